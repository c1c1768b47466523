use crate::geometry::layout::{ArrayGeometry, Polarization};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Overlap bins per element-spacing unit. Phase centres share a bin when
/// their scaled positions floor to the same integer.
const OVERLAP_BINS_PER_UNIT: f64 = 100.0;

/// Transmit/receive polarization of a virtual channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PolarizationPair {
    HH,
    HV,
    VH,
    VV,
}

impl PolarizationPair {
    pub fn from_elements(tx: Polarization, rx: Polarization) -> Self {
        match (tx, rx) {
            (Polarization::H, Polarization::H) => PolarizationPair::HH,
            (Polarization::H, Polarization::V) => PolarizationPair::HV,
            (Polarization::V, Polarization::H) => PolarizationPair::VH,
            (Polarization::V, Polarization::V) => PolarizationPair::VV,
        }
    }

    pub fn is_co_polar(self) -> bool {
        matches!(self, PolarizationPair::HH | PolarizationPair::VV)
    }
}

impl std::fmt::Display for PolarizationPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PolarizationPair::HH => "HH",
            PolarizationPair::HV => "HV",
            PolarizationPair::VH => "VH",
            PolarizationPair::VV => "VV",
        };
        f.write_str(label)
    }
}

/// One synthesized channel: the phase centre of a transmit/receive pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VirtualElement {
    pub tx: usize,
    pub rx: usize,
    pub position: [f32; 2],
    pub polarization: PolarizationPair,
}

/// Virtual positions shared by more than one polarization channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlapReport {
    /// Shared by a co-polar pair (HH, VV) or a cross-polar pair (HV, VH);
    /// usable for channel-to-channel calibration.
    pub calibration: Vec<[f32; 2]>,
    /// Any other coincidence; wasted aperture.
    pub redundant: Vec<[f32; 2]>,
}

/// Ordered virtual aperture: the spatial convolution of the transmit and
/// receive arrays restricted to the configured pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualArray {
    elements: Vec<VirtualElement>,
    spacing: f32,
}

impl VirtualArray {
    pub fn synthesize(geometry: &ArrayGeometry) -> Self {
        let elements = geometry
            .pairs()
            .into_iter()
            .map(|[tx, rx]| {
                let t = &geometry.transmitters[tx];
                let r = &geometry.receivers[rx];
                VirtualElement {
                    tx,
                    rx,
                    position: [
                        t.position[0] + r.position[0],
                        t.position[1] + r.position[1],
                    ],
                    polarization: PolarizationPair::from_elements(t.polarization, r.polarization),
                }
            })
            .collect();
        Self {
            elements,
            spacing: geometry.element_spacing,
        }
    }

    pub fn elements(&self) -> &[VirtualElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Position unit in wavelengths.
    pub fn spacing(&self) -> f32 {
        self.spacing
    }

    /// Indices of the elements whose polarization satisfies `keep`.
    pub fn select(&self, keep: impl Fn(PolarizationPair) -> bool) -> Vec<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| keep(e.polarization))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn has_cross_polar(&self) -> bool {
        self.elements.iter().any(|e| !e.polarization.is_co_polar())
    }

    pub fn overlaps(&self) -> OverlapReport {
        let mut occupied: BTreeMap<(i64, i64), BTreeSet<PolarizationPair>> = BTreeMap::new();
        for element in &self.elements {
            let bin = |x: f32| (f64::from(x) * OVERLAP_BINS_PER_UNIT).floor() as i64;
            let key = (bin(element.position[0]), bin(element.position[1]));
            occupied.entry(key).or_default().insert(element.polarization);
        }

        let co = [PolarizationPair::HH, PolarizationPair::VV];
        let cross = [PolarizationPair::HV, PolarizationPair::VH];
        let mut report = OverlapReport::default();
        for ((x, y), channels) in occupied {
            if channels.len() < 2 {
                continue;
            }
            let corner = |bin: i64| (bin as f64 / OVERLAP_BINS_PER_UNIT) as f32;
            let position = [corner(x), corner(y)];
            let calibrates = [co, cross]
                .iter()
                .any(|pair| pair.iter().all(|p| channels.contains(p)));
            if calibrates {
                report.calibration.push(position);
            } else {
                report.redundant.push(position);
            }
        }
        report
    }

    pub fn log_overlaps(&self) {
        let report = self.overlaps();
        if report.calibration.is_empty() && report.redundant.is_empty() {
            info!("virtual array: {} channels, no overlaps", self.len());
            return;
        }
        if !report.calibration.is_empty() {
            info!(
                "virtual array: calibration overlaps at {:?}",
                report.calibration
            );
        }
        if !report.redundant.is_empty() {
            warn!("virtual array: redundant overlaps at {:?}", report.redundant);
        }
    }
}
