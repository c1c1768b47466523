use crate::geometry::virtual_array::VirtualArray;
use crate::prelude::{StageError, StageResult};
use serde::{Deserialize, Serialize};

/// Antenna polarization of a physical element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Polarization {
    H,
    V,
}

/// How the transmitters share the slow-time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplexing {
    /// One transmitter per chirp, cycling through the transmitters.
    #[default]
    TimeDivision,
    /// All transmitters on every chirp, separated by Hadamard phase codes.
    CodeDivision,
}

/// A physical antenna phase centre. Positions are in units of
/// [`ArrayGeometry::element_spacing`] (azimuth, elevation).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub position: [f32; 2],
    pub polarization: Polarization,
}

impl Element {
    pub fn new(x: f32, y: f32, polarization: Polarization) -> Self {
        Self {
            position: [x, y],
            polarization,
        }
    }
}

fn default_spacing() -> f32 {
    0.5
}

/// Hardware array description: physical elements, pairing and multiplexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayGeometry {
    pub transmitters: Vec<Element>,
    pub receivers: Vec<Element>,
    /// Position unit in wavelengths.
    #[serde(default = "default_spacing")]
    pub element_spacing: f32,
    /// Explicit `[tx, rx]` pairs forming the virtual array; all pairs when
    /// absent.
    #[serde(default)]
    pub pairing: Option<Vec<[usize; 2]>>,
    #[serde(default)]
    pub multiplexing: Multiplexing,
    /// `adc_lane_map[lane]` is the receiver fed by ADC lane `lane`; identity
    /// when absent.
    #[serde(default)]
    pub adc_lane_map: Option<Vec<usize>>,
}

impl ArrayGeometry {
    pub fn tx_count(&self) -> usize {
        self.transmitters.len()
    }

    pub fn rx_count(&self) -> usize {
        self.receivers.len()
    }

    /// Transmit slots per multiplexing period.
    pub fn slot_count(&self) -> usize {
        self.transmitters.len()
    }

    pub fn lane_map(&self) -> Vec<usize> {
        self.adc_lane_map
            .clone()
            .unwrap_or_else(|| (0..self.receivers.len()).collect())
    }

    pub fn pairs(&self) -> Vec<[usize; 2]> {
        match &self.pairing {
            Some(pairs) => pairs.clone(),
            None => (0..self.tx_count())
                .flat_map(|tx| (0..self.rx_count()).map(move |rx| [tx, rx]))
                .collect(),
        }
    }

    pub fn virtual_array(&self) -> VirtualArray {
        VirtualArray::synthesize(self)
    }

    pub fn validate(&self) -> StageResult<()> {
        if self.transmitters.is_empty() || self.receivers.is_empty() {
            return Err(StageError::InvalidConfig(
                "geometry needs at least one transmitter and one receiver".into(),
            ));
        }
        if !(self.element_spacing > 0.0) {
            return Err(StageError::InvalidConfig(format!(
                "element spacing must be positive, got {}",
                self.element_spacing
            )));
        }
        if self.multiplexing == Multiplexing::CodeDivision && !self.tx_count().is_power_of_two() {
            return Err(StageError::InvalidConfig(format!(
                "code-division multiplexing needs a power-of-two transmitter count, got {}",
                self.tx_count()
            )));
        }

        let pairs = self.pairs();
        if pairs.is_empty() {
            return Err(StageError::InvalidConfig("pairing map is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for &[tx, rx] in &pairs {
            if tx >= self.tx_count() || rx >= self.rx_count() {
                return Err(StageError::InvalidConfig(format!(
                    "pair [{}, {}] references a missing element",
                    tx, rx
                )));
            }
            if !seen.insert((tx, rx)) {
                return Err(StageError::InvalidConfig(format!(
                    "pair [{}, {}] listed twice",
                    tx, rx
                )));
            }
        }

        let mut lanes = self.lane_map();
        if lanes.len() != self.rx_count() {
            return Err(StageError::InvalidConfig(format!(
                "ADC lane map has {} lanes for {} receivers",
                lanes.len(),
                self.rx_count()
            )));
        }
        lanes.sort_unstable();
        if lanes.iter().enumerate().any(|(i, &rx)| i != rx) {
            return Err(StageError::InvalidConfig(
                "ADC lane map must be a permutation of the receivers".into(),
            ));
        }
        Ok(())
    }

    /// Uniform linear array with all elements sharing one polarization:
    /// receivers at `0..n_rx`, transmitters every `n_rx` positions.
    pub fn uniform_linear(n_tx: usize, n_rx: usize, polarization: Polarization) -> Self {
        Self {
            transmitters: (0..n_tx)
                .map(|t| Element::new((t * n_rx) as f32, 0.0, polarization))
                .collect(),
            receivers: (0..n_rx)
                .map(|r| Element::new(r as f32, 0.0, polarization))
                .collect(),
            element_spacing: default_spacing(),
            pairing: None,
            multiplexing: Multiplexing::TimeDivision,
            adc_lane_map: None,
        }
    }

    /// Dual-polarized receive line (H and V ports sharing phase centres
    /// `0..n_rx`) with an H transmitter at 0 and a V transmitter at `n_rx`,
    /// giving a filled co-polar aperture of `2 * n_rx` elements.
    pub fn dual_polarized_linear(n_rx: usize) -> Self {
        let receivers = [Polarization::H, Polarization::V]
            .into_iter()
            .flat_map(|pol| (0..n_rx).map(move |r| Element::new(r as f32, 0.0, pol)))
            .collect();
        Self {
            transmitters: vec![
                Element::new(0.0, 0.0, Polarization::H),
                Element::new(n_rx as f32, 0.0, Polarization::V),
            ],
            receivers,
            element_spacing: default_spacing(),
            pairing: None,
            multiplexing: Multiplexing::TimeDivision,
            adc_lane_map: None,
        }
    }

    /// Two abutted four-element chips with interleaved H/V receivers and
    /// symmetric H/V transmitter pairs, arranged so the HV and VH virtual
    /// channels overlap for cross-polar calibration.
    pub fn interleaved_two_chip() -> Self {
        let receivers = (0..8)
            .map(|x| {
                let pol = if x % 2 == 0 {
                    Polarization::H
                } else {
                    Polarization::V
                };
                Element::new(x as f32, 0.0, pol)
            })
            .collect();
        Self {
            transmitters: vec![
                Element::new(-4.0, 0.0, Polarization::H),
                Element::new(12.0, 0.0, Polarization::H),
                Element::new(-3.0, 0.0, Polarization::V),
                Element::new(11.0, 0.0, Polarization::V),
            ],
            receivers,
            element_spacing: default_spacing(),
            pairing: None,
            multiplexing: Multiplexing::TimeDivision,
            adc_lane_map: None,
        }
    }

    /// Cascade-style 2D layout: sixteen interleaved receivers on one line
    /// and a sparse transmit set with one elevated element per polarization.
    pub fn cascade_2d() -> Self {
        let receivers = (0..16)
            .map(|x| {
                let pol = if x % 2 == 0 {
                    Polarization::H
                } else {
                    Polarization::V
                };
                Element::new(x as f32, 0.0, pol)
            })
            .collect();
        Self {
            transmitters: vec![
                Element::new(-4.0, 0.0, Polarization::H),
                Element::new(20.0, 0.0, Polarization::H),
                Element::new(-4.0, 5.0, Polarization::H),
                Element::new(-3.0, 0.0, Polarization::V),
                Element::new(19.0, 0.0, Polarization::V),
                Element::new(20.0, 5.0, Polarization::V),
            ],
            receivers,
            element_spacing: default_spacing(),
            pairing: None,
            multiplexing: Multiplexing::TimeDivision,
            adc_lane_map: None,
        }
    }
}
