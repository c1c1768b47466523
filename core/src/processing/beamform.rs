use crate::config::{AngleMethod, BeamformingConfig, PipelineConfig};
use crate::cube::RangeDopplerMap;
use crate::geometry::{AngleGrid, Multiplexing, VirtualArray, VirtualElement};
use crate::math::fft::{fft_shift, shifted_index, FftHelper};
use crate::math::matrix::MatrixHelper;
use crate::prelude::{ProcessingStage, Sample, StageError, StageResult};
use crate::telemetry::log::LogManager;
use ndarray::{Array2, Array3, ArrayView3, Axis};
use num_complex::Complex64;
use rayon::prelude::*;
use std::f64::consts::PI;

/// Tolerance for treating a virtual position as lying on the element grid.
const GRID_TOLERANCE: f32 = 1e-3;

/// Angle spectra and per-cell powers for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamformedFrame {
    pub frame_index: u32,
    pub timestamp: f64,
    pub grid: AngleGrid,
    /// Response power `[range][doppler][angle]`, zero outside the visible
    /// region.
    pub spectra: Array3<f32>,
    /// Non-coherent power summed over every virtual channel.
    pub power: Array2<f32>,
    /// HH + VV power.
    pub co_polar: Array2<f32>,
    /// HV + VH power.
    pub cross_polar: Array2<f32>,
    pub has_cross_polar: bool,
    pub virtual_channels: usize,
    /// Cells whose adaptive estimate fell back to the FFT.
    pub fallback_cells: usize,
}

impl BeamformedFrame {
    pub fn range_bins(&self) -> usize {
        self.power.nrows()
    }

    pub fn doppler_bins(&self) -> usize {
        self.power.ncols()
    }

    /// Angle index of the strongest response in a cell.
    pub fn peak_angle(&self, range: usize, doppler: usize) -> usize {
        self.spectra
            .slice(ndarray::s![range, doppler, ..])
            .indexed_iter()
            .fold((0, f32::MIN), |best, (index, &value)| {
                if value > best.1 {
                    (index, value)
                } else {
                    best
                }
            })
            .0
    }
}

/// Positions of the selected channels on the FFT aperture.
struct ApertureLayout {
    /// Aperture cell (`elevation * azimuth_bins + azimuth`) and averaging
    /// weight per selected channel.
    cells: Vec<(usize, f32)>,
    occupied: usize,
}

impl ApertureLayout {
    fn new(elements: &[VirtualElement], grid: &AngleGrid) -> StageResult<Self> {
        let min_x = elements.iter().map(|e| e.position[0]).fold(f32::MAX, f32::min);
        let min_y = elements.iter().map(|e| e.position[1]).fold(f32::MAX, f32::min);

        let mut offsets = Vec::with_capacity(elements.len());
        for element in elements {
            let x = element.position[0] - min_x;
            let y = element.position[1] - min_y;
            if (x - x.round()).abs() > GRID_TOLERANCE || (y - y.round()).abs() > GRID_TOLERANCE {
                return Err(StageError::InvalidConfig(format!(
                    "virtual element (tx {}, rx {}) at {:?} is off the element grid",
                    element.tx, element.rx, element.position
                )));
            }
            let (gx, gy) = (x.round() as usize, y.round() as usize);
            if gx >= grid.azimuth_bins || gy >= grid.elevation_bins {
                return Err(StageError::InvalidConfig(format!(
                    "virtual aperture needs at least {} x {} angle bins, grid has {} x {}",
                    gx + 1,
                    gy + 1,
                    grid.azimuth_bins,
                    grid.elevation_bins
                )));
            }
            offsets.push(grid.index(gx, gy));
        }

        let mut counts = vec![0usize; grid.len()];
        for &cell in &offsets {
            counts[cell] += 1;
        }
        let occupied = counts.iter().filter(|&&c| c > 0).count();
        let cells = offsets
            .into_iter()
            .map(|cell| (cell, 1.0 / counts[cell] as f32))
            .collect();
        Ok(Self { cells, occupied })
    }
}

/// Velocity compensation, code-division decoding and angle estimation over
/// the virtual array.
pub struct VirtualArrayBeamformer {
    config: BeamformingConfig,
    array: VirtualArray,
    grid: AngleGrid,
    n_rx: usize,
    n_slots: usize,
    /// `decode[slot][tx]`: weight of slot `slot` in the transmitter `tx`
    /// sequence.
    decode: Vec<Vec<f32>>,
    selected: Vec<usize>,
    layout: ApertureLayout,
    visible: Vec<bool>,
    /// `steering[angle][selected channel]` for the adaptive strategy.
    steering: Vec<Vec<Complex64>>,
    azimuth_fft: FftHelper,
    elevation_fft: FftHelper,
    logger: LogManager,
}

impl VirtualArrayBeamformer {
    pub fn new(config: &PipelineConfig) -> StageResult<Self> {
        config.geometry.validate()?;
        let bf = config.beamforming.clone();
        let array = config.geometry.virtual_array();
        array.log_overlaps();

        let selection = bf.channels;
        let selected = array.select(|pair| selection.accepts(pair));
        if selected.is_empty() {
            return Err(StageError::InvalidConfig(format!(
                "channel selection {:?} matches no virtual channel",
                selection
            )));
        }

        let grid = AngleGrid::new(bf.azimuth_bins, bf.elevation_bins, config.geometry.element_spacing);
        let chosen: Vec<VirtualElement> = selected.iter().map(|&i| array.elements()[i]).collect();
        let layout = ApertureLayout::new(&chosen, &grid)?;
        let visible = (0..grid.len()).map(|i| grid.is_visible(i)).collect();
        let steering = steering_vectors(&chosen, &grid);

        let n_slots = config.geometry.slot_count();
        let n_tx = config.geometry.tx_count();
        let decode = match config.geometry.multiplexing {
            Multiplexing::TimeDivision => (0..n_slots)
                .map(|m| (0..n_tx).map(|t| if m == t { 1.0 } else { 0.0 }).collect())
                .collect(),
            Multiplexing::CodeDivision => {
                let h = hadamard(n_tx);
                let scale = 1.0 / n_tx as f32;
                h.into_iter()
                    .map(|row| row.into_iter().map(|c| c * scale).collect())
                    .collect()
            }
        };

        let logger = LogManager::for_stage("beamform");
        logger.record(&format!(
            "{:?} beamformer over {} of {} virtual channels, grid {} x {}",
            bf.method,
            selected.len(),
            array.len(),
            grid.azimuth_bins,
            grid.elevation_bins
        ));

        Ok(Self {
            azimuth_fft: FftHelper::new(grid.azimuth_bins),
            elevation_fft: FftHelper::new(grid.elevation_bins),
            config: bf,
            array,
            grid,
            n_rx: config.geometry.rx_count(),
            n_slots,
            decode,
            selected,
            layout,
            visible,
            steering,
            logger,
        })
    }

    pub fn grid(&self) -> &AngleGrid {
        &self.grid
    }

    pub fn virtual_array(&self) -> &VirtualArray {
        &self.array
    }

    /// Compensated and decoded virtual-channel spectra `[virtual][range][doppler]`.
    ///
    /// Slot `m` at signed Doppler bin `k` is rotated by
    /// `exp(-j 2 pi k m / (N_doppler * n_slots))` before decoding.
    pub fn virtual_channels(&self, map: &RangeDopplerMap) -> StageResult<Array3<Sample>> {
        if map.n_rx() != self.n_rx || map.n_slots() != self.n_slots {
            return Err(StageError::Dimension(format!(
                "map has {} rx x {} slots, array has {} x {}",
                map.n_rx(),
                map.n_slots(),
                self.n_rx,
                self.n_slots
            )));
        }
        let (range_bins, doppler_bins) = (map.range_bins(), map.doppler_bins());
        let rotors: Vec<Vec<Sample>> = (0..self.n_slots)
            .map(|m| {
                (0..doppler_bins)
                    .map(|d| {
                        let k = shifted_index(d, doppler_bins) as f64;
                        let phase = -2.0 * PI * k * m as f64 / (doppler_bins * self.n_slots) as f64;
                        Sample::new(phase.cos() as f32, phase.sin() as f32)
                    })
                    .collect()
            })
            .collect();

        let data = map.data();
        let mut out = Array3::<Sample>::zeros((self.array.len(), range_bins, doppler_bins));
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(v, mut lane)| {
                let element = &self.array.elements()[v];
                for (m, rotor) in rotors.iter().enumerate() {
                    let weight = self.decode[m][element.tx];
                    if weight == 0.0 {
                        continue;
                    }
                    let source = data.index_axis(Axis(0), map.channel_index(m, element.rx));
                    for ((r, d), value) in lane.indexed_iter_mut() {
                        *value += source[[r, d]] * rotor[d] * weight;
                    }
                }
            });
        Ok(out)
    }

    fn fft_spectrum(&self, snapshot: &[Sample], out: &mut [f32]) {
        let (na, ne) = (self.grid.azimuth_bins, self.grid.elevation_bins);
        let mut aperture = vec![Sample::new(0.0, 0.0); na * ne];
        for (value, &(cell, weight)) in snapshot.iter().zip(&self.layout.cells) {
            aperture[cell] += value * weight;
        }
        for row in aperture.chunks_mut(na) {
            self.azimuth_fft.forward_in_place(row);
            fft_shift(row);
        }
        if ne > 1 {
            let mut column = vec![Sample::new(0.0, 0.0); ne];
            for a in 0..na {
                for e in 0..ne {
                    column[e] = aperture[e * na + a];
                }
                self.elevation_fft.forward_in_place(&mut column);
                fft_shift(&mut column);
                for e in 0..ne {
                    aperture[e * na + a] = column[e];
                }
            }
        }
        let norm = (self.layout.occupied * self.layout.occupied) as f32;
        for (index, (slot, value)) in out.iter_mut().zip(&aperture).enumerate() {
            *slot = if self.visible[index] {
                value.norm_sqr() / norm
            } else {
                0.0
            };
        }
    }

    /// Capon spectrum from snapshots in the configured neighbourhood of a
    /// cell.
    fn mvdr_spectrum(
        &self,
        channels: &ArrayView3<Sample>,
        range: usize,
        doppler: usize,
        out: &mut [f32],
    ) -> StageResult<()> {
        let (_, range_bins, doppler_bins) = channels.dim();
        let r_lo = range.saturating_sub(self.config.snapshot_range_cells);
        let r_hi = (range + self.config.snapshot_range_cells).min(range_bins - 1);
        let d_lo = doppler.saturating_sub(self.config.snapshot_doppler_cells);
        let d_hi = (doppler + self.config.snapshot_doppler_cells).min(doppler_bins - 1);

        let count = (r_hi - r_lo + 1) * (d_hi - d_lo + 1);
        let mut snapshots = Array2::<Sample>::zeros((count, self.selected.len()));
        let cells = (r_lo..=r_hi).flat_map(|r| (d_lo..=d_hi).map(move |d| (r, d)));
        for (mut row, (r, d)) in snapshots.axis_iter_mut(Axis(0)).zip(cells) {
            for (slot, &channel) in row.iter_mut().zip(&self.selected) {
                *slot = channels[[channel, r, d]];
            }
        }

        let mut covariance = MatrixHelper::sample_covariance(snapshots.view());
        MatrixHelper::diagonal_loading(&mut covariance, self.config.diagonal_loading);
        let lower = MatrixHelper::cholesky(&covariance, self.config.max_condition)?;
        for (index, (slot, a)) in out.iter_mut().zip(&self.steering).enumerate() {
            *slot = if self.visible[index] {
                let q = MatrixHelper::inverse_quadratic_form(&lower, a);
                if q > 0.0 {
                    (1.0 / q) as f32
                } else {
                    0.0
                }
            } else {
                0.0
            };
        }
        Ok(())
    }
}

impl ProcessingStage for VirtualArrayBeamformer {
    type Input = RangeDopplerMap;
    type Output = BeamformedFrame;

    fn name(&self) -> &'static str {
        "beamform"
    }

    fn execute(&self, map: RangeDopplerMap) -> StageResult<BeamformedFrame> {
        let channels = self.virtual_channels(&map)?;
        let view = channels.view();
        let (_, range_bins, doppler_bins) = channels.dim();

        let mut power = Array2::<f32>::zeros((range_bins, doppler_bins));
        let mut co_polar = Array2::<f32>::zeros((range_bins, doppler_bins));
        let mut cross_polar = Array2::<f32>::zeros((range_bins, doppler_bins));
        for (element, lane) in self.array.elements().iter().zip(channels.outer_iter()) {
            let target = if element.polarization.is_co_polar() {
                &mut co_polar
            } else {
                &mut cross_polar
            };
            ndarray::Zip::from(&mut power)
                .and(target)
                .and(&lane)
                .for_each(|p, t, x| {
                    let value = x.norm_sqr();
                    *p += value;
                    *t += value;
                });
        }

        let mut spectra = Array3::<f32>::zeros((range_bins, doppler_bins, self.grid.len()));
        let fallback_cells: usize = spectra
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(r, mut plane)| {
                let mut fallbacks = 0;
                let mut snapshot = vec![Sample::new(0.0, 0.0); self.selected.len()];
                let mut out = vec![0.0f32; self.grid.len()];
                for d in 0..doppler_bins {
                    for (slot, &channel) in snapshot.iter_mut().zip(&self.selected) {
                        *slot = view[[channel, r, d]];
                    }
                    match self.config.method {
                        AngleMethod::Fft => self.fft_spectrum(&snapshot, &mut out),
                        AngleMethod::Mvdr => {
                            if let Err(err) = self.mvdr_spectrum(&view, r, d, &mut out) {
                                self.logger
                                    .detail(&format!("cell ({}, {}) fell back to FFT: {}", r, d, err));
                                fallbacks += 1;
                                self.fft_spectrum(&snapshot, &mut out);
                            }
                        }
                    }
                    for (target, &value) in plane.row_mut(d).iter_mut().zip(&out) {
                        *target = value;
                    }
                }
                fallbacks
            })
            .sum();

        if fallback_cells > 0 {
            self.logger.warn(&format!(
                "frame {}: {} cells fell back to FFT beamforming",
                map.frame_index(),
                fallback_cells
            ));
        }

        Ok(BeamformedFrame {
            frame_index: map.frame_index(),
            timestamp: map.timestamp(),
            grid: self.grid,
            spectra,
            power,
            co_polar,
            cross_polar,
            has_cross_polar: self.array.has_cross_polar(),
            virtual_channels: self.array.len(),
            fallback_cells,
        })
    }
}

/// Sylvester-Hadamard matrix of order `n` (a power of two), entries +-1.
pub fn hadamard(n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| if (i & j).count_ones() % 2 == 0 { 1.0 } else { -1.0 })
                .collect()
        })
        .collect()
}

/// Unit-modulus responses `exp(j 2 pi d (x u + y v))` of the chosen channels
/// for every grid direction.
fn steering_vectors(elements: &[VirtualElement], grid: &AngleGrid) -> Vec<Vec<Complex64>> {
    let spacing = grid.spacing as f64;
    (0..grid.len())
        .map(|index| {
            let (u, v) = grid.direction(index);
            elements
                .iter()
                .map(|e| {
                    let phase = 2.0
                        * PI
                        * spacing
                        * (e.position[0] as f64 * u as f64 + e.position[1] as f64 * v as f64);
                    Complex64::new(phase.cos(), phase.sin())
                })
                .collect()
        })
        .collect()
}
