//! Adaptive-threshold detection over power maps.
//!
//! The window around each cell under test is a box of `training + guard`
//! cells per side on every enabled axis, minus the guard box. Angle maps are
//! scanned as an elevation x azimuth grid, so the window never runs from
//! the end of one elevation row into the next. Near the map edges the window
//! is truncated (or wrapped, on axes configured to wrap), and the threshold
//! factor is derived from the number of training cells actually used, so
//! the false-alarm rate holds at edges.
//!
//! Range and range-Doppler maps hold power summed over every virtual
//! channel, so under noise each cell is the sum of `looks` unit
//! exponentials. Threshold factors are solved for that distribution.

use crate::config::{CfarConfig, CfarDimensions, CfarVariant, PipelineConfig};
use crate::geometry::AngleGrid;
use crate::prelude::{ProcessingStage, StageError, StageResult};
use crate::processing::beamform::BeamformedFrame;
use crate::telemetry::log::LogManager;
use ndarray::{Array3, ArrayView3, Axis};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::sync::OnceLock;

const BISECTION_STEPS: usize = 200;
const QUADRATURE_INTERVALS: usize = 4096;

/// Window axes: range, Doppler, elevation, azimuth.
const AXES: usize = 4;

/// One cell that crossed its threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CfarHit {
    pub range: usize,
    pub doppler: usize,
    /// Angle bin of the hit; zero unless the scan runs over angle spectra.
    pub angle: usize,
    pub power: f32,
    pub noise: f32,
    /// Linear `power / noise`.
    pub snr: f32,
}

/// Hits beyond the per-frame cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowReport {
    pub found: usize,
    pub cap: usize,
}

impl OverflowReport {
    pub fn dropped(&self) -> usize {
        self.found - self.cap
    }

    pub fn to_error(self) -> StageError {
        StageError::DetectionOverflow {
            found: self.found,
            cap: self.cap,
        }
    }
}

/// Detection mask and per-cell SNR over the scanned map
/// (`[range][doppler][angle or 1]`).
#[derive(Debug, Clone, PartialEq)]
pub struct CfarMap {
    pub dimensions: CfarDimensions,
    pub mask: Array3<bool>,
    pub snr: Array3<f32>,
    /// Kept hits in scan order.
    pub hits: Vec<CfarHit>,
    pub overflow: Option<OverflowReport>,
}

impl CfarMap {
    pub fn hit_count(&self) -> usize {
        self.hits.len()
    }
}

/// CFAR result together with the frame it was computed from.
#[derive(Debug, Clone)]
pub struct CfarFrame {
    pub map: CfarMap,
    pub frame: BeamformedFrame,
}

#[derive(Debug, Clone, Copy)]
struct Offset {
    delta: [isize; AXES],
    /// First non-zero offset component is negative.
    leading: bool,
}

/// `ln n!`, exact for small `n`, Stirling series above.
fn ln_factorial(n: usize) -> f64 {
    if n < 32 {
        return (2..=n).map(|k| (k as f64).ln()).sum();
    }
    let x = n as f64;
    x * x.ln() - x + 0.5 * (2.0 * std::f64::consts::PI * x).ln() + 1.0 / (12.0 * x)
        - 1.0 / (360.0 * x * x * x)
}

/// `P(X > x)` for `X` the sum of `looks` unit exponentials.
fn gamma_tail(looks: usize, x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    // Poisson terms e^-x x^j / j! for j < looks; the rest are negligible.
    let spread = 40.0 * x.sqrt() + 20.0;
    let first = (x - spread).max(0.0) as usize;
    let last = ((x + spread).ceil() as usize).min(looks);
    if first >= last {
        return 0.0;
    }
    let ln_x = x.ln();
    let mut log_term = -x + first as f64 * ln_x - ln_factorial(first);
    let mut sum = log_term.exp();
    for j in (first + 1)..last {
        log_term += ln_x - (j as f64).ln();
        sum += log_term.exp();
    }
    sum.min(1.0)
}

/// Log density of the sum of `looks` unit exponentials.
fn ln_gamma_density(looks: usize, x: f64) -> f64 {
    if looks == 1 {
        return -x;
    }
    if x <= 0.0 {
        return f64::NEG_INFINITY;
    }
    (looks - 1) as f64 * x.ln() - x - ln_factorial(looks - 1)
}

/// Pfa of cell averaging over `n` cells of `looks` integrated exponentials
/// at threshold factor `t` on the training mean.
fn ca_pfa(n: usize, looks: usize, t: f64) -> f64 {
    let shape = (n * looks) as f64;
    let alpha = t / n as f64;
    let ln_ratio = (alpha / (1.0 + alpha)).ln();
    let mut log_term = -shape * alpha.ln_1p();
    let mut sum = log_term.exp();
    for j in 0..looks.saturating_sub(1) {
        let j = j as f64;
        log_term += (shape + j).ln() - (j + 1.0).ln() + ln_ratio;
        sum += log_term.exp();
    }
    sum
}

fn os_pfa_single(n: usize, k: usize, t: f64) -> f64 {
    (0..k)
        .map(|i| {
            let remaining = (n - i) as f64;
            remaining.ln() - (remaining + t).ln()
        })
        .sum::<f64>()
        .exp()
}

fn go_pfa_single(n: usize, t: f64) -> f64 {
    let nf = n as f64;
    let x = 2.0 + t / nf;
    let mut log_term = -nf * x.ln();
    let mut tail = 0.0;
    for k in 0..n {
        tail += log_term.exp();
        let kf = k as f64;
        log_term += ((nf + kf) / (kf + 1.0)).ln() - x.ln();
    }
    2.0 * (-nf * (1.0 + t / nf).ln()).exp() - 2.0 * tail
}

/// Simpson quadrature over the density of a noise estimate, built once per
/// training count and reused across bisection steps.
struct NoiseDensity {
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl NoiseDensity {
    fn from_fn(lo: f64, hi: f64, density: impl Fn(f64) -> f64) -> Self {
        let step = (hi - lo) / QUADRATURE_INTERVALS as f64;
        let nodes: Vec<f64> = (0..=QUADRATURE_INTERVALS)
            .map(|i| lo + i as f64 * step)
            .collect();
        let weights = nodes
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let simpson = if i == 0 || i == QUADRATURE_INTERVALS {
                    1.0
                } else if i % 2 == 1 {
                    4.0
                } else {
                    2.0
                };
                simpson * step / 3.0 * density(x)
            })
            .collect();
        Self { nodes, weights }
    }

    /// `k`-th smallest of `n` cells of `looks` integrated exponentials.
    fn ordered(n: usize, k: usize, looks: usize) -> Self {
        let ln_coef = ln_factorial(n) - ln_factorial(k - 1) - ln_factorial(n - k);
        let m = looks as f64;
        Self::from_fn(0.0, m + 14.0 * m.sqrt() + 30.0, |y| {
            let tail = gamma_tail(looks, y);
            let below = 1.0 - tail;
            let mut log_density = ln_coef + ln_gamma_density(looks, y);
            if k > 1 {
                if below <= 0.0 {
                    return 0.0;
                }
                log_density += (k - 1) as f64 * below.ln();
            }
            if n > k {
                if tail <= 0.0 {
                    return 0.0;
                }
                log_density += (n - k) as f64 * tail.ln();
            }
            log_density.exp()
        })
    }

    /// Larger of two means of `n` cells each of `looks` integrated
    /// exponentials.
    fn greater_of(n: usize, looks: usize) -> Self {
        let shape = n * looks;
        let nf = n as f64;
        let mean = looks as f64;
        let spread = (mean / nf).sqrt();
        let lo = (mean - 14.0 * spread).max(0.0);
        let hi = mean + 14.0 * spread + 30.0 / nf;
        Self::from_fn(lo, hi, |z| {
            let sum = nf * z;
            let below = 1.0 - gamma_tail(shape, sum);
            if below <= 0.0 {
                return 0.0;
            }
            2.0 * nf * below * ln_gamma_density(shape, sum).exp()
        })
    }

    fn pfa(&self, looks: usize, t: f64) -> f64 {
        self.nodes
            .iter()
            .zip(&self.weights)
            .filter(|&(_, &w)| w > 0.0)
            .map(|(&x, &w)| w * gamma_tail(looks, t * x))
            .sum()
    }
}

/// Factor on the training mean for cell averaging over `n` cells, each the
/// sum of `looks` exponentials. `T = N (Pfa^(-1/N) - 1)` for one look.
pub fn ca_factor(n: usize, looks: usize, pfa: f64) -> f64 {
    if looks <= 1 {
        let n = n as f64;
        return n * (pfa.powf(-1.0 / n) - 1.0);
    }
    solve_decreasing(|t| ca_pfa(n, looks, t), pfa)
}

/// Factor on the `k`-th smallest of `n` training cells.
pub fn os_factor(n: usize, k: usize, looks: usize, pfa: f64) -> f64 {
    if looks <= 1 {
        return solve_decreasing(|t| os_pfa_single(n, k, t), pfa);
    }
    let density = NoiseDensity::ordered(n, k, looks);
    solve_decreasing(|t| density.pfa(looks, t), pfa)
}

/// Factor applied to the larger of two half-window means of `n` cells each.
pub fn go_factor(n: usize, looks: usize, pfa: f64) -> f64 {
    if looks <= 1 {
        return solve_decreasing(|t| go_pfa_single(n, t), pfa);
    }
    let density = NoiseDensity::greater_of(n, looks);
    solve_decreasing(|t| density.pfa(looks, t), pfa)
}

/// Bisection for `f(t) = target` with `f` decreasing from 1 at `t = 0`.
fn solve_decreasing(f: impl Fn(f64) -> f64, target: f64) -> f64 {
    let mut lo = 0.0;
    let mut hi = 1.0;
    while f(hi) > target && hi < 1e15 {
        lo = hi;
        hi *= 2.0;
    }
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if f(mid) > target {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-12 * hi {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Threshold factors memoized per training count.
struct FactorTable {
    variant: CfarVariant,
    pfa: f64,
    looks: usize,
    rank_fraction: f64,
    primary: Vec<OnceLock<f64>>,
    averaging: Vec<OnceLock<f64>>,
}

impl FactorTable {
    fn new(config: &CfarConfig, max_cells: usize, looks: usize) -> Self {
        Self {
            variant: config.variant,
            pfa: config.target_pfa,
            looks,
            rank_fraction: config.os_rank_fraction,
            primary: (0..=max_cells).map(|_| OnceLock::new()).collect(),
            averaging: (0..=max_cells).map(|_| OnceLock::new()).collect(),
        }
    }

    fn os_rank(&self, n: usize) -> usize {
        ((self.rank_fraction * n as f64).ceil() as usize).clamp(1, n.max(1))
    }

    /// Factor for the configured variant, keyed by total training count (CA,
    /// OS) or per-half count (GO).
    fn primary(&self, n: usize) -> f64 {
        *self.primary[n].get_or_init(|| match self.variant {
            CfarVariant::CellAveraging => ca_factor(n, self.looks, self.pfa),
            CfarVariant::OrderedStatistic => {
                os_factor(n, self.os_rank(n), self.looks, self.pfa)
            }
            CfarVariant::GreatestOf => go_factor(n, self.looks, self.pfa),
        })
    }

    fn averaging(&self, n: usize) -> f64 {
        *self.averaging[n].get_or_init(|| ca_factor(n, self.looks, self.pfa))
    }
}

/// Extents of one scan, `[range, doppler, elevation, azimuth]`, and the
/// angle cells that may take part in it.
struct ScanShape<'a> {
    dims: [usize; AXES],
    visible: Option<&'a [bool]>,
}

impl ScanShape<'_> {
    fn flat_angle(&self, cell: &[usize; AXES]) -> usize {
        cell[2] * self.dims[3] + cell[3]
    }

    fn usable(&self, angle: usize) -> bool {
        self.visible.map_or(true, |mask| mask[angle])
    }
}

/// Constant-false-alarm-rate detector.
pub struct CfarDetector {
    config: CfarConfig,
    looks: usize,
    offsets: Vec<Offset>,
    /// Window span per axis, `2 (training + guard) + 1` or 1.
    span: [usize; AXES],
    table: FactorTable,
    logger: LogManager,
}

impl CfarDetector {
    /// Detector for the maps `config` produces: the summed power of every
    /// virtual channel for range and range-Doppler scans, single-look angle
    /// spectra otherwise.
    pub fn new(config: &PipelineConfig) -> StageResult<Self> {
        let looks = match config.cfar.dimensions {
            CfarDimensions::RangeDopplerAngle => 1,
            CfarDimensions::Range | CfarDimensions::RangeDoppler => {
                config.geometry.virtual_array().len()
            }
        };
        Self::with_looks(config.cfar.clone(), looks)
    }

    /// Detector for maps of single-look (exponential) noise cells.
    pub fn from_config(config: CfarConfig) -> StageResult<Self> {
        Self::with_looks(config, 1)
    }

    /// Detector for maps whose noise cells each sum `looks` exponentials.
    pub fn with_looks(config: CfarConfig, looks: usize) -> StageResult<Self> {
        config.validate()?;
        if looks == 0 {
            return Err(StageError::InvalidConfig(
                "CFAR needs at least one integrated look".into(),
            ));
        }
        let enabled = match config.dimensions {
            CfarDimensions::Range => [true, false, false, false],
            CfarDimensions::RangeDoppler => [true, true, false, false],
            CfarDimensions::RangeDopplerAngle => [true, true, true, true],
        };
        let reach = config.training_cells + config.guard_cells;
        let extent = |axis: usize| if enabled[axis] { reach as isize } else { 0 };
        let guard = |axis: usize| if enabled[axis] { config.guard_cells as isize } else { 0 };

        let mut offsets = Vec::new();
        for dr in -extent(0)..=extent(0) {
            for dd in -extent(1)..=extent(1) {
                for de in -extent(2)..=extent(2) {
                    for da in -extent(3)..=extent(3) {
                        let delta = [dr, dd, de, da];
                        let inside_guard = (0..AXES).all(|axis| delta[axis].abs() <= guard(axis));
                        if inside_guard {
                            continue;
                        }
                        let leading = delta.iter().find(|&&c| c != 0).map_or(false, |&c| c < 0);
                        offsets.push(Offset { delta, leading });
                    }
                }
            }
        }
        let span = [0, 1, 2, 3].map(|axis| 2 * extent(axis) as usize + 1);
        let table = FactorTable::new(&config, offsets.len(), looks);
        let logger = LogManager::for_stage("cfar");
        logger.record(&format!(
            "{:?} CFAR over {:?}: {} training cells, {} looks, Pfa {:e}",
            config.variant,
            config.dimensions,
            offsets.len(),
            looks,
            config.target_pfa
        ));
        Ok(Self {
            config,
            looks,
            offsets,
            span,
            table,
            logger,
        })
    }

    /// Exponentials summed in each noise cell of the scanned maps.
    pub fn looks(&self) -> usize {
        self.looks
    }

    /// Training cells of an interior cell.
    pub fn full_training_count(&self) -> usize {
        self.offsets.len()
    }

    fn wraps(&self, axis: usize, len: usize) -> bool {
        let configured = match axis {
            0 => self.config.wrap.range,
            1 => self.config.wrap.doppler,
            _ => self.config.wrap.angle,
        };
        configured && len >= self.span[axis]
    }

    fn resolve(&self, cell: [usize; AXES], delta: [isize; AXES], dims: [usize; AXES]) -> Option<[usize; AXES]> {
        let mut out = [0usize; AXES];
        for axis in 0..AXES {
            let len = dims[axis] as isize;
            let target = cell[axis] as isize + delta[axis];
            out[axis] = if (0..len).contains(&target) {
                target as usize
            } else if self.wraps(axis, dims[axis]) {
                target.rem_euclid(len) as usize
            } else {
                return None;
            };
        }
        Some(out)
    }

    /// Offsets that can land inside a map of `dims` from some cell.
    fn reachable(&self, dims: [usize; AXES]) -> Vec<Offset> {
        self.offsets
            .iter()
            .filter(|o| {
                (0..AXES).all(|axis| {
                    o.delta[axis].unsigned_abs() < dims[axis] || self.wraps(axis, dims[axis])
                })
            })
            .copied()
            .collect()
    }

    /// Training cells actually available to `cell` in a map of `dims`; lower
    /// than [`full_training_count`](Self::full_training_count) near
    /// non-wrapping edges. The angle axis is taken as a single azimuth row.
    pub fn training_cell_count(&self, dims: (usize, usize, usize), cell: (usize, usize, usize)) -> usize {
        let dims = [dims.0, dims.1, 1, dims.2];
        let cell = [cell.0, cell.1, 0, cell.2];
        self.reachable(dims)
            .iter()
            .filter(|o| self.resolve(cell, o.delta, dims).is_some())
            .count()
    }

    /// Noise estimate and threshold factor, `None` when the cell has no
    /// usable training cells.
    fn estimate(
        &self,
        map: &ArrayView3<f32>,
        shape: &ScanShape,
        offsets: &[Offset],
        cell: [usize; AXES],
        scratch: &mut Vec<f32>,
    ) -> Option<(f64, f64)> {
        scratch.clear();
        let (mut lead_sum, mut lead_n, mut trail_sum, mut trail_n) = (0.0f64, 0usize, 0.0f64, 0usize);
        for offset in offsets {
            let Some(index) = self.resolve(cell, offset.delta, shape.dims) else {
                continue;
            };
            let angle = shape.flat_angle(&index);
            if !shape.usable(angle) {
                continue;
            }
            let value = map[[index[0], index[1], angle]];
            scratch.push(value);
            if offset.leading {
                lead_sum += value as f64;
                lead_n += 1;
            } else {
                trail_sum += value as f64;
                trail_n += 1;
            }
        }
        let n = scratch.len();
        if n == 0 {
            return None;
        }
        let total_mean = (lead_sum + trail_sum) / n as f64;
        match self.config.variant {
            CfarVariant::CellAveraging => Some((total_mean, self.table.primary(n))),
            CfarVariant::OrderedStatistic => {
                let k = self.table.os_rank(n);
                let (_, kth, _) = scratch
                    .select_nth_unstable_by(k - 1, |x, y| x.partial_cmp(y).unwrap_or(Ordering::Equal));
                Some((*kth as f64, self.table.primary(n)))
            }
            CfarVariant::GreatestOf => {
                if lead_n == 0 || trail_n == 0 {
                    return Some((total_mean, self.table.averaging(n)));
                }
                let noise = (lead_sum / lead_n as f64).max(trail_sum / trail_n as f64);
                Some((noise, self.table.primary(lead_n.min(trail_n))))
            }
        }
    }

    /// Scans a `[range][doppler][angle]` power map whose angle axis is a
    /// single azimuth row.
    pub fn detect(&self, map: ArrayView3<f32>) -> CfarMap {
        let (range_bins, doppler_bins, angle_bins) = map.dim();
        let shape = ScanShape {
            dims: [range_bins, doppler_bins, 1, angle_bins],
            visible: None,
        };
        self.scan(map, &shape)
    }

    /// Scans `[range][doppler][angle]` spectra over `grid`. Directions
    /// outside the visible region are neither tested nor used as training
    /// cells.
    pub fn detect_spectra(&self, spectra: ArrayView3<f32>, grid: &AngleGrid) -> StageResult<CfarMap> {
        let (range_bins, doppler_bins, angle_bins) = spectra.dim();
        if angle_bins != grid.len() {
            return Err(StageError::Dimension(format!(
                "spectra have {} angle bins, grid has {} x {}",
                angle_bins, grid.azimuth_bins, grid.elevation_bins
            )));
        }
        let visible: Vec<bool> = (0..grid.len()).map(|i| grid.is_visible(i)).collect();
        let shape = ScanShape {
            dims: [range_bins, doppler_bins, grid.elevation_bins, grid.azimuth_bins],
            visible: Some(&visible),
        };
        Ok(self.scan(spectra, &shape))
    }

    fn scan(&self, map: ArrayView3<f32>, shape: &ScanShape) -> CfarMap {
        let (range_bins, doppler_bins, angle_bins) = map.dim();
        let azimuth_bins = shape.dims[3];
        let offsets = self.reachable(shape.dims);
        let rows: Vec<(Vec<f32>, Vec<CfarHit>)> = (0..range_bins)
            .into_par_iter()
            .map(|r| {
                let mut scratch = Vec::with_capacity(offsets.len());
                let mut snr = vec![0.0f32; doppler_bins * angle_bins];
                let mut hits = Vec::new();
                for d in 0..doppler_bins {
                    for a in 0..angle_bins {
                        if !shape.usable(a) {
                            continue;
                        }
                        let cell = [r, d, a / azimuth_bins, a % azimuth_bins];
                        let Some((noise, factor)) = self.estimate(&map, shape, &offsets, cell, &mut scratch) else {
                            continue;
                        };
                        if noise <= 0.0 {
                            continue;
                        }
                        let power = map[[r, d, a]];
                        let ratio = power as f64 / noise;
                        snr[d * angle_bins + a] = ratio as f32;
                        if ratio > factor {
                            hits.push(CfarHit {
                                range: r,
                                doppler: d,
                                angle: a,
                                power,
                                noise: noise as f32,
                                snr: ratio as f32,
                            });
                        }
                    }
                }
                (snr, hits)
            })
            .collect();

        let mut snr = Array3::<f32>::zeros((range_bins, doppler_bins, angle_bins));
        let mut hits = Vec::new();
        for (mut plane, (row_snr, row_hits)) in snr.axis_iter_mut(Axis(0)).zip(rows) {
            for (target, value) in plane.iter_mut().zip(row_snr) {
                *target = value;
            }
            hits.extend(row_hits);
        }

        let found = hits.len();
        let cap = self.config.max_hits;
        let overflow = (found > cap).then(|| {
            hits.sort_by(|x, y| y.snr.partial_cmp(&x.snr).unwrap_or(Ordering::Equal));
            hits.truncate(cap);
            hits.sort_by_key(|h| (h.range, h.doppler, h.angle));
            OverflowReport { found, cap }
        });
        if let Some(report) = overflow {
            self.logger.warn(&format!(
                "{}; dropped {} weakest hits",
                report.to_error(),
                report.dropped()
            ));
        }

        let mut mask = Array3::from_elem((range_bins, doppler_bins, angle_bins), false);
        for hit in &hits {
            mask[[hit.range, hit.doppler, hit.angle]] = true;
        }
        CfarMap {
            dimensions: self.config.dimensions,
            mask,
            snr,
            hits,
            overflow,
        }
    }
}

impl ProcessingStage for CfarDetector {
    type Input = BeamformedFrame;
    type Output = CfarFrame;

    fn name(&self) -> &'static str {
        "cfar"
    }

    fn execute(&self, frame: BeamformedFrame) -> StageResult<CfarFrame> {
        let map = match self.config.dimensions {
            CfarDimensions::Range | CfarDimensions::RangeDoppler => {
                if frame.virtual_channels != self.looks {
                    return Err(StageError::Dimension(format!(
                        "power map sums {} virtual channels, detector expects {}",
                        frame.virtual_channels, self.looks
                    )));
                }
                self.detect(frame.power.view().insert_axis(Axis(2)))
            }
            CfarDimensions::RangeDopplerAngle => self.detect_spectra(frame.spectra.view(), &frame.grid)?,
        };
        self.logger.detail(&format!(
            "frame {}: {} hits",
            frame.frame_index,
            map.hit_count()
        ));
        Ok(CfarFrame { map, frame })
    }
}
