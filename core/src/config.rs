//! Explicit configuration threaded through every stage constructor.

use crate::cube::CubeShape;
use crate::geometry::{ArrayGeometry, PolarizationPair};
use crate::interface::capture::PackingFormat;
use crate::math::window::WindowKind;
use crate::prelude::{StageError, StageResult};
use serde::{Deserialize, Serialize};

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// FMCW waveform and ADC parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarParameters {
    pub center_frequency_hz: f64,
    pub bandwidth_hz: f64,
    /// Active ramp time covered by the ADC samples.
    pub ramp_duration_s: f64,
    /// Chirp repetition interval, ramp plus idle time.
    pub chirp_period_s: f64,
    pub sample_rate_hz: f64,
    pub samples_per_chirp: usize,
    pub chirps_per_frame: usize,
    pub packing: PackingFormat,
}

impl Default for RadarParameters {
    fn default() -> Self {
        Self {
            center_frequency_hz: 77.0e9,
            bandwidth_hz: 300.0e6,
            ramp_duration_s: 25.6e-6,
            chirp_period_s: 40.0e-6,
            sample_rate_hz: 5.0e6,
            samples_per_chirp: 128,
            chirps_per_frame: 64,
            packing: PackingFormat::default(),
        }
    }
}

impl RadarParameters {
    pub fn wavelength(&self) -> f64 {
        SPEED_OF_LIGHT / self.center_frequency_hz
    }

    pub fn slope(&self) -> f64 {
        self.bandwidth_hz / self.ramp_duration_s
    }

    /// Metres per range bin for a range transform of `fft_size` points.
    pub fn range_per_bin(&self, fft_size: usize) -> f64 {
        SPEED_OF_LIGHT * self.sample_rate_hz / (2.0 * self.slope() * fft_size as f64)
    }

    /// Metres per second per Doppler bin, `n_slots` chirps per slow-time
    /// sample.
    pub fn velocity_per_bin(&self, fft_size: usize, n_slots: usize) -> f64 {
        self.wavelength() / (2.0 * fft_size as f64 * n_slots as f64 * self.chirp_period_s)
    }

    pub fn validate(&self) -> StageResult<()> {
        let positive = [
            ("center_frequency_hz", self.center_frequency_hz),
            ("bandwidth_hz", self.bandwidth_hz),
            ("ramp_duration_s", self.ramp_duration_s),
            ("chirp_period_s", self.chirp_period_s),
            ("sample_rate_hz", self.sample_rate_hz),
        ];
        for (name, value) in positive {
            if !(value > 0.0) || !value.is_finite() {
                return Err(StageError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.ramp_duration_s > self.chirp_period_s {
            return Err(StageError::InvalidConfig(
                "ramp duration exceeds the chirp period".into(),
            ));
        }
        if self.samples_per_chirp == 0 || self.chirps_per_frame == 0 {
            return Err(StageError::InvalidConfig(
                "frame needs at least one chirp and one sample".into(),
            ));
        }
        self.packing.validate()
    }
}

/// Static-clutter suppression across the chirp axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClutterRemoval {
    #[default]
    None,
    /// Subtract the slow-time mean of every range bin.
    MeanRemoval,
    /// First difference along slow time; the first pulse is zeroed.
    TwoPulseCanceller,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeDopplerConfig {
    pub range_window: WindowKind,
    pub doppler_window: WindowKind,
    /// Range transform length; defaults to the samples per chirp.
    pub range_fft_size: Option<usize>,
    /// Doppler transform length; defaults to the chirps per slot.
    pub doppler_fft_size: Option<usize>,
    pub clutter_removal: ClutterRemoval,
}

impl Default for RangeDopplerConfig {
    fn default() -> Self {
        Self {
            range_window: WindowKind::Hann,
            doppler_window: WindowKind::Hann,
            range_fft_size: None,
            doppler_fft_size: None,
            clutter_removal: ClutterRemoval::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleMethod {
    #[default]
    Fft,
    /// Minimum-variance distortionless response (Capon).
    Mvdr,
}

/// Virtual channels used for angle estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSelection {
    #[default]
    CoPolar,
    All,
    Only(PolarizationPair),
}

impl ChannelSelection {
    pub fn accepts(self, pair: PolarizationPair) -> bool {
        match self {
            ChannelSelection::CoPolar => pair.is_co_polar(),
            ChannelSelection::All => true,
            ChannelSelection::Only(only) => pair == only,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamformingConfig {
    pub method: AngleMethod,
    pub channels: ChannelSelection,
    pub azimuth_bins: usize,
    pub elevation_bins: usize,
    /// Diagonal loading as a fraction of the mean channel power.
    pub diagonal_loading: f64,
    /// Snapshot neighbourhood half-widths for covariance estimation.
    pub snapshot_range_cells: usize,
    pub snapshot_doppler_cells: usize,
    pub max_condition: f64,
}

impl Default for BeamformingConfig {
    fn default() -> Self {
        Self {
            method: AngleMethod::Fft,
            channels: ChannelSelection::CoPolar,
            azimuth_bins: 64,
            elevation_bins: 1,
            diagonal_loading: 0.01,
            snapshot_range_cells: 2,
            snapshot_doppler_cells: 2,
            max_condition: 1e8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CfarVariant {
    #[default]
    #[serde(rename = "CA", alias = "cell_averaging")]
    CellAveraging,
    #[serde(rename = "OS", alias = "ordered_statistic")]
    OrderedStatistic,
    #[serde(rename = "GO", alias = "greatest_of")]
    GreatestOf,
}

/// Map axes the CFAR window extends over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CfarDimensions {
    Range,
    #[default]
    RangeDoppler,
    RangeDopplerAngle,
}

/// Axes on which the CFAR window wraps around instead of truncating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapAxes {
    pub range: bool,
    pub doppler: bool,
    pub angle: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CfarConfig {
    pub variant: CfarVariant,
    /// Training cells on each side of the cell under test, per axis.
    pub training_cells: usize,
    /// Guard cells on each side of the cell under test, per axis.
    pub guard_cells: usize,
    pub target_pfa: f64,
    pub dimensions: CfarDimensions,
    /// Rank of the ordered-statistic estimate as a fraction of the training
    /// count.
    pub os_rank_fraction: f64,
    pub wrap: WrapAxes,
    pub max_hits: usize,
}

impl Default for CfarConfig {
    fn default() -> Self {
        Self {
            variant: CfarVariant::CellAveraging,
            training_cells: 4,
            guard_cells: 2,
            target_pfa: 1e-5,
            dimensions: CfarDimensions::RangeDoppler,
            os_rank_fraction: 0.75,
            wrap: WrapAxes::default(),
            max_hits: 512,
        }
    }
}

impl CfarConfig {
    pub fn validate(&self) -> StageResult<()> {
        if self.training_cells == 0 {
            return Err(StageError::InvalidConfig(
                "CFAR needs at least one training cell".into(),
            ));
        }
        if !(self.target_pfa > 0.0 && self.target_pfa < 1.0) {
            return Err(StageError::InvalidConfig(format!(
                "target Pfa must lie in (0, 1), got {}",
                self.target_pfa
            )));
        }
        if !(self.os_rank_fraction > 0.0 && self.os_rank_fraction <= 1.0) {
            return Err(StageError::InvalidConfig(format!(
                "OS rank fraction must lie in (0, 1], got {}",
                self.os_rank_fraction
            )));
        }
        if self.max_hits == 0 {
            return Err(StageError::InvalidConfig("max_hits must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Largest bin gap per axis at which two hits still join a cluster.
    pub range_gap_bins: usize,
    pub doppler_gap_bins: usize,
    pub angle_gap_bins: usize,
    /// Constant added to the relative RCS estimate.
    pub rcs_offset_db: f32,
    pub min_confidence: f32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            range_gap_bins: 2,
            doppler_gap_bins: 2,
            angle_gap_bins: 2,
            rcs_offset_db: 0.0,
            min_confidence: 0.0,
        }
    }
}

/// Behaviour of a full inter-stage queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    #[default]
    Block,
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub queue_depth: usize,
    pub policy: QueuePolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4,
            policy: QueuePolicy::Block,
        }
    }
}

/// Everything a pipeline needs besides the calibration table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub radar: RadarParameters,
    pub geometry: ArrayGeometry,
    #[serde(default)]
    pub range_doppler: RangeDopplerConfig,
    #[serde(default)]
    pub beamforming: BeamformingConfig,
    #[serde(default)]
    pub cfar: CfarConfig,
    #[serde(default)]
    pub assembler: AssemblerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

impl PipelineConfig {
    pub fn new(geometry: ArrayGeometry) -> Self {
        Self {
            radar: RadarParameters::default(),
            geometry,
            range_doppler: RangeDopplerConfig::default(),
            beamforming: BeamformingConfig::default(),
            cfar: CfarConfig::default(),
            assembler: AssemblerConfig::default(),
            stream: StreamConfig::default(),
        }
    }

    pub fn cube_shape(&self) -> CubeShape {
        CubeShape::new(
            self.geometry.rx_count(),
            self.radar.chirps_per_frame,
            self.radar.samples_per_chirp,
        )
    }

    pub fn chirps_per_slot(&self) -> usize {
        self.radar.chirps_per_frame / self.geometry.slot_count().max(1)
    }

    pub fn range_fft_size(&self) -> usize {
        self.range_doppler
            .range_fft_size
            .unwrap_or(self.radar.samples_per_chirp)
    }

    pub fn doppler_fft_size(&self) -> usize {
        self.range_doppler
            .doppler_fft_size
            .unwrap_or_else(|| self.chirps_per_slot())
    }

    /// Rejects inconsistent configurations before any frame is processed.
    pub fn validate(&self) -> StageResult<()> {
        self.radar.validate()?;
        self.geometry.validate()?;
        self.cfar.validate()?;

        let slots = self.geometry.slot_count();
        if self.radar.chirps_per_frame % slots != 0 {
            return Err(StageError::InvalidConfig(format!(
                "{} chirps cannot be split evenly over {} transmit slots",
                self.radar.chirps_per_frame, slots
            )));
        }
        if self.range_fft_size() < self.radar.samples_per_chirp {
            return Err(StageError::InvalidConfig(format!(
                "range FFT size {} is shorter than {} samples",
                self.range_fft_size(),
                self.radar.samples_per_chirp
            )));
        }
        if self.doppler_fft_size() < self.chirps_per_slot() {
            return Err(StageError::InvalidConfig(format!(
                "Doppler FFT size {} is shorter than {} chirps per slot",
                self.doppler_fft_size(),
                self.chirps_per_slot()
            )));
        }
        if self.beamforming.azimuth_bins == 0 || self.beamforming.elevation_bins == 0 {
            return Err(StageError::InvalidConfig("angle grid must not be empty".into()));
        }
        if !(self.beamforming.diagonal_loading >= 0.0) {
            return Err(StageError::InvalidConfig(
                "diagonal loading must be non-negative".into(),
            ));
        }
        if self.stream.queue_depth == 0 {
            return Err(StageError::InvalidConfig("queue depth must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polarization;

    fn config() -> PipelineConfig {
        PipelineConfig::new(ArrayGeometry::uniform_linear(2, 4, Polarization::H))
    }

    #[test]
    fn default_waveform_resolutions() {
        let radar = RadarParameters::default();
        assert!((radar.range_per_bin(128) - 0.4997).abs() < 1e-3);
        assert!((radar.velocity_per_bin(32, 2) - 0.761).abs() < 1e-3);
    }

    #[test]
    fn default_config_validates() {
        config().validate().unwrap();
        assert_eq!(config().chirps_per_slot(), 32);
        assert_eq!(config().doppler_fft_size(), 32);
        assert_eq!(config().cube_shape(), CubeShape::new(4, 64, 128));
    }

    #[test]
    fn uneven_slot_split_is_rejected() {
        let mut cfg = config();
        cfg.radar.chirps_per_frame = 63;
        assert!(matches!(cfg.validate(), Err(StageError::InvalidConfig(_))));
    }

    #[test]
    fn short_transforms_are_rejected() {
        let mut cfg = config();
        cfg.range_doppler.range_fft_size = Some(64);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cfar_variant_uses_short_names() {
        let cfar: CfarConfig =
            serde_json::from_str(r#"{"variant": "OS", "training_cells": 6}"#).unwrap();
        assert_eq!(cfar.variant, CfarVariant::OrderedStatistic);
        assert_eq!(cfar.guard_cells, 2);
        let bad = CfarConfig {
            target_pfa: 1.5,
            ..CfarConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
