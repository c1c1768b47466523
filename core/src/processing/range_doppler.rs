use crate::config::{ClutterRemoval, PipelineConfig, RadarParameters};
use crate::cube::RangeDopplerMap;
use crate::math::fft::{fft_shift, FftHelper};
use crate::math::stats::StatsHelper;
use crate::prelude::{ProcessingStage, Sample, StageError, StageResult};
use crate::processing::calibration::CalibratedCube;
use crate::telemetry::log::LogManager;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;

/// Windowed range and Doppler transforms per receive channel and transmit
/// slot.
///
/// Chirp `k * n_slots + slot` belongs to `slot`. Output channels follow
/// [`RangeDopplerMap::channel_index`].
pub struct RangeDopplerProcessor {
    range_fft: FftHelper,
    doppler_fft: FftHelper,
    range_window: Vec<f32>,
    doppler_window: Vec<f32>,
    clutter: ClutterRemoval,
    n_rx: usize,
    n_slots: usize,
    samples: usize,
    chirps_per_slot: usize,
    radar: RadarParameters,
    logger: LogManager,
}

impl RangeDopplerProcessor {
    pub fn new(config: &PipelineConfig) -> StageResult<Self> {
        config.validate()?;
        let rd = &config.range_doppler;
        Ok(Self {
            range_fft: FftHelper::new(config.range_fft_size()),
            doppler_fft: FftHelper::new(config.doppler_fft_size()),
            range_window: rd.range_window.coefficients(config.radar.samples_per_chirp),
            doppler_window: rd.doppler_window.coefficients(config.chirps_per_slot()),
            clutter: rd.clutter_removal,
            n_rx: config.geometry.rx_count(),
            n_slots: config.geometry.slot_count(),
            samples: config.radar.samples_per_chirp,
            chirps_per_slot: config.chirps_per_slot(),
            radar: config.radar.clone(),
            logger: LogManager::for_stage("range_doppler"),
        })
    }

    pub fn range_bins(&self) -> usize {
        self.range_fft.size()
    }

    pub fn doppler_bins(&self) -> usize {
        self.doppler_fft.size()
    }

    /// Metres per range bin.
    pub fn range_resolution(&self) -> f64 {
        self.radar.range_per_bin(self.range_bins())
    }

    /// Metres per second per Doppler bin.
    pub fn velocity_resolution(&self) -> f64 {
        self.radar
            .velocity_per_bin(self.doppler_bins(), self.n_slots)
    }

    /// Range of bin `bin` in metres.
    pub fn bin_to_range(&self, bin: f32) -> f32 {
        bin * self.range_resolution() as f32
    }

    /// Radial velocity of a (shifted) Doppler bin, positive when closing.
    pub fn bin_to_velocity(&self, bin: f32) -> f32 {
        (bin - (self.doppler_bins() / 2) as f32) * self.velocity_resolution() as f32
    }

    /// Range spectra `[chirp in slot][range bin]` for one receiver and slot.
    fn range_profiles(&self, channel: ArrayView2<Sample>, slot: usize) -> Array2<Sample> {
        let mut profiles = Array2::zeros((self.chirps_per_slot, self.range_bins()));
        for (k, mut row) in profiles.axis_iter_mut(Axis(0)).enumerate() {
            let chirp = k * self.n_slots + slot;
            let spectrum = self
                .range_fft
                .forward_windowed(channel.row(chirp), &self.range_window);
            row.assign(&ArrayView1::from(&spectrum[..]));
        }
        profiles
    }

    fn remove_clutter(&self, mut profiles: ArrayViewMut2<Sample>) {
        match self.clutter {
            ClutterRemoval::None => {}
            ClutterRemoval::MeanRemoval => {
                let count = profiles.nrows().max(1) as f32;
                for mut column in profiles.axis_iter_mut(Axis(1)) {
                    let mean = column.iter().sum::<Sample>() / count;
                    column.mapv_inplace(|x| x - mean);
                }
            }
            ClutterRemoval::TwoPulseCanceller => {
                for mut column in profiles.axis_iter_mut(Axis(1)) {
                    for k in (1..column.len()).rev() {
                        column[k] = column[k] - column[k - 1];
                    }
                    if !column.is_empty() {
                        column[0] = Sample::new(0.0, 0.0);
                    }
                }
            }
        }
    }

    /// Shifted Doppler spectra `[range bin][Doppler bin]`.
    fn doppler_map(&self, profiles: ArrayView2<Sample>, mut out: ArrayViewMut2<Sample>) {
        for (bin, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
            let mut spectrum = self
                .doppler_fft
                .forward_windowed(profiles.column(bin), &self.doppler_window);
            fft_shift(&mut spectrum);
            row.assign(&ArrayView1::from(&spectrum[..]));
        }
    }
}

impl ProcessingStage for RangeDopplerProcessor {
    type Input = CalibratedCube;
    type Output = RangeDopplerMap;

    fn name(&self) -> &'static str {
        "range_doppler"
    }

    fn execute(&self, input: CalibratedCube) -> StageResult<RangeDopplerMap> {
        let cube = &input.cube;
        let shape = cube.shape();
        if shape.channels != self.n_rx || shape.samples != self.samples {
            return Err(StageError::Dimension(format!(
                "cube is {:?}, processor expects {} channels x {} samples",
                shape.dims(),
                self.n_rx,
                self.samples
            )));
        }
        if shape.chirps != self.chirps_per_slot * self.n_slots {
            return Err(StageError::Dimension(format!(
                "{} chirps do not fill {} slots of {}",
                shape.chirps, self.n_slots, self.chirps_per_slot
            )));
        }

        let channels = self.n_rx * self.n_slots;
        let mut data = Array3::<Sample>::zeros((channels, self.range_bins(), self.doppler_bins()));
        data.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(channel, lane)| {
                let slot = channel / self.n_rx;
                let rx = channel % self.n_rx;
                let mut profiles = self.range_profiles(cube.channel(rx), slot);
                self.remove_clutter(profiles.view_mut());
                self.doppler_map(profiles.view(), lane);
            });

        let mut map = RangeDopplerMap::new(
            data,
            self.n_rx,
            self.n_slots,
            cube.frame_index(),
            cube.timestamp(),
        )?;
        if let Some(correction) = &input.range_correction {
            correction.apply(&mut map);
        }

        let rms = StatsHelper::complex_rms(map.data().iter());
        self.logger.detail(&format!(
            "frame {} range-Doppler RMS {:.4}",
            map.frame_index(),
            rms
        ));
        Ok(map)
    }
}
