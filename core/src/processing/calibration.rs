use crate::config::PipelineConfig;
use crate::cube::{IqCube, RangeDopplerMap};
use crate::interface::calibration::CalibrationMatrix;
use crate::prelude::{ProcessingStage, Sample, StageError, StageResult};
use crate::telemetry::log::LogManager;
use ndarray::{s, ArrayViewMut3, Axis, Zip};
use rayon::prelude::*;
use std::sync::Arc;

/// Calibrated cube plus the range-dependent part of the correction, which
/// can only be applied once the range transform has run.
#[derive(Debug, Clone)]
pub struct CalibratedCube {
    pub cube: IqCube,
    pub range_correction: Option<RangeCorrection>,
}

/// Range-curve gains and cross-talk deferred to the range-Doppler domain.
///
/// Curves belong to the physical receiver, so they are applied to each
/// source channel before the polarimetric mixing combines H and V.
#[derive(Debug, Clone)]
pub struct RangeCorrection {
    calibration: Arc<CalibrationMatrix>,
}

impl RangeCorrection {
    pub fn gain(&self, rx: usize, bin: usize, bins: usize) -> Sample {
        self.calibration.range_coefficient(rx, bin, bins)
    }

    /// Scales every range bin of every map channel by its receiver's curve,
    /// then mixes each cross-talk pair within every transmit slot.
    pub fn apply(&self, map: &mut RangeDopplerMap) {
        let n_rx = map.n_rx();
        let n_slots = map.n_slots();
        let bins = map.range_bins();
        let mut data = map.data_mut();
        data.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(channel, mut lane)| {
                let rx = channel % n_rx;
                let has_curve = self
                    .calibration
                    .channels
                    .get(rx)
                    .map_or(false, |c| c.range_curve.is_some());
                if !has_curve {
                    return;
                }
                for (bin, mut row) in lane.axis_iter_mut(Axis(0)).enumerate() {
                    let gain = self.gain(rx, bin, bins);
                    row.mapv_inplace(|x| x * gain);
                }
            });
        for slot in 0..n_slots {
            for term in &self.calibration.cross_talk {
                mix(
                    &mut data,
                    slot * n_rx + term.h_channel,
                    slot * n_rx + term.v_channel,
                    &term.matrix,
                );
            }
        }
    }
}

/// Replaces lanes `h` and `v` of the leading axis with their 2x2 mix.
fn mix(data: &mut ArrayViewMut3<'_, Sample>, h: usize, v: usize, m: &[[Sample; 2]; 2]) {
    let (mut h, mut v) = data.multi_slice_mut((s![h, .., ..], s![v, .., ..]));
    Zip::from(&mut h).and(&mut v).for_each(|h, v| {
        let (a, b) = (*h, *v);
        *h = m[0][0] * a + m[0][1] * b;
        *v = m[1][0] * a + m[1][1] * b;
    });
}

/// Applies per-channel complex gains and polarimetric cross-talk terms.
pub struct CalibrationEngine {
    calibration: Arc<CalibrationMatrix>,
    identity: bool,
    logger: LogManager,
}

impl CalibrationEngine {
    pub fn new(config: &PipelineConfig, calibration: Arc<CalibrationMatrix>) -> StageResult<Self> {
        calibration.validate()?;
        calibration.validate_against(&config.geometry)?;
        let unit = Sample::new(1.0, 0.0);
        let identity = calibration.cross_talk.is_empty()
            && calibration.channels.iter().all(|c| c.coefficient == unit);
        let logger = LogManager::for_stage("calibration");
        logger.record(&format!(
            "calibration v{} loaded: {} channels, {} cross-talk terms, range curves {}",
            calibration.version,
            calibration.channel_count(),
            calibration.cross_talk.len(),
            calibration.has_range_curves()
        ));
        Ok(Self {
            calibration,
            identity,
            logger,
        })
    }

    pub fn calibration(&self) -> &CalibrationMatrix {
        &self.calibration
    }
}

impl ProcessingStage for CalibrationEngine {
    type Input = IqCube;
    type Output = CalibratedCube;

    fn name(&self) -> &'static str {
        "calibration"
    }

    fn execute(&self, mut cube: IqCube) -> StageResult<CalibratedCube> {
        let found = cube.shape().channels;
        let expected = self.calibration.channel_count();
        if found != expected {
            return Err(StageError::CalibrationMismatch { expected, found });
        }

        if !self.identity {
            let mut data = cube.data_mut();
            for (channel, cal) in self.calibration.channels.iter().enumerate() {
                let gain = cal.coefficient;
                data.index_axis_mut(Axis(0), channel)
                    .mapv_inplace(|x| x * gain);
            }
            // With range curves the mixing has to wait for the range bins.
            if !self.calibration.has_range_curves() {
                for term in &self.calibration.cross_talk {
                    mix(&mut data, term.h_channel, term.v_channel, &term.matrix);
                }
            }
        }
        self.logger
            .detail(&format!("frame {} calibrated", cube.frame_index()));

        let range_correction = self
            .calibration
            .has_range_curves()
            .then(|| RangeCorrection {
                calibration: Arc::clone(&self.calibration),
            });
        Ok(CalibratedCube {
            cube,
            range_correction,
        })
    }
}
