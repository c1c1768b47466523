use crate::geometry::{ArrayGeometry, Polarization};
use crate::prelude::{Sample, StageError, StageResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Newest calibration table layout this build understands.
pub const CALIBRATION_FORMAT_VERSION: u32 = 1;

/// Correction for one receive channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    pub polarization: Polarization,
    /// Static complex gain (phase and amplitude).
    pub coefficient: Sample,
    /// Optional range-dependent gain, sampled uniformly from the first to
    /// the last range bin and interpolated linearly in between.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_curve: Option<Vec<Sample>>,
}

/// Polarimetric cross-talk correction for an (H, V) receive pair:
/// `[h', v'] = matrix * [h, v]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossTalkCorrection {
    pub h_channel: usize,
    pub v_channel: usize,
    pub matrix: [[Sample; 2]; 2],
}

/// Versioned per-channel calibration table, loaded once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMatrix {
    pub version: u32,
    pub channels: Vec<ChannelCalibration>,
    #[serde(default)]
    pub cross_talk: Vec<CrossTalkCorrection>,
}

impl CalibrationMatrix {
    /// Unit gains for every receiver of `geometry`, no cross-talk terms.
    pub fn identity(geometry: &ArrayGeometry) -> Self {
        Self {
            version: CALIBRATION_FORMAT_VERSION,
            channels: geometry
                .receivers
                .iter()
                .map(|rx| ChannelCalibration {
                    polarization: rx.polarization,
                    coefficient: Sample::new(1.0, 0.0),
                    range_curve: None,
                })
                .collect(),
            cross_talk: Vec::new(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> StageResult<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let matrix: CalibrationMatrix = serde_json::from_str(&contents)?;
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> StageResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), text)?;
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn has_range_curves(&self) -> bool {
        self.channels.iter().any(|c| c.range_curve.is_some())
    }

    pub fn validate(&self) -> StageResult<()> {
        if self.version == 0 || self.version > CALIBRATION_FORMAT_VERSION {
            return Err(StageError::InvalidConfig(format!(
                "unsupported calibration version {} (newest supported {})",
                self.version, CALIBRATION_FORMAT_VERSION
            )));
        }
        for (index, channel) in self.channels.iter().enumerate() {
            if matches!(&channel.range_curve, Some(curve) if curve.is_empty()) {
                return Err(StageError::InvalidConfig(format!(
                    "channel {} has an empty range curve",
                    index
                )));
            }
        }
        for term in &self.cross_talk {
            let h = self.channels.get(term.h_channel);
            let v = self.channels.get(term.v_channel);
            match (h, v) {
                (Some(h), Some(v))
                    if h.polarization == Polarization::H && v.polarization == Polarization::V => {}
                _ => {
                    return Err(StageError::InvalidConfig(format!(
                        "cross-talk term ({}, {}) must pair an H channel with a V channel",
                        term.h_channel, term.v_channel
                    )))
                }
            }
        }
        Ok(())
    }

    /// Checks the table against the receive array it is applied to.
    pub fn validate_against(&self, geometry: &ArrayGeometry) -> StageResult<()> {
        if self.channel_count() != geometry.rx_count() {
            return Err(StageError::CalibrationMismatch {
                expected: self.channel_count(),
                found: geometry.rx_count(),
            });
        }
        for (index, (channel, rx)) in self.channels.iter().zip(&geometry.receivers).enumerate() {
            if channel.polarization != rx.polarization {
                return Err(StageError::InvalidConfig(format!(
                    "calibration channel {} is {:?}-polarized, receiver is {:?}",
                    index, channel.polarization, rx.polarization
                )));
            }
        }
        Ok(())
    }

    /// Range-curve gain for `bin` of `bins`; unity for channels without a
    /// curve.
    pub fn range_coefficient(&self, channel: usize, bin: usize, bins: usize) -> Sample {
        let curve = match self.channels.get(channel).and_then(|c| c.range_curve.as_ref()) {
            Some(curve) if !curve.is_empty() => curve,
            _ => return Sample::new(1.0, 0.0),
        };
        if curve.len() == 1 || bins <= 1 {
            return curve[0];
        }
        let position = bin as f32 / (bins - 1) as f32 * (curve.len() - 1) as f32;
        let lower = (position.floor() as usize).min(curve.len() - 1);
        let upper = (lower + 1).min(curve.len() - 1);
        let frac = position - lower as f32;
        curve[lower] * (1.0 - frac) + curve[upper] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polarization;
    use tempfile::NamedTempFile;

    #[test]
    fn identity_matches_geometry() {
        let geometry = ArrayGeometry::interleaved_two_chip();
        let cal = CalibrationMatrix::identity(&geometry);
        assert_eq!(cal.channel_count(), 8);
        cal.validate().unwrap();
        cal.validate_against(&geometry).unwrap();
    }

    #[test]
    fn mismatched_channel_count_is_reported() {
        let cal = CalibrationMatrix::identity(&ArrayGeometry::uniform_linear(1, 4, Polarization::H));
        let err = cal
            .validate_against(&ArrayGeometry::uniform_linear(1, 8, Polarization::H))
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::CalibrationMismatch {
                expected: 4,
                found: 8
            }
        ));
    }

    #[test]
    fn future_versions_are_rejected() {
        let mut cal = CalibrationMatrix::identity(&ArrayGeometry::uniform_linear(1, 2, Polarization::H));
        cal.version = CALIBRATION_FORMAT_VERSION + 1;
        assert!(cal.validate().is_err());
    }

    #[test]
    fn cross_talk_must_pair_h_with_v() {
        let geometry = ArrayGeometry::interleaved_two_chip();
        let mut cal = CalibrationMatrix::identity(&geometry);
        let one = Sample::new(1.0, 0.0);
        let zero = Sample::new(0.0, 0.0);
        cal.cross_talk.push(CrossTalkCorrection {
            h_channel: 0,
            v_channel: 2,
            matrix: [[one, zero], [zero, one]],
        });
        assert!(cal.validate().is_err());
        cal.cross_talk[0].v_channel = 1;
        assert!(cal.validate().is_ok());
    }

    #[test]
    fn range_curve_interpolates_linearly() {
        let geometry = ArrayGeometry::uniform_linear(1, 1, Polarization::H);
        let mut cal = CalibrationMatrix::identity(&geometry);
        cal.channels[0].range_curve = Some(vec![Sample::new(1.0, 0.0), Sample::new(3.0, 0.0)]);
        assert_eq!(cal.range_coefficient(0, 0, 5), Sample::new(1.0, 0.0));
        assert_eq!(cal.range_coefficient(0, 2, 5), Sample::new(2.0, 0.0));
        assert_eq!(cal.range_coefficient(0, 4, 5), Sample::new(3.0, 0.0));
        assert_eq!(cal.range_coefficient(3, 1, 5), Sample::new(1.0, 0.0));
    }

    #[test]
    fn save_and_load_round_trip() {
        let geometry = ArrayGeometry::dual_polarized_linear(2);
        let mut cal = CalibrationMatrix::identity(&geometry);
        cal.channels[1].coefficient = Sample::new(0.5, -0.25);
        let file = NamedTempFile::new().unwrap();
        cal.save(file.path()).unwrap();
        assert_eq!(CalibrationMatrix::load(file.path()).unwrap(), cal);
    }
}
