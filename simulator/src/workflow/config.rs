use crate::generator::profile::{GeneratorConfig, GeometryPreset};
use anyhow::Context;
use pomaarcore::config::PipelineConfig;
use pomaarcore::interface::calibration::CalibrationMatrix;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Driver settings loaded from YAML. An explicit `pipeline` section wins
/// over `preset`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub preset: GeometryPreset,
    pub pipeline: Option<PipelineConfig>,
    /// Calibration table; identity for the configured geometry when absent.
    pub calibration: Option<PathBuf>,
    pub generator: GeneratorConfig,
    /// Process through the concurrent stage tasks instead of frame by frame.
    pub streaming: bool,
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn from_preset(preset: GeometryPreset) -> Self {
        Self {
            preset,
            ..Default::default()
        }
    }

    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let config = self
            .pipeline
            .clone()
            .unwrap_or_else(|| self.preset.pipeline_config());
        config.validate().context("validating pipeline configuration")?;
        Ok(config)
    }

    pub fn calibration_matrix(&self, config: &PipelineConfig) -> anyhow::Result<Arc<CalibrationMatrix>> {
        let matrix = match &self.calibration {
            Some(path) => CalibrationMatrix::load(path)
                .with_context(|| format!("loading calibration {}", path.display()))?,
            None => CalibrationMatrix::identity(&config.geometry),
        };
        Ok(Arc::new(matrix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pomaarcore::config::CfarVariant;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn preset_supplies_pipeline() {
        let cfg = WorkflowConfig::from_preset(GeometryPreset::UniformLinear);
        let pipeline = cfg.pipeline_config().unwrap();
        assert_eq!(pipeline.geometry.rx_count(), 4);
        assert_eq!(cfg.calibration_matrix(&pipeline).unwrap().channel_count(), 4);
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"preset: interleaved_two_chip\nstreaming: true\ngenerator:\n  frames: 3\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.preset, GeometryPreset::InterleavedTwoChip);
        assert!(cfg.streaming);
        assert_eq!(cfg.generator.frames, 3);
    }

    #[test]
    fn explicit_pipeline_overrides_preset() {
        let yaml = r#"
pipeline:
  geometry:
    transmitters:
      - { position: [0.0, 0.0], polarization: H }
    receivers:
      - { position: [0.0, 0.0], polarization: H }
      - { position: [1.0, 0.0], polarization: H }
  radar:
    samples_per_chirp: 64
    chirps_per_frame: 32
  cfar:
    variant: OS
    target_pfa: 1.0e-4
"#;
        let cfg: WorkflowConfig = serde_yaml::from_str(yaml).unwrap();
        let pipeline = cfg.pipeline_config().unwrap();
        assert_eq!(pipeline.geometry.rx_count(), 2);
        assert_eq!(pipeline.radar.samples_per_chirp, 64);
        assert_eq!(pipeline.radar.center_frequency_hz, 77.0e9);
        assert_eq!(pipeline.cfar.variant, CfarVariant::OrderedStatistic);
        assert_eq!(pipeline.cfar.training_cells, 4);
    }

    #[test]
    fn invalid_pipeline_is_reported() {
        let mut cfg = WorkflowConfig::default();
        let mut pipeline = cfg.preset.pipeline_config();
        pipeline.radar.chirps_per_frame = 63;
        cfg.pipeline = Some(pipeline);
        let err = cfg.pipeline_config().unwrap_err();
        assert!(format!("{:#}", err).contains("transmit slots"));
    }

    #[test]
    fn missing_calibration_file_is_an_error() {
        let cfg = WorkflowConfig {
            calibration: Some(PathBuf::from("/nonexistent/calibration.json")),
            ..Default::default()
        };
        let pipeline = cfg.pipeline_config().unwrap();
        assert!(cfg.calibration_matrix(&pipeline).is_err());
    }
}
