use crate::workflow::config::WorkflowConfig;
use anyhow::{bail, Context};
use log::info;
use pomaarcore::interface::capture::CaptureReader;
use pomaarcore::interface::detection::{CaptureReport, FrameDetections};
use pomaarcore::{Pipeline, StreamingPipeline};
use std::path::Path;
use tokio::sync::watch;

/// Runs a workflow's pipeline over capture files.
#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    fn prepare(&self, capture: &Path) -> anyhow::Result<(Pipeline, CaptureReader)> {
        let pipeline_config = self.config.pipeline_config()?;
        let calibration = self.config.calibration_matrix(&pipeline_config)?;
        let reader = CaptureReader::open(capture)
            .with_context(|| format!("opening capture {}", capture.display()))?;

        let expected = pipeline_config.cube_shape();
        if reader.header().shape != expected {
            bail!(
                "capture {} holds {:?} cubes, configuration expects {:?}",
                capture.display(),
                reader.header().shape.dims(),
                expected.dims()
            );
        }
        let pipeline =
            Pipeline::new(pipeline_config, calibration).context("building pipeline")?;
        Ok((pipeline, reader))
    }

    fn report(capture: &Path, pipeline: &Pipeline, frames: Vec<FrameDetections>) -> CaptureReport {
        let report = CaptureReport {
            capture: capture.display().to_string(),
            frames,
            summary: pipeline.metrics(),
        };
        info!(
            "{}: {} frames, {} detections, {} skipped",
            report.capture,
            report.summary.frames_processed,
            report.detection_count(),
            report.summary.frames_skipped
        );
        report
    }

    /// Processes every frame of `capture` in order on the calling thread.
    pub fn execute(&self, capture: &Path) -> anyhow::Result<CaptureReport> {
        let (pipeline, reader) = self.prepare(capture)?;
        let frames = pipeline
            .run(reader)
            .with_context(|| format!("processing {}", capture.display()))?;
        Ok(Self::report(capture, &pipeline, frames))
    }

    /// Processes `capture` through the concurrent stage tasks until the
    /// capture ends or `shutdown` is raised.
    pub async fn execute_streaming(
        &self,
        capture: &Path,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<CaptureReport> {
        let (pipeline, reader) = self.prepare(capture)?;
        let streaming = StreamingPipeline::new(pipeline);
        let frames = streaming
            .run(reader, shutdown)
            .await
            .with_context(|| format!("streaming {}", capture.display()))?;
        Ok(Self::report(capture, streaming.pipeline(), frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::profile::{write_capture, GeneratorConfig, GeometryPreset};
    use pomaarcore::synth::{Scene, Target};

    fn small_workflow() -> WorkflowConfig {
        let mut pipeline = GeometryPreset::UniformLinear.pipeline_config();
        pipeline.radar.samples_per_chirp = 64;
        pipeline.radar.chirps_per_frame = 32;
        pipeline.cfar.target_pfa = 1e-6;
        WorkflowConfig {
            pipeline: Some(pipeline),
            generator: GeneratorConfig {
                frames: 3,
                scene: Scene {
                    targets: vec![Target {
                        range_m: 12.0,
                        velocity_mps: -2.0,
                        azimuth_deg: 0.0,
                        elevation_deg: 0.0,
                        snr_db: 25.0,
                        scattering: Default::default(),
                    }],
                    seed: 4,
                    ..Scene::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn runner_processes_generated_capture() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_workflow();
        let written =
            write_capture(&cfg.pipeline_config().unwrap(), &cfg.generator, dir.path()).unwrap();

        let report = Runner::new(cfg).execute(&written.capture).unwrap();
        assert_eq!(report.frames.len(), 3);
        assert_eq!(report.summary.frames_processed, 3);
        for frame in &report.frames {
            assert_eq!(frame.detections.len(), 1);
            assert!((frame.detections[0].range - 12.0).abs() < 1.0);
            assert!(frame.detections[0].velocity < 0.0);
        }
    }

    #[test]
    fn mismatched_capture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_workflow();
        let written =
            write_capture(&cfg.pipeline_config().unwrap(), &cfg.generator, dir.path()).unwrap();

        let other = WorkflowConfig::from_preset(GeometryPreset::DualPolarized);
        let err = Runner::new(other).execute(&written.capture).unwrap_err();
        assert!(format!("{:#}", err).contains("configuration expects"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streaming_runner_matches_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_workflow();
        let written =
            write_capture(&cfg.pipeline_config().unwrap(), &cfg.generator, dir.path()).unwrap();

        let runner = Runner::new(cfg);
        let sequential = runner.execute(&written.capture).unwrap();
        let (_tx, shutdown) = watch::channel(false);
        let streamed = runner
            .execute_streaming(&written.capture, shutdown)
            .await
            .unwrap();
        assert_eq!(streamed.frames, sequential.frames);
    }
}
