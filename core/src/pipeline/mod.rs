//! Stage wiring: sequential per-frame processing and the streaming runner.

pub mod stream;

use crate::config::PipelineConfig;
use crate::cube::IqCube;
use crate::interface::calibration::CalibrationMatrix;
use crate::interface::capture::RawFrame;
use crate::interface::detection::FrameDetections;
use crate::prelude::{ParseError, ProcessingStage, StageResult};
use crate::processing::{
    CalibrationEngine, CfarDetector, CfarFrame, DetectionAssembler, FrameIngestor,
    RangeDopplerProcessor, VirtualArrayBeamformer,
};
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::{MetricsRecorder, MetricsSnapshot};
use std::sync::Arc;

pub use stream::{FrameQueue, PushOutcome, StreamingPipeline};

/// Every stage built once from one configuration and shared read-only.
pub struct Pipeline {
    config: PipelineConfig,
    ingestor: FrameIngestor,
    calibration: CalibrationEngine,
    range_doppler: RangeDopplerProcessor,
    beamformer: VirtualArrayBeamformer,
    cfar: CfarDetector,
    assembler: DetectionAssembler,
    metrics: Arc<MetricsRecorder>,
    logger: LogManager,
}

impl Pipeline {
    /// Validates the configuration and builds every stage. Any error here is
    /// fatal and happens before the first frame.
    pub fn new(config: PipelineConfig, calibration: Arc<CalibrationMatrix>) -> StageResult<Self> {
        config.validate()?;
        let pipeline = Self {
            ingestor: FrameIngestor::new(&config)?,
            calibration: CalibrationEngine::new(&config, calibration)?,
            range_doppler: RangeDopplerProcessor::new(&config)?,
            beamformer: VirtualArrayBeamformer::new(&config)?,
            cfar: CfarDetector::new(&config)?,
            assembler: DetectionAssembler::new(&config)?,
            metrics: Arc::new(MetricsRecorder::new()),
            logger: LogManager::new(),
            config,
        };
        pipeline.logger.record(&format!(
            "pipeline ready: {:?} cube, range res {:.3} m, velocity res {:.3} m/s",
            pipeline.config.cube_shape().dims(),
            pipeline.range_doppler.range_resolution(),
            pipeline.range_doppler.velocity_resolution()
        ));
        Ok(pipeline)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ingestor(&self) -> &FrameIngestor {
        &self.ingestor
    }

    pub fn range_doppler(&self) -> &RangeDopplerProcessor {
        &self.range_doppler
    }

    pub fn beamformer(&self) -> &VirtualArrayBeamformer {
        &self.beamformer
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs every stage after ingestion on one decoded cube.
    pub fn process_cube(&self, cube: IqCube) -> StageResult<FrameDetections> {
        let calibrated = self.calibration.execute(cube)?;
        let map = self.range_doppler.execute(calibrated)?;
        let beamformed = self.beamformer.execute(map)?;
        let cfar = self.cfar.execute(beamformed)?;
        self.assemble(cfar)
    }

    pub fn process_frame(&self, frame: RawFrame) -> StageResult<FrameDetections> {
        let cube = self.ingestor.execute(frame)?;
        self.process_cube(cube)
    }

    fn assemble(&self, cfar: CfarFrame) -> StageResult<FrameDetections> {
        let frame_index = cfar.frame.frame_index;
        let timestamp = cfar.frame.timestamp;
        let fallback_cells = cfar.frame.fallback_cells;
        let dropped_hits = cfar.map.overflow.map_or(0, |o| o.dropped());
        let detections = self.assembler.execute(cfar)?;
        Ok(FrameDetections {
            frame_index,
            timestamp,
            detections,
            fallback_cells,
            dropped_hits,
        })
    }

    fn record(&self, frame: &FrameDetections) {
        self.metrics.record_processed(
            frame.detections.len(),
            frame.fallback_cells,
            frame.dropped_hits,
        );
    }

    /// Processes frames in order. Per-frame errors skip the frame and are
    /// counted; the first fatal error aborts the run.
    pub fn run<I>(&self, frames: I) -> StageResult<Vec<FrameDetections>>
    where
        I: IntoIterator<Item = Result<RawFrame, ParseError>>,
    {
        let mut reports = Vec::new();
        for item in frames {
            let outcome = item
                .map_err(Into::into)
                .and_then(|frame| self.process_frame(frame));
            match outcome {
                Ok(report) => {
                    self.record(&report);
                    reports.push(report);
                }
                Err(err) if !err.is_fatal() => {
                    self.logger.warn(&format!("skipping frame: {}", err));
                    self.metrics.record_skipped();
                }
                Err(err) => {
                    self.logger.warn(&format!("aborting run: {}", err));
                    return Err(err);
                }
            }
        }
        let summary = self.metrics.snapshot();
        self.logger.record(&format!(
            "run complete: {} processed, {} skipped, {} detections",
            summary.frames_processed, summary.frames_skipped, summary.detections
        ));
        Ok(reports)
    }
}
