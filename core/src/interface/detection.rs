use crate::prelude::StageResult;
use crate::telemetry::MetricsSnapshot;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Final target report emitted by the pipeline.
///
/// Units: metres, metres per second (positive = closing), degrees. The
/// polarimetric ratio is co-polar over cross-polar power and is absent when
/// the array has no cross-polar channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub timestamp: f64,
    pub frame_index: u32,
    pub range: f32,
    pub velocity: f32,
    pub azimuth: f32,
    pub elevation: f32,
    pub amplitude: f32,
    pub rcs_dbsm: f32,
    pub polarimetric_ratio: Option<f32>,
    pub snr_db: f32,
    pub confidence: f32,
    pub cluster_size: usize,
}

/// Detections and per-frame diagnostics for one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDetections {
    pub frame_index: u32,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
    /// Cells whose adaptive angle estimate fell back to the FFT.
    pub fallback_cells: usize,
    /// CFAR hits dropped by the per-frame cap.
    pub dropped_hits: usize,
}

/// One output batch per processed capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureReport {
    pub capture: String,
    pub frames: Vec<FrameDetections>,
    pub summary: MetricsSnapshot,
}

impl CaptureReport {
    pub fn detection_count(&self) -> usize {
        self.frames.iter().map(|f| f.detections.len()).sum()
    }

    pub fn write_to<W: Write>(&self, writer: W) -> StageResult<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> StageResult<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
