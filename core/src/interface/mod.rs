//! File-level formats exchanged with the outside world: raw captures in,
//! calibration tables, detection batches out.

pub mod calibration;
pub mod capture;
pub mod detection;

pub use calibration::{CalibrationMatrix, ChannelCalibration, CrossTalkCorrection};
pub use capture::{
    CaptureHeader, CaptureReader, CaptureWriter, FrameMetadata, IqOrder, PackingFormat, RawFrame,
};
pub use detection::{CaptureReport, Detection, FrameDetections};
