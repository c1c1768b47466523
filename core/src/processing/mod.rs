pub mod assembler;
pub mod beamform;
pub mod calibration;
pub mod cfar;
pub mod ingest;
pub mod range_doppler;

pub use assembler::DetectionAssembler;
pub use beamform::{BeamformedFrame, VirtualArrayBeamformer};
pub use calibration::{CalibratedCube, CalibrationEngine, RangeCorrection};
pub use cfar::{CfarDetector, CfarFrame, CfarHit, CfarMap, OverflowReport};
pub use ingest::FrameIngestor;
pub use range_doppler::RangeDopplerProcessor;
