//! Core signal processing for the polarimetric MIMO automotive radar
//! pipeline.
//!
//! Raw ADC frames flow through ingestion, calibration, range-Doppler
//! transforms, virtual-array beamforming, CFAR detection and detection
//! assembly. Each stage is a [`ProcessingStage`] built once from a
//! [`config::PipelineConfig`] and shared read-only across frames.

pub mod config;
pub mod cube;
pub mod geometry;
pub mod interface;
pub mod math;
pub mod pipeline;
pub mod prelude;
pub mod processing;
pub mod synth;
pub mod telemetry;

pub use config::PipelineConfig;
pub use pipeline::{Pipeline, StreamingPipeline};
pub use prelude::{ParseError, ProcessingStage, StageError, StageResult};
