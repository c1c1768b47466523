use num_complex::Complex32;

/// Complex baseband sample type used throughout the pipeline.
pub type Sample = Complex32;

/// Reasons a single raw frame cannot be decoded. Always non-fatal: the frame
/// is skipped and the stream continues.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("truncated frame: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("misaligned frame: {0}")]
    Misaligned(String),
    #[error("corrupt frame: checksum {computed:#010x} does not match {declared:#010x}")]
    Corrupt { declared: u32, computed: u32 },
    #[error("lost synchronization: skipped {skipped} bytes at offset {offset}")]
    Sync { offset: u64, skipped: usize },
    #[error("bad capture header: {0}")]
    Header(String),
}

/// Common error type for stage execution.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("calibration mismatch: calibration has {expected} channels, capture has {found}")]
    CalibrationMismatch { expected: usize, found: usize },
    #[error("numerical error: {0}")]
    Numerical(String),
    #[error("detection overflow: {found} hits exceed cap of {cap}")]
    DetectionOverflow { found: usize, cap: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("dimension mismatch: {0}")]
    Dimension(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl StageError {
    /// Whether the error must abort the whole run rather than the current
    /// frame or cell.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StageError::Parse(_) | StageError::Numerical(_) | StageError::DetectionOverflow { .. }
        )
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// A pure per-frame transformation. Stages are built once from the pipeline
/// configuration and then shared read-only across frames and threads.
pub trait ProcessingStage {
    type Input;
    type Output;

    fn name(&self) -> &'static str;
    fn execute(&self, input: Self::Input) -> StageResult<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_frame_errors_are_not_fatal() {
        let parse = StageError::from(ParseError::Misaligned("lane".into()));
        assert!(!parse.is_fatal());
        assert!(!StageError::Numerical("singular".into()).is_fatal());
        assert!(!StageError::DetectionOverflow { found: 10, cap: 4 }.is_fatal());
    }

    #[test]
    fn configuration_errors_are_fatal() {
        let mismatch = StageError::CalibrationMismatch {
            expected: 8,
            found: 4,
        };
        assert!(mismatch.is_fatal());
        assert!(StageError::InvalidConfig("bad".into()).is_fatal());
        assert!(mismatch.to_string().contains("8 channels"));
    }
}
