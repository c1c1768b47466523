pub mod checksum;
pub mod fft;
pub mod matrix;
pub mod stats;
pub mod window;

pub use checksum::Crc32;
pub use fft::FftHelper;
pub use matrix::MatrixHelper;
pub use stats::StatsHelper;
pub use window::WindowKind;
