//! Audio pipeline stages: decoding, buffering, resampling, device output,
//! and level metering.

pub mod buffering;
pub mod formats;
pub mod level;
pub mod output;
pub mod resampler;
pub mod source;

pub use formats::FormatRegistry;
pub use output::{AudioDevice, BlockCallback, CpalOutput, StreamSpec};
pub use source::{AudioSource, SourceStatus};

/// Channel count of every internal buffer. The engine is stereo throughout;
/// other channel layouts are folded down (or up) at decode time.
pub const CHANNELS: usize = 2;
