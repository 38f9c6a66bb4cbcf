pub mod filename;
pub mod image;

pub use filename::{AllocatedFilename, FilenameAllocator, OutputRequest, SuffixStyle};
pub use self::image::{AlphaMode, FloatImage};

use std::time::Instant;

/// Milliseconds since `start`, for the per step timings in the logs.
#[inline]
pub fn elapsed_ms(start: Instant) -> u128 {
    start.elapsed().as_millis()
}
