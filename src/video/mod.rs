mod backend;
mod correlator;
mod data;
mod ffmpeg;
mod finder;
mod hash;
mod sampler;
mod signature;
#[cfg(test)]
pub(crate) mod synthetic;

pub use backend::{Backend, DecodedFrame, FrameStream};
pub use correlator::{correlate, correlate_with_cancel, Correlation};
pub use data::{OffsetResult, VideoInfo};
pub use ffmpeg::{FFmpegBackend, FFmpegStream};
pub use finder::{CancelToken, Finder, Phase, Progress, ProgressFn, VideoRole};
pub use sampler::{Frame, Sampler};
pub use signature::{
    extract, Algorithm, BitSignature, Extractor, PixelSignature, Signature, SignatureSeries,
    SignatureShape,
};

/// Default hash size.
///
/// Bit-vector signatures have `hash_size * hash_size` bits. Larger values are more precise,
/// but every bit is paid for in the correlator's inner loop.
pub const DEFAULT_HASH_SIZE: usize = 16;

/// Default coarse sampling rate (frames per second).
pub const DEFAULT_COARSE_FPS: f64 = 1.0;

/// Default fine sampling rate (frames per second).
pub const DEFAULT_FINE_FPS: f64 = 10.0;

/// Default refinement window (seconds).
///
/// The fine phase searches this far on either side of the coarse estimate.
pub const DEFAULT_REFINE_WINDOW: f64 = 2.0;

/// Refinement window of the native-rate phase (seconds).
pub const NATIVE_REFINE_WINDOW: f64 = 0.5;

/// Width and height of direct-pixel (SAD) signatures.
pub const PIXEL_SIGNATURE_SIZE: u32 = 64;

/// Frame rate assumed when the container does not report one.
pub const FALLBACK_FPS: f64 = 25.0;

/// Start times above this threshold (seconds) make the sampler seek instead of decoding from
/// the first frame.
pub const SEEK_THRESHOLD: f64 = 0.5;

/// How far before the requested start the sampler seeks (seconds). Seeks land on the keyframe
/// at or before the target, so the margin keeps the start inside the decoded range.
pub const SEEK_MARGIN: f64 = 0.5;
