use std::path::Path;
use std::time::Duration;

use image::GrayImage;

use super::VideoInfo;
use crate::{Error, Result};

/// A decoded frame with its native (container) timestamp in seconds.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub timestamp: f64,
    pub image: GrayImage,
}

/// A single forward pass over the frames of one video stream.
pub trait FrameStream {
    /// Decodes the next frame, or returns `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>>;

    /// Moves the stream to a keyframe at or before `position` (seconds, container time).
    ///
    /// Frames returned after a seek keep their container timestamps. Seeking is best-effort:
    /// callers check [FrameStream::can_seek] first and decode forward when it is false.
    fn seek(&mut self, position: f64) -> Result<()>;

    /// Whether frames decoded after a [FrameStream::seek] still carry their true timestamps.
    ///
    /// Streams without container timestamps count frames from wherever decoding resumes, so a
    /// seek would shift their clock.
    fn can_seek(&self) -> bool {
        true
    }
}

/// Rejects a seek to `position` in a stream whose first timestamp is `start` and which lasts
/// `duration` seconds. Both `position` and `start` are container time. A zero duration is
/// unknown and always passes.
pub(crate) fn check_seek_position(position: f64, start: f64, duration: f64) -> Result<()> {
    if duration > 0.0 && position >= start + duration {
        return Err(Error::InvalidSeekTimestamp {
            requested: Duration::from_secs_f64((position - start).max(0.0)),
            duration: Duration::from_secs_f64(duration),
        });
    }
    Ok(())
}

/// Source of video metadata and frame streams.
///
/// A backend is queried once per video for its [VideoInfo] and then opened once per sampling
/// pass. Each opened stream is independent of any other.
pub trait Backend {
    type Stream: FrameStream;

    fn video_info(&self, path: &Path) -> Result<VideoInfo>;

    fn open(&self, path: &Path) -> Result<Self::Stream>;
}
