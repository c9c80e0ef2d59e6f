use std::path::PathBuf;
use std::time::Duration;

pub mod util;
pub mod video;

use video::{Phase, VideoRole};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("video not found at: {0:?}")]
    VideoNotFound(PathBuf),
    #[error("no video stream found in: {0:?}")]
    NoVideoStream(PathBuf),
    #[error("decoded frame is malformed in: {0:?}")]
    MalformedFrame(PathBuf),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("hash size {hash_size} is not supported by {algorithm}")]
    InvalidHashSize {
        algorithm: video::Algorithm,
        hash_size: usize,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid timestamp for seek: requested={requested:?} duration={duration:?}")]
    InvalidSeekTimestamp {
        requested: Duration,
        duration: Duration,
    },
    #[error("{phase} phase sampled no frames from the {video} video")]
    EmptySignatureSeries { phase: Phase, video: VideoRole },
    #[error("signatures of different shapes cannot be compared")]
    SignatureShapeMismatch,
    #[error("signature timestamps must increase: {timestamp} after {previous}")]
    UnorderedTimestamps { previous: f64, timestamp: f64 },
    #[error("search was cancelled")]
    Cancelled,
    #[error("FFmpeg error: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),
    #[error("serde_json error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
