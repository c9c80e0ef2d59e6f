//! Deterministic in-memory videos for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::GrayImage;

use super::backend::check_seek_position;
use super::{Backend, DecodedFrame, FrameStream, VideoInfo};
use crate::{Error, Result};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
const BLOCK: u32 = 8;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Renders content frame `index`: a moving interference pattern plus per-block noise, so
/// that every content frame is distinct from its neighbours.
pub(crate) fn render(index: i64) -> GrayImage {
    let k = index as f64;
    GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let wave = 60.0 * (x as f64 * 0.15 + k * 0.21).sin() * (y as f64 * 0.11 - k * 0.13).cos();
        let seed = (index as u64) << 32 | u64::from(y / BLOCK) << 16 | u64::from(x / BLOCK);
        let noise = (splitmix64(seed) % 81) as f64 - 40.0;
        image::Luma([(128.0 + wave + noise).round().clamp(0.0, 255.0) as u8])
    })
}

/// Description of one synthetic video.
#[derive(Clone, Debug)]
pub(crate) struct SyntheticVideo {
    fps: f64,
    frames: usize,
    content_offset: i64,
    pts_offset: i64,
    keyframe_interval: usize,
    timestamps: bool,
}

impl SyntheticVideo {
    pub(crate) fn new(fps: f64, frames: usize) -> Self {
        Self {
            fps,
            frames,
            content_offset: 0,
            pts_offset: 0,
            keyframe_interval: 25,
            timestamps: true,
        }
    }

    /// Frame `i` shows content frame `i + content_offset`.
    pub(crate) fn with_content_offset(mut self, content_offset: i64) -> Self {
        self.content_offset = content_offset;
        self
    }

    /// Frame `i` carries the container timestamp `(i + pts_offset) / fps`.
    pub(crate) fn with_pts_offset(mut self, pts_offset: i64) -> Self {
        self.pts_offset = pts_offset;
        self
    }

    /// Frames carry no container timestamp, like a raw elementary stream. The stream then
    /// labels frames by how many it decoded since it was opened.
    pub(crate) fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    pub(crate) fn with_keyframe_interval(mut self, keyframe_interval: usize) -> Self {
        self.keyframe_interval = keyframe_interval.max(1);
        self
    }

    fn start(&self) -> f64 {
        self.pts_offset as f64 / self.fps
    }

    fn duration(&self) -> f64 {
        self.frames as f64 / self.fps
    }
}

/// A [Backend] serving [SyntheticVideo]s by path. Counts every decoded frame.
#[derive(Clone, Debug, Default)]
pub(crate) struct SyntheticBackend {
    videos: HashMap<PathBuf, SyntheticVideo>,
    decoded: Arc<AtomicUsize>,
}

impl SyntheticBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_video(mut self, path: impl Into<PathBuf>, video: SyntheticVideo) -> Self {
        self.videos.insert(path.into(), video);
        self
    }

    pub(crate) fn frames_decoded(&self) -> usize {
        self.decoded.load(Ordering::SeqCst)
    }

    fn get(&self, path: &Path) -> Result<&SyntheticVideo> {
        self.videos
            .get(path)
            .ok_or_else(|| Error::VideoNotFound(path.to_owned()))
    }
}

impl Backend for SyntheticBackend {
    type Stream = SyntheticStream;

    fn video_info(&self, path: &Path) -> Result<VideoInfo> {
        let video = self.get(path)?;
        Ok(VideoInfo {
            path: path.to_owned(),
            fps: video.fps,
            duration: video.duration(),
            frame_count: video.frames,
            width: WIDTH,
            height: HEIGHT,
        })
    }

    fn open(&self, path: &Path) -> Result<SyntheticStream> {
        Ok(SyntheticStream {
            video: self.get(path)?.clone(),
            position: 0,
            frames_decoded: 0,
            decoded: Arc::clone(&self.decoded),
        })
    }
}

pub(crate) struct SyntheticStream {
    video: SyntheticVideo,
    position: usize,
    frames_decoded: usize,
    decoded: Arc<AtomicUsize>,
}

impl FrameStream for SyntheticStream {
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        if self.position >= self.video.frames {
            return Ok(None);
        }
        let i = self.position as i64;
        let timestamp = if self.video.timestamps {
            (i + self.video.pts_offset) as f64 / self.video.fps
        } else {
            self.frames_decoded as f64 / self.video.fps
        };
        self.position += 1;
        self.frames_decoded += 1;
        self.decoded.fetch_add(1, Ordering::SeqCst);
        Ok(Some(DecodedFrame {
            timestamp,
            image: render(i + self.video.content_offset),
        }))
    }

    fn seek(&mut self, position: f64) -> Result<()> {
        let (start, duration) = (self.video.start(), self.video.duration());
        check_seek_position(position, start, duration)?;
        let index = ((position - start) * self.video.fps + 1e-9).floor().max(0.0) as usize;
        self.position = index - index % self.video.keyframe_interval;
        Ok(())
    }

    fn can_seek(&self) -> bool {
        self.video.timestamps
    }
}
