use image::GrayImage;

use super::{CancelToken, FrameStream, SEEK_MARGIN, SEEK_THRESHOLD};
use crate::{Error, Result};

// Slack for comparing normalized timestamps against window bounds. Container timestamps are
// rationals converted to floats, so a frame exactly on a bound may land a few ulps off.
const TIMESTAMP_TOLERANCE: f64 = 1e-6;

/// A sampled frame. `timestamp` is in seconds relative to the first decoded frame of the pass.
#[derive(Clone, Debug)]
pub struct Frame {
    pub timestamp: f64,
    pub image: GrayImage,
}

/// Decimates a [FrameStream] to a target frame rate within an optional time window.
///
/// This is a single forward pass: once the iterator returns `None` (or an error) it is done.
pub struct Sampler<S: FrameStream> {
    stream: S,
    source_fps: f64,
    target_fps: f64,
    step: f64,
    start_time: f64,
    max_duration: Option<f64>,
    max_frames: Option<usize>,
    cancel: Option<CancelToken>,

    // Container timestamp of the first decoded frame.
    origin: Option<f64>,
    last_timestamp: Option<f64>,
    frames_in_range: usize,
    next_sample: f64,
    emitted: usize,
    done: bool,
}

impl<S: FrameStream> Sampler<S> {
    /// Constructs a new [Sampler] over `stream`, which decodes at `source_fps`.
    pub fn new(stream: S, source_fps: f64, target_fps: f64) -> Result<Self> {
        if !(source_fps.is_finite() && source_fps > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "source frame rate must be positive: {}",
                source_fps
            )));
        }
        if !(target_fps.is_finite() && target_fps > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "target frame rate must be positive: {}",
                target_fps
            )));
        }

        Ok(Self {
            stream,
            source_fps,
            target_fps,
            // Decimation only: above the source rate every frame is emitted.
            step: (source_fps / target_fps).max(1.0),
            start_time: 0.0,
            max_duration: None,
            max_frames: None,
            cancel: None,
            origin: None,
            last_timestamp: None,
            frames_in_range: 0,
            next_sample: 0.0,
            emitted: 0,
            done: false,
        })
    }

    /// Returns a new [Sampler] that skips frames before `start_time` (normalized seconds).
    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = start_time.max(0.0);
        self
    }

    /// Returns a new [Sampler] that stops at the first frame `max_duration` seconds or more
    /// after the start time.
    pub fn with_max_duration(mut self, max_duration: Option<f64>) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Returns a new [Sampler] that emits at most `max_frames` frames.
    pub fn with_max_frames(mut self, max_frames: Option<usize>) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Returns a new [Sampler] that stops with [Error::Cancelled] once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: Option<CancelToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Estimates how many frames this pass will emit from a video of `video_duration` seconds.
    pub fn estimated_frames(&self, video_duration: f64) -> usize {
        let mut duration = (video_duration - self.start_time).max(0.0);
        if let Some(max_duration) = self.max_duration {
            duration = duration.min(max_duration);
        }
        let rate = self.target_fps.min(self.source_fps);
        let estimate = (duration * rate).ceil() as usize;
        match self.max_frames {
            Some(max_frames) => estimate.min(max_frames),
            None => estimate,
        }
    }

    pub fn frames_emitted(&self) -> usize {
        self.emitted
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancelToken::is_cancelled)
    }

    // Time zero must come from the first frame of the file, so that frame is decoded before
    // seeking. Afterwards decoding resumes at the keyframe before the target.
    fn seek_to_start(&mut self, origin: f64) -> Result<bool> {
        let position = origin + (self.start_time - SEEK_MARGIN).max(0.0);
        match self.stream.seek(position) {
            Ok(()) => Ok(true),
            // The window starts past the end of the video.
            Err(Error::InvalidSeekTimestamp { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let decoded = match self.stream.next_frame()? {
                Some(decoded) => decoded,
                None => return Ok(None),
            };

            let origin = match self.origin {
                Some(origin) => origin,
                None => {
                    self.origin = Some(decoded.timestamp);
                    if self.start_time > SEEK_THRESHOLD {
                        if self.stream.can_seek() {
                            if !self.seek_to_start(decoded.timestamp)? {
                                return Ok(None);
                            }
                            continue;
                        }
                        tracing::debug!(
                            start_time = self.start_time,
                            "stream has no timestamps, decoding forward instead of seeking"
                        );
                    }
                    decoded.timestamp
                }
            };

            let timestamp = decoded.timestamp - origin;
            if timestamp + TIMESTAMP_TOLERANCE < self.start_time {
                continue;
            }
            if let Some(max_duration) = self.max_duration {
                if timestamp - self.start_time >= max_duration - TIMESTAMP_TOLERANCE {
                    return Ok(None);
                }
            }
            if let Some(max_frames) = self.max_frames {
                if self.emitted >= max_frames {
                    return Ok(None);
                }
            }
            if let Some(last) = self.last_timestamp {
                if timestamp <= last {
                    tracing::trace!(timestamp, last, "skipping non-increasing timestamp");
                    continue;
                }
            }
            self.last_timestamp = Some(timestamp);

            let sample = self.frames_in_range as f64 >= self.next_sample;
            self.frames_in_range += 1;
            if sample {
                self.next_sample += self.step;
                self.emitted += 1;
                return Ok(Some(Frame {
                    timestamp,
                    image: decoded.image,
                }));
            }
        }
    }
}

impl<S: FrameStream> Iterator for Sampler<S> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::super::synthetic::{render, SyntheticBackend, SyntheticVideo};
    use super::super::Backend;
    use super::*;

    fn backend() -> SyntheticBackend {
        SyntheticBackend::new().with_video("ref.mp4", SyntheticVideo::new(25.0, 250))
    }

    fn sample(
        backend: &SyntheticBackend,
        fps: f64,
        start: f64,
        max_duration: Option<f64>,
    ) -> Vec<Frame> {
        let stream = backend.open(Path::new("ref.mp4")).unwrap();
        Sampler::new(stream, 25.0, fps)
            .unwrap()
            .with_start_time(start)
            .with_max_duration(max_duration)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_count_matches_rate() {
        let backend = backend();
        for fps in [1.0, 2.0, 3.0, 5.0, 7.0, 10.0, 12.5, 25.0] {
            for (start, duration) in [(0.0, 4.0), (1.5, 3.0), (0.0, 9.0), (2.0, 1.0)] {
                let frames = sample(&backend, fps, start, Some(duration));
                let expected = duration * fps;
                assert!(
                    (frames.len() as f64 - expected).abs() <= 1.0,
                    "fps={} start={} duration={} count={}",
                    fps,
                    start,
                    duration,
                    frames.len()
                );
            }
        }
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let backend = backend();
        for fps in [0.5, 1.0, 7.0, 10.0, 30.0, 60.0] {
            let frames = sample(&backend, fps, 0.0, None);
            assert!(!frames.is_empty());
            assert!(frames
                .windows(2)
                .all(|w| w[0].timestamp < w[1].timestamp));
        }
    }

    #[test]
    fn test_rate_above_source_emits_every_frame() {
        let frames = sample(&backend(), 60.0, 0.0, None);
        assert_eq!(frames.len(), 250);
    }

    #[test]
    fn test_timestamps_are_normalized() {
        let backend = SyntheticBackend::new()
            .with_video("ref.mp4", SyntheticVideo::new(25.0, 250).with_pts_offset(1000));
        let frames = sample(&backend, 5.0, 0.0, Some(2.0));
        assert!(frames[0].timestamp.abs() < 1e-9);
        assert!((frames[1].timestamp - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_start_time_seeks() {
        let backend = SyntheticBackend::new().with_video(
            "ref.mp4",
            SyntheticVideo::new(25.0, 250)
                .with_pts_offset(40)
                .with_keyframe_interval(12),
        );
        let frames = sample(&backend, 25.0, 6.0, Some(1.0));

        // Normalized time is preserved across the seek.
        assert!((frames[0].timestamp - 6.0).abs() < 1e-9);
        assert_eq!(frames.len(), 25);

        // One frame to find time zero, then at most a keyframe interval plus the seek margin
        // before the window, then the window itself.
        let decoded = backend.frames_decoded();
        assert!(decoded < 1 + 12 + 13 + 27, "decoded {} frames", decoded);
    }

    #[test]
    fn test_seeked_frames_match_sequential_decode() {
        let backend = SyntheticBackend::new().with_video(
            "ref.mp4",
            SyntheticVideo::new(25.0, 250).with_keyframe_interval(12),
        );
        let seeked = sample(&backend, 5.0, 3.0, Some(2.0));

        // Below the seek threshold the sampler decodes from the first frame.
        let stream = backend.open(Path::new("ref.mp4")).unwrap();
        let sequential = Sampler::new(stream, 25.0, 25.0)
            .unwrap()
            .filter_map(|f| f.ok())
            .find(|f| (f.timestamp - 3.0).abs() < 1e-9)
            .unwrap();
        assert_eq!(seeked[0].image, sequential.image);
    }

    #[test]
    fn test_start_time_seeks_with_late_first_timestamp() {
        // The first frame is stamped at 3600s, far beyond the 10s the video lasts.
        let backend = SyntheticBackend::new().with_video(
            "ref.mp4",
            SyntheticVideo::new(25.0, 250).with_pts_offset(90_000),
        );
        let frames = sample(&backend, 25.0, 9.2, None);
        assert_eq!(frames.len(), 20);
        assert!((frames[0].timestamp - 9.2).abs() < 1e-6);
        assert_eq!(frames[0].image, render(230));
        assert!(backend.frames_decoded() < 250);
    }

    #[test]
    fn test_stream_without_timestamps_decodes_forward() {
        let backend = SyntheticBackend::new().with_video(
            "ref.mp4",
            SyntheticVideo::new(25.0, 250)
                .with_keyframe_interval(12)
                .without_timestamps(),
        );
        let frames = sample(&backend, 5.0, 3.0, Some(2.0));
        assert_eq!(frames.len(), 10);
        assert!((frames[0].timestamp - 3.0).abs() < 1e-6);
        assert_eq!(frames[0].image, render(75));
        assert!(backend.frames_decoded() >= 75);
    }

    #[test]
    fn test_start_past_end_is_empty() {
        assert!(sample(&backend(), 1.0, 30.0, None).is_empty());
    }

    #[test]
    fn test_max_frames() {
        let stream = backend().open(Path::new("ref.mp4")).unwrap();
        let sampler = Sampler::new(stream, 25.0, 10.0)
            .unwrap()
            .with_max_frames(Some(7));
        assert_eq!(sampler.estimated_frames(10.0), 7);
        assert_eq!(sampler.count(), 7);
    }

    #[test]
    fn test_estimated_frames() {
        let stream = backend().open(Path::new("ref.mp4")).unwrap();
        let sampler = Sampler::new(stream, 25.0, 10.0)
            .unwrap()
            .with_start_time(2.0)
            .with_max_duration(Some(4.0));
        assert_eq!(sampler.estimated_frames(10.0), 40);
        assert_eq!(sampler.estimated_frames(3.0), 10);
    }

    #[test]
    fn test_cancelled_sampler_stops() {
        let token = CancelToken::new();
        token.cancel();
        let stream = backend().open(Path::new("ref.mp4")).unwrap();
        let mut sampler = Sampler::new(stream, 25.0, 1.0)
            .unwrap()
            .with_cancel_token(Some(token));
        assert!(matches!(sampler.next(), Some(Err(Error::Cancelled))));
        assert!(sampler.next().is_none());
    }

    #[test]
    fn test_invalid_rates() {
        let stream = backend().open(Path::new("ref.mp4")).unwrap();
        assert!(Sampler::new(stream, 25.0, 0.0).is_err());
    }
}
