#[cfg(feature = "rayon")]
extern crate rayon;

use std::fmt::Display;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::Serialize;

use super::correlator::correlate_with_cancel;
use super::{
    Algorithm, Backend, Extractor, FFmpegBackend, Frame, OffsetResult, Sampler, SignatureSeries,
    VideoInfo,
};
use crate::{Error, Result};

// Frames are hashed in batches so that parallel extraction never holds a whole phase in memory.
const EXTRACTION_BATCH_SIZE: usize = 64;

/// Stage of the hierarchical search.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Coarse,
    Fine,
    Native,
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Coarse => "coarse",
            Self::Fine => "fine",
            Self::Native => "native",
        })
    }
}

/// Which of the two inputs a video is.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoRole {
    Reference,
    Distorted,
}

impl Display for VideoRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Reference => "reference",
            Self::Distorted => "distorted",
        })
    }
}

/// Cooperative cancellation flag shared between a [Finder] and its caller.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Reported once per sampled frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub phase: Phase,
    pub video: VideoRole,
    /// Frames sampled so far in this pass, including this one.
    pub frames: usize,
    pub estimated_frames: usize,
    /// Normalized timestamp of the frame, in seconds.
    pub timestamp: f64,
}

pub type ProgressFn = dyn Fn(&Progress) + Send + Sync;

// Sampling window of one video in one phase.
#[derive(Clone, Copy, Debug)]
struct Window {
    start: f64,
    duration: Option<f64>,
}

// Offset estimate produced by a phase.
#[derive(Clone, Copy, Debug)]
struct Estimate {
    phase: Phase,
    offset: f64,
    distance: f64,
    fps: f64,
}

#[derive(Debug)]
enum State {
    Coarse,
    Fine(Estimate),
    Native(Estimate),
    Done(Estimate),
}

/// Finds the temporal offset between a reference and a distorted video.
///
/// The search runs up to three phases. A coarse pass correlates both videos at a low rate,
/// a fine pass re-samples a window around the coarse estimate at a higher rate, and an
/// optional native pass repeats this at the videos' own frame rate.
///
/// ```no_run
/// use vidoffset::video::{Algorithm, Finder};
///
/// let finder = Finder::new()?
///     .with_algorithm(Algorithm::DHash)
///     .with_max_search_offset(Some(30.0));
/// let result = finder.find_offset("reference.mp4", "distorted.mp4")?;
/// println!("{}", result.offset_timestamp);
/// # Ok::<(), vidoffset::Error>(())
/// ```
pub struct Finder<B: Backend = FFmpegBackend> {
    backend: B,
    algorithm: Algorithm,
    hash_size: usize,
    coarse_fps: f64,
    fine_fps: f64,
    start_offset: f64,
    max_search_offset: Option<f64>,
    max_duration: Option<f64>,
    refine_window: f64,
    frame_accurate: bool,
    threading: bool,
    progress: Option<Arc<ProgressFn>>,
    cancel: Option<CancelToken>,
}

impl Finder<FFmpegBackend> {
    /// Constructs a new [Finder] that decodes with `FFmpeg`.
    pub fn new() -> Result<Self> {
        Ok(Self::with_backend(FFmpegBackend::new()?))
    }
}

impl<B: Backend> Finder<B> {
    /// Constructs a new [Finder] with default settings over the given backend.
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            algorithm: Algorithm::PHash,
            hash_size: super::DEFAULT_HASH_SIZE,
            coarse_fps: super::DEFAULT_COARSE_FPS,
            fine_fps: super::DEFAULT_FINE_FPS,
            start_offset: 0.0,
            max_search_offset: None,
            max_duration: None,
            refine_window: super::DEFAULT_REFINE_WINDOW,
            frame_accurate: true,
            threading: true,
            progress: None,
            cancel: None,
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_hash_size(mut self, hash_size: usize) -> Self {
        self.hash_size = hash_size;
        self
    }

    pub fn with_coarse_fps(mut self, coarse_fps: f64) -> Self {
        self.coarse_fps = coarse_fps;
        self
    }

    pub fn with_fine_fps(mut self, fine_fps: f64) -> Self {
        self.fine_fps = fine_fps;
        self
    }

    /// Known minimum offset (seconds). The reference is only searched from this point on.
    pub fn with_start_offset(mut self, start_offset: f64) -> Self {
        self.start_offset = start_offset;
        self
    }

    /// Largest offset (seconds) the coarse phase considers. `None` searches the whole video.
    pub fn with_max_search_offset(mut self, max_search_offset: Option<f64>) -> Self {
        self.max_search_offset = max_search_offset;
        self
    }

    /// Caps how much of each video (seconds) is analyzed.
    pub fn with_max_duration(mut self, max_duration: Option<f64>) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Half-width (seconds) of the fine phase's search around the coarse estimate.
    pub fn with_refine_window(mut self, refine_window: f64) -> Self {
        self.refine_window = refine_window;
        self
    }

    /// Enables the native frame rate phase.
    pub fn with_frame_accurate(mut self, frame_accurate: bool) -> Self {
        self.frame_accurate = frame_accurate;
        self
    }

    /// Enables parallel signature extraction. Has no effect without the `rayon` feature.
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Checks the configuration. Runs before any video is opened.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: f64) -> Result<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(Error::InvalidConfig(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )))
            }
        }

        self.algorithm.validate_hash_size(self.hash_size)?;
        positive("coarse_fps", self.coarse_fps)?;
        positive("fine_fps", self.fine_fps)?;
        positive("refine_window", self.refine_window)?;
        if let Some(max_duration) = self.max_duration {
            positive("max_duration", max_duration)?;
        }
        if !(self.start_offset.is_finite() && self.start_offset >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "start_offset must not be negative, got {}",
                self.start_offset
            )));
        }
        if let Some(max_search_offset) = self.max_search_offset {
            if !(max_search_offset.is_finite() && max_search_offset >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "max_search_offset must not be negative, got {}",
                    max_search_offset
                )));
            }
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancelToken::is_cancelled)
    }

    fn report(&self, progress: impl FnOnce() -> Progress) {
        if let Some(callback) = &self.progress {
            callback(&progress());
        }
    }

    fn extract_batch(
        &self,
        extractor: &Extractor,
        batch: &mut Vec<Frame>,
        series: &mut SignatureSeries,
    ) -> Result<()> {
        let mut signatures = Vec::new();

        if cfg!(feature = "rayon") && self.threading {
            #[cfg(feature = "rayon")]
            {
                signatures = batch
                    .par_iter()
                    .map(|frame| extractor.extract(&frame.image))
                    .collect::<Vec<_>>();
            }
        } else {
            signatures.extend(batch.iter().map(|frame| extractor.extract(&frame.image)));
        }

        for (frame, signature) in batch.drain(..).zip(signatures) {
            series.push(frame.timestamp, signature)?;
        }

        Ok(())
    }

    // Samples one video over `window` and computes a signature for every sampled frame.
    fn sample_series(
        &self,
        extractor: &Extractor,
        info: &VideoInfo,
        phase: Phase,
        video: VideoRole,
        fps: f64,
        window: Window,
    ) -> Result<SignatureSeries> {
        let _g = tracing::span!(tracing::Level::TRACE, "sample_series", %phase, %video).entered();

        let stream = self.backend.open(&info.path)?;
        let sampler = Sampler::new(stream, info.fps, fps)?
            .with_start_time(window.start)
            .with_max_duration(window.duration)
            .with_cancel_token(self.cancel.clone());
        let estimated_frames = sampler.estimated_frames(info.duration);

        let mut series = SignatureSeries::new();
        let mut batch = Vec::with_capacity(EXTRACTION_BATCH_SIZE);
        for frame in sampler {
            let frame = frame?;
            let frames = series.len() + batch.len() + 1;
            self.report(|| Progress {
                phase,
                video,
                frames,
                estimated_frames,
                timestamp: frame.timestamp,
            });
            batch.push(frame);
            if batch.len() == EXTRACTION_BATCH_SIZE {
                self.extract_batch(extractor, &mut batch, &mut series)?;
            }
        }
        self.extract_batch(extractor, &mut batch, &mut series)?;

        if series.is_empty() {
            return Err(Error::EmptySignatureSeries { phase, video });
        }

        tracing::debug!(
            %phase,
            %video,
            frames = series.len(),
            start = window.start,
            "sampled signatures"
        );

        Ok(series)
    }

    // Runs one phase and converts the winning lag into an offset in seconds.
    //
    // Each series is anchored at its first sampled frame, so the offset stays exact when a
    // window starts between frames.
    fn run_phase(
        &self,
        extractor: &Extractor,
        phase: Phase,
        fps: f64,
        (ref_info, ref_window): (&VideoInfo, Window),
        (dist_info, dist_window): (&VideoInfo, Window),
    ) -> Result<Estimate> {
        let _g = tracing::span!(tracing::Level::TRACE, "run_phase", %phase, fps).entered();

        let ref_series = self.sample_series(
            extractor,
            ref_info,
            phase,
            VideoRole::Reference,
            fps,
            ref_window,
        )?;
        let dist_series = self.sample_series(
            extractor,
            dist_info,
            phase,
            VideoRole::Distorted,
            fps,
            dist_window,
        )?;

        let correlation = correlate_with_cancel(
            ref_series.signatures(),
            dist_series.signatures(),
            self.cancel.as_ref(),
        )?;

        let ref_anchor = ref_series.timestamps()[0];
        let dist_anchor = dist_series.timestamps()[0];
        let offset = correlation.lag as f64 / fps + ref_anchor - dist_anchor;

        tracing::debug!(
            %phase,
            fps,
            lag = correlation.lag,
            offset,
            distance = correlation.distance,
            lags = correlation.lags_evaluated,
            "phase complete"
        );

        Ok(Estimate {
            phase,
            offset,
            distance: correlation.distance,
            fps,
        })
    }

    // Windows around a previous estimate. Candidate offsets start at `estimate - window`;
    // when that is negative the distorted video is entered later instead.
    fn refine_windows(estimate: f64, window: f64, dist_duration: f64) -> (Window, Window) {
        let low = estimate - window;
        let ref_window = Window {
            start: low.max(0.0),
            duration: Some(dist_duration + window),
        };
        let dist_window = Window {
            start: (-low).max(0.0),
            duration: Some(dist_duration),
        };
        (ref_window, dist_window)
    }

    fn method(&self, phase: Phase) -> String {
        let prefix = match phase {
            Phase::Coarse => "coarse",
            Phase::Fine => "hierarchical",
            Phase::Native => "frame_accurate",
        };
        format!("{}_{}", prefix, self.algorithm)
    }

    /// Finds the offset of `distorted` relative to `reference`.
    ///
    /// Configuration errors are reported before either video is opened. A phase whose window
    /// yields no frames fails with [Error::EmptySignatureSeries].
    pub fn find_offset(
        &self,
        reference: impl AsRef<Path>,
        distorted: impl AsRef<Path>,
    ) -> Result<OffsetResult> {
        let _g = tracing::span!(tracing::Level::TRACE, "find_offset").entered();

        self.validate()?;
        let extractor = Extractor::new(self.algorithm, self.hash_size)?;

        let ref_info = self.backend.video_info(reference.as_ref())?;
        let dist_info = self.backend.video_info(distorted.as_ref())?;
        for (video, info) in [
            (VideoRole::Reference, &ref_info),
            (VideoRole::Distorted, &dist_info),
        ] {
            tracing::debug!(
                %video,
                width = info.width,
                height = info.height,
                fps = info.fps,
                duration = info.duration,
                "probed video"
            );
        }

        let native_fps = ref_info.fps.max(dist_info.fps);
        let native_guard = |current_fps: f64| self.frame_accurate && native_fps > current_fps;

        let mut state = State::Coarse;
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }

            state = match state {
                State::Coarse => {
                    let ref_duration = match self.max_search_offset {
                        Some(max_search_offset) => Some(
                            (max_search_offset + self.max_duration.unwrap_or(dist_info.duration))
                                .min(ref_info.duration),
                        ),
                        None => self.max_duration,
                    };
                    let ref_window = Window {
                        start: self.start_offset,
                        duration: ref_duration,
                    };
                    let dist_window = Window {
                        start: 0.0,
                        duration: self.max_search_offset,
                    };
                    let estimate = self.run_phase(
                        &extractor,
                        Phase::Coarse,
                        self.coarse_fps,
                        (&ref_info, ref_window),
                        (&dist_info, dist_window),
                    )?;

                    if self.fine_fps > self.coarse_fps {
                        State::Fine(estimate)
                    } else if native_guard(estimate.fps) {
                        State::Native(estimate)
                    } else {
                        State::Done(estimate)
                    }
                }
                State::Fine(previous) => {
                    let duration = (2.0 * self.refine_window)
                        .min(self.max_duration.unwrap_or(dist_info.duration));
                    let (ref_window, dist_window) =
                        Self::refine_windows(previous.offset, self.refine_window, duration);
                    let estimate = self.run_phase(
                        &extractor,
                        Phase::Fine,
                        self.fine_fps,
                        (&ref_info, ref_window),
                        (&dist_info, dist_window),
                    )?;

                    if native_guard(estimate.fps) {
                        State::Native(estimate)
                    } else {
                        State::Done(estimate)
                    }
                }
                State::Native(previous) => {
                    let window = super::NATIVE_REFINE_WINDOW;
                    let duration = (2.0 * window).min(dist_info.duration);
                    let (ref_window, dist_window) =
                        Self::refine_windows(previous.offset, window, duration);
                    let estimate = self.run_phase(
                        &extractor,
                        Phase::Native,
                        native_fps,
                        (&ref_info, ref_window),
                        (&dist_info, dist_window),
                    )?;
                    State::Done(estimate)
                }
                State::Done(estimate) => {
                    // Native results are counted at the native rate, others at the reference's.
                    let frame_rate = match estimate.phase {
                        Phase::Native => native_fps,
                        _ => ref_info.fps,
                    };
                    let result = OffsetResult::new(
                        estimate.offset,
                        frame_rate,
                        estimate.distance,
                        estimate.fps,
                        self.method(estimate.phase),
                    );
                    tracing::debug!(
                        offset = result.offset_seconds,
                        frames = result.offset_frames,
                        method = %result.method,
                        "search complete"
                    );
                    return Ok(result);
                }
            };
        }
    }
}
