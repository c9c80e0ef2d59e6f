extern crate ffmpeg_next;

use std::path::{Path, PathBuf};

use image::GrayImage;

use super::backend::check_seek_position;
use super::{Backend, DecodedFrame, FrameStream, VideoInfo};
use crate::{Error, Result};

/// `AV_TIME_BASE`: the unit of format-level timestamps and durations.
const AV_TIME_BASE: f64 = 1_000_000.0;

/// Thin wrapper around the native `FFmpeg` video decoder.
struct Decoder {
    decoder: ffmpeg_next::codec::decoder::Video,
}

impl Decoder {
    fn build_threading_config() -> ffmpeg_next::codec::threading::Config {
        let mut config = ffmpeg_next::codec::threading::Config::default();
        config.count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        config.kind = ffmpeg_next::codec::threading::Type::Frame;
        config
    }

    fn from_stream(stream: ffmpeg_next::format::stream::Stream, threaded: bool) -> Result<Self> {
        let ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let mut decoder = ctx.decoder();

        if threaded {
            decoder.set_threading(Self::build_threading_config());
        }

        let decoder = decoder.video()?;

        Ok(Self { decoder })
    }

    fn send_packet(&mut self, packet: &ffmpeg_next::packet::Packet) -> Result<()> {
        Ok(self.decoder.send_packet(packet)?)
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(self.decoder.send_eof()?)
    }

    fn receive_frame(&mut self, frame: &mut ffmpeg_next::frame::Video) -> bool {
        self.decoder.receive_frame(frame).is_ok()
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

// Converts a timestamp in time base units into seconds.
fn to_seconds(time_base: ffmpeg_next::util::rational::Rational, raw_timestamp: i64) -> f64 {
    raw_timestamp as f64 * f64::from(time_base)
}

// Container time of the first frame. MPEG-TS usually starts around 1.4s and broadcast captures
// much later. Unset start times count as zero.
fn start_seconds(time_base: ffmpeg_next::util::rational::Rational, raw_start: i64) -> f64 {
    if raw_start == ffmpeg_next::ffi::AV_NOPTS_VALUE {
        0.0
    } else {
        to_seconds(time_base, raw_start)
    }
}

fn find_best_video_stream<'a>(
    input: &'a ffmpeg_next::format::context::Input,
    path: &Path,
) -> Result<ffmpeg_next::format::stream::Stream<'a>> {
    input
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or_else(|| Error::NoVideoStream(path.to_owned()))
}

// Picks the average frame rate, then the real base rate, then the fallback.
fn stream_fps(stream: &ffmpeg_next::format::stream::Stream) -> f64 {
    [stream.avg_frame_rate(), stream.rate()]
        .into_iter()
        .filter(|r| r.numerator() > 0 && r.denominator() > 0)
        .map(f64::from)
        .next()
        .unwrap_or(super::FALLBACK_FPS)
}

// Try to get the duration from the stream info. If it is invalid, get it
// from the format context.
//
// As an example, Matroska does not store the duration in the stream; it
// only stores it in the format context.
fn stream_duration(
    input: &ffmpeg_next::format::context::Input,
    stream: &ffmpeg_next::format::stream::Stream,
) -> f64 {
    if stream.duration() > 0 {
        to_seconds(stream.time_base(), stream.duration())
    } else if input.duration() > 0 {
        input.duration() as f64 / AV_TIME_BASE
    } else {
        0.0
    }
}

/// [Backend] that decodes videos with `FFmpeg`.
#[derive(Clone, Debug, Default)]
pub struct FFmpegBackend {
    threaded_decoding: bool,
}

impl FFmpegBackend {
    /// Initializes `FFmpeg` and constructs a new backend.
    pub fn new() -> Result<Self> {
        ffmpeg_next::init()?;
        Ok(Self::default())
    }

    /// Returns a new [FFmpegBackend] with `threaded_decoding` set to the provided value.
    pub fn with_threaded_decoding(mut self, threaded_decoding: bool) -> Self {
        self.threaded_decoding = threaded_decoding;
        self
    }

    fn open_input(path: &Path) -> Result<ffmpeg_next::format::context::Input> {
        if !path.exists() {
            return Err(Error::VideoNotFound(path.to_owned()));
        }
        Ok(ffmpeg_next::format::input(&path)?)
    }
}

impl Backend for FFmpegBackend {
    type Stream = FFmpegStream;

    fn video_info(&self, path: &Path) -> Result<VideoInfo> {
        let input = Self::open_input(path)?;
        let stream = find_best_video_stream(&input, path)?;

        let fps = stream_fps(&stream);
        let duration = stream_duration(&input, &stream);
        let frame_count = if stream.frames() > 0 {
            stream.frames() as usize
        } else {
            (duration * fps) as usize
        };
        let decoder = Decoder::from_stream(stream, false)?;

        Ok(VideoInfo {
            path: path.to_owned(),
            fps,
            duration,
            frame_count,
            width: decoder.decoder.width(),
            height: decoder.decoder.height(),
        })
    }

    fn open(&self, path: &Path) -> Result<FFmpegStream> {
        FFmpegStream::open(path, self.threaded_decoding)
    }
}

/// A forward pass over the best video stream of a file, yielding GRAY8 frames.
pub struct FFmpegStream {
    path: PathBuf,
    input: ffmpeg_next::format::context::Input,
    decoder: Decoder,
    converter: Option<ffmpeg_next::software::scaling::context::Context>,
    stream_idx: usize,
    time_base: ffmpeg_next::util::rational::Rational,
    fps: f64,
    start: f64,
    duration: f64,
    frame: ffmpeg_next::frame::Video,
    frame_gray: ffmpeg_next::frame::Video,
    frames_decoded: usize,
    // Set once a frame without any timestamp was decoded.
    missing_timestamps: bool,
    eof_sent: bool,
}

impl FFmpegStream {
    fn open(path: &Path, threaded: bool) -> Result<Self> {
        let input = FFmpegBackend::open_input(path)?;
        let stream = find_best_video_stream(&input, path)?;
        let stream_idx = stream.index();
        let time_base = stream.time_base();
        let fps = stream_fps(&stream);
        let start = start_seconds(time_base, stream.start_time());
        let duration = stream_duration(&input, &stream);
        let decoder = Decoder::from_stream(stream, threaded)?;

        Ok(Self {
            path: path.to_owned(),
            input,
            decoder,
            converter: None,
            stream_idx,
            time_base,
            fps,
            start,
            duration,
            frame: ffmpeg_next::frame::Video::empty(),
            frame_gray: ffmpeg_next::frame::Video::empty(),
            frames_decoded: 0,
            missing_timestamps: false,
            eof_sent: false,
        })
    }

    // Converts the current frame to GRAY8 and packs it into an image without row padding.
    fn convert_frame(&mut self) -> Result<DecodedFrame> {
        if self.converter.is_none() {
            self.converter = Some(
                self.decoder
                    .decoder
                    .converter(ffmpeg_next::format::Pixel::GRAY8)?,
            );
        }
        if let Some(converter) = &mut self.converter {
            converter.run(&self.frame, &mut self.frame_gray)?;
        }

        let (width, height) = (self.frame_gray.width(), self.frame_gray.height());
        let stride = self.frame_gray.stride(0);
        let data = self.frame_gray.data(0);
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for row in data.chunks(stride).take(height as usize) {
            pixels.extend_from_slice(&row[..row.len().min(width as usize)]);
        }
        let image = GrayImage::from_raw(width, height, pixels)
            .ok_or_else(|| Error::MalformedFrame(self.path.clone()))?;

        // Frames without a timestamp are placed by decode order at the nominal frame rate.
        let timestamp = match self.frame.timestamp().or_else(|| self.frame.pts()) {
            Some(ts) => to_seconds(self.time_base, ts),
            None => {
                self.missing_timestamps = true;
                self.frames_decoded as f64 / self.fps
            }
        };
        self.frames_decoded += 1;

        Ok(DecodedFrame { timestamp, image })
    }
}

impl FrameStream for FFmpegStream {
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        loop {
            if self.decoder.receive_frame(&mut self.frame) {
                return self.convert_frame().map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = ffmpeg_next::packet::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) if packet.stream() == self.stream_idx => {
                    match self.decoder.send_packet(&packet) {
                        Ok(()) => (),
                        // Corrupt packets are dropped; the decoder resyncs on the next keyframe.
                        Err(Error::FFmpegError(ffmpeg_next::Error::InvalidData)) => {
                            tracing::warn!(path = %self.path.display(), "dropping invalid packet");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(()) => (),
                Err(ffmpeg_next::Error::Eof) => {
                    self.decoder.send_eof()?;
                    self.eof_sent = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Seeks the format context to the given position. Under the hood, this uses
    // the standard FFmpeg function, `avformat_seek_file`.
    fn seek(&mut self, position: f64) -> Result<()> {
        // Ensure that the provided timestamp is valid (i.e., doesn't exceed duration of the video).
        check_seek_position(position, self.start, self.duration)?;

        // With no stream selected, FFmpeg expects the timestamp in AV_TIME_BASE units.
        let timestamp = (position.max(0.0) * AV_TIME_BASE) as i64;
        self.input.seek(timestamp, ..timestamp)?;
        self.decoder.flush();
        self.eof_sent = false;

        tracing::trace!(path = %self.path.display(), position, "seeked");
        Ok(())
    }

    // Counted timestamps restart wherever decoding resumes.
    fn can_seek(&self) -> bool {
        !self.missing_timestamps
    }
}
