use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{ArgAction, CommandFactory, ErrorKind, Parser, Subcommand};
use serde::Serialize;

use vidoffset::video::{self, Algorithm, Backend, FFmpegBackend, Finder, OffsetResult, Progress};

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum AlgorithmArg {
    Phash,
    Dhash,
    Ahash,
    Whash,
    Blockhash,
    Sad,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Phash => Algorithm::PHash,
            AlgorithmArg::Dhash => Algorithm::DHash,
            AlgorithmArg::Ahash => Algorithm::AHash,
            AlgorithmArg::Whash => Algorithm::WHash,
            AlgorithmArg::Blockhash => Algorithm::BlockHash,
            AlgorithmArg::Sad => Algorithm::Sad,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[clap(after_help = "Displays the FFmpeg version and, for each given video, its stream info.")]
    Info {
        #[clap(
            multiple_values = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Video files to probe."
        )]
        paths: Vec<PathBuf>,
    },

    #[clap(
        arg_required_else_help = true,
        after_help = "Find the temporal offset of the distorted video relative to the reference video. A positive offset means the distorted video starts later in the content. The result is printed to stdout as JSON."
    )]
    Find {
        #[clap(value_parser = clap::value_parser!(PathBuf), help = "Reference video.")]
        reference: PathBuf,

        #[clap(
            value_parser = clap::value_parser!(PathBuf),
            help = "Distorted (shifted, re-encoded, rescaled) video."
        )]
        distorted: PathBuf,

        #[clap(short = 't', long, value_enum, default_value_t = AlgorithmArg::Phash, help = "Frame signature. phash is a good general choice, dhash is fast, ahash is fastest but less robust, whash is the most robust but slowest, blockhash is a block-mean hash, and sad compares raw 64x64 grayscale thumbnails.")]
        algorithm: AlgorithmArg,

        #[clap(
            long,
            default_value_t = video::DEFAULT_HASH_SIZE,
            value_parser = clap::value_parser!(usize),
            help = "Hash size. Hashes have hash_size * hash_size bits. whash requires a power of two and blockhash one of 4, 8, 12 or 16. Ignored by sad."
        )]
        hash_size: usize,

        #[clap(
            long,
            default_value_t = video::DEFAULT_COARSE_FPS,
            value_parser = clap::value_parser!(f64),
            help = "Sampling rate of the coarse search, in frames per second."
        )]
        coarse_fps: f64,

        #[clap(
            long,
            default_value_t = video::DEFAULT_FINE_FPS,
            value_parser = clap::value_parser!(f64),
            help = "Sampling rate of the fine search, in frames per second. The fine search is skipped unless this is higher than --coarse-fps."
        )]
        fine_fps: f64,

        #[clap(
            short = 'o',
            long,
            default_value_t = 0.0,
            value_parser = clap::value_parser!(f64),
            help = "Known minimum offset, in seconds. The reference is only searched from this point on."
        )]
        start_offset: f64,

        #[clap(
            short = 's',
            long,
            value_parser = clap::value_parser!(f64),
            help = "Maximum offset to search for, in seconds. Searches the whole video by default."
        )]
        max_search_offset: Option<f64>,

        #[clap(
            short = 'm',
            long,
            value_parser = clap::value_parser!(f64),
            help = "Maximum duration of each video to analyze, in seconds."
        )]
        max_duration: Option<f64>,

        #[clap(
            long,
            default_value_t = video::DEFAULT_REFINE_WINDOW,
            value_parser = clap::value_parser!(f64),
            help = "Window around the coarse estimate searched by the fine search, in seconds."
        )]
        refine_window: f64,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Skip the final search at the native frame rate."
        )]
        no_frame_accurate: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Enable multi-threaded decoding in FFmpeg."
        )]
        threaded_decoding: bool,

        #[clap(
            short,
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Do not display progress on stderr."
        )]
        quiet: bool,
    },
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        short,
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "Enable debug logging on stderr."
    )]
    verbose: bool,

    #[clap(
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "By default, video files are validated using FFmpeg, which is extremely accurate. Setting this flag will switch to just checking file headers."
    )]
    file_headers_only: bool,
}

impl Cli {
    fn validate(&self) {
        let mut cmd = Cli::command();
        match self.command {
            Commands::Info { ref paths } => {
                for path in paths {
                    self.validate_video(path);
                }
            }
            Commands::Find {
                ref reference,
                ref distorted,
                coarse_fps,
                fine_fps,
                start_offset,
                max_search_offset,
                max_duration,
                refine_window,
                ..
            } => {
                if coarse_fps <= 0.0 || fine_fps <= 0.0 {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "coarse_fps and fine_fps must be positive numbers",
                    )
                    .exit();
                }
                if start_offset < 0.0 {
                    cmd.error(ErrorKind::InvalidValue, "start_offset cannot be negative")
                        .exit();
                }
                if max_search_offset.map_or(false, |s| s < 0.0) {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "max_search_offset cannot be negative",
                    )
                    .exit();
                }
                if max_duration.map_or(false, |d| d <= 0.0) {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "max_duration must be a positive number",
                    )
                    .exit();
                }
                if refine_window <= 0.0 {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "refine_window must be a positive number",
                    )
                    .exit();
                }
                self.validate_video(reference);
                self.validate_video(distorted);
            }
        }
    }

    fn validate_video(&self, path: &Path) {
        if !vidoffset::util::is_valid_video_file(path, !self.file_headers_only) {
            let mut cmd = Cli::command();
            cmd.error(
                ErrorKind::InvalidValue,
                format!("not a valid video file: {}", path.display()),
            )
            .exit();
        }
    }
}

#[derive(Debug, Serialize)]
struct Settings {
    algorithm: Algorithm,
    hash_size: usize,
    coarse_fps: f64,
    fine_fps: f64,
    start_offset: f64,
    max_search_offset: Option<f64>,
    max_duration: Option<f64>,
    refine_window: f64,
    frame_accurate: bool,
    /// Wall time of the search, in seconds.
    compute_time: f64,
}

#[derive(Debug, Serialize)]
struct FindOutput<'a> {
    reference: &'a Path,
    distorted: &'a Path,
    #[serde(flatten)]
    result: OffsetResult,
    settings: Settings,
    /// Local time the search finished, in RFC 3339.
    date: String,
}

fn print_progress(p: &Progress) {
    if p.frames == 1 || p.frames % 10 == 0 || p.frames == p.estimated_frames {
        eprintln!(
            "{} / {}: {}/{} frames ({:.2}s)",
            p.phase, p.video, p.frames, p.estimated_frames, p.timestamp
        );
    }
}

fn main() -> vidoffset::Result<()> {
    let args = Cli::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    ffmpeg_next::init()?;

    args.validate();

    match args.command {
        Commands::Info { ref paths } => {
            println!("FFmpeg version: {}", vidoffset::util::ffmpeg_version_string());
            let backend = FFmpegBackend::new()?;
            for path in paths {
                let info = backend.video_info(path)?;
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
        }
        Commands::Find {
            ref reference,
            ref distorted,
            algorithm,
            hash_size,
            coarse_fps,
            fine_fps,
            start_offset,
            max_search_offset,
            max_duration,
            refine_window,
            no_frame_accurate,
            threaded_decoding,
            quiet,
        } => {
            let algorithm = Algorithm::from(algorithm);
            let backend = FFmpegBackend::new()?.with_threaded_decoding(threaded_decoding);
            let mut finder = Finder::with_backend(backend)
                .with_algorithm(algorithm)
                .with_hash_size(hash_size)
                .with_coarse_fps(coarse_fps)
                .with_fine_fps(fine_fps)
                .with_start_offset(start_offset)
                .with_max_search_offset(max_search_offset)
                .with_max_duration(max_duration)
                .with_refine_window(refine_window)
                .with_frame_accurate(!no_frame_accurate);
            if !quiet {
                finder = finder.with_progress(print_progress);
            }

            let start = Instant::now();
            let result = finder.find_offset(reference, distorted)?;
            let compute_time = start.elapsed().as_secs_f64();

            tracing::info!(
                offset = result.offset_seconds,
                method = %result.method,
                compute_time,
                "found offset"
            );

            let output = FindOutput {
                reference,
                distorted,
                result,
                settings: Settings {
                    algorithm,
                    hash_size,
                    coarse_fps,
                    fine_fps,
                    start_offset,
                    max_search_offset,
                    max_duration,
                    refine_window,
                    frame_accurate: !no_frame_accurate,
                    compute_time,
                },
                date: chrono::Local::now().to_rfc3339(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
