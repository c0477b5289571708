use clap::Parser;
use std::path::PathBuf;

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Video:  playa-ffmpeg 8.0 (static)\n",
    "Audio:  cpal 0.16\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Headless video player driving the stepframe engine
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Video file to play
    #[arg(value_name = "FILE")]
    pub file_path: PathBuf,

    /// Start position in milliseconds
    #[arg(short = 'p', long = "position", value_name = "MS", default_value_t = 0)]
    pub position_ms: u64,

    /// Playback speed (negative plays backwards)
    #[arg(short = 's', long = "speed", value_name = "X", default_value_t = 1.0, allow_hyphen_values = true)]
    pub speed: f64,

    /// Stop after this many milliseconds of wall time
    #[arg(short = 'd', long = "duration", value_name = "MS")]
    pub duration_ms: Option<u64>,

    /// Save the last painted frame as PNG
    #[arg(long = "snapshot", value_name = "PNG")]
    pub snapshot: Option<PathBuf>,

    /// Snapshot canvas size
    #[arg(long = "size", value_names = ["W", "H"], num_args = 2, default_values_t = [640u32, 360])]
    pub size: Vec<u32>,

    /// Play without opening an audio device
    #[arg(long = "no-audio")]
    pub no_audio: bool,

    /// Configuration file (default: stepframe.json in the config dir)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Enable debug logging to file (default: stepframe.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}
