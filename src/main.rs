use stepframe::cli::Args;
use stepframe::config::{CONFIG_FILE, EngineConfig};
use stepframe::entities::{AudioLineFactory, DecoderFactory};
use stepframe::media::{self, ImageSurface};
use stepframe::paths::{self, PathConfig};
use stepframe::{Backend, Engine, PlayerEvent};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often the event loop wakes up to check the wall-clock limit
const POLL: Duration = Duration::from_millis(100);

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // Determine log level based on verbosity flags
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        // File logging with specified verbosity level
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| paths::data_file("stepframe.log", path_config));
        paths::ensure_parent(&log_path)?;
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging with specified verbosity level (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command-line arguments first (needed for log setup)
    let args = Args::parse();

    // Create path configuration from CLI args and environment
    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    init_logging(&args, &path_config)?;

    info!("Stepframe starting...");
    debug!("Command-line args: {:?}", args);

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| paths::config_file(CONFIG_FILE, &path_config));
    info!("Config path: {}", config_path.display());
    let config = EngineConfig::load(&config_path)?;

    let decoders: Arc<dyn DecoderFactory> = Arc::new(media::new_ffmpeg_decoder);
    let audio = if args.no_audio {
        None
    } else {
        let factory: Arc<dyn AudioLineFactory> = Arc::new(media::new_cpal_line);
        Some(factory)
    };

    let (width, height) = match args.size.as_slice() {
        [w, h] => (*w, *h),
        _ => bail!("--size takes a width and a height"),
    };
    let surface = ImageSurface::new(width, height);
    let engine = Engine::new(config, Backend { decoders, audio }, Some(Box::new(surface.clone())))
        .context("Failed to start engine")?;

    info!("Input file: {}", args.file_path.display());
    engine.set_speed(args.speed);
    engine.load(args.file_path.clone(), args.position_ms);
    engine.play();

    let deadline = args.duration_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
    let mut failure = None;
    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Duration limit reached");
            break;
        }
        let event = match engine.events().recv_timeout(POLL) {
            Ok(event) => event,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        match event {
            PlayerEvent::Loaded { path, info } => println!(
                "{}: {}x{} @ {:.3} fps, {}",
                path.display(),
                info.video.width,
                info.video.height,
                info.frame_rate,
                match info.audio {
                    Some(a) => format!("{} Hz {} ch", a.sample_rate, a.channels),
                    None => "no audio".to_string(),
                }
            ),
            PlayerEvent::StateChanged(state) => debug!("State: {:?}", state),
            PlayerEvent::Position { seq, timestamp_ms } => debug!("Frame {} at {}ms", seq, timestamp_ms),
            PlayerEvent::EndOfMedia => {
                println!("End of media");
                break;
            }
            PlayerEvent::Error(e) if e.is_fatal_for_load() => {
                error!("{}", e);
                failure = Some(e);
                break;
            }
            PlayerEvent::Error(e) => warn!("{}", e),
        }
    }

    if !engine.shutdown() {
        warn!("Some engine threads did not stop in time");
    }

    if let Some(path) = &args.snapshot {
        surface.save_png(path)?;
        println!("Snapshot saved to {}", path.display());
    }

    match failure {
        Some(e) => Err(e).context("Playback failed"),
        None => Ok(()),
    }
}
