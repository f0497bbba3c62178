//! Command-line interface for Loopstation
//!
//! Handles argument parsing and logging configuration.

use crate::audio::BackendPreference;
use crate::models::LooperConfig;
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// Loopstation - multi-channel audio looper
#[derive(Parser, Debug)]
#[command(name = "loopstation")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of channels
    #[arg(short, long)]
    pub channels: Option<usize>,

    /// Directory holding the channel files
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Audio backend
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendPreference>,

    /// Print channel events as JSON lines
    #[arg(long)]
    pub json_events: bool,

    /// Store the resulting channel count, directory and backend in dconf
    #[arg(long)]
    pub save_settings: bool,

    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = audio libraries too
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Command-line flags win over stored settings
    pub fn apply(&self, config: &mut LooperConfig) {
        if let Some(channels) = self.channels {
            config.channels = channels.max(1);
        }
        if let Some(dir) = &self.dir {
            config.recordings_dir = dir.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    // Set loopstation modules to requested verbosity level
    builder.filter_module("loopstation", args.log_level());

    // Audio library internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("cpal", args.log_level());
        builder.filter_module("pipewire", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
