//! Command-line interface definitions using clap.

use ballot_interp::entry::EntryName;
use ballot_interp::logging::{LogConfig, LogFormat};
use ballot_interp::worker::WorkerPoolConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Interpret scanned ballot sheets and decide whether they can be cast.
#[derive(Parser, Debug)]
#[command(name = "ballot-interp")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long, env = "BALLOT_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormat>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interpret one sheet from its front and back images.
    Sheet(SheetArgs),

    /// Interpret every `<name>-front.*` / `<name>-back.*` pair in a directory.
    Batch(BatchArgs),

    /// Run as a pool worker, speaking the job protocol on stdin/stdout.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Worker pool options shared by the interpreting commands.
#[derive(Args, Debug, Clone)]
pub struct PoolArgs {
    /// Number of worker processes (default: one per CPU).
    #[arg(short = 'j', long, env = "BALLOT_WORKERS")]
    pub workers: Option<usize>,

    /// Interpret in this process instead of worker processes. Overrides --workers.
    #[arg(long)]
    pub inline: bool,

    /// Seconds to wait for running jobs at shutdown before killing workers.
    #[arg(long, default_value_t = 30)]
    pub grace_secs: u64,
}

impl PoolArgs {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            pool_size: self.workers,
            shutdown_grace: Duration::from_secs(self.grace_secs),
            ..WorkerPoolConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct SheetArgs {
    /// Front page image.
    pub front: PathBuf,

    /// Back page image.
    pub back: PathBuf,

    #[command(flatten)]
    pub pool: PoolArgs,

    /// Pretty-print the JSON result.
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// Directory containing scanned sheet images.
    pub dir: PathBuf,

    #[command(flatten)]
    pub pool: PoolArgs,

    /// Pretty-print the JSON result.
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Entry point to host.
    #[arg(long, value_enum, default_value_t = EntryName::Replay)]
    pub entry: EntryName,
}

/// Verbosity level for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: warnings and errors.
    Normal,
    /// -v: pool lifecycle.
    Info,
    /// -vv: per-job dispatch and worker restarts.
    Debug,
    /// -vvv: IPC round trips.
    Trace,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            2 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v and -q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }

    /// Logging configuration for the parent process.
    ///
    /// `-v`/`-q` set an explicit filter, which environment filters do not
    /// override.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::default();
        let level = match self.verbosity() {
            Verbosity::Quiet => Some(Level::ERROR),
            Verbosity::Normal => None,
            Verbosity::Info => Some(Level::INFO),
            Verbosity::Debug => Some(Level::DEBUG),
            Verbosity::Trace => Some(Level::TRACE),
        };
        if let Some(level) = level {
            config = config
                .with_level(level)
                .with_filter(level.to_string().to_lowercase());
        }
        let mut config = config.with_env_overrides();
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        config
    }
}
