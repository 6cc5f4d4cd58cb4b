//! Engine configuration.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default account name for development storage.
pub const DEFAULT_ACCOUNT: &str = "devstoreaccount1";

/// Default pause between garbage collection sweeps, in seconds.
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

/// Default number of bytes moved per step of a background copy.
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Command-line arguments for the engine.
#[derive(Parser, Debug, Clone)]
#[command(name = "azurite-engine")]
#[command(about = "Blob storage emulator engine")]
#[command(version)]
pub struct Args {
    /// Location for workspace data.
    #[arg(long, short = 'l')]
    pub location: Option<PathBuf>,

    /// Account name used when a request names none.
    #[arg(long, default_value = DEFAULT_ACCOUNT)]
    pub account: String,

    /// Enable debug logging.
    #[arg(long, short = 'd')]
    pub debug: bool,

    /// Enable silent mode (minimal logging).
    #[arg(long, short = 's')]
    pub silent: bool,

    /// In-memory mode (no persistence).
    #[arg(long)]
    pub in_memory: bool,

    /// Seconds between garbage collection sweeps.
    #[arg(long, default_value_t = DEFAULT_GC_INTERVAL_SECS)]
    pub gc_interval: u64,

    /// Bytes copied per step of a background blob copy.
    #[arg(long, default_value_t = DEFAULT_COPY_CHUNK_SIZE)]
    pub copy_chunk_size: usize,

    /// Maximum bytes held by the in-memory extent store (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub extent_size_limit: u64,

    /// Seconds an archived blob takes to rehydrate.
    #[arg(long, default_value_t = 0)]
    pub rehydrate_delay: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            location: None,
            account: DEFAULT_ACCOUNT.to_string(),
            debug: false,
            silent: false,
            in_memory: true,
            gc_interval: DEFAULT_GC_INTERVAL_SECS,
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
            extent_size_limit: 0,
            rehydrate_delay: 0,
        }
    }
}

/// Engine configuration derived from command-line arguments.
#[derive(Debug, Clone)]
pub struct Config {
    /// Location for workspace data.
    pub location: Option<PathBuf>,
    /// In-memory mode (no persistence).
    pub in_memory: bool,
    /// Default account name.
    pub account: String,
    /// Enable debug logging.
    pub debug: bool,
    pub silent: bool,
    pub gc_interval: Duration,
    pub copy_chunk_size: usize,
    /// Extent store size limit in bytes (0 = unlimited).
    pub extent_size_limit: u64,
    pub rehydrate_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config::from(Args::default())
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let in_memory = args.in_memory || args.location.is_none();
        Self {
            location: args.location,
            in_memory,
            account: args.account,
            debug: args.debug,
            silent: args.silent,
            gc_interval: Duration::from_secs(args.gc_interval.max(1)),
            copy_chunk_size: args.copy_chunk_size.max(1),
            extent_size_limit: args.extent_size_limit,
            rehydrate_delay: Duration::from_secs(args.rehydrate_delay),
        }
    }
}

impl Config {
    /// Returns the workspace directory when persistence is enabled.
    pub fn workspace(&self) -> Option<&Path> {
        if self.in_memory {
            None
        } else {
            self.location.as_deref()
        }
    }

    /// Path of the persisted metadata image.
    pub fn metadata_path(&self) -> Option<PathBuf> {
        self.workspace().map(|dir| dir.join("metadata.json"))
    }

    /// Directory holding extent files.
    pub fn extents_path(&self) -> Option<PathBuf> {
        self.workspace().map(|dir| dir.join("extents"))
    }
}
