//! CLI/config helpers shared by the `cu-worker` and `mu-worker` binaries.

mod logging;

pub use logging::{init_logging, LogArgs, LogFormat};

use std::path::PathBuf;
use url::Url;

/// Helper trait for exiting the application early if there's an error.
pub trait OrBail<T> {
    fn or_bail(self, message: &str) -> T;
}

impl<T, E> OrBail<T> for Result<T, E>
where
    E: std::fmt::Display + std::fmt::Debug,
{
    fn or_bail(self, message: &str) -> T {
        match self {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(error_details = ?e, message);
                tracing::error!(error = %e, message);
                std::process::exit(1);
            }
        }
    }
}

#[derive(Debug, clap::ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Development,
    Production,
}

impl ToString for Mode {
    fn to_string(&self) -> String {
        match self {
            Mode::Development => "development",
            Mode::Production => "production",
        }
        .to_string()
    }
}

/// Configuration for the `cu-worker` binary. Every field is environment-
/// backed so a missing value fails fast at process start, per spec.md §6.
#[derive(Debug, clap::Parser)]
pub struct CuConfig {
    #[arg(long, env = "SEQUENCER_URL")]
    pub sequencer_url: Url,

    #[arg(long, env = "GATEWAY_URL")]
    pub gateway_url: Url,

    #[arg(long, env = "DB_PATH")]
    pub db_path: PathBuf,

    #[arg(long, env = "DB_MAX_LISTENERS", default_value_t = 100)]
    pub db_max_listeners: u32,

    #[arg(long, env = "PROCESS_MEMORY_CACHE_MAX_SIZE")]
    pub process_memory_cache_max_size: u64,

    #[arg(long, env = "PROCESS_MEMORY_CACHE_TTL")]
    pub process_memory_cache_ttl_ms: u64,

    #[arg(long, env = "AO_LOAD_MAX_BLOCK")]
    pub ao_load_max_block: Option<u64>,

    #[arg(long, env = "WASM_URL")]
    pub wasm_url: Url,

    #[arg(long, env = "CHECKPOINT_EVERY")]
    pub checkpoint_every: Option<u64>,

    #[arg(long, env = "MODULE_OWNER")]
    pub module_owner: String,

    #[arg(long, env = "MODULE_ID")]
    pub module_id: String,

    #[arg(long, env = "MODE", value_enum, default_value_t = Mode::Development)]
    pub mode: Mode,

    #[arg(long, env = "PORT", default_value_t = 6363)]
    pub port: u16,

    #[clap(flatten)]
    pub log: LogArgs,
}

/// Configuration for the `mu-worker` binary.
#[derive(Debug, clap::Parser)]
pub struct MuConfig {
    #[arg(long, env = "SEQUENCER_URL")]
    pub sequencer_url: Url,

    #[arg(long, env = "GATEWAY_URL")]
    pub gateway_url: Url,

    #[arg(long, env = "CU_URL")]
    pub cu_url: Url,

    #[arg(long, env = "DB_PATH")]
    pub db_path: PathBuf,

    #[arg(long, env = "DB_MAX_LISTENERS", default_value_t = 100)]
    pub db_max_listeners: u32,

    #[arg(long, env = "PROCESS_MEMORY_CACHE_MAX_SIZE")]
    pub process_memory_cache_max_size: u64,

    #[arg(long, env = "PROCESS_MEMORY_CACHE_TTL")]
    pub process_memory_cache_ttl_ms: u64,

    #[arg(long, env = "AO_LOAD_MAX_BLOCK")]
    pub ao_load_max_block: Option<u64>,

    #[arg(long, env = "MODULE_OWNER")]
    pub module_owner: String,

    #[arg(long, env = "CRANK_DEPTH_LIMIT", default_value_t = 10)]
    pub crank_depth_limit: u32,

    #[arg(long, env = "MONITOR_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub monitor_poll_interval_ms: u64,

    #[arg(long, env = "MONITOR_MAX_CONCURRENCY", default_value_t = 25)]
    pub monitor_max_concurrency: usize,

    #[arg(long, env = "MODE", value_enum, default_value_t = Mode::Development)]
    pub mode: Mode,

    #[arg(long, env = "PORT", default_value_t = 6364)]
    pub port: u16,

    #[arg(long, env = "MU_WALLET")]
    pub mu_wallet: PathBuf,

    #[clap(flatten)]
    pub log: LogArgs,
}
