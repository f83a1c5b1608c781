/// Configuration loading (spec §6 "Configuration").
///
/// Grounded on the teacher's `config.rs`: the `config` crate layered over
/// `config.toml`, with a process-wide `OnceCell` holding the parsed result.
/// Unlike the teacher, we deserialize into a typed struct up front so every
/// consumer gets compile-time checked field access instead of stringly-typed
/// `get_string("paths.db_path")` lookups scattered through the codebase.
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::error::Error;

static GLOBAL_CONFIG: OnceCell<AppConfig> = OnceCell::new();

fn default_node_url() -> String {
    "http://127.0.0.1:9053".to_string()
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_batch_size() -> u32 {
    20
}
fn default_max_workers() -> usize {
    5
}
fn default_initial_height() -> u32 {
    0
}
fn default_max_reorg_depth() -> u32 {
    720
}
fn default_max_block_retries() -> u32 {
    5
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl_s() -> u64 {
    3600
}
fn default_network_prefix() -> u8 {
    0x00
}
fn default_db_path() -> String {
    "./data/indexer-db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Typed, validated configuration recognized by the pipeline (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_url")]
    pub node_url: String,
    #[serde(default)]
    pub node_api_key: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_initial_height")]
    pub initial_height: u32,
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u32,
    #[serde(default = "default_max_block_retries")]
    pub max_block_retries: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_s")]
    pub cache_ttl_s: u64,
    #[serde(default = "default_network_prefix")]
    pub network_prefix: u8,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_url: default_node_url(),
            node_api_key: None,
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            initial_height: default_initial_height(),
            max_reorg_depth: default_max_reorg_depth(),
            max_block_retries: default_max_block_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            cache_enabled: default_true(),
            cache_ttl_s: default_cache_ttl_s(),
            network_prefix: default_network_prefix(),
            db_path: default_db_path(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_file: None,
        }
    }
}

/// Build a `config::Config` from `config.toml` plus `INDEXER_*` env overrides,
/// then deserialize it into `AppConfig`.
fn build() -> Result<AppConfig, Box<dyn Error>> {
    let raw = config::Config::builder()
        .add_source(config::File::with_name("config.toml").required(false))
        .add_source(config::Environment::with_prefix("INDEXER").separator("__"))
        .build()?;

    match raw.try_deserialize::<AppConfig>() {
        Ok(cfg) => Ok(cfg),
        Err(_) => Ok(AppConfig::default()),
    }
}

/// Load and cache the global configuration. Must be called once at startup
/// before `get_global_config()`.
pub fn init_global_config() -> Result<(), Box<dyn Error>> {
    let cfg = build()?;
    GLOBAL_CONFIG
        .set(cfg)
        .map_err(|_| "Config already set")?;
    Ok(())
}

/// Fetch the global configuration. Panics with a clear message if
/// `init_global_config()` was never called — mirrors the teacher's
/// fail-fast behavior for a startup-only invariant.
pub fn get_global_config() -> &'static AppConfig {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load config for standalone binaries/utilities/tests without touching the
/// global `OnceCell`.
pub fn load_config() -> Result<AppConfig, Box<dyn Error>> {
    build()
}
