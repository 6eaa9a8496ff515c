use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub replica: ReplicaConfig,
    #[serde(default)]
    pub net: NetConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Database id: the Base64x64 name of the root object.
    pub db_id: String,
    /// Pre-assigned origin token; when absent, the upstream grants a
    /// session-scoped one on first connect.
    #[serde(default)]
    pub ssn_id: Option<String>,
    /// Replica id scheme digit widths, e.g. "0262".
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Per-object op count above which the log is folded into a snapshot.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Address to accept downstream replicas on.
    #[serde(default)]
    pub listen: Option<String>,
    /// Upstream replica to connect to.
    #[serde(default)]
    pub connect: Option<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_cache_size")]
    pub sqlite_cache_size: i32,
    #[serde(default = "default_busy_timeout")]
    pub sqlite_busy_timeout: i32,
}

fn default_scheme() -> String {
    "0262".to_string()
}

fn default_compact_threshold() -> usize {
    64
}

fn default_debounce_ms() -> u64 {
    10
}

fn default_keepalive_ms() -> u64 {
    30_000
}

fn default_backoff_min_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_cache_size() -> i32 {
    1000
}

fn default_busy_timeout() -> i32 {
    5000
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen: None,
            connect: None,
            debounce_ms: default_debounce_ms(),
            keepalive_ms: default_keepalive_ms(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        settings.try_deserialize()
    }
}
