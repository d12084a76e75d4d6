use serde::Deserialize;
use std::time::Duration;

/// Coordinator tuning knobs. Loaded from an optional TOML file plus
/// `FLOE_COORDINATOR__*` environment overrides; every field has a default so
/// a bare environment works.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Rows fetched per cursor round trip. Bounds resident memory.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Transport block capacity in bytes.
    #[serde(default = "default_block_capacity")]
    pub block_capacity: usize,
    /// Whole-job deadline. Nodes still pending when it fires are timed out.
    #[serde(default = "default_job_deadline_secs")]
    pub job_deadline_secs: u64,
    /// Per-fetch stall limit inside the streamer.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// When true a single failed node fails the whole job instead of
    /// consolidating the replies that did arrive.
    #[serde(default)]
    pub require_all_nodes: bool,
    /// Cap on rows returned to the caller; the reply is truncated past it.
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: u64,
    /// Queries slower than this are reported to the observer.
    #[serde(default = "default_slow_query_ms")]
    pub slow_query_ms: u64,
}

fn default_batch_size() -> usize {
    100
}

fn default_block_capacity() -> usize {
    16 * 1024
}

fn default_job_deadline_secs() -> u64 {
    30
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_max_result_rows() -> u64 {
    1_000_000
}

fn default_slow_query_ms() -> u64 {
    1_000
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("FLOE_COORDINATOR_CONFIG_PATH") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let s = builder
            .add_source(config::Environment::with_prefix("FLOE_COORDINATOR").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.job_deadline_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            block_capacity: default_block_capacity(),
            job_deadline_secs: default_job_deadline_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            require_all_nodes: false,
            max_result_rows: default_max_result_rows(),
            slow_query_ms: default_slow_query_ms(),
        }
    }
}
