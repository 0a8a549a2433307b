use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tie-break applied when two sources write the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Whichever delta reaches the apply step last wins
    #[default]
    LastWriteWins,
    /// Drop deltas whose source timestamp is older than the stored one
    RejectOlderSource,
}

/// Configuration for the market data store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Expected number of instruments
    pub initial_capacity: usize,
    /// Number of map shards (power of two)
    pub shard_amount: usize,
    pub conflict_policy: ConflictPolicy,
    /// Buffered notifications per subscribed key
    pub subscription_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 4096,
            shard_amount: 64,
            conflict_policy: ConflictPolicy::LastWriteWins,
            subscription_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub heartbeat_interval_ms: u64,
    /// Heartbeat latency above this degrades a connection
    pub latency_threshold_ms: u64,
    /// Consecutive misses before a connection is unhealthy
    pub missed_heartbeat_limit: u32,
    /// Consecutive malformed messages before a feed is degraded
    pub malformed_threshold: u32,
    pub reconnect_base_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Capacity of the transition broadcast channel
    pub transition_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            latency_threshold_ms: 250,
            missed_heartbeat_limit: 3,
            malformed_threshold: 5,
            reconnect_base_backoff_ms: 200,
            reconnect_max_backoff_ms: 10_000,
            reconnect_timeout_ms: 2_000,
            max_reconnect_attempts: 5,
            transition_capacity: 1024,
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// Backoff before the given (zero-based) reconnection attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .reconnect_base_backoff_ms
            .saturating_mul(factor)
            .min(self.reconnect_max_backoff_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Address the WebSocket feed server listens on
    pub listen_addr: SocketAddr,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9001)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Budget for each target's delivery
    pub delivery_timeout_ms: u64,
    /// Address trader workstations connect to for signals
    pub listen_addr: SocketAddr,
    /// Signals buffered per workstation socket
    pub outbound_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: 500,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9002)),
            outbound_capacity: 64,
        }
    }
}

impl OrchestratorConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveMode {
    /// Every record on every run
    #[default]
    Full,
    /// Only records whose version changed since the last successful handoff
    Diff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    #[default]
    None,
    Lz4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub interval_secs: u64,
    pub mode: ArchiveMode,
    pub directory: PathBuf,
    pub compression: CompressionLevel,
    /// Failed batches kept for retry before older ones are folded together
    pub max_pending: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            mode: ArchiveMode::Full,
            directory: PathBuf::from("archive"),
            compression: CompressionLevel::None,
            max_pending: 8,
        }
    }
}

impl ArchiveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Top-level configuration for the gateway process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub store: StoreConfig,
    pub health: HealthConfig,
    pub feed: FeedConfig,
    pub orchestrator: OrchestratorConfig,
    pub archive: ArchiveConfig,
    /// Prometheus exporter address; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl GatewayConfig {
    /// Loads from the file named by `GATEWAY_CONFIG` (if any), applies
    /// `GATEWAY_*` environment overrides and validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("GATEWAY_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(addr) = env_parse("GATEWAY_FEED_ADDR")? {
            self.feed.listen_addr = addr;
        }
        if let Some(addr) = env_parse("GATEWAY_SIGNAL_ADDR")? {
            self.orchestrator.listen_addr = addr;
        }
        if let Some(addr) = env_parse("GATEWAY_METRICS_ADDR")? {
            self.metrics_addr = Some(addr);
        }
        if let Some(ms) = env_parse("GATEWAY_HEARTBEAT_INTERVAL_MS")? {
            self.health.heartbeat_interval_ms = ms;
        }
        if let Some(limit) = env_parse("GATEWAY_MISSED_HEARTBEAT_LIMIT")? {
            self.health.missed_heartbeat_limit = limit;
        }
        if let Some(ms) = env_parse("GATEWAY_DELIVERY_TIMEOUT_MS")? {
            self.orchestrator.delivery_timeout_ms = ms;
        }
        if let Some(secs) = env_parse("GATEWAY_ARCHIVE_INTERVAL_SECS")? {
            self.archive.interval_secs = secs;
        }
        if let Ok(dir) = std::env::var("GATEWAY_ARCHIVE_DIR") {
            self.archive.directory = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let shards = self.store.shard_amount;
        if shards < 2 || !shards.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "store.shard_amount must be a power of two greater than 1, got {}",
                shards
            )));
        }
        if self.store.subscription_capacity == 0
            || self.health.transition_capacity == 0
            || self.orchestrator.outbound_capacity == 0
        {
            return Err(ConfigError::Invalid("channel capacities must be non-zero".into()));
        }
        if self.health.missed_heartbeat_limit == 0 {
            return Err(ConfigError::Invalid("health.missed_heartbeat_limit must be at least 1".into()));
        }
        if self.health.heartbeat_interval_ms == 0 || self.orchestrator.delivery_timeout_ms == 0 {
            return Err(ConfigError::Invalid("intervals and timeouts must be non-zero".into()));
        }
        if self.archive.interval_secs == 0 {
            return Err(ConfigError::Invalid("archive.interval_secs must be non-zero".into()));
        }
        if self.archive.max_pending == 0 {
            return Err(ConfigError::Invalid("archive.max_pending must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.missed_heartbeat_limit, 3);
        assert_eq!(config.store.conflict_policy, ConflictPolicy::LastWriteWins);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let health = HealthConfig {
            reconnect_base_backoff_ms: 100,
            reconnect_max_backoff_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(health.backoff_for(0), Duration::from_millis(100));
        assert_eq!(health.backoff_for(1), Duration::from_millis(200));
        assert_eq!(health.backoff_for(3), Duration::from_millis(800));
        assert_eq!(health.backoff_for(4), Duration::from_millis(1_000));
        assert_eq!(health.backoff_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"store": {{"conflict_policy": "reject_older_source"}}, "archive": {{"mode": "diff"}}}}"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.store.conflict_policy, ConflictPolicy::RejectOlderSource);
        assert_eq!(config.store.shard_amount, 64);
        assert_eq!(config.archive.mode, ArchiveMode::Diff);
        assert_eq!(config.health.missed_heartbeat_limit, 3);
    }

    #[test]
    fn test_rejects_bad_shard_amount() {
        let mut config = GatewayConfig::default();
        config.store.shard_amount = 48;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_pending_cap() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.archive.max_pending, 8);
        config.archive.max_pending = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
