//! agentmesh configuration file handling
//!
//! Loads and saves `~/.config/agentmesh/config.yaml`.

use super::{duration_ms, duration_secs};
use crate::breaker::BreakerConfig;
use crate::decision::{EscalationTimeoutPolicy, Tier};
use crate::retry::RetryConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which coordination store the process talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, only shared with tasks of this process
    Memory,
    /// Store hosted by `agentmesh serve`
    #[default]
    Remote,
}

/// Coordination store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Base URL of the store server
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Per-request timeout
    #[serde(
        default = "default_request_timeout",
        rename = "request_timeout_ms",
        with = "duration_ms"
    )]
    pub request_timeout: Duration,
}

fn default_store_url() -> String {
    "http://127.0.0.1:7420".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(35)
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Fixed-window limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Per-client-IP limit on API requests
    #[serde(default = "default_api_rate_limit")]
    pub api_rate_limit: RateLimitSettings,

    /// Request body size limit in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_api_rate_limit() -> RateLimitSettings {
    RateLimitSettings {
        max_requests: 600,
        window: Duration::from_secs(60),
    }
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_rate_limit: default_api_rate_limit(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Guaranteed delivery bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSettings {
    /// Approximate stream retention
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,

    /// Bounded wait on group reads
    #[serde(default = "default_read_block", rename = "read_block_ms", with = "duration_ms")]
    pub read_block: Duration,

    #[serde(default = "default_read_count")]
    pub read_count: usize,

    /// Pending entries idle this long are taken over by live consumers
    #[serde(
        default = "default_reclaim_min_idle",
        rename = "reclaim_min_idle_ms",
        with = "duration_ms"
    )]
    pub reclaim_min_idle: Duration,
}

fn default_stream_max_len() -> usize {
    10_000
}

fn default_read_block() -> Duration {
    Duration::from_secs(5)
}

fn default_read_count() -> usize {
    10
}

fn default_reclaim_min_idle() -> Duration {
    Duration::from_secs(60)
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            stream_max_len: default_stream_max_len(),
            read_block: default_read_block(),
            read_count: default_read_count(),
            reclaim_min_idle: default_reclaim_min_idle(),
        }
    }
}

/// Task queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Default number of tasks taken per claim
    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,
}

fn default_claim_batch() -> usize {
    1
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            claim_batch: default_claim_batch(),
        }
    }
}

/// Decision coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSettings {
    /// SQLite database holding decisions and escalations
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_minor_timeout", rename = "minor_timeout_secs", with = "duration_secs")]
    pub minor_timeout: Duration,

    #[serde(default = "default_major_timeout", rename = "major_timeout_secs", with = "duration_secs")]
    pub major_timeout: Duration,

    #[serde(
        default = "default_critical_timeout",
        rename = "critical_timeout_secs",
        with = "duration_secs"
    )]
    pub critical_timeout: Duration,

    /// Veto rounds before a decision is force-escalated
    #[serde(default = "default_max_veto_rounds")]
    pub max_veto_rounds: u32,

    /// How long a human has to answer an escalation
    #[serde(
        default = "default_escalation_timeout",
        rename = "escalation_timeout_secs",
        with = "duration_secs"
    )]
    pub escalation_timeout: Duration,

    /// What happens to the decision when its escalation times out
    #[serde(default)]
    pub escalation_timeout_policy: EscalationTimeoutPolicy,

    /// Channels notified of new escalations (`head`, `clevel`, `agent:<id>`, ...)
    #[serde(default = "default_escalation_channels")]
    pub escalation_channels: Vec<String>,

    #[serde(default = "default_sweep_interval", rename = "sweep_interval_secs", with = "duration_secs")]
    pub sweep_interval: Duration,

    /// TTL of `lock:decision:{id}` while a mutation runs
    #[serde(default = "default_lock_ttl", rename = "lock_ttl_secs", with = "duration_secs")]
    pub lock_ttl: Duration,
}

fn default_db_path() -> PathBuf {
    config_dir().join("decisions.db")
}

fn default_minor_timeout() -> Duration {
    Duration::from_secs(4 * 3600)
}

fn default_major_timeout() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_critical_timeout() -> Duration {
    Duration::from_secs(48 * 3600)
}

fn default_max_veto_rounds() -> u32 {
    3
}

fn default_escalation_timeout() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_escalation_channels() -> Vec<String> {
    vec!["head".to_string(), "clevel".to_string()]
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(30)
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            minor_timeout: default_minor_timeout(),
            major_timeout: default_major_timeout(),
            critical_timeout: default_critical_timeout(),
            max_veto_rounds: default_max_veto_rounds(),
            escalation_timeout: default_escalation_timeout(),
            escalation_timeout_policy: EscalationTimeoutPolicy::default(),
            escalation_channels: default_escalation_channels(),
            sweep_interval: default_sweep_interval(),
            lock_ttl: default_lock_ttl(),
        }
    }
}

impl DecisionSettings {
    /// Automatic timeout for a tier
    pub fn timeout_for(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Minor => self.minor_timeout,
            Tier::Major => self.major_timeout,
            Tier::Critical => self.critical_timeout,
        }
    }
}

/// Limits on expensive external calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default = "default_claude_limit")]
    pub claude: RateLimitSettings,
}

fn default_claude_limit() -> RateLimitSettings {
    RateLimitSettings {
        max_requests: 50,
        window: Duration::from_secs(60),
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            claude: default_claude_limit(),
        }
    }
}

/// Circuit breaker defaults and per-dependency overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default)]
    pub defaults: BreakerConfig,

    #[serde(default)]
    pub overrides: BTreeMap<String, BreakerConfig>,
}

/// agentmesh configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub decisions: DecisionSettings,

    #[serde(default)]
    pub rate_limits: RateLimits,

    #[serde(default)]
    pub breakers: BreakerSettings,

    /// TTL of `agent:status:{id}` entries
    #[serde(
        default = "default_agent_status_ttl",
        rename = "agent_status_ttl_secs",
        with = "duration_secs"
    )]
    pub agent_status_ttl: Duration,
}

fn default_agent_status_ttl() -> Duration {
    Duration::from_secs(300)
}

fn config_dir() -> PathBuf {
    // Always use ~/.config for consistency across platforms
    let mut dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push(".config");
    dir.push("agentmesh");
    dir
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            retry: RetryConfig::default(),
            server: ServerSettings::default(),
            bus: BusSettings::default(),
            queue: QueueSettings::default(),
            decisions: DecisionSettings::default(),
            rate_limits: RateLimits::default(),
            breakers: BreakerSettings::default(),
            agent_status_ttl: default_agent_status_ttl(),
        }
    }
}

impl MeshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the default path (~/.config/agentmesh/config.yaml)
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load the default config, falling back to built-in defaults when the
    /// file does not exist
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::new())
        }
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::MeshError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading agentmesh configuration");

        let content = fs::read_to_string(path)?;
        // An empty file deserializes to unit, not to an empty map
        let config: Self = if content.trim().is_empty() {
            Self::new()
        } else {
            serde_yaml::from_str(&content)?
        };

        tracing::debug!(
            backend = ?config.store.backend,
            store_url = %config.store.url,
            db_path = %config.decisions.db_path.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving agentmesh configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/agentmesh/config.yaml)
    pub fn default_path() -> PathBuf {
        config_dir().join("config.yaml")
    }

    /// Breaker configuration for a named dependency
    pub fn breaker_config(&self, name: &str) -> BreakerConfig {
        self.breakers
            .overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.breakers.defaults.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::new();
        assert_eq!(config.store.backend, StoreBackend::Remote);
        assert_eq!(config.decisions.timeout_for(Tier::Minor), Duration::from_secs(4 * 3600));
        assert_eq!(config.decisions.timeout_for(Tier::Critical), Duration::from_secs(48 * 3600));
        assert_eq!(config.decisions.escalation_timeout_policy, EscalationTimeoutPolicy::Reject);
        assert_eq!(config.agent_status_ttl, Duration::from_secs(300));
        assert_eq!(config.breakers.defaults.volume_threshold, 5);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
store:
  backend: memory
decisions:
  max_veto_rounds: 2
  escalation_timeout_policy: approve
breakers:
  overrides:
    claude:
      volume_threshold: 3
      error_threshold_percentage: 50
"#;
        let config: MeshConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.url, "http://127.0.0.1:7420");
        assert_eq!(config.decisions.max_veto_rounds, 2);
        assert_eq!(
            config.decisions.escalation_timeout_policy,
            EscalationTimeoutPolicy::Approve
        );
        assert_eq!(config.bus.read_block, Duration::from_secs(5));
        assert_eq!(config.agent_status_ttl, Duration::from_secs(300));

        let claude = config.breaker_config("claude");
        assert_eq!(claude.volume_threshold, 3);
        assert_eq!(claude.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.breaker_config("github").volume_threshold, 5);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.yaml");

        let mut config = MeshConfig::new();
        config.bus.stream_max_len = 500;
        config.decisions.escalation_channels = vec!["agent:ops".to_string()];
        config.save(&path).unwrap();

        let loaded = MeshConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_and_empty_files() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.yaml");
        assert!(matches!(
            MeshConfig::load(&missing),
            Err(crate::MeshError::Config(_))
        ));
        assert_eq!(
            MeshConfig::load_or_default(Some(&missing)).unwrap(),
            MeshConfig::new()
        );

        let empty = temp.path().join("empty.yaml");
        fs::write(&empty, "\n").unwrap();
        assert_eq!(MeshConfig::load(&empty).unwrap(), MeshConfig::new());
    }
}
