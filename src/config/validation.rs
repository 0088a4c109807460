//! Configuration validation
//!
//! Reports every problem in a configuration at once rather than stopping at
//! the first one.

use super::mesh_config::{MeshConfig, RateLimitSettings, StoreBackend};
use crate::breaker::BreakerConfig;
use crate::keys::Channel;
use crate::MeshError;
use std::net::SocketAddr;
use std::time::Duration;

/// Longest group-read block the store server honours
pub const MAX_READ_BLOCK: Duration = Duration::from_secs(30);

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Named entry the error belongs to (a breaker name, for instance)
    pub context: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref ctx) = self.context {
            write!(f, "[{}] {}: {}", ctx, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate an agentmesh configuration
pub fn validate_config(config: &MeshConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.store.backend == StoreBackend::Remote
        && !(config.store.url.starts_with("http://") || config.store.url.starts_with("https://"))
    {
        errors.push(ValidationError::new(
            "store.url",
            format!("Invalid store URL '{}': must start with http:// or https://", config.store.url),
        ));
    }
    if config.store.request_timeout <= config.bus.read_block {
        errors.push(ValidationError::new(
            "store.request_timeout_ms",
            "Request timeout must exceed bus.read_block_ms or blocking reads time out",
        ));
    }

    if config.retry.multiplier < 1.0 {
        errors.push(ValidationError::new(
            "retry.multiplier",
            "Multiplier must be at least 1.0",
        ));
    }
    if config.retry.initial_backoff > config.retry.max_backoff {
        errors.push(ValidationError::new(
            "retry.initial_backoff_ms",
            "Initial backoff must not exceed max backoff",
        ));
    }

    if config.server.bind.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "server.bind",
            format!("Invalid bind address '{}'", config.server.bind),
        ));
    }
    validate_rate_limit(&config.server.api_rate_limit, "server.api_rate_limit", &mut errors);
    validate_rate_limit(&config.rate_limits.claude, "rate_limits.claude", &mut errors);

    if config.bus.stream_max_len == 0 {
        errors.push(ValidationError::new(
            "bus.stream_max_len",
            "Stream max length must be greater than 0",
        ));
    }
    if config.bus.read_count == 0 {
        errors.push(ValidationError::new(
            "bus.read_count",
            "Read count must be greater than 0",
        ));
    }
    if config.bus.read_block > MAX_READ_BLOCK {
        errors.push(ValidationError::new(
            "bus.read_block_ms",
            format!("Read block must be at most {}ms", MAX_READ_BLOCK.as_millis()),
        ));
    }
    if config.queue.claim_batch == 0 {
        errors.push(ValidationError::new(
            "queue.claim_batch",
            "Claim batch must be greater than 0",
        ));
    }

    let decisions = &config.decisions;
    for (field, value) in [
        ("decisions.minor_timeout_secs", decisions.minor_timeout),
        ("decisions.major_timeout_secs", decisions.major_timeout),
        ("decisions.critical_timeout_secs", decisions.critical_timeout),
        ("decisions.escalation_timeout_secs", decisions.escalation_timeout),
        ("decisions.sweep_interval_secs", decisions.sweep_interval),
        ("decisions.lock_ttl_secs", decisions.lock_ttl),
    ] {
        if value.is_zero() {
            errors.push(ValidationError::new(field, "Duration must be greater than 0"));
        }
    }
    if decisions.max_veto_rounds == 0 {
        errors.push(ValidationError::new(
            "decisions.max_veto_rounds",
            "At least one veto round must be allowed",
        ));
    }
    for channel in &decisions.escalation_channels {
        if let Err(e) = channel.parse::<Channel>() {
            errors.push(ValidationError::new("decisions.escalation_channels", e));
        }
    }

    validate_breaker(&config.breakers.defaults, "defaults", &mut errors);
    for (name, breaker) in &config.breakers.overrides {
        validate_breaker(breaker, name, &mut errors);
    }

    if config.agent_status_ttl.is_zero() {
        errors.push(ValidationError::new(
            "agent_status_ttl_secs",
            "Status TTL must be greater than 0",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_rate_limit(limit: &RateLimitSettings, field: &str, errors: &mut Vec<ValidationError>) {
    if limit.max_requests == 0 {
        errors.push(ValidationError::new(
            format!("{}.max_requests", field),
            "Max requests must be greater than 0",
        ));
    }
    if limit.window.is_zero() {
        errors.push(ValidationError::new(
            format!("{}.window_secs", field),
            "Window must be greater than 0",
        ));
    }
}

fn validate_breaker(config: &BreakerConfig, name: &str, errors: &mut Vec<ValidationError>) {
    if config.timeout.is_zero() {
        errors.push(ValidationError::new("timeout_ms", "Timeout must be greater than 0").with_context(name));
    }
    if config.error_threshold_percentage == 0 || config.error_threshold_percentage > 100 {
        errors.push(
            ValidationError::new(
                "error_threshold_percentage",
                format!("Threshold {} is outside 1..=100", config.error_threshold_percentage),
            )
            .with_context(name),
        );
    }
    if config.rolling_buckets == 0 {
        errors.push(
            ValidationError::new("rolling_buckets", "Bucket count must be greater than 0")
                .with_context(name),
        );
    } else if config.rolling_window < Duration::from_millis(u64::from(config.rolling_buckets)) {
        errors.push(
            ValidationError::new(
                "rolling_window_ms",
                "Window must allow at least 1ms per bucket",
            )
            .with_context(name),
        );
    }
}

/// Validate and fold all errors into one configuration error
pub fn validate_config_result(config: &MeshConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
        MeshError::Config(format!("Invalid configuration:\n{}", lines.join("\n")))
    })
}
