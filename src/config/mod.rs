//! Configuration system
//!
//! Loads `~/.config/agentmesh/config.yaml`. Every section has defaults, so an
//! empty file (or no file at all for most commands) is a valid configuration.

mod mesh_config;
pub mod validation;

pub use mesh_config::{
    BreakerSettings, BusSettings, DecisionSettings, MeshConfig, QueueSettings, RateLimitSettings,
    RateLimits, ServerSettings, StoreBackend, StoreSettings,
};
pub use validation::{validate_config, validate_config_result, ValidationError};

/// Serialize a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize a `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
