//! Logging configuration using tracing
//!
//! Structured logging to stderr, filtered through `RUST_LOG`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber
///
/// Filtering follows `RUST_LOG` and defaults to `warn` so CLI output stays
/// quiet. Useful values:
/// - `RUST_LOG=info` - component lifecycle (queue recovery, sweeps, breaker transitions)
/// - `RUST_LOG=agentmesh=debug,meshstore=info` - per-crate levels
/// - `RUST_LOG=agentmesh::bus=trace` - one module
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init() -> crate::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| crate::MeshError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}
