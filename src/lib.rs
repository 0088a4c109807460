//! agentmesh - Distributed coordination layer for fleets of autonomous agents
//!
//! Agents run as independent processes and coordinate only through a shared
//! coordination store. This crate provides the pieces they coordinate with:
//! a crash-safe task queue, a message bus with best-effort and guaranteed
//! delivery, locks, fixed-window rate limits, circuit breakers, and a tiered
//! decision workflow with human escalation.
//!
//! # Architecture
//!
//! - **store**: Store handle, [`RemoteStore`](store::RemoteStore) HTTP client
//! - **queue**: Per-agent task queues with claim/acknowledge/recover
//! - **bus**: Pub/sub plus streams with consumer groups
//! - **lock**: Store-backed mutual exclusion
//! - **rate_limit**: Fixed-window counters
//! - **breaker**: Per-dependency circuit breakers
//! - **decision**: Decisions, votes, escalations and the timeout sweeper
//! - **server**: axum surface for the store and the collaborator API
//! - **mesh**: The per-process service bundle

// Core modules
pub mod config;
pub mod error;
pub mod keys;
pub mod message;
pub mod retry;
pub mod store;

// Components
pub mod agent_status;
pub mod breaker;
pub mod bus;
pub mod decision;
pub mod lock;
pub mod queue;
pub mod rate_limit;

// Process wiring
pub mod logging;
pub mod mesh;
pub mod metrics;
pub mod server;

// Re-exports
pub use error::{MeshError, Result};
pub use mesh::Mesh;
