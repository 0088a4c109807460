//! Decisions, votes and human escalation
//!
//! State machine:
//!
//! ```text
//! pending ──vote/manual──▶ approved | rejected
//!    │
//!    └──tier timeout / veto limit──▶ escalated ──human / deadline──▶ approved | rejected
//! ```
//!
//! Minor decisions approve themselves when their timeout passes; major and
//! critical ones escalate to a human instead.

mod coordinator;
mod repository;
mod sweeper;
mod types;

pub use coordinator::{DecisionCoordinator, SweepReport};
pub use repository::{DecisionRepository, SqliteDecisionRepository};
pub use sweeper::{Sweeper, SweeperCommand, SweeperEvent};
pub use types::{
    Decision, DecisionStatus, Escalation, EscalationStatus, EscalationTimeoutPolicy, Tier, Vote,
    Voter,
};
