//! Coordination store key and channel naming
//!
//! These names are shared with every other process in the fleet and must
//! not change.

use std::fmt;
use std::str::FromStr;

pub const URGENT_QUEUE: &str = "queue:urgent";

pub fn task_queue(agent_id: &str) -> String {
    format!("queue:tasks:{}", agent_id)
}

pub fn processing_queue(agent_id: &str) -> String {
    format!("queue:processing:{}", agent_id)
}

pub fn decision_lock(decision_id: &str) -> String {
    format!("lock:decision:{}", decision_id)
}

pub fn container_lock(container_id: &str) -> String {
    format!("lock:container:{}", container_id)
}

pub fn claude_rate_limit(agent_id: &str) -> String {
    format!("ratelimit:claude:{}", agent_id)
}

pub fn api_rate_limit(client: &str) -> String {
    format!("ratelimit:api:{}", client)
}

pub fn agent_status(agent_id: &str) -> String {
    format!("agent:status:{}", agent_id)
}

/// A logical channel, with a best-effort pub/sub name and a paired stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Broadcast,
    Head,
    CLevel,
    Orchestrator,
    Agent(String),
}

impl Channel {
    pub fn agent(id: impl Into<String>) -> Self {
        Channel::Agent(id.into())
    }

    fn suffix(&self) -> String {
        match self {
            Channel::Broadcast => "broadcast".to_string(),
            Channel::Head => "head".to_string(),
            Channel::CLevel => "clevel".to_string(),
            Channel::Orchestrator => "orchestrator".to_string(),
            Channel::Agent(id) => format!("agent:{}", id),
        }
    }

    /// Pub/sub channel name, e.g. `channel:agent:a1`
    pub fn pubsub(&self) -> String {
        format!("channel:{}", self.suffix())
    }

    /// Paired stream name, e.g. `stream:agent:a1`
    pub fn stream(&self) -> String {
        format!("stream:{}", self.suffix())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix())
    }
}

impl FromStr for Channel {
    type Err = String;

    /// Accepts the bare suffix (`head`, `agent:a1`) or either full name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s
            .strip_prefix("channel:")
            .or_else(|| s.strip_prefix("stream:"))
            .unwrap_or(s);
        match bare {
            "broadcast" => Ok(Channel::Broadcast),
            "head" => Ok(Channel::Head),
            "clevel" => Ok(Channel::CLevel),
            "orchestrator" => Ok(Channel::Orchestrator),
            other => match other.strip_prefix("agent:") {
                Some(id) if !id.is_empty() => Ok(Channel::agent(id)),
                _ => Err(format!("Unknown channel: {}", s)),
            },
        }
    }
}
