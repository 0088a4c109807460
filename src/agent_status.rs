//! Short-lived agent status cache
//!
//! Agents refresh `agent:status:{id}` periodically; a status that is not
//! refreshed within the TTL disappears and the agent reads as unknown.

use crate::keys;
use crate::store::SharedStore;
use crate::Result;
use chrono::{DateTime, Utc};
use meshstore::StoreExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Busy,
    Paused,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub agent_id: String,
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentStatus {
    pub fn new(agent_id: impl Into<String>, state: AgentState) -> Self {
        Self {
            agent_id: agent_id.into(),
            state,
            current_task: None,
            updated_at: Utc::now(),
        }
    }

    pub fn working_on(mut self, task_id: impl Into<String>) -> Self {
        self.current_task = Some(task_id.into());
        self
    }
}

#[derive(Clone)]
pub struct AgentStatusCache {
    store: SharedStore,
    ttl: Duration,
}

impl AgentStatusCache {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn set(&self, status: &AgentStatus) -> Result<()> {
        let value = serde_json::to_string(status)?;
        self.store
            .set_ex(&keys::agent_status(&status.agent_id), &value, self.ttl)
            .await?;
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        let Some(raw) = self.store.get(&keys::agent_status(agent_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(status) => Ok(Some(status)),
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "Ignoring malformed agent status");
                Ok(None)
            }
        }
    }
}
