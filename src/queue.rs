//! Per-agent task queues with crash-safe claiming
//!
//! Each agent has a queue (`queue:tasks:{id}`) and a processing buffer
//! (`queue:processing:{id}`). Producers push onto the tail; a claim moves the
//! head entry into the processing buffer in one atomic step, so a claimed
//! task is always in exactly one of the two lists. Acknowledging removes it
//! from the buffer; recovery moves everything left in the buffer back onto
//! the queue. Delivery is at-least-once.
//!
//! Lists follow store direction semantics: `LPUSH` is the tail, the right
//! end (`RPOP`) is the head.

use crate::keys::{self, Channel};
use crate::message::{AgentMessage, MessageKind, Priority};
use crate::metrics;
use crate::store::SharedStore;
use crate::Result;
use chrono::{DateTime, Utc};
use meshstore::{Command, StoreExt};
use serde::{Deserialize, Serialize};

/// Sender name used on queue notifications
const QUEUE_SENDER: &str = "queue";

/// A unit of work for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedTask {
    pub fn new(agent_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// A task moved into the processing buffer
///
/// `raw` is the exact stored text; acknowledgement matches on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub task: QueuedTask,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queued: i64,
    pub processing: i64,
}

#[derive(Clone)]
pub struct TaskQueue {
    store: SharedStore,
}

impl TaskQueue {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Append a task to `agent_id`'s queue and notify the agent
    ///
    /// The push and the notification are one store transaction.
    pub async fn enqueue(&self, agent_id: &str, payload: serde_json::Value) -> Result<QueuedTask> {
        let task = QueuedTask::new(agent_id, payload);
        let raw = serde_json::to_string(&task)?;
        let notice = AgentMessage::new(
            MessageKind::TaskQueued,
            QUEUE_SENDER,
            agent_id,
            serde_json::json!({ "taskId": task.id }),
        );

        let replies = self
            .store
            .transaction(vec![
                Command::LPush {
                    key: keys::task_queue(agent_id),
                    values: vec![raw],
                },
                Command::Publish {
                    channel: Channel::agent(agent_id).pubsub(),
                    message: notice.to_json()?,
                },
            ])
            .await?;
        for reply in replies {
            reply.into_result()?;
        }

        metrics::record_queue_operation("enqueue", 1);
        tracing::debug!(agent_id, task_id = %task.id, "Task enqueued");
        Ok(task)
    }

    /// Move up to `count` tasks from the head of the queue into processing
    ///
    /// Each task is its own atomic move; stops early once the queue is empty.
    /// Entries that do not parse are dropped from the processing buffer.
    pub async fn claim(&self, agent_id: &str, count: usize) -> Result<Vec<ClaimedTask>> {
        let queue = keys::task_queue(agent_id);
        let processing = keys::processing_queue(agent_id);
        let mut claimed = Vec::new();

        for _ in 0..count {
            let Some(raw) = self.store.rpoplpush(&queue, &processing).await? else {
                break;
            };
            match serde_json::from_str::<QueuedTask>(&raw) {
                Ok(task) => claimed.push(ClaimedTask { task, raw }),
                Err(e) => {
                    tracing::warn!(agent_id, error = %e, raw = %raw, "Discarding malformed task");
                    self.store.lrem(&processing, 1, &raw).await?;
                    metrics::record_queue_operation("discard", 1);
                }
            }
        }

        if !claimed.is_empty() {
            metrics::record_queue_operation("claim", claimed.len() as u64);
            tracing::debug!(agent_id, count = claimed.len(), "Tasks claimed");
        }
        Ok(claimed)
    }

    /// Remove finished tasks from the processing buffer
    ///
    /// Idempotent; returns how many were still there.
    pub async fn acknowledge(&self, agent_id: &str, tasks: &[ClaimedTask]) -> Result<i64> {
        let processing = keys::processing_queue(agent_id);
        let mut removed = 0;
        for claimed in tasks {
            removed += self.store.lrem(&processing, 1, &claimed.raw).await?;
        }
        metrics::record_queue_operation("ack", removed.max(0) as u64);
        Ok(removed)
    }

    /// Acknowledge by task id, for callers that no longer hold the claim
    pub async fn acknowledge_ids(&self, agent_id: &str, task_ids: &[String]) -> Result<i64> {
        let processing = keys::processing_queue(agent_id);
        let mut removed = 0;
        for raw in self.store.lrange(&processing, 0, -1).await? {
            let Ok(task) = serde_json::from_str::<QueuedTask>(&raw) else {
                continue;
            };
            if task_ids.contains(&task.id) {
                removed += self.store.lrem(&processing, 1, &raw).await?;
            }
        }
        metrics::record_queue_operation("ack", removed.max(0) as u64);
        Ok(removed)
    }

    /// Move everything left in the processing buffer back onto the queue
    ///
    /// One atomic move; recovered tasks land at the tail in their original
    /// relative order.
    pub async fn recover(&self, agent_id: &str) -> Result<i64> {
        let moved = self
            .store
            .drain_list(&keys::processing_queue(agent_id), &keys::task_queue(agent_id))
            .await?;
        if moved > 0 {
            tracing::info!(agent_id, count = moved, "Recovered stranded tasks");
            metrics::record_queue_operation("recover", moved as u64);
        }
        Ok(moved)
    }

    pub async fn depth(&self, agent_id: &str) -> Result<QueueDepth> {
        let depth = QueueDepth {
            queued: self.store.llen(&keys::task_queue(agent_id)).await?,
            processing: self.store.llen(&keys::processing_queue(agent_id)).await?,
        };
        metrics::set_queue_depth(agent_id, depth.queued, depth.processing);
        Ok(depth)
    }

    /// Tasks currently claimed but not acknowledged, oldest first
    pub async fn processing(&self, agent_id: &str) -> Result<Vec<QueuedTask>> {
        let mut raw = self
            .store
            .lrange(&keys::processing_queue(agent_id), 0, -1)
            .await?;
        raw.reverse();
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    /// Add a task to the shared urgent lane and alert the orchestrator
    pub async fn enqueue_urgent(&self, payload: serde_json::Value) -> Result<QueuedTask> {
        let task = QueuedTask::new("", payload);
        let raw = serde_json::to_string(&task)?;
        let notice = AgentMessage::new(
            MessageKind::TaskQueued,
            QUEUE_SENDER,
            Channel::Orchestrator.to_string(),
            serde_json::json!({ "taskId": task.id, "queue": keys::URGENT_QUEUE }),
        )
        .with_priority(Priority::Urgent);

        let replies = self
            .store
            .transaction(vec![
                Command::LPush {
                    key: keys::URGENT_QUEUE.to_string(),
                    values: vec![raw],
                },
                Command::Publish {
                    channel: Channel::Orchestrator.pubsub(),
                    message: notice.to_json()?,
                },
            ])
            .await?;
        for reply in replies {
            reply.into_result()?;
        }

        metrics::record_queue_operation("enqueue_urgent", 1);
        tracing::info!(task_id = %task.id, "Urgent task enqueued");
        Ok(task)
    }

    pub async fn urgent_depth(&self) -> Result<i64> {
        let depth = self.store.llen(keys::URGENT_QUEUE).await?;
        metrics::set_urgent_depth(depth);
        Ok(depth)
    }

    /// Move the oldest urgent task onto `agent_id`'s queue, then notify it
    ///
    /// The move is atomic; the notification is a separate step. The task
    /// keeps the text it was stored with, so its `agentId` stays empty.
    pub async fn route_urgent(&self, agent_id: &str) -> Result<Option<QueuedTask>> {
        let Some(raw) = self
            .store
            .rpoplpush(keys::URGENT_QUEUE, &keys::task_queue(agent_id))
            .await?
        else {
            return Ok(None);
        };

        let task: Option<QueuedTask> = serde_json::from_str(&raw).ok();
        let notice = AgentMessage::new(
            MessageKind::TaskAssigned,
            QUEUE_SENDER,
            agent_id,
            serde_json::json!({ "taskId": task.as_ref().map(|t| t.id.clone()) }),
        )
        .with_priority(Priority::Urgent);
        self.store
            .publish(&Channel::agent(agent_id).pubsub(), &notice.to_json()?)
            .await?;

        metrics::record_queue_operation("route_urgent", 1);
        tracing::info!(agent_id, "Urgent task routed");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshstore::{CoordinationStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn queue() -> (TaskQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (TaskQueue::new(store.clone()), store)
    }

    fn ids(tasks: &[ClaimedTask]) -> Vec<serde_json::Value> {
        tasks.iter().map(|t| t.task.payload["n"].clone()).collect()
    }

    #[tokio::test]
    async fn test_fifo_claim_order() {
        let (queue, _) = queue();
        for n in 1..=3 {
            queue.enqueue("a1", json!({ "n": n })).await.unwrap();
        }

        let first = queue.claim("a1", 2).await.unwrap();
        assert_eq!(ids(&first), vec![json!(1), json!(2)]);
        let rest = queue.claim("a1", 5).await.unwrap();
        assert_eq!(ids(&rest), vec![json!(3)]);
        assert!(queue.claim("a1", 1).await.unwrap().is_empty());

        let depth = queue.depth("a1").await.unwrap();
        assert_eq!(depth, QueueDepth { queued: 0, processing: 3 });
    }

    #[tokio::test]
    async fn test_enqueue_notifies_agent() {
        let (queue, store) = queue();
        let mut sub = store.subscribe("channel:agent:a1").await.unwrap();

        let task = queue.enqueue("a1", json!({})).await.unwrap();
        let raw = sub.recv().await.unwrap();
        let msg = AgentMessage::from_json(&raw).unwrap();
        assert_eq!(msg.kind, MessageKind::TaskQueued);
        assert_eq!(msg.to, "a1");
        assert_eq!(msg.payload["taskId"], task.id.as_str());
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let (queue, _) = queue();
        queue.enqueue("a1", json!({ "n": 1 })).await.unwrap();
        let claimed = queue.claim("a1", 1).await.unwrap();

        assert_eq!(queue.acknowledge("a1", &claimed).await.unwrap(), 1);
        assert_eq!(queue.acknowledge("a1", &claimed).await.unwrap(), 0);
        assert_eq!(queue.depth("a1").await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn test_acknowledge_by_id() {
        let (queue, _) = queue();
        queue.enqueue("a1", json!({ "n": 1 })).await.unwrap();
        queue.enqueue("a1", json!({ "n": 2 })).await.unwrap();
        let claimed = queue.claim("a1", 2).await.unwrap();

        let first = vec![claimed[0].task.id.clone()];
        assert_eq!(queue.acknowledge_ids("a1", &first).await.unwrap(), 1);
        assert_eq!(queue.acknowledge_ids("a1", &first).await.unwrap(), 0);

        let left = queue.processing("a1").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, claimed[1].task.id);
    }

    #[tokio::test]
    async fn test_recover_requeues_at_tail_in_order() {
        let (queue, _) = queue();
        for n in 1..=4 {
            queue.enqueue("a1", json!({ "n": n })).await.unwrap();
        }
        queue.claim("a1", 2).await.unwrap();

        // Crash: nothing acknowledged
        assert_eq!(queue.recover("a1").await.unwrap(), 2);
        assert_eq!(queue.recover("a1").await.unwrap(), 0);

        let order = queue.claim("a1", 10).await.unwrap();
        assert_eq!(ids(&order), vec![json!(3), json!(4), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_discarded() {
        let (queue, store) = queue();
        store.lpush("queue:tasks:a1", "not json").await.unwrap();
        queue.enqueue("a1", json!({ "n": 1 })).await.unwrap();

        let claimed = queue.claim("a1", 2).await.unwrap();
        assert_eq!(ids(&claimed), vec![json!(1)]);
        assert_eq!(queue.depth("a1").await.unwrap().processing, 1);
    }

    #[tokio::test]
    async fn test_processing_lists_oldest_first() {
        let (queue, _) = queue();
        for n in 1..=2 {
            queue.enqueue("a1", json!({ "n": n })).await.unwrap();
        }
        queue.claim("a1", 2).await.unwrap();
        let stranded = queue.processing("a1").await.unwrap();
        let order: Vec<_> = stranded.iter().map(|t| t.payload["n"].clone()).collect();
        assert_eq!(order, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_urgent_lane() {
        let (queue, store) = queue();
        let mut orchestrator = store.subscribe("channel:orchestrator").await.unwrap();

        let urgent = queue.enqueue_urgent(json!({ "n": 9 })).await.unwrap();
        let alert = AgentMessage::from_json(&orchestrator.recv().await.unwrap()).unwrap();
        assert_eq!(alert.priority, Priority::Urgent);
        assert_eq!(queue.urgent_depth().await.unwrap(), 1);

        queue.enqueue("a1", json!({ "n": 1 })).await.unwrap();
        let mut agent = store.subscribe("channel:agent:a1").await.unwrap();
        let routed = queue.route_urgent("a1").await.unwrap().unwrap();
        assert_eq!(routed.id, urgent.id);
        let notice = AgentMessage::from_json(&agent.recv().await.unwrap()).unwrap();
        assert_eq!(notice.kind, MessageKind::TaskAssigned);

        assert_eq!(queue.urgent_depth().await.unwrap(), 0);
        assert!(queue.route_urgent("a1").await.unwrap().is_none());

        // Routed work goes behind what the agent already had
        let order = queue.claim("a1", 2).await.unwrap();
        assert_eq!(ids(&order), vec![json!(1), json!(9)]);
    }
}
