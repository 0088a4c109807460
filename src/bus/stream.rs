//! Consumer group operations on the bus streams

use super::{MessageBus, MESSAGE_FIELD};
use crate::message::AgentMessage;
use crate::Result;
use meshstore::{GroupInfo, GroupStart, PendingEntry, ReadCursor, StoreError, StoreExt, StreamEntry, StreamId};
use serde::Serialize;
use std::time::Duration;

/// A decoded stream entry handed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: StreamId,
    pub message: AgentMessage,
}

/// Stream length and per-group backlog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamDepth {
    pub stream: String,
    pub length: i64,
    pub groups: Vec<GroupInfo>,
}

impl MessageBus {
    /// Create `group` on `stream` reading new entries only
    ///
    /// Creates the stream if needed; an existing group is left untouched.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        match self
            .store()
            .xgroup_create(stream, group, GroupStart::NewOnly, true)
            .await
        {
            Ok(()) => {
                tracing::debug!(stream, group, "Created consumer group");
                Ok(())
            }
            Err(StoreError::BusyGroup { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read entries never delivered to any member of `group`
    ///
    /// Waits up to `block` when nothing is available. A missing group is
    /// created (new entries only) and the read retried once. Entries that do
    /// not decode are acknowledged and skipped.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Delivery>> {
        let entries = match self
            .store()
            .xreadgroup(stream, group, consumer, ReadCursor::New, count, block)
            .await
        {
            Err(StoreError::NoGroup { .. }) => {
                self.ensure_group(stream, group).await?;
                self.store()
                    .xreadgroup(stream, group, consumer, ReadCursor::New, count, block)
                    .await?
            }
            other => other?,
        };
        self.decode(stream, group, entries).await
    }

    /// Re-read this consumer's delivered but unacknowledged entries
    pub async fn read_own_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        let entries = match self
            .store()
            .xreadgroup(stream, group, consumer, ReadCursor::OwnPending, count, None)
            .await
        {
            Err(StoreError::NoGroup { .. }) => return Ok(Vec::new()),
            other => other?,
        };
        self.decode(stream, group, entries).await
    }

    pub async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<i64> {
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.store().xack(stream, group, ids).await?)
    }

    /// Oldest pending entries of `group`
    pub async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>> {
        match self.store().xpending(stream, group, count, None).await {
            Err(StoreError::NoGroup { .. }) => Ok(Vec::new()),
            other => Ok(other?),
        }
    }

    /// Take over up to `count` entries idle for at least `min_idle`
    pub async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        let claimed = match self
            .store()
            .xautoclaim(stream, group, consumer, min_idle, StreamId::ZERO, count)
            .await
        {
            Err(StoreError::NoGroup { .. }) => return Ok(Vec::new()),
            other => other?,
        };
        if !claimed.deleted.is_empty() {
            tracing::warn!(
                stream,
                group,
                count = claimed.deleted.len(),
                "Pending entries were trimmed before delivery"
            );
        }
        if !claimed.entries.is_empty() {
            tracing::info!(stream, group, consumer, count = claimed.entries.len(), "Reclaimed idle entries");
        }
        self.decode(stream, group, claimed.entries).await
    }

    pub async fn stream_depth(&self, stream: &str) -> Result<StreamDepth> {
        let length = self.store().xlen(stream).await?;
        let groups = self.store().xinfo_groups(stream).await?;
        Ok(StreamDepth {
            stream: stream.to_string(),
            length,
            groups,
        })
    }

    async fn decode(&self, stream: &str, group: &str, entries: Vec<StreamEntry>) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(entries.len());
        let mut malformed = Vec::new();
        for entry in entries {
            let decoded = entry
                .field(MESSAGE_FIELD)
                .ok_or_else(|| "missing message field".to_string())
                .and_then(|raw| AgentMessage::from_json(raw).map_err(|e| e.to_string()));
            match decoded {
                Ok(message) => deliveries.push(Delivery { id: entry.id, message }),
                Err(error) => {
                    tracing::warn!(stream, group, id = %entry.id, error = %error, "Skipping malformed stream entry");
                    malformed.push(entry.id);
                }
            }
        }
        self.ack(stream, group, &malformed).await?;
        Ok(deliveries)
    }
}
