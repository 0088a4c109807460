//! Message bus with best-effort and guaranteed delivery paths
//!
//! Every logical [`Channel`](crate::keys::Channel) has a pub/sub name and a
//! paired stream. Pub/sub reaches whoever is subscribed right now and is lost
//! otherwise. Streams keep entries (trimmed to roughly `stream_max_len`) and
//! hand them to consumer groups, where an entry stays pending until it is
//! acknowledged and can be reclaimed by another consumer once idle.

mod consumer;
mod stream;
mod subscribers;

pub use consumer::{default_consumer_name, ConsumerOptions, CycleStats, DeliveryHandler, GuaranteedConsumer};
pub use stream::{Delivery, StreamDepth};
pub use subscribers::{MessageHandler, SubscriberRegistry};

use crate::config::BusSettings;
use crate::keys::Channel;
use crate::message::AgentMessage;
use crate::metrics;
use crate::store::SharedStore;
use crate::{MeshError, Result};
use meshstore::{StoreError, StoreExt, StreamId};
use serde::Serialize;
use std::collections::BTreeMap;

/// Stream entry field holding the message JSON
pub const MESSAGE_FIELD: &str = "message";

/// Outcome of one delivery path
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PathOutcome<T> {
    Ok { value: T },
    Failed { error: String },
}

impl<T> PathOutcome<T> {
    fn from_result(result: std::result::Result<T, StoreError>) -> Self {
        match result {
            Ok(value) => PathOutcome::Ok { value },
            Err(e) => PathOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PathOutcome::Ok { .. })
    }
}

/// Result of a publish on both paths
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReport {
    /// Subscribers reached over pub/sub
    pub pubsub: PathOutcome<i64>,
    /// Id of the stream entry
    pub stream: PathOutcome<StreamId>,
}

impl DeliveryReport {
    pub fn stream_id(&self) -> Option<StreamId> {
        match &self.stream {
            PathOutcome::Ok { value } => Some(*value),
            PathOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct MessageBus {
    store: SharedStore,
    settings: BusSettings,
}

impl MessageBus {
    pub fn new(store: SharedStore, settings: BusSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub(crate) fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Best-effort publish; returns the number of subscribers reached
    pub async fn publish(&self, channel: &str, message: &AgentMessage) -> Result<i64> {
        let payload = message.to_json()?;
        let result = self.store.publish(channel, &payload).await;
        metrics::record_delivery("pubsub", result.is_ok());
        Ok(result?)
    }

    /// Append to `stream`, trimming it to roughly the configured length
    pub async fn publish_to_stream(&self, stream: &str, message: &AgentMessage) -> Result<StreamId> {
        let payload = message.to_json()?;
        let result = self.append(stream, payload).await;
        metrics::record_delivery("stream", result.is_ok());
        Ok(result?)
    }

    async fn append(&self, stream: &str, payload: String) -> std::result::Result<StreamId, StoreError> {
        let mut fields = BTreeMap::new();
        fields.insert(MESSAGE_FIELD.to_string(), payload);
        self.store
            .xadd(stream, fields, Some(self.settings.stream_max_len))
            .await
    }

    /// Publish on both paths independently
    ///
    /// A failure on one path never stops the other. Fails only when both do.
    pub async fn publish_with_guarantee(
        &self,
        channel: &str,
        stream: &str,
        message: &AgentMessage,
    ) -> Result<DeliveryReport> {
        let payload = message.to_json()?;
        let (pubsub, appended) = tokio::join!(
            self.store.publish(channel, &payload),
            self.append(stream, payload.clone()),
        );
        metrics::record_delivery("pubsub", pubsub.is_ok());
        metrics::record_delivery("stream", appended.is_ok());

        let report = DeliveryReport {
            pubsub: PathOutcome::from_result(pubsub),
            stream: PathOutcome::from_result(appended),
        };
        match (&report.pubsub, &report.stream) {
            (PathOutcome::Failed { error: a }, PathOutcome::Failed { error: b }) => {
                Err(MeshError::Delivery(format!("pubsub: {}; stream: {}", a, b)))
            }
            (PathOutcome::Failed { error }, _) => {
                tracing::warn!(channel, message_id = %message.id, error = %error, "Pub/sub path failed, stream holds the message");
                Ok(report)
            }
            (_, PathOutcome::Failed { error }) => {
                tracing::warn!(stream, message_id = %message.id, error = %error, "Stream path failed, message not durable");
                Ok(report)
            }
            _ => Ok(report),
        }
    }

    /// [`publish_with_guarantee`](Self::publish_with_guarantee) on a
    /// channel's pub/sub name and paired stream
    pub async fn send(&self, channel: &Channel, message: &AgentMessage) -> Result<DeliveryReport> {
        self.publish_with_guarantee(&channel.pubsub(), &channel.stream(), message)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use async_trait::async_trait;
    use meshstore::{Command, CoordinationStore, MemoryStore, Reply, Subscription};
    use serde_json::json;
    use std::sync::Arc;

    fn message() -> AgentMessage {
        AgentMessage::new(MessageKind::Broadcast, "head", "*", json!({"n": 1}))
    }

    /// Store whose pub/sub and/or stream commands fail
    struct FlakyStore {
        inner: MemoryStore,
        fail_publish: bool,
        fail_xadd: bool,
    }

    #[async_trait]
    impl CoordinationStore for FlakyStore {
        async fn execute(&self, command: Command) -> meshstore::Result<Reply> {
            match command {
                Command::Publish { .. } if self.fail_publish => {
                    Err(StoreError::Transport("connection reset".into()))
                }
                Command::XAdd { .. } if self.fail_xadd => {
                    Err(StoreError::Transport("connection reset".into()))
                }
                other => self.inner.execute(other).await,
            }
        }

        async fn transaction(&self, commands: Vec<Command>) -> meshstore::Result<Vec<Reply>> {
            self.inner.transaction(commands).await
        }

        async fn subscribe(&self, channel: &str) -> meshstore::Result<Subscription> {
            self.inner.subscribe(channel).await
        }
    }

    fn flaky_bus(fail_publish: bool, fail_xadd: bool) -> (MessageBus, Arc<FlakyStore>) {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_publish,
            fail_xadd,
        });
        (MessageBus::new(store.clone(), BusSettings::default()), store)
    }

    #[tokio::test]
    async fn test_guaranteed_publish_reaches_both_paths() {
        let (bus, store) = flaky_bus(false, false);
        let mut sub = store.subscribe("channel:head").await.unwrap();

        let msg = message();
        let report = bus.send(&Channel::Head, &msg).await.unwrap();
        assert_eq!(report.pubsub, PathOutcome::Ok { value: 1 });
        assert!(report.stream_id().is_some());

        let received = AgentMessage::from_json(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(received, msg);
        assert_eq!(store.xlen("stream:head").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pubsub_failure_still_appends() {
        let (bus, store) = flaky_bus(true, false);
        let report = bus.send(&Channel::CLevel, &message()).await.unwrap();
        assert!(!report.pubsub.is_ok());
        assert!(report.stream.is_ok());
        assert_eq!(store.xlen("stream:clevel").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_still_publishes() {
        let (bus, store) = flaky_bus(false, true);
        let mut sub = store.subscribe("channel:clevel").await.unwrap();
        let report = bus.send(&Channel::CLevel, &message()).await.unwrap();
        assert!(report.pubsub.is_ok());
        assert!(report.stream_id().is_none());
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_both_paths_failing_is_an_error() {
        let (bus, _) = flaky_bus(true, true);
        let err = bus.send(&Channel::Broadcast, &message()).await.unwrap_err();
        assert!(matches!(err, MeshError::Delivery(_)));
    }

    #[tokio::test]
    async fn test_stream_is_trimmed_roughly() {
        let store = Arc::new(MemoryStore::new());
        let settings = BusSettings {
            stream_max_len: 10,
            ..Default::default()
        };
        let bus = MessageBus::new(store.clone(), settings);
        for _ in 0..25 {
            bus.publish_to_stream("stream:broadcast", &message()).await.unwrap();
        }
        let len = store.xlen("stream:broadcast").await.unwrap();
        assert!((10..=11).contains(&len), "len = {}", len);
    }
}
