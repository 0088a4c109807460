//! Callback subscriptions on pub/sub channels
//!
//! The registry owns one store subscription and one task per channel. The
//! task decodes each message and calls the channel's handlers one after
//! another in registration order, so a channel's messages reach every
//! handler in publish order.

use crate::message::AgentMessage;
use crate::store::SharedStore;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Called for every message on a channel
pub type MessageHandler = Arc<dyn Fn(&AgentMessage) + Send + Sync>;

type Handlers = Arc<RwLock<Vec<(u64, MessageHandler)>>>;

struct ChannelTask {
    handlers: Handlers,
    task: JoinHandle<()>,
}

pub struct SubscriberRegistry {
    store: SharedStore,
    channels: Mutex<HashMap<String, ChannelTask>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl SubscriberRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            channels: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Add `handler` to `channel`; returns an id for [`remove`](Self::remove)
    ///
    /// The first handler on a channel opens the store subscription. Messages
    /// published before that are not seen.
    pub async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<u64> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut channels = self.channels.lock().await;

        if let Some(entry) = channels.get(channel) {
            if !entry.task.is_finished() {
                entry
                    .handlers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((id, handler));
                return Ok(id);
            }
        }

        let mut subscription = self.store.subscribe(channel).await?;
        let handlers: Handlers = Arc::new(RwLock::new(vec![(id, handler)]));
        let task_handlers = handlers.clone();
        let name = channel.to_string();
        let task = tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                let message = match AgentMessage::from_json(&raw) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(channel = %name, error = %e, "Skipping malformed message");
                        continue;
                    }
                };
                let current: Vec<MessageHandler> = task_handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect();
                for handler in current {
                    handler(&message);
                }
            }
            tracing::debug!(channel = %name, "Subscription closed");
        });

        tracing::debug!(channel, "Subscribed");
        channels.insert(channel.to_string(), ChannelTask { handlers, task });
        Ok(id)
    }

    /// Remove one handler; the last one out closes the subscription
    pub async fn remove(&self, channel: &str, handler_id: u64) -> bool {
        let mut channels = self.channels.lock().await;
        let Some(entry) = channels.get(channel) else {
            return false;
        };
        let (removed, empty) = {
            let mut handlers = entry.handlers.write().unwrap_or_else(PoisonError::into_inner);
            let before = handlers.len();
            handlers.retain(|(id, _)| *id != handler_id);
            (handlers.len() != before, handlers.is_empty())
        };
        if empty {
            if let Some(entry) = channels.remove(channel) {
                entry.task.abort();
            }
        }
        removed
    }

    /// Drop every handler on `channel` and close its subscription
    pub async fn unsubscribe(&self, channel: &str) -> bool {
        match self.channels.lock().await.remove(channel) {
            Some(entry) => {
                entry.task.abort();
                tracing::debug!(channel, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    pub async fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for SubscriberRegistry {
    fn drop(&mut self) {
        for entry in self.channels.get_mut().values() {
            entry.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use meshstore::{MemoryStore, StoreExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn publishable(n: u32) -> String {
        AgentMessage::new(MessageKind::Broadcast, "head", "*", json!({ "n": n }))
            .to_json()
            .unwrap()
    }

    fn recording(tx: mpsc::UnboundedSender<(String, serde_json::Value)>, tag: &str) -> MessageHandler {
        let tag = tag.to_string();
        Arc::new(move |msg: &AgentMessage| {
            let _ = tx.send((tag.clone(), msg.payload["n"].clone()));
        })
    }

    #[tokio::test]
    async fn test_handlers_run_in_order_per_message() {
        let store = Arc::new(MemoryStore::new());
        let registry = SubscriberRegistry::new(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.subscribe("channel:broadcast", recording(tx.clone(), "first")).await.unwrap();
        registry.subscribe("channel:broadcast", recording(tx, "second")).await.unwrap();

        store.publish("channel:broadcast", &publishable(1)).await.unwrap();
        store.publish("channel:broadcast", "garbage").await.unwrap();
        store.publish("channel:broadcast", &publishable(2)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                ("first".to_string(), json!(1)),
                ("second".to_string(), json!(1)),
                ("first".to_string(), json!(2)),
                ("second".to_string(), json!(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let store = Arc::new(MemoryStore::new());
        let registry = SubscriberRegistry::new(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = registry.subscribe("channel:head", recording(tx, "h")).await.unwrap();
        assert_eq!(registry.channels().await, vec!["channel:head"]);
        assert!(registry.remove("channel:head", id).await);
        assert!(registry.channels().await.is_empty());
        assert!(!registry.unsubscribe("channel:head").await);

        store.publish("channel:head", &publishable(1)).await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(got, Err(_) | Ok(None)));
    }
}
