//! Long-running consumer for a guaranteed stream
//!
//! Each cycle first takes over entries other consumers left idle past
//! `reclaim_min_idle`, then reads new entries with a bounded block. An entry
//! is acknowledged only after its handler returns `Ok`; on `Err` it stays
//! pending and comes back through reclaim.

use super::{Delivery, MessageBus};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

/// Processes one delivery; `Err` leaves it pending for redelivery
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// `{hostname}-{pid}`
pub fn default_consumer_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}-{}", host, std::process::id())
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub count: usize,
    pub block: Duration,
    pub reclaim_min_idle: Duration,
}

impl ConsumerOptions {
    /// Options for `stream`/`group` with the bus defaults
    pub fn new(bus: &MessageBus, stream: impl Into<String>, group: impl Into<String>) -> Self {
        let settings = bus.settings();
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: default_consumer_name(),
            count: settings.read_count,
            block: settings.read_block,
            reclaim_min_idle: settings.reclaim_min_idle,
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }
}

/// Counts from one consumer cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub handled: usize,
    pub failed: usize,
}

pub struct GuaranteedConsumer<H> {
    bus: MessageBus,
    options: ConsumerOptions,
    handler: H,
}

impl<H: DeliveryHandler> GuaranteedConsumer<H> {
    pub fn new(bus: MessageBus, options: ConsumerOptions, handler: H) -> Self {
        Self { bus, options, handler }
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Run until `shutdown` turns `true`
    ///
    /// Store failures are logged and retried after a pause; they never end
    /// the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let opts = &self.options;
        self.bus.ensure_group(&opts.stream, &opts.group).await?;
        tracing::info!(stream = %opts.stream, group = %opts.group, consumer = %opts.consumer, "Consumer started");

        // Entries this consumer took but never acknowledged before a restart
        let own = self
            .bus
            .read_own_pending(&opts.stream, &opts.group, &opts.consumer, opts.count)
            .await?;
        self.dispatch(own).await?;

        while !*shutdown.borrow() {
            let failed = tokio::select! {
                cycle = self.cycle() => cycle.err(),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    None
                }
            };
            if let Some(e) = failed {
                tracing::warn!(stream = %opts.stream, error = %e, "Consumer cycle failed");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!(stream = %opts.stream, consumer = %opts.consumer, "Consumer stopped");
        Ok(())
    }

    /// One reclaim + read + dispatch pass
    pub async fn cycle(&self) -> Result<CycleStats> {
        let opts = &self.options;
        let mut stats = CycleStats::default();

        let reclaimed = self
            .bus
            .reclaim(&opts.stream, &opts.group, &opts.consumer, opts.reclaim_min_idle, opts.count)
            .await?;
        let s = self.dispatch(reclaimed).await?;
        stats.handled += s.handled;
        stats.failed += s.failed;

        let fresh = self
            .bus
            .read_group(&opts.stream, &opts.group, &opts.consumer, opts.count, Some(opts.block))
            .await?;
        let s = self.dispatch(fresh).await?;
        stats.handled += s.handled;
        stats.failed += s.failed;
        Ok(stats)
    }

    async fn dispatch(&self, deliveries: Vec<Delivery>) -> Result<CycleStats> {
        let opts = &self.options;
        let mut stats = CycleStats::default();
        let mut settled = Vec::new();
        for delivery in deliveries {
            match self.handler.handle(&delivery).await {
                Ok(()) => {
                    settled.push(delivery.id);
                    stats.handled += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        stream = %opts.stream,
                        id = %delivery.id,
                        error = %e,
                        "Handler failed, entry left pending"
                    );
                    stats.failed += 1;
                }
            }
        }
        self.bus.ack(&opts.stream, &opts.group, &settled).await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusSettings;
    use crate::message::{AgentMessage, MessageKind};
    use meshstore::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        seen: Arc<AtomicUsize>,
        fail_first: bool,
    }

    #[async_trait]
    impl DeliveryHandler for Counting {
        async fn handle(&self, _delivery: &Delivery) -> anyhow::Result<()> {
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    }

    fn bus() -> MessageBus {
        let settings = BusSettings {
            read_block: Duration::from_millis(10),
            reclaim_min_idle: Duration::from_secs(60),
            ..Default::default()
        };
        MessageBus::new(Arc::new(MemoryStore::new()), settings)
    }

    fn message() -> AgentMessage {
        AgentMessage::new(MessageKind::Direct, "head", "a1", json!({}))
    }

    #[test]
    fn test_default_consumer_name_has_pid() {
        let name = default_consumer_name();
        assert!(name.ends_with(&format!("-{}", std::process::id())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_is_redelivered() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let options = ConsumerOptions::new(&bus, "stream:agent:a1", "agents").with_consumer("c1");
        let consumer = GuaranteedConsumer::new(
            bus.clone(),
            options,
            Counting {
                seen: seen.clone(),
                fail_first: true,
            },
        );
        bus.ensure_group("stream:agent:a1", "agents").await.unwrap();
        bus.publish_to_stream("stream:agent:a1", &message()).await.unwrap();

        let stats = consumer.cycle().await.unwrap();
        assert_eq!(stats, CycleStats { handled: 0, failed: 1 });
        assert_eq!(bus.pending("stream:agent:a1", "agents", 10).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let stats = consumer.cycle().await.unwrap();
        assert_eq!(stats.handled, 1);
        assert!(bus.pending("stream:agent:a1", "agents", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let options = ConsumerOptions::new(&bus, "stream:head", "heads").with_consumer("c1");
        let consumer = Arc::new(GuaranteedConsumer::new(
            bus.clone(),
            options,
            Counting {
                seen: seen.clone(),
                fail_first: false,
            },
        ));
        let (tx, rx) = watch::channel(false);
        let running = consumer.clone();
        let handle = tokio::spawn(async move { running.run(rx).await });

        // Give the consumer time to create its group
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish_to_stream("stream:head", &message()).await.unwrap();
        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
