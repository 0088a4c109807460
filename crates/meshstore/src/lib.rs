//! Coordination store contract for agentmesh
//!
//! A coordination store is a shared key-value store offering atomic commands
//! over strings, lists, counters, pub/sub channels and append-only streams
//! with consumer groups. Components talk to it only through
//! [`CoordinationStore`], so the same code runs against the in-process
//! [`MemoryStore`] or a store reached over the network.
//!
//! # Example
//!
//! ```
//! use meshstore::{MemoryStore, StoreExt};
//! use std::time::Duration;
//!
//! # tokio_test_block_on(async {
//! let store = MemoryStore::new();
//! assert!(store.set_nx_ex("lock:decision:1", "1", Duration::from_secs(30)).await?);
//! assert!(!store.set_nx_ex("lock:decision:1", "1", Duration::from_secs(30)).await?);
//! # Ok::<(), meshstore::StoreError>(())
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

mod command;
mod error;
mod memory;
mod stream;

pub use command::{Command, Reply};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use stream::{
    AutoClaimed, GroupInfo, GroupStart, PendingEntry, ReadCursor, StreamEntry, StreamId,
};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// The shared coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Execute one command atomically
    async fn execute(&self, command: Command) -> Result<Reply>;

    /// Execute commands atomically and in order, with no interleaving from
    /// other clients. A failing command yields [`Reply::Error`] in its slot;
    /// the others still apply.
    async fn transaction(&self, commands: Vec<Command>) -> Result<Vec<Reply>>;

    /// Register a best-effort subscriber on `channel`
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// A best-effort pub/sub subscription
///
/// Receives only messages published after it was registered, in publish
/// order. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message; `None` once the store side has gone away
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next message if one is already buffered
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Typed helpers over [`CoordinationStore::execute`]
#[async_trait]
pub trait StoreExt: CoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.execute(Command::Get { key: key.to_string() })
            .await?
            .into_opt_string()
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.execute(Command::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms: millis(ttl),
        })
        .await?
        .into_result()
        .map(|_| ())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.execute(Command::SetNxEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms: millis(ttl),
        })
        .await?
        .into_bool()
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.execute(Command::Del { key: key.to_string() })
            .await?
            .into_bool()
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        self.execute(Command::DelIfEq {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await?
        .into_bool()
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.execute(Command::Incr { key: key.to_string() })
            .await?
            .into_int()
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.execute(Command::Expire {
            key: key.to_string(),
            ttl_ms: millis(ttl),
        })
        .await?
        .into_bool()
    }

    /// Remaining TTL; `None` if the key is missing or has no expiry
    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let ms = self
            .execute(Command::Ttl { key: key.to_string() })
            .await?
            .into_int()?;
        Ok(u64::try_from(ms).ok().map(Duration::from_millis))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        self.execute(Command::LPush {
            key: key.to_string(),
            values: vec![value.to_string()],
        })
        .await?
        .into_int()
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        self.execute(Command::RPop { key: key.to_string() })
            .await?
            .into_opt_string()
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        self.execute(Command::RPopLPush {
            source: source.to_string(),
            destination: destination.to_string(),
        })
        .await?
        .into_opt_string()
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<i64> {
        self.execute(Command::LRem {
            key: key.to_string(),
            count,
            value: value.to_string(),
        })
        .await?
        .into_int()
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        self.execute(Command::LLen { key: key.to_string() })
            .await?
            .into_int()
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.execute(Command::LRange {
            key: key.to_string(),
            start,
            stop,
        })
        .await?
        .into_list()
    }

    async fn drain_list(&self, source: &str, destination: &str) -> Result<i64> {
        self.execute(Command::DrainList {
            source: source.to_string(),
            destination: destination.to_string(),
        })
        .await?
        .into_int()
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<i64> {
        self.execute(Command::Publish {
            channel: channel.to_string(),
            message: message.to_string(),
        })
        .await?
        .into_int()
    }

    async fn xadd(
        &self,
        key: &str,
        fields: BTreeMap<String, String>,
        max_len: Option<usize>,
    ) -> Result<StreamId> {
        self.execute(Command::XAdd {
            key: key.to_string(),
            fields,
            max_len,
        })
        .await?
        .into_id()
    }

    async fn xgroup_create(
        &self,
        key: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<()> {
        self.execute(Command::XGroupCreate {
            key: key.to_string(),
            group: group.to_string(),
            start,
            mkstream,
        })
        .await?
        .into_result()
        .map(|_| ())
    }

    async fn xreadgroup(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        self.execute(Command::XReadGroup {
            key: key.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            cursor,
            count,
            block_ms: block.map(millis),
        })
        .await?
        .into_entries()
    }

    async fn xack(&self, key: &str, group: &str, ids: &[StreamId]) -> Result<i64> {
        self.execute(Command::XAck {
            key: key.to_string(),
            group: group.to_string(),
            ids: ids.to_vec(),
        })
        .await?
        .into_int()
    }

    async fn xpending(
        &self,
        key: &str,
        group: &str,
        count: usize,
        min_idle: Option<Duration>,
    ) -> Result<Vec<PendingEntry>> {
        self.execute(Command::XPending {
            key: key.to_string(),
            group: group.to_string(),
            count,
            min_idle_ms: min_idle.map(millis),
            consumer: None,
        })
        .await?
        .into_pending()
    }

    async fn xclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamEntry>> {
        self.execute(Command::XClaim {
            key: key.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            min_idle_ms: millis(min_idle),
            ids: ids.to_vec(),
        })
        .await?
        .into_entries()
    }

    async fn xautoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: StreamId,
        count: usize,
    ) -> Result<AutoClaimed> {
        self.execute(Command::XAutoClaim {
            key: key.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            min_idle_ms: millis(min_idle),
            start,
            count,
        })
        .await?
        .into_auto_claimed()
    }

    async fn xlen(&self, key: &str) -> Result<i64> {
        self.execute(Command::XLen { key: key.to_string() })
            .await?
            .into_int()
    }

    async fn xinfo_groups(&self, key: &str) -> Result<Vec<GroupInfo>> {
        self.execute(Command::XInfoGroups { key: key.to_string() })
            .await?
            .into_groups()
    }
}

impl<S: CoordinationStore + ?Sized> StoreExt for S {}
