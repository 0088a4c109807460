//! In-process coordination store
//!
//! All commands are serialised through one async mutex, which gives every
//! command (and every transaction) the same atomicity a networked store
//! offers. Expiry is lazy and measured on `tokio::time::Instant`, so tests can
//! pause and advance time.

use crate::command::{Command, Reply};
use crate::error::{Result, StoreError};
use crate::stream::{
    AutoClaimed, GroupInfo, GroupStart, PendingEntry, ReadCursor, StreamEntry, StreamId,
};
use crate::{CoordinationStore, Subscription};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

/// In-memory [`CoordinationStore`]
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    appended: Notify,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Slot>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

enum Value {
    Str(String),
    List(VecDeque<String>),
    Stream(Stream),
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<StreamId, BTreeMap<String, String>>,
    last_id: StreamId,
    groups: BTreeMap<String, Group>,
}

struct Group {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, Delivery>,
    consumers: BTreeSet<String>,
}

struct Delivery {
    consumer: String,
    delivered_at: Instant,
    count: u64,
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn idle_ms(delivery: &Delivery, now: Instant) -> u64 {
    let idle = now.saturating_duration_since(delivery.delivered_at);
    u64::try_from(idle.as_millis()).unwrap_or(u64::MAX)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Resolve Redis-style inclusive `start..=stop` (negative counts from the end)
fn list_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = to_i64(len);
    let norm = |i: i64| if i < 0 { len + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl State {
    /// Drop the key if its TTL has passed
    fn purge(&mut self, key: &str, now: Instant) {
        let expired = self
            .keys
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.keys.remove(key);
        }
    }

    fn string(&mut self, key: &str, now: Instant) -> Result<Option<&mut String>> {
        self.purge(key, now);
        match self.keys.get_mut(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list(&mut self, key: &str, now: Instant, create: bool) -> Result<Option<&mut VecDeque<String>>> {
        self.purge(key, now);
        if create && !self.keys.contains_key(key) {
            self.keys
                .insert(key.to_string(), Slot::new(Value::List(VecDeque::new())));
        }
        match self.keys.get_mut(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn stream(&mut self, key: &str, now: Instant, create: bool) -> Result<Option<&mut Stream>> {
        self.purge(key, now);
        if create && !self.keys.contains_key(key) {
            self.keys
                .insert(key.to_string(), Slot::new(Value::Stream(Stream::default())));
        }
        match self.keys.get_mut(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Stream(stream),
                ..
            }) => Ok(Some(stream)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn group(&mut self, key: &str, group: &str, now: Instant) -> Result<&mut Group> {
        let no_group = || StoreError::NoGroup {
            stream: key.to_string(),
            group: group.to_string(),
        };
        let stream = self.stream(key, now, false)?.ok_or_else(no_group)?;
        stream.groups.get_mut(group).ok_or_else(no_group)
    }

    /// Lists disappear once empty
    fn drop_empty_list(&mut self, key: &str) {
        let empty = matches!(
            self.keys.get(key),
            Some(Slot { value: Value::List(list), .. }) if list.is_empty()
        );
        if empty {
            self.keys.remove(key);
        }
    }

    fn rpoplpush(&mut self, source: &str, destination: &str, now: Instant) -> Result<Option<String>> {
        // Type-check the destination before mutating the source
        self.list(destination, now, false)?;
        let Some(item) = self.list(source, now, false)?.and_then(|l| l.pop_back()) else {
            return Ok(None);
        };
        self.drop_empty_list(source);
        if let Some(dest) = self.list(destination, now, true)? {
            dest.push_front(item.clone());
        }
        Ok(Some(item))
    }

    fn apply(&mut self, command: Command, now: Instant) -> Result<Reply> {
        match command {
            Command::Get { key } => Ok(match self.string(&key, now)? {
                Some(s) => Reply::Str(s.clone()),
                None => Reply::Nil,
            }),
            Command::SetEx { key, value, ttl_ms } => {
                let mut slot = Slot::new(Value::Str(value));
                slot.expires_at = Some(now + Duration::from_millis(ttl_ms));
                self.keys.insert(key, slot);
                Ok(Reply::Bool(true))
            }
            Command::SetNxEx { key, value, ttl_ms } => {
                self.purge(&key, now);
                if self.keys.contains_key(&key) {
                    return Ok(Reply::Bool(false));
                }
                let mut slot = Slot::new(Value::Str(value));
                slot.expires_at = Some(now + Duration::from_millis(ttl_ms));
                self.keys.insert(key, slot);
                Ok(Reply::Bool(true))
            }
            Command::Del { key } => {
                self.purge(&key, now);
                Ok(Reply::Bool(self.keys.remove(&key).is_some()))
            }
            Command::DelIfEq { key, value } => {
                let matches = self.string(&key, now)?.is_some_and(|s| *s == value);
                if matches {
                    self.keys.remove(&key);
                }
                Ok(Reply::Bool(matches))
            }
            Command::Incr { key } => {
                let next = match self.string(&key, now)? {
                    Some(s) => {
                        let n: i64 = s
                            .parse()
                            .map_err(|_| StoreError::NotInteger(key.clone()))?;
                        let n = n
                            .checked_add(1)
                            .ok_or_else(|| StoreError::NotInteger(key.clone()))?;
                        *s = n.to_string();
                        n
                    }
                    None => {
                        self.keys
                            .insert(key, Slot::new(Value::Str("1".to_string())));
                        1
                    }
                };
                Ok(Reply::Int(next))
            }
            Command::Expire { key, ttl_ms } => {
                self.purge(&key, now);
                Ok(Reply::Bool(match self.keys.get_mut(&key) {
                    Some(slot) => {
                        slot.expires_at = Some(now + Duration::from_millis(ttl_ms));
                        true
                    }
                    None => false,
                }))
            }
            Command::Ttl { key } => {
                self.purge(&key, now);
                Ok(Reply::Int(match self.keys.get(&key) {
                    None => -2,
                    Some(Slot { expires_at: None, .. }) => -1,
                    Some(Slot {
                        expires_at: Some(at),
                        ..
                    }) => {
                        let left = at.saturating_duration_since(now).as_millis();
                        i64::try_from(left).unwrap_or(i64::MAX)
                    }
                }))
            }
            Command::LPush { key, values } => {
                let list = self
                    .list(&key, now, true)?
                    .ok_or_else(|| StoreError::WrongType(key.clone()))?;
                for value in values {
                    list.push_front(value);
                }
                Ok(Reply::Int(to_i64(list.len())))
            }
            Command::RPop { key } => {
                let item = self.list(&key, now, false)?.and_then(|l| l.pop_back());
                self.drop_empty_list(&key);
                Ok(item.map_or(Reply::Nil, Reply::Str))
            }
            Command::RPopLPush {
                source,
                destination,
            } => Ok(self
                .rpoplpush(&source, &destination, now)?
                .map_or(Reply::Nil, Reply::Str)),
            Command::LRem { key, count, value } => {
                let Some(list) = self.list(&key, now, false)? else {
                    return Ok(Reply::Int(0));
                };
                let limit = if count == 0 {
                    usize::MAX
                } else {
                    usize::try_from(count.unsigned_abs()).unwrap_or(usize::MAX)
                };
                let mut removed = 0usize;
                if count >= 0 {
                    let mut i = 0;
                    while i < list.len() && removed < limit {
                        if list[i] == value {
                            list.remove(i);
                            removed += 1;
                        } else {
                            i += 1;
                        }
                    }
                } else {
                    let mut i = list.len();
                    while i > 0 && removed < limit {
                        i -= 1;
                        if list[i] == value {
                            list.remove(i);
                            removed += 1;
                        }
                    }
                }
                self.drop_empty_list(&key);
                Ok(Reply::Int(to_i64(removed)))
            }
            Command::LLen { key } => Ok(Reply::Int(
                self.list(&key, now, false)?.map_or(0, |l| to_i64(l.len())),
            )),
            Command::LRange { key, start, stop } => {
                let items = match self.list(&key, now, false)? {
                    Some(list) => match list_range(list.len(), start, stop) {
                        Some((from, to)) => list.range(from..=to).cloned().collect(),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                };
                Ok(Reply::List(items))
            }
            Command::DrainList {
                source,
                destination,
            } => {
                if source == destination {
                    return Ok(Reply::Int(0));
                }
                let mut moved = 0i64;
                while self.rpoplpush(&source, &destination, now)?.is_some() {
                    moved += 1;
                }
                Ok(Reply::Int(moved))
            }
            Command::Publish { channel, message } => {
                let mut delivered = 0i64;
                if let Some(subscribers) = self.channels.get_mut(&channel) {
                    subscribers.retain(|tx| tx.send(message.clone()).is_ok());
                    delivered = to_i64(subscribers.len());
                    if subscribers.is_empty() {
                        self.channels.remove(&channel);
                    }
                }
                Ok(Reply::Int(delivered))
            }
            Command::XAdd {
                key,
                fields,
                max_len,
            } => {
                let stream = self
                    .stream(&key, now, true)?
                    .ok_or_else(|| StoreError::WrongType(key.clone()))?;
                let id = StreamId::next_after(stream.last_id, wall_clock_ms());
                stream.entries.insert(id, fields);
                stream.last_id = id;
                if let Some(max) = max_len {
                    let batch = (max / 10).max(1);
                    let len = stream.entries.len();
                    if len > max && len - max >= batch {
                        while stream.entries.len() > max {
                            stream.entries.pop_first();
                        }
                    }
                }
                Ok(Reply::Id(id))
            }
            Command::XGroupCreate {
                key,
                group,
                start,
                mkstream,
            } => {
                let stream = self.stream(&key, now, mkstream)?.ok_or_else(|| {
                    StoreError::InvalidArgument(format!(
                        "stream '{}' does not exist (use mkstream)",
                        key
                    ))
                })?;
                if stream.groups.contains_key(&group) {
                    return Err(StoreError::BusyGroup { stream: key, group });
                }
                let last_delivered = match start {
                    GroupStart::NewOnly => stream.last_id,
                    GroupStart::Beginning => StreamId::ZERO,
                    GroupStart::After(id) => id,
                };
                stream.groups.insert(
                    group,
                    Group {
                        last_delivered,
                        pending: BTreeMap::new(),
                        consumers: BTreeSet::new(),
                    },
                );
                Ok(Reply::Bool(true))
            }
            Command::XReadGroup {
                key,
                group,
                consumer,
                cursor,
                count,
                ..
            } => {
                let no_group = || StoreError::NoGroup {
                    stream: key.clone(),
                    group: group.clone(),
                };
                let stream = self.stream(&key, now, false)?.ok_or_else(no_group)?;
                let Stream {
                    entries, groups, ..
                } = stream;
                let g = groups.get_mut(&group).ok_or_else(no_group)?;
                g.consumers.insert(consumer.clone());
                let count = count.max(1);
                let mut out = Vec::new();
                match cursor {
                    ReadCursor::New => {
                        let fresh: Vec<StreamId> = entries
                            .range(g.last_delivered.successor()..)
                            .take(count)
                            .map(|(id, _)| *id)
                            .collect();
                        for id in fresh {
                            g.pending.insert(
                                id,
                                Delivery {
                                    consumer: consumer.clone(),
                                    delivered_at: now,
                                    count: 1,
                                },
                            );
                            g.last_delivered = id;
                            if let Some(fields) = entries.get(&id) {
                                out.push(StreamEntry {
                                    id,
                                    fields: fields.clone(),
                                });
                            }
                        }
                    }
                    ReadCursor::OwnPending => {
                        for (id, delivery) in g.pending.iter_mut() {
                            if out.len() >= count {
                                break;
                            }
                            if delivery.consumer != consumer {
                                continue;
                            }
                            if let Some(fields) = entries.get(id) {
                                delivery.delivered_at = now;
                                delivery.count += 1;
                                out.push(StreamEntry {
                                    id: *id,
                                    fields: fields.clone(),
                                });
                            }
                        }
                    }
                }
                Ok(Reply::Entries(out))
            }
            Command::XAck { key, group, ids } => {
                let acked = match self.group(&key, &group, now) {
                    Ok(g) => ids.iter().filter(|id| g.pending.remove(id).is_some()).count(),
                    Err(StoreError::NoGroup { .. }) => 0,
                    Err(e) => return Err(e),
                };
                Ok(Reply::Int(to_i64(acked)))
            }
            Command::XPending {
                key,
                group,
                count,
                min_idle_ms,
                consumer,
            } => {
                let g = self.group(&key, &group, now)?;
                let pending = g
                    .pending
                    .iter()
                    .filter(|(_, d)| consumer.as_ref().map_or(true, |c| *c == d.consumer))
                    .map(|(id, d)| PendingEntry {
                        id: *id,
                        consumer: d.consumer.clone(),
                        idle_ms: idle_ms(d, now),
                        delivery_count: d.count,
                    })
                    .filter(|p| min_idle_ms.map_or(true, |min| p.idle_ms >= min))
                    .take(count)
                    .collect();
                Ok(Reply::Pending(pending))
            }
            Command::XClaim {
                key,
                group,
                consumer,
                min_idle_ms,
                ids,
            } => {
                let no_group = || StoreError::NoGroup {
                    stream: key.clone(),
                    group: group.clone(),
                };
                let stream = self.stream(&key, now, false)?.ok_or_else(no_group)?;
                let Stream {
                    entries, groups, ..
                } = stream;
                let g = groups.get_mut(&group).ok_or_else(no_group)?;
                g.consumers.insert(consumer.clone());
                let mut out = Vec::new();
                for id in ids {
                    let claimable = g
                        .pending
                        .get(&id)
                        .is_some_and(|d| idle_ms(d, now) >= min_idle_ms);
                    if !claimable {
                        continue;
                    }
                    match entries.get(&id) {
                        Some(fields) => {
                            if let Some(d) = g.pending.get_mut(&id) {
                                d.consumer = consumer.clone();
                                d.delivered_at = now;
                                d.count += 1;
                            }
                            out.push(StreamEntry {
                                id,
                                fields: fields.clone(),
                            });
                        }
                        None => {
                            g.pending.remove(&id);
                        }
                    }
                }
                Ok(Reply::Entries(out))
            }
            Command::XAutoClaim {
                key,
                group,
                consumer,
                min_idle_ms,
                start,
                count,
            } => {
                let no_group = || StoreError::NoGroup {
                    stream: key.clone(),
                    group: group.clone(),
                };
                let stream = self.stream(&key, now, false)?.ok_or_else(no_group)?;
                let Stream {
                    entries, groups, ..
                } = stream;
                let g = groups.get_mut(&group).ok_or_else(no_group)?;
                g.consumers.insert(consumer.clone());
                let count = count.max(1);
                let mut claimed = AutoClaimed::default();
                let mut scanned = 0usize;
                let candidates: Vec<StreamId> = g.pending.range(start..).map(|(id, _)| *id).collect();
                let mut next = StreamId::ZERO;
                for id in candidates {
                    if scanned >= count {
                        next = id;
                        break;
                    }
                    let idle_enough = g
                        .pending
                        .get(&id)
                        .is_some_and(|d| idle_ms(d, now) >= min_idle_ms);
                    if !idle_enough {
                        continue;
                    }
                    scanned += 1;
                    match entries.get(&id) {
                        Some(fields) => {
                            if let Some(d) = g.pending.get_mut(&id) {
                                d.consumer = consumer.clone();
                                d.delivered_at = now;
                                d.count += 1;
                            }
                            claimed.entries.push(StreamEntry {
                                id,
                                fields: fields.clone(),
                            });
                        }
                        None => {
                            g.pending.remove(&id);
                            claimed.deleted.push(id);
                        }
                    }
                }
                claimed.next = next;
                Ok(Reply::AutoClaimed(claimed))
            }
            Command::XLen { key } => Ok(Reply::Int(
                self.stream(&key, now, false)?
                    .map_or(0, |s| to_i64(s.entries.len())),
            )),
            Command::XInfoGroups { key } => {
                let groups = match self.stream(&key, now, false)? {
                    Some(stream) => stream
                        .groups
                        .iter()
                        .map(|(name, g)| GroupInfo {
                            name: name.clone(),
                            consumers: g.consumers.len(),
                            pending: g.pending.len(),
                            last_delivered_id: g.last_delivered,
                        })
                        .collect(),
                    None => Vec::new(),
                };
                Ok(Reply::Groups(groups))
            }
        }
    }
}

fn is_append(command: &Command) -> bool {
    matches!(command, Command::XAdd { .. })
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (expired keys still awaiting lazy purge included)
    pub async fn key_count(&self) -> usize {
        self.state.lock().await.keys.len()
    }

    /// Group read that waits (bounded) for new entries
    async fn blocking_read(&self, command: Command, block: Duration) -> Result<Reply> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            // Register interest before checking, so an append between the
            // check and the wait is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let reply = state.apply(command.clone(), Instant::now())?;
                if !matches!(&reply, Reply::Entries(entries) if entries.is_empty()) {
                    return Ok(reply);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Reply::Entries(Vec::new()));
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn execute(&self, command: Command) -> Result<Reply> {
        if let Some(ms) = command.block_ms() {
            return self.blocking_read(command, Duration::from_millis(ms)).await;
        }
        let append = is_append(&command);
        let reply = self.state.lock().await.apply(command, Instant::now());
        if append && reply.is_ok() {
            self.appended.notify_waiters();
        }
        reply
    }

    async fn transaction(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        let append = commands.iter().any(is_append);
        let replies = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            commands
                .into_iter()
                .map(|command| state.apply(command, now).unwrap_or_else(Reply::Error))
                .collect()
        };
        if append {
            self.appended.notify_waiters();
        }
        Ok(replies)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx))
    }
}
