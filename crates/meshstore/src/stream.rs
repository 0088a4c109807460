//! Stream types: ids, entries, consumer-group bookkeeping

use crate::error::StoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Stream entry id, `<millis>-<sequence>`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The smallest id (`0-0`)
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The id immediately after this one
    pub fn successor(&self) -> Self {
        if self.seq == u64::MAX {
            Self::new(self.ms + 1, 0)
        } else {
            Self::new(self.ms, self.seq + 1)
        }
    }

    /// Next auto-assigned id given the last id in the stream and the current time
    pub fn next_after(last: StreamId, now_ms: u64) -> Self {
        if now_ms > last.ms {
            Self::new(now_ms, 0)
        } else {
            last.successor()
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidStreamId(s.to_string());
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self::new(
                ms.parse().map_err(|_| invalid())?,
                seq.parse().map_err(|_| invalid())?,
            )),
            None => Ok(Self::new(s.parse().map_err(|_| invalid())?, 0)),
        }
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One entry of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: BTreeMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Where a newly created consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "at", content = "id", rename_all = "snake_case")]
pub enum GroupStart {
    /// Only entries appended after creation (`$`)
    #[default]
    NewOnly,
    /// Every entry still in the stream (`0`)
    Beginning,
    /// After a specific id
    After(StreamId),
}

/// What a group read returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadCursor {
    /// Entries never delivered to any member of the group (`>`)
    #[default]
    New,
    /// This consumer's delivered-but-unacknowledged entries (`0`)
    OwnPending,
}

/// A delivered-but-unacknowledged entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: StreamId,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

impl PendingEntry {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

/// Consumer group summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub pending: usize,
    pub last_delivered_id: StreamId,
}

/// Result of an automatic claim scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoClaimed {
    /// Cursor for the next scan; `0-0` once the pending list was scanned to the end
    pub next: StreamId,
    pub entries: Vec<StreamEntry>,
    /// Pending ids whose entries had already been trimmed from the stream
    pub deleted: Vec<StreamId>,
}
