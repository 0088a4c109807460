//! Store command protocol
//!
//! Every store operation is a [`Command`] answered by a [`Reply`]. Both are
//! serializable so the same protocol runs in-process and over HTTP.

use crate::error::{Result, StoreError};
use crate::stream::{AutoClaimed, GroupInfo, GroupStart, PendingEntry, ReadCursor, StreamEntry, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single store command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Get {
        key: String,
    },
    SetEx {
        key: String,
        value: String,
        ttl_ms: u64,
    },
    /// Set only if the key is absent
    SetNxEx {
        key: String,
        value: String,
        ttl_ms: u64,
    },
    Del {
        key: String,
    },
    /// Delete only if the key holds exactly `value`
    DelIfEq {
        key: String,
        value: String,
    },
    Incr {
        key: String,
    },
    Expire {
        key: String,
        ttl_ms: u64,
    },
    /// Remaining time to live in ms; -1 without expiry, -2 when missing
    Ttl {
        key: String,
    },
    LPush {
        key: String,
        values: Vec<String>,
    },
    RPop {
        key: String,
    },
    RPopLPush {
        source: String,
        destination: String,
    },
    /// Remove occurrences of `value`: `count > 0` from the head, `< 0` from
    /// the tail, `0` all
    LRem {
        key: String,
        count: i64,
        value: String,
    },
    LLen {
        key: String,
    },
    LRange {
        key: String,
        start: i64,
        stop: i64,
    },
    /// Repeat `RPopLPush(source, destination)` until `source` is empty
    DrainList {
        source: String,
        destination: String,
    },
    Publish {
        channel: String,
        message: String,
    },
    XAdd {
        key: String,
        fields: BTreeMap<String, String>,
        /// Approximate `MAXLEN ~` bound
        max_len: Option<usize>,
    },
    XGroupCreate {
        key: String,
        group: String,
        start: GroupStart,
        mkstream: bool,
    },
    XReadGroup {
        key: String,
        group: String,
        consumer: String,
        cursor: ReadCursor,
        count: usize,
        /// Bounded wait for new entries; ignored inside transactions
        block_ms: Option<u64>,
    },
    XAck {
        key: String,
        group: String,
        ids: Vec<StreamId>,
    },
    XPending {
        key: String,
        group: String,
        count: usize,
        min_idle_ms: Option<u64>,
        consumer: Option<String>,
    },
    XClaim {
        key: String,
        group: String,
        consumer: String,
        min_idle_ms: u64,
        ids: Vec<StreamId>,
    },
    XAutoClaim {
        key: String,
        group: String,
        consumer: String,
        min_idle_ms: u64,
        start: StreamId,
        count: usize,
    },
    XLen {
        key: String,
    },
    XInfoGroups {
        key: String,
    },
}

impl Command {
    /// Command name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "get",
            Command::SetEx { .. } => "set_ex",
            Command::SetNxEx { .. } => "set_nx_ex",
            Command::Del { .. } => "del",
            Command::DelIfEq { .. } => "del_if_eq",
            Command::Incr { .. } => "incr",
            Command::Expire { .. } => "expire",
            Command::Ttl { .. } => "ttl",
            Command::LPush { .. } => "lpush",
            Command::RPop { .. } => "rpop",
            Command::RPopLPush { .. } => "rpoplpush",
            Command::LRem { .. } => "lrem",
            Command::LLen { .. } => "llen",
            Command::LRange { .. } => "lrange",
            Command::DrainList { .. } => "drain_list",
            Command::Publish { .. } => "publish",
            Command::XAdd { .. } => "xadd",
            Command::XGroupCreate { .. } => "xgroup_create",
            Command::XReadGroup { .. } => "xreadgroup",
            Command::XAck { .. } => "xack",
            Command::XPending { .. } => "xpending",
            Command::XClaim { .. } => "xclaim",
            Command::XAutoClaim { .. } => "xautoclaim",
            Command::XLen { .. } => "xlen",
            Command::XInfoGroups { .. } => "xinfo_groups",
        }
    }

    /// Bounded block duration, if this is a blocking group read
    pub fn block_ms(&self) -> Option<u64> {
        match self {
            Command::XReadGroup {
                block_ms: Some(ms),
                cursor: ReadCursor::New,
                ..
            } if *ms > 0 => Some(*ms),
            _ => None,
        }
    }
}

/// Reply to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
    Id(StreamId),
    Entries(Vec<StreamEntry>),
    Pending(Vec<PendingEntry>),
    AutoClaimed(AutoClaimed),
    Groups(Vec<GroupInfo>),
    /// A command inside a transaction failed; the others still applied
    Error(StoreError),
}

fn unexpected(expected: &str, got: &Reply) -> StoreError {
    StoreError::UnexpectedReply(format!("expected {}, got {:?}", expected, got))
}

impl Reply {
    /// Turn an in-transaction error reply back into an `Err`
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error(e) => Err(e),
            other => Ok(other),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self.into_result()? {
            Reply::Bool(b) => Ok(b),
            other => Err(unexpected("bool", &other)),
        }
    }

    pub fn into_int(self) -> Result<i64> {
        match self.into_result()? {
            Reply::Int(n) => Ok(n),
            other => Err(unexpected("int", &other)),
        }
    }

    pub fn into_opt_string(self) -> Result<Option<String>> {
        match self.into_result()? {
            Reply::Str(s) => Ok(Some(s)),
            Reply::Nil => Ok(None),
            other => Err(unexpected("string or nil", &other)),
        }
    }

    pub fn into_list(self) -> Result<Vec<String>> {
        match self.into_result()? {
            Reply::List(items) => Ok(items),
            other => Err(unexpected("list", &other)),
        }
    }

    pub fn into_id(self) -> Result<StreamId> {
        match self.into_result()? {
            Reply::Id(id) => Ok(id),
            other => Err(unexpected("stream id", &other)),
        }
    }

    pub fn into_entries(self) -> Result<Vec<StreamEntry>> {
        match self.into_result()? {
            Reply::Entries(entries) => Ok(entries),
            other => Err(unexpected("entries", &other)),
        }
    }

    pub fn into_pending(self) -> Result<Vec<PendingEntry>> {
        match self.into_result()? {
            Reply::Pending(pending) => Ok(pending),
            other => Err(unexpected("pending entries", &other)),
        }
    }

    pub fn into_auto_claimed(self) -> Result<AutoClaimed> {
        match self.into_result()? {
            Reply::AutoClaimed(claimed) => Ok(claimed),
            other => Err(unexpected("auto-claim result", &other)),
        }
    }

    pub fn into_groups(self) -> Result<Vec<GroupInfo>> {
        match self.into_result()? {
            Reply::Groups(groups) => Ok(groups),
            other => Err(unexpected("group info", &other)),
        }
    }
}
