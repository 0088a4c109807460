//! Fixed-window rate limiting over store counters
//!
//! Each subject gets one counter per window, keyed `{subject}:{window_index}`
//! with `window_index = unix_millis / window_millis`. Every increment
//! refreshes the counter's expiry in the same transaction, so a counter is
//! never left without one. A burst of up to twice the limit is
//! possible across a window boundary.

use crate::config::RateLimitSettings;
use crate::keys;
use crate::metrics;
use crate::store::SharedStore;
use crate::{MeshError, Result};
use meshstore::Command;
use serde::Serialize;
use std::time::Duration;

/// Outcome of one rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests counted in this window, including this one
    pub count: i64,
    pub limit: u32,
    #[serde(skip)]
    pub window: Duration,
    /// Time until the current window ends
    #[serde(skip)]
    pub retry_after: Duration,
}

impl RateLimitDecision {
    pub fn remaining(&self) -> u32 {
        let used = u32::try_from(self.count.max(0)).unwrap_or(u32::MAX);
        self.limit.saturating_sub(used)
    }
}

fn unix_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    claude: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: SharedStore, claude: RateLimitSettings) -> Self {
        Self { store, claude }
    }

    /// Count one request for `subject` against `max_requests` per `window`
    pub async fn check(
        &self,
        subject: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateLimitDecision> {
        self.check_at(subject, max_requests, window, unix_millis())
            .await
    }

    /// [`check`](Self::check) with an explicit clock reading
    pub async fn check_at(
        &self,
        subject: &str,
        max_requests: u32,
        window: Duration,
        now_ms: u64,
    ) -> Result<RateLimitDecision> {
        let width = window_millis(window);
        let index = now_ms / width;
        let key = format!("{}:{}", subject, index);

        let mut replies = self
            .store
            .transaction(vec![
                Command::Incr { key: key.clone() },
                Command::Expire {
                    key,
                    ttl_ms: width,
                },
            ])
            .await?
            .into_iter();
        let count = replies
            .next()
            .ok_or_else(|| MeshError::Other("empty rate limit reply".into()))?
            .into_int()?;
        for reply in replies {
            reply.into_result()?;
        }

        let allowed = count <= i64::from(max_requests);
        let retry_after = Duration::from_millis((index + 1) * width - now_ms);
        if !allowed {
            metrics::record_rate_limit_rejection(subject.split(':').nth(1).unwrap_or(subject));
            tracing::debug!(subject, count, limit = max_requests, "Rate limit exceeded");
        }
        Ok(RateLimitDecision {
            allowed,
            count,
            limit: max_requests,
            window,
            retry_after,
        })
    }

    /// Per-agent limit on model API calls
    pub async fn check_claude(&self, agent_id: &str) -> Result<RateLimitDecision> {
        self.check(
            &keys::claude_rate_limit(agent_id),
            self.claude.max_requests,
            self.claude.window,
        )
        .await
    }
}
