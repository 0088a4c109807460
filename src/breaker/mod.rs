//! Circuit breaker
//!
//! Wraps any async operation. `closed` admits every call and watches the
//! rolling error rate; crossing the threshold (once enough calls were seen)
//! opens the breaker, which then rejects calls without running them. After
//! `reset_timeout` the next call is admitted as the single half-open probe:
//! success closes the breaker, failure reopens it. Every call carries its own
//! timeout, and a timeout counts as a failure.
//!
//! Breakers are in-process and never persisted.

mod registry;
mod window;

pub use registry::BreakerRegistry;
pub use window::{Counts, Outcome};

use crate::config::duration_ms;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use window::RollingWindow;

/// Per-dependency breaker tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Per-call timeout
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,

    /// Error percentage at or above which the breaker opens
    pub error_threshold_percentage: u32,

    /// Time spent open before a probe is allowed
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,

    /// Span of the rolling statistics window
    #[serde(rename = "rolling_window_ms", with = "duration_ms")]
    pub rolling_window: Duration,

    /// Number of buckets the window is divided into
    pub rolling_buckets: u32,

    /// Minimum executed calls in the window before the breaker may open
    pub volume_threshold: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            volume_threshold: 5,
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn level(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Manual override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedState {
    Open,
    Closed,
}

/// Why a breaker-wrapped call did not produce a value
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// Rejected without running the operation
    #[error("circuit '{0}' is open")]
    Open(String),

    /// The operation did not finish within the per-call timeout
    #[error("call through circuit '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// The operation ran and failed
    #[error("{0}")]
    Failed(E),
}

impl<E> BreakerError<E> {
    /// The dependency's own error, if it ran and failed
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub forced: Option<ForcedState>,
    pub counts: Counts,
    pub error_percentage: u64,
    pub config: BreakerConfig,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    forced: Option<ForcedState>,
    window: RollingWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
    Rejected,
}

/// A named circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Puts an abandoned probe back so the next call can probe again
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            inner.probe_in_flight = false;
            tracing::debug!(breaker = %self.breaker.name, "Probe cancelled, staying half-open");
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        metrics::set_breaker_state(&name, BreakerState::Closed.level());
        Self {
            name,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                opened_at: None,
                probe_in_flight: false,
                forced: None,
                window: RollingWindow::new(config.rolling_window, config.rolling_buckets),
            }),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        if inner.state == to {
            return;
        }
        tracing::info!(breaker = %self.name, from = %inner.state, to = %to, "Circuit breaker transition");
        inner.state = to;
        match to {
            BreakerState::Open => inner.opened_at = Some(now),
            BreakerState::Closed => {
                inner.opened_at = None;
                inner.window.clear();
            }
            BreakerState::HalfOpen => {}
        }
        inner.probe_in_flight = false;
        metrics::set_breaker_state(&self.name, to.level());
    }

    /// Current state, applying the open -> half-open timeout
    pub fn state(&self) -> BreakerState {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.forced.is_none() {
            self.refresh(&mut inner, now);
        }
        inner.state
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            if elapsed >= self.config.reset_timeout {
                self.transition(inner, BreakerState::HalfOpen, now);
            }
        }
    }

    fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.lock();
        let admission = match inner.forced {
            Some(ForcedState::Open) => Admission::Rejected,
            Some(ForcedState::Closed) => Admission::Normal,
            None => {
                self.refresh(&mut inner, now);
                match inner.state {
                    BreakerState::Closed => Admission::Normal,
                    BreakerState::Open => Admission::Rejected,
                    BreakerState::HalfOpen if inner.probe_in_flight => Admission::Rejected,
                    BreakerState::HalfOpen => {
                        inner.probe_in_flight = true;
                        Admission::Probe
                    }
                }
            }
        };
        if admission == Admission::Rejected {
            inner.window.record(Outcome::Rejection, now);
        }
        admission
    }

    fn complete(&self, admission: Admission, outcome: Outcome) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.window.record(outcome, now);

        let ok = outcome == Outcome::Success;
        if admission == Admission::Probe {
            let to = if ok { BreakerState::Closed } else { BreakerState::Open };
            self.transition(&mut inner, to, now);
            return;
        }

        // Calls admitted before a state change only count toward statistics
        if inner.forced.is_some() || inner.state != BreakerState::Closed {
            return;
        }
        let totals = inner.window.totals(now);
        if totals.executed() >= self.config.volume_threshold
            && totals.error_percentage() >= u64::from(self.config.error_threshold_percentage)
        {
            tracing::warn!(
                breaker = %self.name,
                executed = totals.executed(),
                error_percentage = totals.error_percentage(),
                "Error threshold crossed, opening circuit"
            );
            self.transition(&mut inner, BreakerState::Open, now);
        }
    }

    /// Run `op` through the breaker
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit();
        if admission == Admission::Rejected {
            metrics::record_breaker_call(&self.name, "rejected");
            return Err(BreakerError::Open(self.name.clone()));
        }

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };
        let result = tokio::time::timeout(self.config.timeout, op()).await;
        guard.disarm();

        match result {
            Ok(Ok(value)) => {
                self.complete(admission, Outcome::Success);
                metrics::record_breaker_call(&self.name, "success");
                Ok(value)
            }
            Ok(Err(e)) => {
                self.complete(admission, Outcome::Failure);
                metrics::record_breaker_call(&self.name, "failure");
                Err(BreakerError::Failed(e))
            }
            Err(_) => {
                self.complete(admission, Outcome::Timeout);
                metrics::record_breaker_call(&self.name, "timeout");
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    /// Run `op`; on any breaker error hand the error to `fallback` instead
    pub async fn call_with_fallback<F, Fut, FB, FutB, T, E>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(BreakerError<E>) -> FutB,
        FutB: Future<Output = Result<T, E>>,
    {
        match self.call(op).await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::debug!(breaker = %self.name, "Routing call to fallback");
                {
                    let now = Instant::now();
                    self.lock().window.record(Outcome::Fallback, now);
                }
                metrics::record_breaker_call(&self.name, "fallback");
                fallback(e).await.map_err(BreakerError::Failed)
            }
        }
    }

    /// Pin the breaker in a state until [`clear_override`](Self::clear_override)
    pub fn force(&self, forced: ForcedState) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.forced = Some(forced);
        let to = match forced {
            ForcedState::Open => BreakerState::Open,
            ForcedState::Closed => BreakerState::Closed,
        };
        self.transition(&mut inner, to, now);
        tracing::info!(breaker = %self.name, forced = ?forced, "Circuit breaker overridden");
    }

    /// Drop a manual override; the breaker resumes from its current state
    pub fn clear_override(&self) {
        let mut inner = self.lock();
        if inner.forced.take().is_some() {
            tracing::info!(breaker = %self.name, "Circuit breaker override cleared");
        }
    }

    /// Close the breaker and forget its statistics and any override
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.forced = None;
        self.transition(&mut inner, BreakerState::Closed, now);
        inner.window.clear();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.forced.is_none() {
            self.refresh(&mut inner, now);
        }
        let counts = inner.window.totals(now);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            forced: inner.forced,
            counts,
            error_percentage: counts.error_percentage(),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            timeout: Duration::from_secs(1),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            volume_threshold: 3,
        }
    }

    async fn ok(b: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        b.call(|| async { Ok::<_, String>(1) }).await
    }

    async fn fail(b: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        b.call(|| async { Err::<u32, _>("boom".to_string()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_volume_and_threshold() {
        let b = CircuitBreaker::new("svc", test_config());

        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        // Two calls are under the volume threshold
        assert_eq!(b.state(), BreakerState::Closed);

        assert_eq!(ok(&b).await, Ok(1));
        // 3 calls, 66% errors
        assert_eq!(b.state(), BreakerState::Open);

        let mut ran = false;
        let rejected = b
            .call(|| {
                ran = true;
                async { Ok::<u32, String>(2) }
            })
            .await;
        assert_eq!(rejected, Err(BreakerError::Open("svc".to_string())));
        assert!(!ran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let b = CircuitBreaker::new("svc", test_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        assert_eq!(ok(&b).await, Ok(1));
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().counts.executed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let b = CircuitBreaker::new("svc", test_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(matches!(fail(&b).await, Err(BreakerError::Failed(_))));
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(ok(&b).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_while_half_open() {
        let b = Arc::new(CircuitBreaker::new("svc", test_config()));
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = release_rx.await;
                    Ok::<u32, String>(7)
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        assert!(ok(&b).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap(), Ok(7));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_stays_half_open() {
        let b = CircuitBreaker::new("svc", test_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let pending = b.call(|| std::future::pending::<Result<u32, String>>());
        let cancelled = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(cancelled.is_err());

        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(ok(&b).await, Ok(1));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let b = CircuitBreaker::new("slow", test_config());
        for _ in 0..3 {
            let result = b
                .call(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<u32, String>(1)
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        }
        let snapshot = b.snapshot();
        assert_eq!(snapshot.counts.timeouts, 3);
        assert_eq!(snapshot.state, BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_on_open() {
        let b = CircuitBreaker::new("svc", test_config());
        b.force(ForcedState::Open);

        let result = b
            .call_with_fallback(
                || async { Ok::<&str, String>("live") },
                |e| async move {
                    assert!(e.is_open());
                    Ok("cached")
                },
            )
            .await;
        assert_eq!(result, Ok("cached"));

        let snapshot = b.snapshot();
        assert_eq!(snapshot.counts.rejections, 1);
        assert_eq!(snapshot.counts.fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_states_persist() {
        let b = CircuitBreaker::new("svc", test_config());
        b.force(ForcedState::Open);
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(b.state(), BreakerState::Open);
        assert!(ok(&b).await.unwrap_err().is_open());

        b.force(ForcedState::Closed);
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Closed);

        b.clear_override();
        assert_eq!(b.snapshot().forced, None);
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }
}
