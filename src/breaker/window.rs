//! Rolling outcome counts over a bucketed time window

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// What happened to one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    Rejection,
    Fallback,
}

/// Outcome totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub fallbacks: u64,
}

impl Counts {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure => self.failures += 1,
            Outcome::Timeout => self.timeouts += 1,
            Outcome::Rejection => self.rejections += 1,
            Outcome::Fallback => self.fallbacks += 1,
        }
    }

    fn merge(&mut self, other: &Counts) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.rejections += other.rejections;
        self.fallbacks += other.fallbacks;
    }

    /// Calls that actually reached the dependency
    pub fn executed(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    /// Failures and timeouts as a percentage of executed calls
    pub fn error_percentage(&self) -> u64 {
        match self.executed() {
            0 => 0,
            total => (self.failures + self.timeouts) * 100 / total,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    start: Instant,
    counts: Counts,
}

/// `buckets` buckets of `window / buckets` each; the oldest falls off as
/// time moves on
#[derive(Debug)]
pub struct RollingWindow {
    width: Duration,
    capacity: usize,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    pub fn new(window: Duration, buckets: u32) -> Self {
        let buckets = buckets.max(1);
        let width = (window / buckets).max(Duration::from_millis(1));
        Self {
            width,
            capacity: buckets as usize,
            buckets: VecDeque::with_capacity(buckets as usize),
        }
    }

    fn expire(&mut self, now: Instant) {
        let span = self.width * self.capacity as u32;
        while let Some(front) = self.buckets.front() {
            if now.saturating_duration_since(front.start) >= span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record(&mut self, outcome: Outcome, now: Instant) {
        self.expire(now);
        let start = match self.buckets.back() {
            Some(last) if now.saturating_duration_since(last.start) < self.width => None,
            // Align bucket starts to the previous bucket so widths stay fixed
            Some(last) => {
                let elapsed = now.saturating_duration_since(last.start);
                let steps = (elapsed.as_nanos() / self.width.as_nanos()) as u32;
                Some(last.start + self.width * steps)
            }
            None => Some(now),
        };
        if let Some(start) = start {
            self.buckets.push_back(Bucket {
                start,
                counts: Counts::default(),
            });
            if self.buckets.len() > self.capacity {
                self.buckets.pop_front();
            }
        }
        if let Some(current) = self.buckets.back_mut() {
            current.counts.add(outcome);
        }
    }

    pub fn totals(&mut self, now: Instant) -> Counts {
        self.expire(now);
        let mut totals = Counts::default();
        for bucket in &self.buckets {
            totals.merge(&bucket.counts);
        }
        totals
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_percentage() {
        let counts = Counts {
            successes: 1,
            failures: 1,
            timeouts: 1,
            rejections: 10,
            fallbacks: 0,
        };
        assert_eq!(counts.executed(), 3);
        assert_eq!(counts.error_percentage(), 66);
        assert_eq!(Counts::default().error_percentage(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_buckets_roll_off() {
        let mut window = RollingWindow::new(Duration::from_secs(10), 10);
        let start = Instant::now();

        window.record(Outcome::Failure, start);
        window.record(Outcome::Failure, start + Duration::from_millis(500));
        window.record(Outcome::Success, start + Duration::from_secs(5));
        assert_eq!(window.totals(start + Duration::from_secs(5)).failures, 2);

        let later = start + Duration::from_millis(10_500);
        let totals = window.totals(later);
        assert_eq!(totals.failures, 0);
        assert_eq!(totals.successes, 1);

        assert_eq!(window.totals(start + Duration::from_secs(16)).executed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear() {
        let mut window = RollingWindow::new(Duration::from_secs(1), 4);
        let now = Instant::now();
        window.record(Outcome::Timeout, now);
        window.clear();
        assert_eq!(window.totals(now), Counts::default());
    }
}
