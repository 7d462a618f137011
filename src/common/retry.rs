//! Polling policy and wall clock
//!
//! Every wait loop in fleetsync (lock acquisition, binary rendezvous, upgrade
//! barriers) is driven by a [`RetryPolicy`]. Deadlines are measured with
//! `tokio::time::Instant`, so a paused tokio runtime acts as a fake clock in
//! tests. Wall-clock timestamps that get persisted (lock age, markers, store
//! values) come from an injected [`Clock`].

use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Source of wall-clock time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::days(36_500));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Interval, growth, cap and jitter for a polling loop
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    interval: Duration,
    max_interval: Duration,
    multiplier: f64,
    jitter: Duration,
}

impl RetryPolicy {
    /// Fixed-interval policy
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval.max(self.interval);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delay before the given retry (0-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let secs = self.interval.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before the given retry, with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }

    /// Start a polling loop; `None` polls forever
    pub fn poller(&self, timeout: Option<Duration>) -> Poller {
        let started = Instant::now();
        Poller {
            policy: self.clone(),
            started,
            deadline: timeout.map(|t| started + t),
            attempt: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Map the "0 means forever" timeout convention to an optional deadline
pub fn timeout_or_forever(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

/// State of one polling loop
#[derive(Debug)]
pub struct Poller {
    policy: RetryPolicy,
    started: Instant,
    deadline: Option<Instant>,
    attempt: u32,
}

impl Poller {
    /// Sleep until the next check. Returns `false` once the deadline has passed.
    ///
    /// The last sleep is clipped to the deadline so a final check always runs
    /// right at the deadline.
    pub async fn wait(&mut self) -> bool {
        let mut delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            delay = delay.min(deadline - now);
        }

        tokio::time::sleep(delay).await;
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::new(Duration::from_secs(1));
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_policy_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_max_interval(Duration::from_secs(10));
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay(4), Duration::from_secs(10));
        assert_eq!(policy.base_delay(60), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy =
            RetryPolicy::new(Duration::from_millis(100)).with_jitter(Duration::from_millis(50));
        for attempt in 0..20 {
            let d = policy.delay(attempt);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::default();
        let start = clock.now();
        clock.advance(Duration::from_secs(601));
        assert_eq!((clock.now() - start).num_seconds(), 601);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_at_deadline() {
        let policy = RetryPolicy::new(Duration::from_secs(2));
        let mut poller = policy.poller(Some(Duration::from_secs(5)));
        let mut checks = 1;
        while poller.wait().await {
            checks += 1;
        }
        // checks at t=0, 2, 4, 5
        assert_eq!(checks, 4);
        assert!(poller.elapsed() >= Duration::from_secs(5));
        assert!(poller.elapsed() < Duration::from_secs(6));
    }

    #[test]
    fn test_timeout_or_forever() {
        assert_eq!(timeout_or_forever(Duration::ZERO), None);
        assert_eq!(
            timeout_or_forever(Duration::from_secs(3)),
            Some(Duration::from_secs(3))
        );
    }
}
