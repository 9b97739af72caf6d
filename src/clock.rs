//! Time source abstraction.
//!
//! Every component that reads the time or sleeps (rate limiter, retry
//! backoff, credential expiry, task polling, audit timestamps) goes through
//! a [`Clock`], so tests can swap in [`MockClock`] and simulate elapsed time
//! without real delays.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Monotonic time, wall-clock time and sleeping.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant, used for elapsed-time arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for timestamps and last-seen comparisons.
    fn utc_now(&self) -> DateTime<Utc>;

    /// Suspends the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by `Instant::now`, `Utc::now` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for tests.
///
/// `sleep` returns immediately after advancing virtual time by the requested
/// duration, and records the request so tests can assert backoff schedules.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    start_utc: DateTime<Utc>,
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl MockClock {
    /// Creates a mock clock anchored at the current instant and wall time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a mock clock whose wall time starts at `utc`.
    pub fn starting_at(utc: DateTime<Utc>) -> Self {
        MockClock {
            start: Instant::now(),
            start_utc: utc,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Advances virtual time without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.state.lock().elapsed += duration;
    }

    /// Total virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + self.state.lock().elapsed
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let elapsed = self.state.lock().elapsed;
        self.start_utc + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.state.lock();
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}
