//! Adaptive token-bucket admission control.
//!
//! The bucket refills lazily at call time (`elapsed * refill_rate`, capped at
//! capacity); there is no background timer. Each admission costs
//! `cost * multiplier`, where the multiplier is a standing penalty raised by
//! 429 responses and relaxed by successes:
//!
//! - [`RateLimiter::on_rate_limited`]: `multiplier = min(multiplier * 1.5, 2.0)`
//! - [`RateLimiter::on_success`]: `multiplier = max(multiplier * 0.9, 1.0)`
//!
//! The pairing tunes the client down after congestion and lets it recover
//! gradually instead of snapping back.
//!
//! Admission is not strict under concurrency: a caller that had to wait
//! re-reads the bucket after sleeping but does not wait again if another
//! caller drained it meanwhile. The debit clamps at zero instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::clock::Clock;

const PENALTY_FACTOR: f64 = 1.5;
const MAX_MULTIPLIER: f64 = 2.0;
const RECOVERY_FACTOR: f64 = 0.9;
const MIN_MULTIPLIER: f64 = 1.0;

/// Rate-limit parameters from the `[rate_limit]` config section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained request rate. Refill rate is `requests_per_minute / 60`
    /// tokens per second.
    pub requests_per_minute: u32,
    /// Bucket capacity; the bucket starts full.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    multiplier: f64,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token-bucket limiter with an adaptive cost multiplier.
///
/// All bucket updates happen under one short-lived lock that is never held
/// across an `.await`.
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a full bucket from the given parameters.
    ///
    /// Zero values are clamped to one so the limiter can always make
    /// progress; [`crate::config::Config::validate`] rejects them earlier.
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = f64::from(config.burst_size.max(1));
        let refill_rate = f64::from(config.requests_per_minute.max(1)) / 60.0;
        RateLimiter {
            capacity,
            refill_rate,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: clock.now(),
                multiplier: MIN_MULTIPLIER,
            }),
            clock,
        }
    }

    /// Suspends until `cost` tokens (scaled by the multiplier) are admitted.
    pub async fn acquire(&self, cost: f64) {
        let (effective, wait) = {
            let mut bucket = self.bucket.lock();
            bucket.refill(self.clock.now(), self.refill_rate, self.capacity);
            let effective = cost * bucket.multiplier;
            if bucket.tokens >= effective {
                bucket.tokens -= effective;
                debug!(cost = effective, remaining = bucket.tokens, "admitted");
                return;
            }
            let wait = (effective - bucket.tokens) / self.refill_rate;
            (effective, Duration::from_secs_f64(wait))
        };

        debug!(cost = effective, wait_ms = wait.as_millis() as u64, "waiting for admission");
        self.clock.sleep(wait).await;

        let mut bucket = self.bucket.lock();
        bucket.refill(self.clock.now(), self.refill_rate, self.capacity);
        if bucket.tokens < effective {
            debug!(
                tokens = bucket.tokens,
                cost = effective,
                "bucket drained by a concurrent caller; admitting anyway"
            );
        }
        bucket.tokens = (bucket.tokens - effective).max(0.0);
    }

    /// Records a 429 and raises the standing penalty.
    pub fn on_rate_limited(&self, retry_after: Duration) {
        let mut bucket = self.bucket.lock();
        bucket.multiplier = (bucket.multiplier * PENALTY_FACTOR).min(MAX_MULTIPLIER);
        warn!(
            retry_after_secs = retry_after.as_secs(),
            multiplier = bucket.multiplier,
            "rate limited by remote API"
        );
    }

    /// Records a successful call and relaxes the penalty.
    pub fn on_success(&self) {
        let mut bucket = self.bucket.lock();
        bucket.multiplier = (bucket.multiplier * RECOVERY_FACTOR).max(MIN_MULTIPLIER);
    }

    /// Current adaptive multiplier.
    pub fn multiplier(&self) -> f64 {
        self.bucket.lock().multiplier
    }

    /// Tokens available right now, after a lazy refill.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(self.clock.now(), self.refill_rate, self.capacity);
        bucket.tokens
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
