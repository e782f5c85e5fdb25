//! Shared token bucket gating outbound fetches.
//!
//! Tokens refill lazily on each call: `elapsed / interval * capacity`, capped at
//! capacity. Callers queue on a fair mutex, so a waiter is never overtaken and
//! its wait is bounded by `interval / capacity` once it reaches the front.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const DEFAULT_RATE: u32 = 60;

// Guards against float drift after sleeping for exactly the computed gap.
const TOKEN_EPSILON: f64 = 1e-9;

struct Bucket {
    capacity: u32,
    interval: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let credit = elapsed.as_secs_f64() / self.interval.as_secs_f64() * self.capacity as f64;
        self.tokens = (self.tokens + credit).min(self.capacity as f64);
        self.last_refill = now;
    }

    fn until_next_token(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        self.interval
            .mul_f64(missing / self.capacity as f64)
    }
}

pub struct RateGovernor {
    bucket: Mutex<Bucket>,
    // Copy of `Bucket::capacity`, readable without the lock
    rate: AtomicU32,
}

impl RateGovernor {
    /// A governor allowing `requests_per_minute` fetches per minute, starting full.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute, Duration::from_secs(60))
    }

    pub fn new(capacity: u32, interval: Duration) -> Self {
        let capacity = sanitize_rate(capacity);
        Self {
            bucket: Mutex::new(Bucket {
                capacity,
                interval,
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            rate: AtomicU32::new(capacity),
        }
    }

    /// Wait until a token is available, then spend it.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            bucket.refill(Instant::now());
            if bucket.tokens + TOKEN_EPSILON >= 1.0 {
                bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                return;
            }
            let wait = bucket.until_next_token();
            debug!("Rate budget exhausted, waiting {:?}", wait);
            sleep(wait).await;
        }
    }

    /// Change the per-interval capacity, scaling banked tokens by the same ratio.
    pub async fn set_rate(&self, requests: u32) {
        let requests = sanitize_rate(requests);
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        let ratio = requests as f64 / bucket.capacity as f64;
        bucket.tokens = (bucket.tokens * ratio).min(requests as f64);
        bucket.capacity = requests;
        self.rate.store(requests, Ordering::Relaxed);
    }

    pub fn rate(&self) -> u32 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Whole tokens currently banked. Reports 0 while a caller is waiting.
    pub fn tokens(&self) -> u32 {
        match self.bucket.try_lock() {
            Ok(mut bucket) => {
                bucket.refill(Instant::now());
                bucket.tokens.floor() as u32
            }
            Err(_) => 0,
        }
    }

    pub async fn reset(&self) {
        let mut bucket = self.bucket.lock().await;
        bucket.tokens = bucket.capacity as f64;
        bucket.last_refill = Instant::now();
    }
}

fn sanitize_rate(rate: u32) -> u32 {
    if rate == 0 {
        warn!("Rate of 0 requested, using {} per interval", DEFAULT_RATE);
        DEFAULT_RATE
    } else {
        rate
    }
}
