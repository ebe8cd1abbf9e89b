//! Per-client token-bucket rate limiting.
//!
//! Each client id owns a bucket with `burst` capacity that refills
//! continuously at `max_requests / window_ms` tokens per millisecond.
//! Buckets are created lazily on first use and evicted by a background
//! sweep once idle for twice the window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Bucket capacity. Usually equal to `max_requests`.
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_ms: 60_000,
            burst: 30,
        }
    }
}

/// The outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    /// Whether the request is admitted (and, for `check`, a token consumed).
    pub allowed: bool,
    /// Whole tokens remaining after this decision.
    pub remaining: u32,
    /// Milliseconds until at least one token is available.
    pub reset_in_ms: u64,
    /// Bucket fill level in `[0, 1]`.
    pub fill_level: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared per-client token-bucket rate limiter.
///
/// The outer map lock is held only to locate or create a bucket; per-bucket
/// operations run under the bucket's own lock, so two different clients
/// never contend.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    /// Create a limiter with the given configuration.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Tokens refilled per millisecond.
    fn refill_rate(&self) -> f64 {
        self.config.max_requests as f64 / self.config.window_ms as f64
    }

    async fn bucket_for(&self, client_id: &str) -> Arc<Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(client_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: self.config.burst as f64,
                    last_refill: Instant::now(),
                }))
            })
            .clone()
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed_ms = now.duration_since(bucket.last_refill).as_secs_f64() * 1000.0;
        bucket.tokens =
            (bucket.tokens + elapsed_ms * self.refill_rate()).min(self.config.burst as f64);
    }

    fn decision(&self, tokens: f64, allowed: bool) -> RateDecision {
        let reset_in_ms = if tokens >= 1.0 {
            0
        } else {
            ((1.0 - tokens) / self.refill_rate()).ceil() as u64
        };
        RateDecision {
            allowed,
            remaining: tokens.floor() as u32,
            reset_in_ms,
            fill_level: tokens / self.config.burst as f64,
        }
    }

    /// Consume one token for the client if available.
    pub async fn check(&self, client_id: &str) -> RateDecision {
        let bucket = self.bucket_for(client_id).await;
        let mut bucket = bucket.lock().await;
        let now = Instant::now();
        self.refill(&mut bucket, now);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            self.decision(bucket.tokens, true)
        } else {
            self.decision(bucket.tokens, false)
        }
    }

    /// Report the client's current state without consuming a token.
    pub async fn peek(&self, client_id: &str) -> RateDecision {
        let buckets = self.buckets.lock().await;
        let Some(bucket) = buckets.get(client_id).cloned() else {
            // Unknown client: a full bucket.
            return self.decision(self.config.burst as f64, true);
        };
        drop(buckets);

        let bucket = bucket.lock().await;
        // Compute the refilled level without committing it, so peek stays
        // free of side effects on the activity clock.
        let elapsed_ms = bucket.last_refill.elapsed().as_secs_f64() * 1000.0;
        let tokens =
            (bucket.tokens + elapsed_ms * self.refill_rate()).min(self.config.burst as f64);
        self.decision(tokens, tokens >= 1.0)
    }

    /// Evict buckets idle for at least twice the window. Returns the number
    /// evicted.
    pub async fn sweep_idle(&self) -> usize {
        let idle_after = Duration::from_millis(self.config.window_ms.saturating_mul(2));
        let mut buckets = self.buckets.lock().await;
        let mut evicted = 0;

        let keys: Vec<String> = buckets.keys().cloned().collect();
        for key in keys {
            let stale = {
                let Some(bucket) = buckets.get(&key) else {
                    continue;
                };
                match bucket.try_lock() {
                    Ok(b) => b.last_refill.elapsed() >= idle_after,
                    // In use right now, so not idle.
                    Err(_) => false,
                }
            };
            if stale {
                buckets.remove(&key);
                evicted += 1;
            }
        }
        evicted
    }

    /// Number of live buckets.
    pub async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }

    /// Start a background task that sweeps idle buckets on an interval.
    pub fn start_sweep_task(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let evicted = limiter.sweep_idle().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "rate limiter evicted idle buckets");
                }
            }
        })
    }
}
