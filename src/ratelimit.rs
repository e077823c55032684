//! Per-tenant token-bucket rate limiting.
//!
//! Buckets live in a map behind a read/write lock with double-checked
//! insertion; a periodic reaper drops buckets idle past the window so the
//! map cannot grow unbounded.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            rate: config.requests_per_second as f64,
            burst: config.burst_size as f64,
        }
    }

    /// Returns true when the tenant has budget for one more request.
    pub fn allow(&self, tenant: &str) -> bool {
        let bucket = self.bucket_for(tenant);
        let mut bucket = bucket.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn bucket_for(&self, tenant: &str) -> Arc<Mutex<TokenBucket>> {
        {
            let buckets = self.buckets.read();
            if let Some(bucket) = buckets.get(tenant) {
                return bucket.clone();
            }
        }

        let mut buckets = self.buckets.write();
        // Re-check after taking the write lock
        if let Some(bucket) = buckets.get(tenant) {
            return bucket.clone();
        }

        let now = Instant::now();
        let bucket = Arc::new(Mutex::new(TokenBucket {
            tokens: self.burst,
            last_refill: now,
            last_used: now,
        }));
        buckets.insert(tenant.to_string(), bucket.clone());
        bucket
    }

    /// Drop buckets that have been idle for longer than `idle`.
    pub fn reap_inactive(&self, idle: Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        buckets.retain(|_, bucket| now.duration_since(bucket.lock().last_used) < idle);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }
}

/// Reap idle limiters every `interval`; runs until the process exits.
pub fn spawn_reaper(limiter: Arc<RateLimiter>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            limiter.reap_inactive(interval * 2);
        }
    });
}
