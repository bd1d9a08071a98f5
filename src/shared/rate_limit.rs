use crate::{config::RateLimitLimits, metrics::Metrics, shared::lru::LruMap};
use ahash::RandomState;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// When a denied caller should retry. Zero for allowed requests.
    pub retry_after: Duration,
}

impl Decision {
    /// Suggested `retry-after` header value in whole seconds, rounded up.
    #[inline]
    pub fn retry_after_secs(&self) -> u64 {
        let ms = self.retry_after.as_millis() as u64;
        ms.div_ceil(1000)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket admission per peer address.
///
/// Buckets refill lazily on each check at `capacity / window` tokens per
/// second. The key store is bounded; when full, the least-recently-seen key
/// is evicted. Whitelisted peers bypass the store entirely.
///
/// The store sits behind one short critical section: the arithmetic per
/// check is a handful of float operations, so even hot connections spend
/// almost no time holding the lock.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    store: Mutex<LruMap<IpAddr, Bucket>>,
    whitelist: HashSet<IpAddr, RandomState>,
    capacity: f64,
    rate: f64,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub(crate) fn new(limits: &RateLimitLimits, metrics: Arc<Metrics>) -> Self {
        Self {
            store: Mutex::new(LruMap::new(limits.max_keys)),
            whitelist: limits.whitelist.iter().copied().collect(),
            capacity: limits.capacity,
            rate: limits.capacity / limits.window_seconds as f64,
            metrics,
        }
    }

    /// Admits or denies one request for `key`.
    pub(crate) fn try_acquire(&self, key: IpAddr) -> Decision {
        self.try_acquire_at(key, Instant::now())
    }

    fn try_acquire_at(&self, key: IpAddr, now: Instant) -> Decision {
        if self.whitelist.contains(&key) {
            return Decision {
                allowed: true,
                retry_after: Duration::ZERO,
            };
        }

        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());

        let bucket = match store.get_mut(&key) {
            Some(bucket) => bucket,
            None => {
                store.insert(
                    key,
                    Bucket {
                        tokens: self.capacity,
                        last_refill: now,
                    },
                );
                store.get_mut(&key).expect("bucket just inserted")
            }
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Decision {
                allowed: true,
                retry_after: Duration::ZERO,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after = Duration::from_secs_f64(deficit / self.rate);
            drop(store);

            Metrics::incr(&self.metrics.rate_limit_denials);
            trace!(%key, ?retry_after, "rate limit denied");
            Decision {
                allowed: false,
                retry_after,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.store.lock().unwrap().len()
    }
}
