// =============================================================================
// Token bucket with debt — guards every broker call
// =============================================================================
//
// `acquire` refills under a mutex, takes one token, and if the balance went
// negative sleeps the debt off *outside* the lock so concurrent callers can
// queue their own debt in parallel instead of serialising behind one
// sleeper.
//
// Two instances exist at runtime: `broker` (all broker calls) and `orders`
// (order placement specifically), both 5 req/s with a burst of 10.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Default sustained rate for broker-facing buckets (requests per second).
pub const DEFAULT_RATE: f64 = 5.0;
/// Default burst capacity.
pub const DEFAULT_CAPACITY: f64 = 10.0;

struct Inner {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    name: &'static str,
    rate: f64,
    capacity: f64,
    inner: Mutex<Inner>,
}

impl TokenBucket {
    pub fn new(name: &'static str, rate: f64, capacity: f64) -> Self {
        Self {
            name,
            rate,
            capacity,
            inner: Mutex::new(Inner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn with_defaults(name: &'static str) -> Self {
        Self::new(name, DEFAULT_RATE, DEFAULT_CAPACITY)
    }

    /// Take one token, sleeping off any debt incurred.
    ///
    /// The token is subtracted while holding the lock; the sleep happens
    /// after the lock is released. A burst of callers therefore each take
    /// progressively deeper debt and sleep concurrently, which preserves
    /// the overall rate without head-of-line blocking.
    pub async fn acquire(&self) {
        let wait = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
            inner.tokens = (inner.tokens + elapsed * self.rate).min(self.capacity);
            inner.last_refill = now;

            inner.tokens -= 1.0;
            if inner.tokens < 0.0 {
                Some(Duration::from_secs_f64(-inner.tokens / self.rate))
            } else {
                None
            }
        };

        if let Some(wait) = wait {
            warn!(
                limiter = self.name,
                wait_ms = wait.as_millis() as u64,
                "rate limit hit, sleeping off debt"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token balance (may be negative while debt is outstanding).
    #[cfg(test)]
    fn balance(&self) -> f64 {
        self.inner.lock().tokens
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("name", &self.name)
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn burst_within_capacity_is_instant() {
        let bucket = TokenBucket::new("test", 100.0, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn debt_forces_a_wait() {
        // Capacity 2, rate 50/s: the third acquire owes ~20ms.
        let bucket = TokenBucket::new("test", 50.0, 2.0);
        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn concurrent_callers_accumulate_debt_in_parallel() {
        // Ten callers against capacity 2 at 100/s: total wall time is the
        // deepest single debt (~80ms), not the sum of all debts.
        let bucket = Arc::new(TokenBucket::new("test", 100.0, 2.0));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let b = bucket.clone();
            handles.push(tokio::spawn(async move { b.acquire().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(400));
        // Debt was incurred during the burst and must refill over time.
        assert!(bucket.balance() <= 0.5);
    }

    #[tokio::test]
    async fn acquisitions_over_a_window_are_rate_bounded() {
        // Over a window W the number of grants is <= capacity + rate * W.
        let bucket = TokenBucket::new("test", 40.0, 4.0);
        let window = Duration::from_millis(250);
        let start = Instant::now();
        let mut grants: u32 = 0;
        while start.elapsed() < window {
            bucket.acquire().await;
            grants += 1;
        }
        let bound = 4.0 + 40.0 * start.elapsed().as_secs_f64();
        assert!(
            (grants as f64) <= bound + 1.0,
            "grants {grants} exceeded bound {bound:.1}"
        );
    }
}
