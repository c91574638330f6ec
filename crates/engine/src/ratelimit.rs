use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

/// Token-bucket limiter guarding outbound CLOB REST calls, paired with an
/// exponential backoff that only engages after the exchange itself returns
/// HTTP 429 / a rate-limit error. The two are independent: the bucket
/// paces normal traffic, the backoff punishes repeated rejections.
pub struct ClobRateLimiter {
    inner: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
    base_backoff: Duration,
    max_backoff: Duration,
    /// Optimistic until the first observed failure; flips back on the next
    /// success. Shared with the dashboard `/health` endpoint as adapter
    /// liveness.
    connected: Arc<AtomicBool>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    backoff: Duration,
    consecutive_successes: u32,
}

/// Tunables for `ClobRateLimiter::new`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 5.0,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl ClobRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_connected_flag(config, Arc::new(AtomicBool::new(true)))
    }

    /// Like `new`, but shares the connectivity flag with an external owner
    /// (the dashboard `/health` endpoint) instead of allocating its own.
    pub fn with_connected_flag(config: RateLimiterConfig, connected: Arc<AtomicBool>) -> Self {
        Self {
            inner: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
                backoff: config.base_backoff,
                consecutive_successes: 0,
            }),
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
            connected,
        }
    }

    /// Current adapter connectivity, as inferred from recent REST call
    /// outcomes.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Clone of the shared connectivity flag, for callers that want to read
    /// it without holding a reference to the limiter itself.
    pub fn connected_handle(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Blocks until a token-bucket slot is free, then returns. Never holds
    /// the internal mutex across the sleep — another caller can still
    /// refill/consume concurrently.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.inner.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Call after a rate-limit rejection (HTTP 429 or exchange-reported
    /// throttle). Returns the delay the caller should sleep before retrying.
    /// Doubles the backoff, capped at `max_backoff`, with +/-20% jitter so
    /// concurrent callers don't retry in lockstep.
    pub async fn penalize(&self) -> Duration {
        let delay = {
            let mut state = self.inner.lock().await;
            state.consecutive_successes = 0;
            let delay = state.backoff;
            state.backoff = (state.backoff * 2).min(self.max_backoff);
            delay
        };
        self.connected.store(false, Ordering::Relaxed);
        warn!(delay_ms = delay.as_millis(), "CLOB rate limited, backing off");
        jittered(delay)
    }

    /// Call after a successful call. Three consecutive successes reset the
    /// backoff back to its base value, so a transient throttle doesn't
    /// permanently slow the bot down.
    pub async fn record_success(&self) {
        let mut state = self.inner.lock().await;
        state.consecutive_successes += 1;
        if state.consecutive_successes >= 3 {
            state.backoff = self.base_backoff;
        }
        self.connected.store(true, Ordering::Relaxed);
    }
}

fn jittered(d: Duration) -> Duration {
    use std::time::Duration as D;
    let millis = d.as_millis() as f64;
    let jitter = (fastrand_like() - 0.5) * 0.4; // +/-20%
    D::from_millis((millis * (1.0 + jitter)).max(0.0) as u64)
}

/// Minimal deterministic-free jitter source. Avoids pulling in a `rand`
/// dependency for a single call site; not used anywhere that needs
/// cryptographic randomness.
fn fastrand_like() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_drains_bucket_then_waits() {
        let limiter = ClobRateLimiter::new(RateLimiterConfig {
            capacity: 2.0,
            refill_per_sec: 100.0,
            ..Default::default()
        });

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await; // must wait for refill
        assert!(start.elapsed() > Duration::from_millis(1));
    }

    #[tokio::test]
    async fn penalize_doubles_backoff_up_to_cap() {
        let limiter = ClobRateLimiter::new(RateLimiterConfig {
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(30),
            ..Default::default()
        });

        let d1 = limiter.penalize().await;
        let d2 = limiter.penalize().await;
        let d3 = limiter.penalize().await;

        assert!(d1.as_millis() <= 12);
        assert!(d2.as_millis() <= 24);
        assert!(d3.as_millis() <= 36); // capped at max_backoff + jitter
    }

    #[tokio::test]
    async fn three_successes_reset_backoff() {
        let limiter = ClobRateLimiter::new(RateLimiterConfig {
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(1000),
            ..Default::default()
        });

        limiter.penalize().await;
        limiter.penalize().await;
        limiter.record_success().await;
        limiter.record_success().await;
        limiter.record_success().await;

        let state = limiter.inner.lock().await;
        assert_eq!(state.backoff, Duration::from_millis(10));
    }
}
