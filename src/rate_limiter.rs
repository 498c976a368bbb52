//! Token bucket rate limiter: caps a worker's HTTP call rate.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A shared, `async`-aware token bucket. At most one virtual user per
/// worker holds the internal lock while acquiring.
#[derive(Clone)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Arc<Mutex<BucketState>>,
}

impl RateLimiter {
    /// `rate == 0.0` disables the limiter entirely — `acquire` becomes a
    /// no-op that always admits immediately.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            state: Arc::new(Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.rate <= 0.0
    }

    /// Block until a token is available, then consume it.
    pub async fn acquire(&self) {
        if self.is_disabled() {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
                }
            };

            match wait {
                None => return,
                Some(duration) => time::sleep(duration).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_limiter_never_blocks() {
        let limiter = RateLimiter::new(0.0, 0.0);
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn burst_is_admitted_immediately() {
        let limiter = RateLimiter::new(10.0, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_count_bounded_by_burst_plus_rate_times_window() {
        let rate = 10.0;
        let burst = 5.0;
        let limiter = RateLimiter::new(rate, burst);
        let window = Duration::from_secs(2);
        let deadline = Instant::now() + window;

        let mut admitted = 0u64;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            limiter.acquire().await;
            admitted += 1;
            if admitted > 10_000 {
                break; // safety valve against infinite loop in a failing implementation
            }
        }

        let bound = burst + rate * window.as_secs_f64();
        assert!(
            (admitted as f64) <= bound + 1.0,
            "admitted={admitted} exceeds bound={bound}"
        );
    }
}
