use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{self, Instant};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, rate: f64, burst: f64) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate).min(burst);
            self.refilled_at = now;
        }
    }
}

/// Request pacing for the enhanced endpoint; one token per HTTP attempt.
#[derive(Debug)]
pub(super) struct TokenBucketLimiter {
    rate: f64,
    burst: f64,
    state: AsyncMutex<BucketState>,
}

impl TokenBucketLimiter {
    /// `None` when `requests_per_second` is zero, i.e. pacing disabled.
    pub(super) fn new(requests_per_second: u64, burst: u64) -> Option<Arc<Self>> {
        if requests_per_second == 0 {
            return None;
        }
        let burst = burst.max(requests_per_second).max(1) as f64;
        Some(Arc::new(Self {
            rate: requests_per_second as f64,
            burst,
            state: AsyncMutex::new(BucketState {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }))
    }

    pub(super) async fn acquire(&self) {
        while let Some(wait) = self.try_take().await {
            time::sleep(wait).await;
        }
    }

    /// Takes a token, or reports how long until one is available.
    async fn try_take(&self) -> Option<Duration> {
        let mut state = self.state.lock().await;
        state.refill(Instant::now(), self.rate, self.burst);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return None;
        }
        let deficit = (1.0 - state.tokens).max(0.0);
        Some(Duration::from_secs_f64((deficit / self.rate).max(0.001)))
    }
}
