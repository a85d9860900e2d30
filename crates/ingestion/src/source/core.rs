use reqwest::header::RETRY_AFTER;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time;

pub(super) fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Exponential backoff for the `attempt`-th retry (0-based), capped at
/// `max_ms` unless the server asked for a longer `Retry-After`.
pub(super) fn compute_retry_delay(
    base_ms: u64,
    max_ms: u64,
    jitter_ms: u64,
    attempt: u32,
    jitter_key: &str,
    retry_after: Option<Duration>,
) -> Duration {
    let base_ms = base_ms.max(1);
    let mut cap_ms = max_ms.max(base_ms);
    if let Some(retry_after) = retry_after {
        let retry_after_ms = retry_after.as_millis().min(u128::from(u64::MAX)) as u64;
        cap_ms = cap_ms.max(retry_after_ms);
    }
    let exp_factor = 1u64 << attempt.min(10);
    let mut delay_ms = base_ms.saturating_mul(exp_factor).min(cap_ms);
    if let Some(retry_after) = retry_after {
        let retry_after_ms = retry_after.as_millis().min(u128::from(u64::MAX)) as u64;
        delay_ms = delay_ms.max(retry_after_ms.min(cap_ms));
    }
    let jitter = retry_jitter_ms(jitter_key, attempt, jitter_ms);
    Duration::from_millis(
        delay_ms
            .saturating_add(jitter)
            .min(cap_ms.saturating_add(jitter_ms)),
    )
}

fn retry_jitter_ms(jitter_key: &str, attempt: u32, max_jitter_ms: u64) -> u64 {
    if max_jitter_ms == 0 {
        return 0;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    jitter_key.hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish() % (max_jitter_ms + 1)
}

pub(super) async fn sleep_with_backoff(next_backoff_ms: &mut u64, initial_ms: u64, max_ms: u64) {
    let delay = (*next_backoff_ms).clamp(initial_ms, max_ms);
    time::sleep(Duration::from_millis(delay)).await;
    *next_backoff_ms = delay.saturating_mul(2).min(max_ms);
}

pub(super) fn push_sample(samples: &mut VecDeque<u64>, value: u64, cap: usize) {
    if samples.len() >= cap {
        let _ = samples.pop_front();
    }
    samples.push_back(value);
}

pub(super) fn percentile(values: &[u64], q: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((sorted.len() - 1) as f64 * q.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}
