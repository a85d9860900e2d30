use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

use super::core::{percentile, push_sample};
use super::TELEMETRY_SAMPLE_CAPACITY;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentTelemetrySnapshot {
    pub batches: u64,
    pub attempts: u64,
    pub retry_attempts: u64,
    pub retry_exhausted: u64,
    pub retry_terminal: u64,
    pub http_429: u64,
    pub http_5xx: u64,
    pub transport_errors: u64,
    pub signatures_requested: u64,
    pub signatures_missing: u64,
    pub non_array_bodies: u64,
    pub latency_ms_p50: u64,
    pub latency_ms_p95: u64,
}

#[derive(Debug)]
pub(super) struct EnrichmentTelemetry {
    pub(super) batches: AtomicU64,
    pub(super) attempts: AtomicU64,
    pub(super) retry_attempts: AtomicU64,
    pub(super) retry_exhausted: AtomicU64,
    pub(super) retry_terminal: AtomicU64,
    pub(super) http_429: AtomicU64,
    pub(super) http_5xx: AtomicU64,
    pub(super) transport_errors: AtomicU64,
    pub(super) signatures_requested: AtomicU64,
    pub(super) signatures_missing: AtomicU64,
    pub(super) non_array_bodies: AtomicU64,
    latency_ms_samples: Mutex<VecDeque<u64>>,
    last_report_ms: AtomicI64,
}

impl Default for EnrichmentTelemetry {
    fn default() -> Self {
        Self {
            batches: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            retry_attempts: AtomicU64::new(0),
            retry_exhausted: AtomicU64::new(0),
            retry_terminal: AtomicU64::new(0),
            http_429: AtomicU64::new(0),
            http_5xx: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            signatures_requested: AtomicU64::new(0),
            signatures_missing: AtomicU64::new(0),
            non_array_bodies: AtomicU64::new(0),
            latency_ms_samples: Mutex::new(VecDeque::with_capacity(TELEMETRY_SAMPLE_CAPACITY)),
            last_report_ms: AtomicI64::new(0),
        }
    }
}

impl EnrichmentTelemetry {
    pub(super) fn push_latency(&self, value: u64) {
        if let Ok(mut guard) = self.latency_ms_samples.lock() {
            push_sample(&mut guard, value, TELEMETRY_SAMPLE_CAPACITY);
        }
    }

    pub(super) fn maybe_report(&self, report_seconds: u64) {
        if !claim_report_slot(&self.last_report_ms, report_seconds) {
            return;
        }
        let snapshot = self.snapshot();
        info!(
            batches = snapshot.batches,
            attempts = snapshot.attempts,
            retry_attempts = snapshot.retry_attempts,
            retry_exhausted = snapshot.retry_exhausted,
            retry_terminal = snapshot.retry_terminal,
            http_429 = snapshot.http_429,
            http_5xx = snapshot.http_5xx,
            transport_errors = snapshot.transport_errors,
            signatures_requested = snapshot.signatures_requested,
            signatures_missing = snapshot.signatures_missing,
            non_array_bodies = snapshot.non_array_bodies,
            latency_ms_p50 = snapshot.latency_ms_p50,
            latency_ms_p95 = snapshot.latency_ms_p95,
            "enhanced client metrics"
        );
    }

    pub(super) fn snapshot(&self) -> EnrichmentTelemetrySnapshot {
        let samples = self
            .latency_ms_samples
            .lock()
            .ok()
            .map(|values| values.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        EnrichmentTelemetrySnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            retry_exhausted: self.retry_exhausted.load(Ordering::Relaxed),
            retry_terminal: self.retry_terminal.load(Ordering::Relaxed),
            http_429: self.http_429.load(Ordering::Relaxed),
            http_5xx: self.http_5xx.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            signatures_requested: self.signatures_requested.load(Ordering::Relaxed),
            signatures_missing: self.signatures_missing.load(Ordering::Relaxed),
            non_array_bodies: self.non_array_bodies.load(Ordering::Relaxed),
            latency_ms_p50: percentile(&samples, 0.50),
            latency_ms_p95: percentile(&samples, 0.95),
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct SubscriptionTelemetry {
    pub(super) notifications_seen: AtomicU64,
    pub(super) failed_tx_notifications: AtomicU64,
    pub(super) unrouted_notifications: AtomicU64,
    pub(super) sightings_forwarded: AtomicU64,
    pub(super) subscribe_acks: AtomicU64,
    pub(super) reconnect_count: AtomicU64,
    last_report_ms: AtomicI64,
}

impl SubscriptionTelemetry {
    pub(super) fn maybe_report(&self, report_seconds: u64, active_subscriptions: usize) {
        if !claim_report_slot(&self.last_report_ms, report_seconds) {
            return;
        }
        info!(
            notifications_seen = self.notifications_seen.load(Ordering::Relaxed),
            failed_tx_notifications = self.failed_tx_notifications.load(Ordering::Relaxed),
            unrouted_notifications = self.unrouted_notifications.load(Ordering::Relaxed),
            sightings_forwarded = self.sightings_forwarded.load(Ordering::Relaxed),
            subscribe_acks = self.subscribe_acks.load(Ordering::Relaxed),
            reconnect_count = self.reconnect_count.load(Ordering::Relaxed),
            active_subscriptions,
            "logs subscription metrics"
        );
    }
}

fn claim_report_slot(last_report_ms: &AtomicI64, report_seconds: u64) -> bool {
    let report_seconds = report_seconds.max(5);
    let now_ms = Utc::now().timestamp_millis();
    let last = last_report_ms.load(Ordering::Relaxed);
    if now_ms.saturating_sub(last) < (report_seconds as i64 * 1_000) {
        return false;
    }
    last_report_ms
        .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
}
