use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const SCAN_LIMIT_MIN: usize = 500;
const SCAN_LIMIT_MAX: usize = 20_000;
const SCAN_LIMIT_PER_BATCH_ITEM: usize = 50;
const COMPACT_MIN_ORDER_LEN: usize = 1_024;

#[derive(Debug, Clone)]
pub struct PendingBufferConfig {
    pub max_pending: usize,
    pub initial_delay: Duration,
    pub max_missing_retries: u32,
    pub missing_retry_base: Duration,
    pub missing_retry_max: Duration,
}

impl Default for PendingBufferConfig {
    fn default() -> Self {
        Self {
            max_pending: 50_000,
            initial_delay: Duration::from_millis(1_500),
            max_missing_retries: 6,
            missing_retry_base: Duration::from_millis(500),
            missing_retry_max: Duration::from_millis(20_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub signature: String,
    pub seen_at: DateTime<Utc>,
    pub hint_slot: Option<u64>,
    pub attempts: u32,
    pub next_attempt_at: Instant,
    pub source: String,
    seq: u64,
}

#[derive(Debug, Clone)]
struct OrderSlot {
    seq: u64,
    signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Duplicate,
    Inserted { evicted: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingOutcome {
    Absent,
    Rescheduled { attempts: u32, delay: Duration },
    Dropped { attempts: u32 },
}

/// Bounded, insertion-ordered set of signatures waiting for enrichment.
///
/// `order` may hold stale slots for entries that were removed or re-inserted;
/// a slot is live only while its `seq` matches the entry in `entries`.
#[derive(Debug)]
pub struct PendingBuffer {
    config: PendingBufferConfig,
    entries: HashMap<String, PendingEntry>,
    order: VecDeque<OrderSlot>,
    cursor: usize,
    next_seq: u64,
    evicted: u64,
    dropped_missing: u64,
}

impl PendingBuffer {
    pub fn new(config: PendingBufferConfig) -> Self {
        let config = PendingBufferConfig {
            max_pending: config.max_pending.max(1),
            ..config
        };
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
            cursor: 0,
            next_seq: 0,
            evicted: 0,
            dropped_missing: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.entries.contains_key(signature)
    }

    pub fn get(&self, signature: &str) -> Option<&PendingEntry> {
        self.entries.get(signature)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn dropped_missing(&self) -> u64 {
        self.dropped_missing
    }

    pub fn insert(
        &mut self,
        signature: &str,
        hint_slot: Option<u64>,
        source: &str,
        now: Instant,
    ) -> InsertOutcome {
        if self.entries.contains_key(signature) {
            return InsertOutcome::Duplicate;
        }
        let evicted = if self.entries.len() >= self.config.max_pending {
            self.evict_oldest()
        } else {
            None
        };

        self.next_seq = self.next_seq.saturating_add(1);
        let seq = self.next_seq;
        self.entries.insert(
            signature.to_string(),
            PendingEntry {
                signature: signature.to_string(),
                seen_at: Utc::now(),
                hint_slot,
                attempts: 0,
                next_attempt_at: now + self.config.initial_delay,
                source: source.to_string(),
                seq,
            },
        );
        self.order.push_back(OrderSlot {
            seq,
            signature: signature.to_string(),
        });
        InsertOutcome::Inserted { evicted }
    }

    /// Collects up to `batch_size` ready signatures without removing them.
    ///
    /// The scan resumes where the previous call stopped so that a long run of
    /// not-yet-ready entries at the front cannot starve the tail.
    pub fn select_ready(&mut self, now: Instant, batch_size: usize) -> Vec<String> {
        let mut selected = Vec::new();
        if self.entries.is_empty() || self.order.is_empty() || batch_size == 0 {
            return selected;
        }

        let scan_limit = scan_limit(batch_size).min(self.order.len());
        let mut scanned = 0usize;
        while scanned < scan_limit && selected.len() < batch_size {
            if self.cursor >= self.order.len() {
                self.cursor = 0;
            }
            let slot = &self.order[self.cursor];
            self.cursor += 1;
            scanned += 1;

            let Some(entry) = self.entries.get(&slot.signature) else {
                continue;
            };
            if entry.seq != slot.seq {
                continue;
            }
            if entry.next_attempt_at <= now {
                selected.push(slot.signature.clone());
            }
        }
        selected
    }

    pub fn mark_missing(&mut self, signature: &str, now: Instant) -> MissingOutcome {
        let Some(entry) = self.entries.get_mut(signature) else {
            return MissingOutcome::Absent;
        };
        entry.attempts = entry.attempts.saturating_add(1);
        let attempts = entry.attempts;
        if attempts > self.config.max_missing_retries {
            self.entries.remove(signature);
            self.dropped_missing = self.dropped_missing.saturating_add(1);
            self.maybe_compact();
            return MissingOutcome::Dropped { attempts };
        }

        let delay = missing_retry_delay(
            self.config.missing_retry_base,
            self.config.missing_retry_max,
            attempts,
        );
        entry.next_attempt_at = now + delay;
        MissingOutcome::Rescheduled { attempts, delay }
    }

    /// Pushes back every listed entry that is still pending; attempts are
    /// left untouched. Returns how many entries were found.
    pub fn mark_failed(&mut self, signatures: &[String], now: Instant, delay: Duration) -> usize {
        let not_before = now + delay;
        let mut touched = 0usize;
        for signature in signatures {
            if let Some(entry) = self.entries.get_mut(signature) {
                entry.next_attempt_at = entry.next_attempt_at.max(not_before);
                touched += 1;
            }
        }
        touched
    }

    pub fn remove(&mut self, signature: &str) -> Option<PendingEntry> {
        let removed = self.entries.remove(signature);
        if removed.is_some() {
            self.maybe_compact();
        }
        removed
    }

    fn evict_oldest(&mut self) -> Option<String> {
        while let Some(front) = self.order.pop_front() {
            self.cursor = self.cursor.saturating_sub(1);
            let live = self
                .entries
                .get(&front.signature)
                .is_some_and(|entry| entry.seq == front.seq);
            if live {
                self.entries.remove(&front.signature);
                self.evicted = self.evicted.saturating_add(1);
                return Some(front.signature);
            }
        }
        None
    }

    fn maybe_compact(&mut self) {
        let order_len = self.order.len();
        if order_len < COMPACT_MIN_ORDER_LEN || order_len <= self.entries.len().saturating_mul(2) {
            return;
        }
        self.compact();
    }

    fn compact(&mut self) {
        let old_cursor = self.cursor;
        let mut new_cursor = 0usize;
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for (index, slot) in self.order.drain(..).enumerate() {
            let live = self
                .entries
                .get(&slot.signature)
                .is_some_and(|entry| entry.seq == slot.seq);
            if !live {
                continue;
            }
            if index < old_cursor {
                new_cursor += 1;
            }
            kept.push_back(slot);
        }
        self.order = kept;
        self.cursor = new_cursor;
    }

    #[cfg(test)]
    fn order_len(&self) -> usize {
        self.order.len()
    }
}

fn scan_limit(batch_size: usize) -> usize {
    batch_size
        .saturating_mul(SCAN_LIMIT_PER_BATCH_ITEM)
        .clamp(SCAN_LIMIT_MIN, SCAN_LIMIT_MAX)
}

pub fn missing_retry_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
    let max_ms = max.as_millis().min(u128::from(u64::MAX)) as u64;
    let factor = 1u64 << attempts.min(30);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms.max(base_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(max_pending: usize) -> PendingBuffer {
        PendingBuffer::new(PendingBufferConfig {
            max_pending,
            initial_delay: Duration::ZERO,
            ..PendingBufferConfig::default()
        })
    }

    #[test]
    fn insert_evicts_oldest_live_entry_at_capacity() {
        let now = Instant::now();
        let mut pending = buffer(3);
        for signature in ["a", "b", "c"] {
            pending.insert(signature, None, "test", now);
        }
        pending.remove("a");

        // "a" is only a stale slot now, so "b" is the oldest live entry.
        pending.insert("d", None, "test", now);
        assert_eq!(pending.len(), 3);
        let outcome = pending.insert("e", None, "test", now);
        assert_eq!(
            outcome,
            InsertOutcome::Inserted {
                evicted: Some("b".to_string())
            }
        );
        assert_eq!(pending.len(), 3);
        assert_eq!(pending.evicted(), 1);
        assert!(!pending.contains("b"));
    }

    #[test]
    fn buffer_never_exceeds_capacity() {
        let now = Instant::now();
        let mut pending = buffer(10);
        for index in 0..1_000 {
            pending.insert(&format!("sig-{index}"), None, "test", now);
            assert!(pending.len() <= 10);
        }
        assert_eq!(pending.evicted(), 990);
        assert!(pending.contains("sig-999"));
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let now = Instant::now();
        let mut pending = buffer(10);
        pending.insert("a", Some(5), "first", now);
        assert_eq!(
            pending.insert("a", Some(6), "second", now),
            InsertOutcome::Duplicate
        );
        let entry = pending.get("a").expect("entry present");
        assert_eq!(entry.hint_slot, Some(5));
        assert_eq!(entry.source, "first");
    }

    #[test]
    fn select_ready_respects_initial_delay() {
        let now = Instant::now();
        let mut pending = PendingBuffer::new(PendingBufferConfig {
            max_pending: 10,
            initial_delay: Duration::from_millis(1_500),
            ..PendingBufferConfig::default()
        });
        pending.insert("a", None, "test", now);
        assert!(pending.select_ready(now, 10).is_empty());
        assert_eq!(
            pending.select_ready(now + Duration::from_millis(1_500), 10),
            vec!["a".to_string()]
        );
    }

    #[test]
    fn select_ready_resumes_from_cursor_and_never_repeats_within_call() {
        let now = Instant::now();
        let mut pending = buffer(10);
        for signature in ["a", "b", "c", "d", "e"] {
            pending.insert(signature, None, "test", now);
        }
        let first = pending.select_ready(now, 2);
        assert_eq!(first, vec!["a".to_string(), "b".to_string()]);
        let second = pending.select_ready(now, 2);
        assert_eq!(second, vec!["c".to_string(), "d".to_string()]);
        let third = pending.select_ready(now, 10);
        assert_eq!(third.len(), 5);
        let mut unique = third.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), third.len());
        assert_eq!(third[0], "e");
    }

    #[test]
    fn mark_missing_backs_off_then_drops() {
        let now = Instant::now();
        let mut pending = buffer(10);
        pending.insert("a", None, "test", now);

        assert_eq!(
            pending.mark_missing("a", now),
            MissingOutcome::Rescheduled {
                attempts: 1,
                delay: Duration::from_millis(1_000)
            }
        );
        for _ in 2..=6 {
            assert!(matches!(
                pending.mark_missing("a", now),
                MissingOutcome::Rescheduled { .. }
            ));
        }
        assert_eq!(
            pending.mark_missing("a", now),
            MissingOutcome::Dropped { attempts: 7 }
        );
        assert!(!pending.contains("a"));
        assert_eq!(pending.dropped_missing(), 1);
        assert_eq!(pending.mark_missing("a", now), MissingOutcome::Absent);
    }

    #[test]
    fn missing_retry_delay_is_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_millis(20_000);
        assert_eq!(missing_retry_delay(base, max, 0), Duration::from_millis(500));
        assert_eq!(missing_retry_delay(base, max, 3), Duration::from_millis(4_000));
        assert_eq!(missing_retry_delay(base, max, 6), Duration::from_millis(20_000));
        assert_eq!(missing_retry_delay(base, max, 64), Duration::from_millis(20_000));
    }

    #[test]
    fn mark_failed_keeps_entries_and_only_moves_forward() {
        let now = Instant::now();
        let mut pending = buffer(10);
        pending.insert("a", None, "test", now);
        pending.insert("b", None, "test", now);
        pending.mark_missing("b", now);
        let far = pending.get("b").expect("b").next_attempt_at;

        let touched = pending.mark_failed(
            &["a".to_string(), "b".to_string(), "gone".to_string()],
            now,
            Duration::from_millis(100),
        );
        assert_eq!(touched, 2);
        let a = pending.get("a").expect("a");
        assert_eq!(a.attempts, 0);
        assert_eq!(a.next_attempt_at, now + Duration::from_millis(100));
        let b = pending.get("b").expect("b");
        assert_eq!(b.attempts, 1);
        assert_eq!(b.next_attempt_at, far);
    }

    #[test]
    fn compaction_preserves_order_and_cursor() {
        let now = Instant::now();
        let mut pending = buffer(10_000);
        for index in 0..3_000 {
            pending.insert(&format!("sig-{index:05}"), None, "test", now);
        }
        let first = pending.select_ready(now, 10);
        assert_eq!(first.last().map(String::as_str), Some("sig-00009"));

        for index in 0..2_500 {
            if index % 5 != 0 {
                pending.remove(&format!("sig-{index:05}"));
            }
        }
        assert!(pending.order_len() < 3_000);
        assert_eq!(pending.len(), 1_000);

        // Cursor sat after sig-00009; the next live slot is sig-00010.
        let next = pending.select_ready(now, 3);
        assert_eq!(
            next,
            vec![
                "sig-00010".to_string(),
                "sig-00015".to_string(),
                "sig-00020".to_string()
            ]
        );
    }

    #[test]
    fn reinserted_signature_ignores_stale_slot() {
        let now = Instant::now();
        let mut pending = buffer(10);
        pending.insert("a", None, "test", now);
        pending.insert("b", None, "test", now);
        pending.remove("a");
        pending.insert("a", None, "test", now);

        let selected = pending.select_ready(now, 10);
        assert_eq!(selected, vec!["b".to_string(), "a".to_string()]);
    }
}
