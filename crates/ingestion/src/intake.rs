use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use tipscan_core_types::SignatureSighting;

use crate::pending::{InsertOutcome, PendingBuffer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Rejected,
    Duplicate,
    SampledOut,
    Accepted { evicted: Option<String> },
}

/// Front door of the pending buffer: sampling plus de-duplication.
#[derive(Debug)]
pub struct SignatureIntake {
    sample_pct: f64,
    rng: StdRng,
    ingested: u64,
    sampled_out: u64,
}

impl SignatureIntake {
    pub fn new(sample_pct: f64) -> Self {
        Self::with_rng(sample_pct, StdRng::from_entropy())
    }

    pub fn with_seed(sample_pct: f64, seed: u64) -> Self {
        Self::with_rng(sample_pct, StdRng::seed_from_u64(seed))
    }

    fn with_rng(sample_pct: f64, rng: StdRng) -> Self {
        let sample_pct = if sample_pct.is_nan() {
            1.0
        } else {
            sample_pct.clamp(0.0, 1.0)
        };
        Self {
            sample_pct,
            rng,
            ingested: 0,
            sampled_out: 0,
        }
    }

    pub fn ingested(&self) -> u64 {
        self.ingested
    }

    pub fn sampled_out(&self) -> u64 {
        self.sampled_out
    }

    pub fn ingest(
        &mut self,
        pending: &mut PendingBuffer,
        sighting: &SignatureSighting,
        now: Instant,
    ) -> IngestOutcome {
        let signature = sighting.signature.trim();
        if signature.is_empty() {
            return IngestOutcome::Rejected;
        }
        if pending.contains(signature) {
            return IngestOutcome::Duplicate;
        }
        if !self.keep_sample() {
            self.sampled_out = self.sampled_out.saturating_add(1);
            return IngestOutcome::SampledOut;
        }

        match pending.insert(signature, sighting.hint_slot, &sighting.source, now) {
            InsertOutcome::Duplicate => IngestOutcome::Duplicate,
            InsertOutcome::Inserted { evicted } => {
                self.ingested = self.ingested.saturating_add(1);
                IngestOutcome::Accepted { evicted }
            }
        }
    }

    fn keep_sample(&mut self) -> bool {
        if self.sample_pct >= 1.0 {
            return true;
        }
        if self.sample_pct <= 0.0 {
            return false;
        }
        self.rng.gen::<f64>() < self.sample_pct
    }
}
