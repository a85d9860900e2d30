use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

const EXAMPLE_SIGNATURES_MAX: usize = 5;
const EXAMPLE_LIST_MAX: usize = 16;

/// One aggregatable transaction, already reduced to what the tables need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceObservation {
    pub signature: String,
    pub fingerprint: String,
    pub fee_payer: String,
    pub fee: i128,
    pub tip: i128,
    pub stable: i128,
    /// Noise-filtered, sorted.
    pub programs: Vec<String>,
    pub mints: Vec<String>,
    pub type_source: String,
}

impl SurfaceObservation {
    pub fn has_economic_evidence(&self) -> bool {
        self.stable > 0 || self.tip > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Totals {
    count: u64,
    total_fee: i128,
    total_tip: i128,
    total_stable: i128,
    max_stable: i128,
}

impl Totals {
    fn bump(&mut self, observation: &SurfaceObservation) {
        self.count = self.count.saturating_add(1);
        self.total_fee = self.total_fee.saturating_add(observation.fee);
        self.total_tip = self.total_tip.saturating_add(observation.tip);
        self.total_stable = self.total_stable.saturating_add(observation.stable);
        if observation.stable > self.max_stable {
            self.max_stable = observation.stable;
        }
    }
}

#[derive(Debug, Clone)]
struct FingerprintStats {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    totals: Totals,
    fee_payers: HashSet<String>,
    example_signatures: Vec<String>,
    example_programs: Vec<String>,
    example_mints: Vec<String>,
    example_type_source: String,
}

impl FingerprintStats {
    fn new(observation: &SurfaceObservation, now: DateTime<Utc>) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            totals: Totals::default(),
            fee_payers: HashSet::new(),
            example_signatures: Vec::with_capacity(EXAMPLE_SIGNATURES_MAX),
            example_programs: Vec::new(),
            example_mints: Vec::new(),
            example_type_source: observation.type_source.clone(),
        }
    }

    fn bump(&mut self, observation: &SurfaceObservation, now: DateTime<Utc>) {
        self.last_seen = now;
        self.totals.bump(observation);
        if !observation.fee_payer.is_empty() {
            self.fee_payers.insert(observation.fee_payer.clone());
        }
        if self.example_signatures.len() < EXAMPLE_SIGNATURES_MAX {
            self.example_signatures.push(observation.signature.clone());
        }
        if self.example_programs.is_empty() {
            self.example_programs = head(&observation.programs, EXAMPLE_LIST_MAX);
        }
        if self.example_mints.is_empty() {
            self.example_mints = head(&observation.mints, EXAMPLE_LIST_MAX);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintRow {
    pub fingerprint: String,
    pub first_seen: String,
    pub last_seen: String,
    pub count: u64,
    pub unique_fee_payers: usize,
    pub total_fee_lamports: String,
    pub total_jito_tip_lamports: String,
    pub total_stable_raw: String,
    pub max_stable_raw: String,
    pub example_type_source: String,
    pub example_signatures: Vec<String>,
    pub example_programs: Vec<String>,
    pub example_mints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramRow {
    pub program_id: String,
    pub count: u64,
    pub total_fee_lamports: String,
    pub total_jito_tip_lamports: String,
    pub total_stable_raw: String,
    pub max_stable_raw: String,
}

/// Running per-fingerprint and per-program tables. Entries are never removed.
#[derive(Debug, Default)]
pub struct SurfaceAggregator {
    fingerprints: HashMap<String, FingerprintStats>,
    programs: HashMap<String, Totals>,
}

impl SurfaceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fingerprint_count(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Folds one observation into both tables. Observations without a tip or
    /// a positive stable delta are ignored; returns whether anything changed.
    pub fn observe(&mut self, observation: &SurfaceObservation, now: DateTime<Utc>) -> bool {
        if !observation.has_economic_evidence() {
            return false;
        }
        self.fingerprints
            .entry(observation.fingerprint.clone())
            .or_insert_with(|| FingerprintStats::new(observation, now))
            .bump(observation, now);
        for program in &observation.programs {
            self.programs
                .entry(program.clone())
                .or_default()
                .bump(observation);
        }
        true
    }

    /// Sorted by max stable value, then count; `top_n == 0` returns all rows.
    pub fn fingerprint_rows(&self, top_n: usize) -> Vec<FingerprintRow> {
        let mut entries: Vec<(&String, &FingerprintStats)> = self.fingerprints.iter().collect();
        entries.sort_by(|(left_key, left), (right_key, right)| {
            right
                .totals
                .max_stable
                .cmp(&left.totals.max_stable)
                .then(right.totals.count.cmp(&left.totals.count))
                .then_with(|| left_key.cmp(right_key))
        });
        entries
            .into_iter()
            .take(row_limit(top_n, self.fingerprints.len()))
            .map(|(fingerprint, stats)| FingerprintRow {
                fingerprint: fingerprint.clone(),
                first_seen: stats.first_seen.to_rfc3339_opts(SecondsFormat::Millis, true),
                last_seen: stats.last_seen.to_rfc3339_opts(SecondsFormat::Millis, true),
                count: stats.totals.count,
                unique_fee_payers: stats.fee_payers.len(),
                total_fee_lamports: stats.totals.total_fee.to_string(),
                total_jito_tip_lamports: stats.totals.total_tip.to_string(),
                total_stable_raw: stats.totals.total_stable.to_string(),
                max_stable_raw: stats.totals.max_stable.to_string(),
                example_type_source: stats.example_type_source.clone(),
                example_signatures: stats.example_signatures.clone(),
                example_programs: stats.example_programs.clone(),
                example_mints: stats.example_mints.clone(),
            })
            .collect()
    }

    /// Sorted by total stable value, then count; `top_n == 0` returns all rows.
    pub fn program_rows(&self, top_n: usize) -> Vec<ProgramRow> {
        let mut entries: Vec<(&String, &Totals)> = self.programs.iter().collect();
        entries.sort_by(|(left_key, left), (right_key, right)| {
            right
                .total_stable
                .cmp(&left.total_stable)
                .then(right.count.cmp(&left.count))
                .then_with(|| left_key.cmp(right_key))
        });
        entries
            .into_iter()
            .take(row_limit(top_n, self.programs.len()))
            .map(|(program_id, totals)| ProgramRow {
                program_id: program_id.clone(),
                count: totals.count,
                total_fee_lamports: totals.total_fee.to_string(),
                total_jito_tip_lamports: totals.total_tip.to_string(),
                total_stable_raw: totals.total_stable.to_string(),
                max_stable_raw: totals.max_stable.to_string(),
            })
            .collect()
    }
}

fn row_limit(top_n: usize, len: usize) -> usize {
    if top_n == 0 {
        len
    } else {
        top_n.min(len)
    }
}

fn head(values: &[String], limit: usize) -> Vec<String> {
    values.iter().take(limit).cloned().collect()
}
