use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
pub const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";

/// Mainnet Jito tip accounts. Positive lamport changes on these count as tips.
pub const JITO_TIP_ACCOUNTS: [&str; 8] = [
    "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
    "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
    "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
    "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
    "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
    "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
    "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
];

pub const JITO_TIP_PAYMENT_PROGRAM: &str = "T1pyyaTNZsKv2WcRAB8oVnk93mLJw2XzjtVYqCsaHqt";

/// Programs present in nearly every transaction; excluded from fingerprints
/// and per-program stats.
pub const NOISE_PROGRAMS: [&str; 5] = [
    "11111111111111111111111111111111",
    "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
    "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL",
    "ComputeBudget111111111111111111111111111111",
    "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr",
];

pub const RECORD_SCHEMA: &str = "tip_surface_record_v1";
pub const SUMMARY_SCHEMA: &str = "tip_surface_summary_v1";

pub fn is_jito_tip_account(account: &str) -> bool {
    JITO_TIP_ACCOUNTS.contains(&account)
}

pub fn is_noise_program(program_id: &str) -> bool {
    NOISE_PROGRAMS.contains(&program_id)
}

/// One signature sighting delivered by a log subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSighting {
    pub signature: String,
    pub hint_slot: Option<u64>,
    pub source: String,
}

impl SignatureSighting {
    pub fn new(signature: impl Into<String>, hint_slot: Option<u64>, source: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            hint_slot,
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCounters {
    pub ingested: u64,
    pub sampled_out: u64,
    pub evicted: u64,
    pub processed: u64,
    pub dropped_missing: u64,
    pub enhanced_missing: u64,
    pub enhanced_rate_limited: u64,
    pub enhanced_other_errors: u64,
    pub log_write_errors: u64,
    pub pending: usize,
}

/// Normalized output of one enriched signature, one line of the durable log.
///
/// Raw amounts are decimal strings so that 128-bit values survive JSON
/// consumers that parse numbers as doubles.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedRecord {
    pub schema: &'static str,
    pub signature: String,
    pub slot: Option<u64>,
    pub timestamp: Option<i64>,
    pub observed_at_ms: i64,
    pub source: String,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub source_category: String,
    pub description: Option<String>,
    pub fee_payer: String,
    #[serde(flatten)]
    pub surface: Option<SurfaceFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceFields {
    pub fee_lamports: String,
    pub jito_tip_lamports: String,
    pub jito_tip_breakdown: BTreeMap<String, String>,
    pub program_ids_interesting: Vec<String>,
    pub changed_mints: Vec<String>,
    pub fingerprint: String,
    pub owner_mint_deltas: BTreeMap<String, BTreeMap<String, String>>,
    pub best_stable_owner: Option<String>,
    pub best_usdc_delta_raw: String,
    pub best_usdt_delta_raw: String,
    pub best_stable_delta_raw: String,
    pub fee_payer_wsol_delta_raw: String,
    pub fee_payer_usdc_delta_raw: String,
    pub fee_payer_usdt_delta_raw: String,
}

/// Bookkeeping carried from the pending buffer into record assembly.
#[derive(Debug, Clone)]
pub struct SightingMeta {
    pub seen_at: DateTime<Utc>,
    pub hint_slot: Option<u64>,
    pub source: String,
}
