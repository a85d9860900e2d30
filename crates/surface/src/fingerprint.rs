use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tipscan_core_types::is_noise_program;

const FINGERPRINT_LIST_LIMIT: usize = 32;

/// Field order here is the hashed byte order; do not reorder.
#[derive(Serialize)]
struct FingerprintPayload<'a> {
    #[serde(rename = "type")]
    tx_type: &'a str,
    source: &'a str,
    programs: &'a [String],
    mints: &'a [String],
}

pub fn interesting_programs(programs: &[String]) -> Vec<String> {
    programs
        .iter()
        .filter(|program| !is_noise_program(program))
        .cloned()
        .collect()
}

/// sha256 hex over `{type, source, programs[..32], mints[..32]}`.
///
/// `programs` is expected to be noise-filtered and both lists sorted.
pub fn fingerprint(
    tx_type: &str,
    source: &str,
    programs: &[String],
    mints: &[String],
) -> Result<String> {
    let payload = FingerprintPayload {
        tx_type,
        source,
        programs: &programs[..programs.len().min(FINGERPRINT_LIST_LIMIT)],
        mints: &mints[..mints.len().min(FINGERPRINT_LIST_LIMIT)],
    };
    let bytes = serde_json::to_vec(&payload).context("failed serializing fingerprint payload")?;
    Ok(sha256_hex(&bytes))
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}
