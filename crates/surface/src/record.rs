use serde_json::Value;
use std::collections::BTreeMap;
use tipscan_core_types::{
    EnrichedRecord, SightingMeta, SurfaceFields, RECORD_SCHEMA, USDC_MINT, USDT_MINT, WSOL_MINT,
};

use crate::aggregate::SurfaceObservation;
use crate::extract::{extract_surface, OwnerMintDeltas, SurfaceExtract};
use crate::fingerprint::{fingerprint, interesting_programs};

/// Log line plus, when extraction succeeded, the aggregation input.
#[derive(Debug, Clone)]
pub struct AssembledRecord {
    pub record: EnrichedRecord,
    pub observation: Option<SurfaceObservation>,
}

/// Builds the durable record for one resolved signature. Extraction failures
/// are folded into `extractionError` rather than returned.
pub fn assemble_record(
    signature: &str,
    enhanced: Value,
    meta: &SightingMeta,
    store_enhanced: bool,
) -> AssembledRecord {
    let derived = extract_surface(&enhanced).and_then(|extract| {
        let programs = interesting_programs(&extract.programs);
        let fingerprint = fingerprint(
            &extract.tx_type,
            &extract.source_category,
            &programs,
            &extract.changed_mints,
        )?;
        Ok::<_, anyhow::Error>((extract, programs, fingerprint))
    });

    let mut record = EnrichedRecord {
        schema: RECORD_SCHEMA,
        signature: signature.to_string(),
        slot: enhanced
            .get("slot")
            .and_then(Value::as_u64)
            .or(meta.hint_slot),
        timestamp: enhanced.get("timestamp").and_then(Value::as_i64),
        observed_at_ms: meta.seen_at.timestamp_millis(),
        source: meta.source.clone(),
        tx_type: loose_string(&enhanced, "type"),
        source_category: loose_string(&enhanced, "source"),
        description: enhanced
            .get("description")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        fee_payer: loose_string(&enhanced, "feePayer"),
        surface: None,
        extraction_error: None,
        enhanced: None,
    };

    let observation = match derived {
        Ok((extract, programs, fingerprint)) => {
            let observation = SurfaceObservation {
                signature: signature.to_string(),
                fingerprint: fingerprint.clone(),
                fee_payer: extract.fee_payer.clone(),
                fee: extract.fee,
                tip: extract.tip.total,
                stable: extract.best_stable.total,
                programs: programs.clone(),
                mints: extract.changed_mints.clone(),
                type_source: format!("{}:{}", extract.tx_type, extract.source_category),
            };
            record.surface = Some(surface_fields(&extract, programs, fingerprint));
            Some(observation)
        }
        Err(error) => {
            record.extraction_error = Some(format!("{error:#}"));
            None
        }
    };

    if store_enhanced {
        record.enhanced = Some(enhanced);
    }
    AssembledRecord {
        record,
        observation,
    }
}

fn surface_fields(extract: &SurfaceExtract, programs: Vec<String>, fingerprint: String) -> SurfaceFields {
    let deltas = &extract.owner_mint_deltas;
    let payer = extract.fee_payer.as_str();
    SurfaceFields {
        fee_lamports: extract.fee.to_string(),
        jito_tip_lamports: extract.tip.total.to_string(),
        jito_tip_breakdown: stringify(&extract.tip.breakdown),
        program_ids_interesting: programs,
        changed_mints: extract.changed_mints.clone(),
        fingerprint,
        owner_mint_deltas: deltas
            .iter()
            .map(|(owner, mints)| (owner.clone(), stringify(mints)))
            .collect(),
        best_stable_owner: extract.best_stable.owner.clone(),
        best_usdc_delta_raw: extract.best_stable.usdc.to_string(),
        best_usdt_delta_raw: extract.best_stable.usdt.to_string(),
        best_stable_delta_raw: extract.best_stable.total.to_string(),
        fee_payer_wsol_delta_raw: owner_mint_delta(deltas, payer, WSOL_MINT).to_string(),
        fee_payer_usdc_delta_raw: owner_mint_delta(deltas, payer, USDC_MINT).to_string(),
        fee_payer_usdt_delta_raw: owner_mint_delta(deltas, payer, USDT_MINT).to_string(),
    }
}

fn owner_mint_delta(deltas: &OwnerMintDeltas, owner: &str, mint: &str) -> i128 {
    deltas
        .get(owner)
        .and_then(|mints| mints.get(mint))
        .copied()
        .unwrap_or(0)
}

fn stringify(values: &BTreeMap<String, i128>) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(key, value)| (key.clone(), value.to_string()))
        .collect()
}

fn loose_string(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tipscan_core_types::JITO_TIP_ACCOUNTS;

    const PAYER: &str = "Payer111111111111111111111111111111111111111";
    const AMM: &str = "Amm11111111111111111111111111111111111111111";

    fn meta() -> SightingMeta {
        SightingMeta {
            seen_at: Utc.timestamp_millis_opt(1_700_000_000_123).single().expect("ts"),
            hint_slot: Some(99),
            source: "jito_tip_program:test".to_string(),
        }
    }

    fn enhanced() -> Value {
        json!({
            "signature": "sig-1",
            "type": "SWAP",
            "source": "RAYDIUM",
            "description": "swap",
            "fee": 5000,
            "feePayer": PAYER,
            "timestamp": 1_700_000_000,
            "instructions": [
                {"programId": "ComputeBudget111111111111111111111111111111", "innerInstructions": []},
                {"programId": AMM, "innerInstructions": [
                    {"programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA"}
                ]}
            ],
            "accountData": [
                {"account": JITO_TIP_ACCOUNTS[0], "nativeBalanceChange": 10_000, "tokenBalanceChanges": []},
                {"account": PAYER, "nativeBalanceChange": -15_000, "tokenBalanceChanges": [
                    {"userAccount": PAYER, "mint": USDC_MINT, "rawTokenAmount": {"tokenAmount": "2500000", "decimals": 6}},
                    {"userAccount": PAYER, "mint": WSOL_MINT, "rawTokenAmount": {"tokenAmount": "-1000000000", "decimals": 9}}
                ]}
            ]
        })
    }

    #[test]
    fn resolved_record_carries_surface_fields_and_observation() {
        let assembled = assemble_record("sig-1", enhanced(), &meta(), false);
        let record = &assembled.record;
        assert_eq!(record.slot, Some(99));
        assert_eq!(record.observed_at_ms, 1_700_000_000_123);
        assert!(record.enhanced.is_none());
        assert!(record.extraction_error.is_none());

        let surface = record.surface.as_ref().expect("surface fields");
        assert_eq!(surface.jito_tip_lamports, "10000");
        assert_eq!(surface.program_ids_interesting, vec![AMM.to_string()]);
        assert_eq!(surface.best_stable_owner.as_deref(), Some(PAYER));
        assert_eq!(surface.best_usdc_delta_raw, "2500000");
        assert_eq!(surface.fee_payer_wsol_delta_raw, "-1000000000");
        assert_eq!(surface.fee_payer_usdt_delta_raw, "0");

        let observation = assembled.observation.expect("observation");
        assert_eq!(observation.fingerprint, surface.fingerprint);
        assert_eq!(observation.tip, 10_000);
        assert_eq!(observation.stable, 2_500_000);
        assert_eq!(observation.type_source, "SWAP:RAYDIUM");
    }

    #[test]
    fn record_slot_wins_over_hint_and_raw_payload_is_optional() {
        let mut payload = enhanced();
        payload["slot"] = json!(1234);
        let assembled = assemble_record("sig-1", payload, &meta(), true);
        assert_eq!(assembled.record.slot, Some(1234));
        assert_eq!(
            assembled.record.enhanced.as_ref().and_then(|value| value["type"].as_str()),
            Some("SWAP")
        );
    }

    #[test]
    fn malformed_record_is_logged_without_observation() -> anyhow::Result<()> {
        let mut payload = enhanced();
        payload["accountData"] = json!({"not": "a list"});
        let assembled = assemble_record("sig-1", payload, &meta(), false);
        assert!(assembled.observation.is_none());
        assert!(assembled.record.surface.is_none());
        assert_eq!(assembled.record.tx_type, "SWAP");

        let line = serde_json::to_value(&assembled.record)?;
        assert_eq!(line["schema"], RECORD_SCHEMA);
        assert!(line["extractionError"]
            .as_str()
            .is_some_and(|error| error.contains("accountData")));
        assert!(line.get("fingerprint").is_none());
        Ok(())
    }

    #[test]
    fn serialized_record_flattens_surface_fields() -> anyhow::Result<()> {
        let assembled = assemble_record("sig-1", enhanced(), &meta(), false);
        let line = serde_json::to_value(&assembled.record)?;
        assert_eq!(line["type"], "SWAP");
        assert_eq!(line["jitoTipLamports"], "10000");
        assert_eq!(line["ownerMintDeltas"][PAYER][USDC_MINT], "2500000");
        assert!(line.get("surface").is_none());
        Ok(())
    }
}
