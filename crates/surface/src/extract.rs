use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tipscan_core_types::{is_jito_tip_account, USDC_MINT, USDT_MINT};

pub type OwnerMintDeltas = BTreeMap<String, BTreeMap<String, i128>>;

const NO_ITEMS: &[Value] = &[];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TipSummary {
    pub total: i128,
    pub breakdown: BTreeMap<String, i128>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StableDelta {
    pub owner: Option<String>,
    pub usdc: i128,
    pub usdt: i128,
    pub total: i128,
}

/// Everything derived from one enhanced transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceExtract {
    pub tx_type: String,
    pub source_category: String,
    pub fee_payer: String,
    pub fee: i128,
    pub programs: Vec<String>,
    pub changed_mints: Vec<String>,
    pub tip: TipSummary,
    pub owner_mint_deltas: OwnerMintDeltas,
    pub best_stable: StableDelta,
}

pub fn extract_surface(record: &Value) -> Result<SurfaceExtract> {
    if !record.is_object() {
        return Err(anyhow!("enhanced record is not an object"));
    }
    let owner_mint_deltas = owner_mint_deltas(record)?;
    let best_stable = best_stable_delta(&owner_mint_deltas);
    Ok(SurfaceExtract {
        tx_type: string_field(record, "type"),
        source_category: string_field(record, "source"),
        fee_payer: string_field(record, "feePayer"),
        fee: integer_field(record, "fee")?.unwrap_or(0),
        programs: programs(record)?,
        changed_mints: changed_mints(record)?,
        tip: jito_tip(record)?,
        owner_mint_deltas,
        best_stable,
    })
}

/// Top-level and inner instruction program ids, sorted and unique.
pub fn programs(record: &Value) -> Result<Vec<String>> {
    let mut programs = BTreeSet::new();
    for instruction in list_field(record, "instructions")? {
        collect_str(&mut programs, instruction, "programId");
        for inner in list_field(instruction, "innerInstructions")? {
            collect_str(&mut programs, inner, "programId");
        }
    }
    Ok(programs.into_iter().collect())
}

pub fn changed_mints(record: &Value) -> Result<Vec<String>> {
    let mut mints = BTreeSet::new();
    for account in list_field(record, "accountData")? {
        for change in list_field(account, "tokenBalanceChanges")? {
            collect_str(&mut mints, change, "mint");
        }
    }
    for transfer in list_field(record, "tokenTransfers")? {
        collect_str(&mut mints, transfer, "mint");
    }

    if let Some(swap) = record
        .get("events")
        .and_then(|events| events.get("swap"))
        .filter(|swap| !swap.is_null())
    {
        collect_swap_mints(&mut mints, swap)?;
        for inner in list_field(swap, "innerSwaps")? {
            collect_swap_mints(&mut mints, inner)?;
        }
    }
    Ok(mints.into_iter().collect())
}

fn collect_swap_mints(mints: &mut BTreeSet<String>, swap: &Value) -> Result<()> {
    for key in ["tokenInputs", "tokenOutputs", "tokenFees"] {
        for leg in list_field(swap, key)? {
            collect_str(mints, leg, "mint");
        }
    }
    Ok(())
}

/// Positive lamport changes on the Jito tip accounts.
pub fn jito_tip(record: &Value) -> Result<TipSummary> {
    let mut tip = TipSummary::default();
    for account in list_field(record, "accountData")? {
        let Some(address) = account.get("account").and_then(Value::as_str) else {
            continue;
        };
        if !is_jito_tip_account(address) {
            continue;
        }
        let change = integer_field(account, "nativeBalanceChange")?.unwrap_or(0);
        if change > 0 {
            let slot = tip.breakdown.entry(address.to_string()).or_insert(0);
            *slot = slot.saturating_add(change);
            tip.total = tip.total.saturating_add(change);
        }
    }
    Ok(tip)
}

/// Sums raw token amount changes per `userAccount` and mint.
pub fn owner_mint_deltas(record: &Value) -> Result<OwnerMintDeltas> {
    let mut deltas = OwnerMintDeltas::new();
    for account in list_field(record, "accountData")? {
        for change in list_field(account, "tokenBalanceChanges")? {
            let owner = change
                .get("userAccount")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mint = change.get("mint").and_then(Value::as_str).unwrap_or_default();
            if owner.is_empty() || mint.is_empty() {
                continue;
            }
            let Some(raw) = change.get("rawTokenAmount") else {
                continue;
            };
            let Some(amount) = integer_field(raw, "tokenAmount")? else {
                continue;
            };
            let entry = deltas
                .entry(owner.to_string())
                .or_default()
                .entry(mint.to_string())
                .or_insert(0);
            *entry = entry.saturating_add(amount);
        }
    }
    Ok(deltas)
}

/// Owner with the largest positive USDC + USDT sum. Owners are visited in
/// sorted order and only a strictly larger sum replaces the current best.
pub fn best_stable_delta(deltas: &OwnerMintDeltas) -> StableDelta {
    let mut best = StableDelta::default();
    for (owner, mints) in deltas {
        let usdc = mints.get(USDC_MINT).copied().unwrap_or(0);
        let usdt = mints.get(USDT_MINT).copied().unwrap_or(0);
        let total = usdc.saturating_add(usdt);
        if total > best.total {
            best = StableDelta {
                owner: Some(owner.clone()),
                usdc,
                usdt,
                total,
            };
        }
    }
    best
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn collect_str(set: &mut BTreeSet<String>, value: &Value, key: &str) {
    if let Some(text) = value.get(key).and_then(Value::as_str) {
        if !text.is_empty() {
            set.insert(text.to_string());
        }
    }
}

/// Absent or null reads as an empty list; any other non-array is malformed.
fn list_field<'a>(value: &'a Value, key: &str) -> Result<&'a [Value]> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(NO_ITEMS),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(anyhow!("{key} is not an array")),
    }
}

/// Integers may arrive as JSON numbers or decimal strings.
fn integer_field(value: &Value, key: &str) -> Result<Option<i128>> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => {
            if let Some(signed) = number.as_i64() {
                return Ok(Some(i128::from(signed)));
            }
            if let Some(unsigned) = number.as_u64() {
                return Ok(Some(i128::from(unsigned)));
            }
            match number.as_f64() {
                Some(float) if float.is_finite() && float.fract() == 0.0 && float.abs() < 1e30 => {
                    Ok(Some(float as i128))
                }
                _ => Err(anyhow!("{key} is not an integer: {number}")),
            }
        }
        Some(Value::String(text)) => text
            .trim()
            .parse::<i128>()
            .map(Some)
            .map_err(|_| anyhow!("{key} is not an integer: {text:?}")),
        Some(other) => Err(anyhow!("{key} is not an integer: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tipscan_core_types::JITO_TIP_ACCOUNTS;

    const OWNER_A: &str = "OwnerA1111111111111111111111111111111111111";
    const MINT_X: &str = "MintX111111111111111111111111111111111111111";
    const MINT_Y: &str = "MintY111111111111111111111111111111111111111";

    fn token_change(owner: &str, mint: &str, amount: &str) -> Value {
        json!({
            "userAccount": owner,
            "tokenAccount": format!("{owner}-ata"),
            "mint": mint,
            "rawTokenAmount": {"tokenAmount": amount, "decimals": 6}
        })
    }

    fn fixture() -> Value {
        json!({
            "signature": "sig-fixture",
            "type": "SWAP",
            "source": "JUPITER",
            "fee": 5000,
            "feePayer": OWNER_A,
            "slot": 300,
            "timestamp": 1_700_000_000,
            "instructions": [
                {
                    "programId": "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4",
                    "innerInstructions": [
                        {"programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA"},
                        {"programId": "whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc"}
                    ]
                },
                {"programId": "11111111111111111111111111111111", "innerInstructions": []}
            ],
            "accountData": [
                {
                    "account": OWNER_A,
                    "nativeBalanceChange": -6000,
                    "tokenBalanceChanges": [
                        token_change(OWNER_A, MINT_X, "-100"),
                        token_change(OWNER_A, MINT_Y, "50")
                    ]
                },
                {
                    "account": JITO_TIP_ACCOUNTS[0],
                    "nativeBalanceChange": 1000,
                    "tokenBalanceChanges": []
                }
            ],
            "tokenTransfers": [{"mint": MINT_X, "tokenAmount": 0.0001}],
            "events": {}
        })
    }

    #[test]
    fn fixture_deltas_tip_and_stable() -> Result<()> {
        let surface = extract_surface(&fixture())?;

        let mut expected = OwnerMintDeltas::new();
        expected.insert(
            OWNER_A.to_string(),
            BTreeMap::from([(MINT_X.to_string(), -100), (MINT_Y.to_string(), 50)]),
        );
        assert_eq!(surface.owner_mint_deltas, expected);
        assert_eq!(surface.tip.total, 1000);
        assert_eq!(surface.tip.breakdown[JITO_TIP_ACCOUNTS[0]], 1000);
        assert_eq!(surface.best_stable, StableDelta::default());
        assert_eq!(surface.fee, 5000);
        assert_eq!(surface.fee_payer, OWNER_A);
        assert_eq!(surface.slot, Some(300));
        assert_eq!(surface.changed_mints, vec![MINT_X.to_string(), MINT_Y.to_string()]);
        assert_eq!(surface.programs.len(), 4);
        Ok(())
    }

    #[test]
    fn negative_tip_account_change_is_not_a_tip() -> Result<()> {
        let record = json!({
            "accountData": [
                {"account": JITO_TIP_ACCOUNTS[1], "nativeBalanceChange": -10},
                {"account": "NotATipAccount", "nativeBalanceChange": 99}
            ]
        });
        let tip = jito_tip(&record)?;
        assert_eq!(tip.total, 0);
        assert!(tip.breakdown.is_empty());
        Ok(())
    }

    #[test]
    fn best_stable_prefers_largest_and_keeps_first_on_tie() {
        let mut deltas = OwnerMintDeltas::new();
        deltas.insert(
            "owner-b".to_string(),
            BTreeMap::from([(USDC_MINT.to_string(), 70), (USDT_MINT.to_string(), 30)]),
        );
        deltas.insert(
            "owner-a".to_string(),
            BTreeMap::from([(USDT_MINT.to_string(), 100)]),
        );
        deltas.insert(
            "owner-c".to_string(),
            BTreeMap::from([(USDC_MINT.to_string(), -500)]),
        );
        let best = best_stable_delta(&deltas);
        assert_eq!(best.owner.as_deref(), Some("owner-a"));
        assert_eq!(best.usdt, 100);
        assert_eq!(best.total, 100);
    }

    #[test]
    fn changed_mints_include_swap_events_and_inner_swaps() -> Result<()> {
        let record = json!({
            "events": {
                "swap": {
                    "tokenInputs": [{"mint": "in-mint"}],
                    "tokenOutputs": [{"mint": "out-mint"}],
                    "tokenFees": [{"mint": "fee-mint"}],
                    "innerSwaps": [
                        {"tokenInputs": [{"mint": "inner-in"}], "tokenOutputs": null}
                    ]
                }
            }
        });
        assert_eq!(
            changed_mints(&record)?,
            vec!["fee-mint", "in-mint", "inner-in", "out-mint"]
        );
        Ok(())
    }

    #[test]
    fn token_changes_without_owner_or_amount_are_skipped() -> Result<()> {
        let record = json!({
            "accountData": [{
                "tokenBalanceChanges": [
                    {"mint": MINT_X, "rawTokenAmount": {"tokenAmount": "5"}},
                    {"userAccount": OWNER_A, "mint": MINT_X},
                    {"userAccount": OWNER_A, "mint": MINT_X, "rawTokenAmount": {"tokenAmount": "7"}},
                    {"userAccount": OWNER_A, "mint": MINT_X, "rawTokenAmount": {"tokenAmount": 3}}
                ]
            }]
        });
        let deltas = owner_mint_deltas(&record)?;
        assert_eq!(deltas[OWNER_A][MINT_X], 10);
        Ok(())
    }

    #[test]
    fn amounts_beyond_u64_stay_exact() -> Result<()> {
        let record = json!({
            "accountData": [{
                "tokenBalanceChanges": [
                    token_change(OWNER_A, USDC_MINT, "18446744073709551615"),
                    token_change(OWNER_A, USDC_MINT, "18446744073709551615")
                ]
            }]
        });
        let deltas = owner_mint_deltas(&record)?;
        assert_eq!(deltas[OWNER_A][USDC_MINT], 36_893_488_147_419_103_230);
        assert_eq!(best_stable_delta(&deltas).total, 36_893_488_147_419_103_230);
        Ok(())
    }

    #[test]
    fn malformed_shapes_are_extraction_errors() {
        assert!(extract_surface(&json!(["not", "an", "object"])).is_err());
        assert!(extract_surface(&json!({"accountData": {"account": "x"}})).is_err());
        assert!(extract_surface(&json!({"instructions": "oops"})).is_err());
        assert!(extract_surface(&json!({"fee": "five"})).is_err());
        assert!(extract_surface(&json!({"fee": 1.5})).is_err());
        assert!(extract_surface(&json!({
            "accountData": [{"account": JITO_TIP_ACCOUNTS[0], "nativeBalanceChange": "lots"}]
        }))
        .is_err());
        assert!(extract_surface(&json!({
            "accountData": [{"tokenBalanceChanges": [
                {"userAccount": "o", "mint": "m", "rawTokenAmount": {"tokenAmount": "1e3"}}
            ]}]
        }))
        .is_err());
    }

    #[test]
    fn missing_optional_fields_default_cleanly() -> Result<()> {
        let surface = extract_surface(&json!({"signature": "sig-bare"}))?;
        assert!(surface.programs.is_empty());
        assert!(surface.changed_mints.is_empty());
        assert_eq!(surface.fee, 0);
        assert_eq!(surface.tip, TipSummary::default());
        assert!(surface.fee_payer.is_empty());
        Ok(())
    }
}
