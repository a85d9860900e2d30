use anyhow::{anyhow, Result};
use std::env;
use std::str::FromStr;

use super::AppConfig;

pub const BATCH_SIZE_MAX: usize = 250;
pub const BATCH_INTERVAL_MIN_MS: u64 = 100;

pub(crate) fn parse_env_bool(value: String) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_env_value<T: FromStr>(name: &str) -> Option<T> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

pub(crate) fn parse_csv_list(csv: &str) -> Vec<String> {
    csv.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .split(',')
        .map(str::trim)
        .map(|value| value.trim_matches('"').trim_matches('\''))
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Clamps knobs into the ranges the pipeline and the enhanced endpoint accept.
pub(crate) fn normalize_config(config: &mut AppConfig) {
    let pipeline = &mut config.pipeline;
    pipeline.batch_size = pipeline.batch_size.clamp(1, BATCH_SIZE_MAX);
    pipeline.batch_interval_ms = pipeline.batch_interval_ms.max(BATCH_INTERVAL_MIN_MS);
    pipeline.max_pending = pipeline.max_pending.max(1);
    pipeline.missing_retry_base_ms = pipeline.missing_retry_base_ms.max(1);
    pipeline.missing_retry_max_ms = pipeline
        .missing_retry_max_ms
        .max(pipeline.missing_retry_base_ms);

    let enrichment = &mut config.enrichment;
    enrichment.max_attempts = enrichment.max_attempts.max(1);
    enrichment.request_timeout_ms = enrichment.request_timeout_ms.max(500);
    enrichment.retry_base_ms = enrichment.retry_base_ms.max(1);
    enrichment.retry_max_ms = enrichment.retry_max_ms.max(enrichment.retry_base_ms);

    let ingestion = &mut config.ingestion;
    ingestion.reconnect_initial_ms = ingestion.reconnect_initial_ms.max(100);
    ingestion.reconnect_max_ms = ingestion
        .reconnect_max_ms
        .max(ingestion.reconnect_initial_ms);
    ingestion.sighting_channel_capacity = ingestion.sighting_channel_capacity.max(16);

    config.output.summary_every_seconds = config.output.summary_every_seconds.max(1);
}

pub(crate) fn validate_config(config: &AppConfig) -> Result<()> {
    let api_key = config.enrichment.helius_api_key.trim();
    if api_key.is_empty() || api_key.contains("REPLACE_ME") {
        return Err(anyhow!(
            "enrichment.helius_api_key is required (set TIPSCAN_HELIUS_API_KEY to the bare key, not a URL)"
        ));
    }
    if api_key.starts_with("http://") || api_key.starts_with("https://") {
        return Err(anyhow!(
            "enrichment.helius_api_key must be the bare key value, got a URL"
        ));
    }

    let enhanced_url = config.enrichment.enhanced_api_url.trim();
    if !(enhanced_url.starts_with("http://") || enhanced_url.starts_with("https://")) {
        return Err(anyhow!(
            "enrichment.enhanced_api_url must use an explicit http(s):// scheme: {}",
            enhanced_url
        ));
    }

    let ws_url = config.ingestion.helius_ws_url.trim();
    if ws_url.is_empty() || ws_url.contains("REPLACE_ME") {
        return Err(anyhow!(
            "ingestion.helius_ws_url is required (set TIPSCAN_HELIUS_WSS_URL)"
        ));
    }
    if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
        return Err(anyhow!(
            "ingestion.helius_ws_url must use ws:// or wss://: {}",
            ws_url
        ));
    }

    if !config.ingestion.subscribe_tip_accounts
        && !config.ingestion.subscribe_tip_program
        && config.ingestion.extra_mention_accounts.is_empty()
    {
        return Err(anyhow!(
            "no log subscriptions configured (enable subscribe_tip_accounts / subscribe_tip_program or set extra_mention_accounts)"
        ));
    }

    match config.ingestion.commitment.trim() {
        "processed" | "confirmed" | "finalized" => {}
        other => {
            return Err(anyhow!(
                "ingestion.commitment must be processed|confirmed|finalized, got {other}"
            ))
        }
    }

    if config.pipeline.run_seconds == 0 {
        return Err(anyhow!("pipeline.run_seconds must be positive"));
    }

    // a fraction, not a percentage: 50 would silently keep everything
    let sample_pct = config.pipeline.ingress_sample_pct;
    if !(0.0..=1.0).contains(&sample_pct) {
        return Err(anyhow!(
            "pipeline.ingress_sample_pct must be a keep fraction in 0..=1 (0.5 keeps half), got {sample_pct}"
        ));
    }

    Ok(())
}
