use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::env_parsing::{
    normalize_config, parse_csv_list, parse_env_bool, parse_env_value, validate_config,
};
use super::AppConfig;

pub fn load_from_path(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

/// Loads the TOML file (falling back to defaults when the default path does
/// not exist), applies `TIPSCAN_*` overrides, clamps and validates.
pub fn load_from_env_or_default(default_path: &Path) -> Result<(AppConfig, PathBuf)> {
    let explicit = env::var("TIPSCAN_CONFIG").ok().map(PathBuf::from);
    let configured = explicit
        .clone()
        .unwrap_or_else(|| default_path.to_path_buf());
    let mut config = if explicit.is_none() && !configured.exists() {
        AppConfig::default()
    } else {
        load_from_path(&configured)?
    };

    apply_env_overrides(&mut config)?;
    normalize_config(&mut config);
    validate_config(&config)?;
    Ok((config, configured))
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(level) = env::var("TIPSCAN_LOG_LEVEL") {
        config.system.log_level = level;
    }
    if let Some(log_json) = env::var("TIPSCAN_LOG_JSON").ok().and_then(parse_env_bool) {
        config.system.log_json = log_json;
    }

    if let Ok(ws_url) = env::var("TIPSCAN_HELIUS_WSS_URL") {
        config.ingestion.helius_ws_url = ws_url.trim().to_string();
    }
    if let Ok(commitment) = env::var("TIPSCAN_COMMITMENT") {
        let trimmed = commitment.trim();
        if !trimmed.is_empty() {
            config.ingestion.commitment = trimmed.to_string();
        }
    }
    if let Ok(accounts_csv) = env::var("TIPSCAN_EXTRA_MENTION_ACCOUNTS") {
        let values = parse_csv_list(&accounts_csv);
        if !values.is_empty() {
            config.ingestion.extra_mention_accounts = values;
        }
    }

    if let Ok(api_key) = env::var("TIPSCAN_HELIUS_API_KEY") {
        config.enrichment.helius_api_key = api_key.trim().to_string();
    }
    if let Ok(url) = env::var("TIPSCAN_ENHANCED_API_URL") {
        config.enrichment.enhanced_api_url = url.trim().to_string();
    }
    if let Some(rps_limit) = parse_env_value::<u64>("TIPSCAN_ENRICHMENT_RPS_LIMIT") {
        config.enrichment.rps_limit = rps_limit;
    }

    if let Some(run_seconds) = parse_env_value::<u64>("TIPSCAN_RUN_SECONDS") {
        config.pipeline.run_seconds = run_seconds;
    }
    if let Some(batch_size) = parse_env_value::<usize>("TIPSCAN_BATCH_SIZE") {
        config.pipeline.batch_size = batch_size;
    }
    if let Some(batch_interval_ms) = parse_env_value::<u64>("TIPSCAN_BATCH_INTERVAL_MS") {
        config.pipeline.batch_interval_ms = batch_interval_ms;
    }
    if let Some(initial_delay_ms) = parse_env_value::<u64>("TIPSCAN_INITIAL_DELAY_MS") {
        config.pipeline.initial_delay_ms = initial_delay_ms;
    }
    if let Some(max_missing_retries) = parse_env_value::<u32>("TIPSCAN_MAX_MISSING_RETRIES") {
        config.pipeline.max_missing_retries = max_missing_retries;
    }
    if let Some(max_pending) = parse_env_value::<usize>("TIPSCAN_MAX_PENDING") {
        config.pipeline.max_pending = max_pending;
    }
    if let Ok(raw) = env::var("TIPSCAN_INGRESS_SAMPLE_PCT") {
        let sample_pct = raw.trim().parse::<f64>().with_context(|| {
            format!("TIPSCAN_INGRESS_SAMPLE_PCT is not a number: {}", raw.trim())
        })?;
        config.pipeline.ingress_sample_pct = sample_pct;
    }

    if let Ok(out_file) = env::var("TIPSCAN_OUT_FILE") {
        config.output.out_file = out_file.trim().to_string();
    }
    if let Ok(summary_file) = env::var("TIPSCAN_SUMMARY_FILE") {
        config.output.summary_file = summary_file.trim().to_string();
    }
    if let Some(summary_every_seconds) =
        parse_env_value::<u64>("TIPSCAN_SUMMARY_EVERY_SECONDS")
    {
        config.output.summary_every_seconds = summary_every_seconds;
    }
    if let Some(store_enhanced) = env::var("TIPSCAN_STORE_ENHANCED")
        .ok()
        .and_then(parse_env_bool)
    {
        config.output.store_enhanced = store_enhanced;
    }
    if let Some(summary_top_n) = parse_env_value::<usize>("TIPSCAN_SUMMARY_TOP_N") {
        config.output.summary_top_n = summary_top_n;
    }

    Ok(())
}
