use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub system: SystemConfig,
    pub ingestion: IngestionConfig,
    pub enrichment: EnrichmentConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub env: String,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub helius_ws_url: String,
    pub commitment: String,
    pub subscribe_tip_accounts: bool,
    pub subscribe_tip_program: bool,
    /// Additional accounts or programs to watch with `logsSubscribe`.
    pub extra_mention_accounts: Vec<String>,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub sighting_channel_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            helius_ws_url: "wss://mainnet.helius-rpc.com/?api-key=REPLACE_ME".to_string(),
            commitment: "confirmed".to_string(),
            subscribe_tip_accounts: true,
            subscribe_tip_program: true,
            extra_mention_accounts: Vec::new(),
            reconnect_initial_ms: 500,
            reconnect_max_ms: 8_000,
            sighting_channel_capacity: 4_096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Bare key value, not a full URL.
    pub helius_api_key: String,
    pub enhanced_api_url: String,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,
    pub rps_limit: u64,
    pub telemetry_report_seconds: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            helius_api_key: "REPLACE_ME".to_string(),
            enhanced_api_url: "https://api-mainnet.helius-rpc.com/v0/transactions".to_string(),
            request_timeout_ms: 20_000,
            max_attempts: 6,
            retry_base_ms: 250,
            retry_max_ms: 10_000,
            retry_jitter_ms: 0,
            rps_limit: 0,
            telemetry_report_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub run_seconds: u64,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub initial_delay_ms: u64,
    pub max_missing_retries: u32,
    pub max_pending: usize,
    pub missing_retry_base_ms: u64,
    pub missing_retry_max_ms: u64,
    pub batch_failure_delay_ms: u64,
    /// Keep probability in `[0, 1]`; 1.0 keeps every sighting.
    pub ingress_sample_pct: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            run_seconds: 3_600,
            batch_size: 100,
            batch_interval_ms: 500,
            initial_delay_ms: 1_500,
            max_missing_retries: 6,
            max_pending: 50_000,
            missing_retry_base_ms: 500,
            missing_retry_max_ms: 20_000,
            batch_failure_delay_ms: 1_000,
            ingress_sample_pct: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Empty means `tip_surface_<ts>.jsonl` in the working directory.
    pub out_file: String,
    /// Empty means `tip_surface_summary_<ts>.json` in the working directory.
    pub summary_file: String,
    pub summary_every_seconds: u64,
    pub store_enhanced: bool,
    /// Row limit per summary table; 0 writes every row.
    pub summary_top_n: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            out_file: String::new(),
            summary_file: String::new(),
            summary_every_seconds: 60,
            store_enhanced: false,
            summary_top_n: 0,
        }
    }
}
