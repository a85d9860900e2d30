use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tipscan_config::{EnrichmentConfig, IngestionConfig};
use tipscan_core_types::{SignatureSighting, JITO_TIP_ACCOUNTS, JITO_TIP_PAYMENT_PROGRAM};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;

mod core;
mod helius_parser;
mod helius_pipeline;
mod rate_limit;
mod telemetry;

use self::core::{compute_retry_delay, parse_retry_after, sleep_with_backoff};
use self::helius_pipeline::{fetch_enhanced_with_retries, ws_reader_loop};
use self::rate_limit::TokenBucketLimiter;
use self::telemetry::{EnrichmentTelemetry, SubscriptionTelemetry};

pub use self::telemetry::EnrichmentTelemetrySnapshot;

type HeliusWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WS_IDLE_TIMEOUT_SECS: u64 = 45;
const TELEMETRY_SAMPLE_CAPACITY: usize = 4096;

/// Outcome of one enrichment call: resolved records keyed by signature, plus
/// the requested signatures the endpoint left out. `rate_limited` counts the
/// 429 responses retried through on the way.
#[derive(Debug, Clone, Default)]
pub struct EnrichedBatch {
    pub records: HashMap<String, Value>,
    pub missing: Vec<String>,
    pub rate_limited: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentErrorKind {
    RateLimited,
    Transport,
    Server,
    Terminal,
}

impl EnrichmentErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Transport => "transport",
            Self::Server => "server",
            Self::Terminal => "terminal",
        }
    }
}

/// Batch-level failure, classified by the cause of the last attempt.
/// `rate_limited` counts every 429 seen across the attempts, the last included.
#[derive(Debug)]
pub struct EnrichmentError {
    pub kind: EnrichmentErrorKind,
    pub error: anyhow::Error,
    pub rate_limited: u64,
}

impl EnrichmentError {
    pub fn new(kind: EnrichmentErrorKind, error: anyhow::Error) -> Self {
        Self {
            kind,
            error,
            rate_limited: u64::from(kind == EnrichmentErrorKind::RateLimited),
        }
    }

    pub fn with_rate_limited(mut self, rate_limited: u64) -> Self {
        self.rate_limited = rate_limited;
        self
    }
}

impl fmt::Display for EnrichmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} enrichment failure: {:#}", self.kind.as_str(), self.error)
    }
}

impl std::error::Error for EnrichmentError {}

#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    async fn fetch_batch(
        &self,
        signatures: &[String],
    ) -> std::result::Result<EnrichedBatch, EnrichmentError>;

    fn report_telemetry(&self) {}
}

/// Client for Helius `POST /v0/transactions`.
pub struct HeliusEnhancedClient {
    request_url: String,
    endpoint_label: String,
    http_client: Client,
    limiter: Option<Arc<TokenBucketLimiter>>,
    max_attempts: u32,
    retry_base_ms: u64,
    retry_max_ms: u64,
    retry_jitter_ms: u64,
    telemetry_report_seconds: u64,
    telemetry: Arc<EnrichmentTelemetry>,
}

impl HeliusEnhancedClient {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let base = config.enhanced_api_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(anyhow!(
                "enhanced api url must use an explicit http(s):// scheme: {base}"
            ));
        }
        let mut url =
            Url::parse(base).with_context(|| format!("invalid enhanced api url: {base}"))?;
        if url.host_str().is_none() {
            return Err(anyhow!("enhanced api url has no host: {base}"));
        }
        let endpoint_label = url.to_string();
        url.query_pairs_mut()
            .append_pair("api-key", config.helius_api_key.trim());

        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(500)))
            .build()
            .context("failed building reqwest client")?;

        Ok(Self {
            request_url: url.to_string(),
            endpoint_label,
            http_client,
            limiter: TokenBucketLimiter::new(config.rps_limit, config.rps_limit.max(1)),
            max_attempts: config.max_attempts.max(1),
            retry_base_ms: config.retry_base_ms.max(1),
            retry_max_ms: config.retry_max_ms.max(config.retry_base_ms.max(1)),
            retry_jitter_ms: config.retry_jitter_ms,
            telemetry_report_seconds: config.telemetry_report_seconds,
            telemetry: Arc::new(EnrichmentTelemetry::default()),
        })
    }

    pub fn telemetry_snapshot(&self) -> EnrichmentTelemetrySnapshot {
        self.telemetry.snapshot()
    }
}

#[async_trait]
impl EnrichmentClient for HeliusEnhancedClient {
    async fn fetch_batch(
        &self,
        signatures: &[String],
    ) -> std::result::Result<EnrichedBatch, EnrichmentError> {
        if signatures.is_empty() {
            return Ok(EnrichedBatch::default());
        }
        fetch_enhanced_with_retries(self, signatures).await
    }

    fn report_telemetry(&self) {
        self.telemetry.maybe_report(self.telemetry_report_seconds);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub mention: String,
    pub source_tag: String,
}

/// Accounts and programs to `logsSubscribe` to, with their provenance tags.
pub fn subscription_targets(config: &IngestionConfig) -> Vec<SubscriptionTarget> {
    let mut targets: Vec<SubscriptionTarget> = Vec::new();
    let mut push = |mention: &str, source_tag: String| {
        let mention = mention.trim();
        if mention.is_empty() || targets.iter().any(|target| target.mention == mention) {
            return;
        }
        targets.push(SubscriptionTarget {
            mention: mention.to_string(),
            source_tag,
        });
    };

    if config.subscribe_tip_accounts {
        for account in JITO_TIP_ACCOUNTS {
            push(account, format!("jito_tip_account:{account}"));
        }
    }
    if config.subscribe_tip_program {
        push(
            JITO_TIP_PAYMENT_PROGRAM,
            format!("jito_tip_program:{JITO_TIP_PAYMENT_PROGRAM}"),
        );
    }
    for account in &config.extra_mention_accounts {
        push(account.as_str(), format!("mention:{}", account.trim()));
    }
    targets
}

#[derive(Debug)]
enum WsEvent {
    SubscribeAck { request_id: u64, subscription: u64 },
    RequestRejected { request_id: u64 },
    Notification(LogsNotification),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogsNotification {
    subscription: u64,
    signature: String,
    slot: Option<u64>,
    is_failed: bool,
}

struct SubscriptionRuntimeConfig {
    ws_url: String,
    ws_url_label: String,
    commitment: String,
    targets: Vec<SubscriptionTarget>,
    reconnect_initial_ms: u64,
    reconnect_max_ms: u64,
    telemetry: SubscriptionTelemetry,
    active_subscriptions: AtomicUsize,
}

impl SubscriptionRuntimeConfig {
    fn set_active_subscriptions(&self, count: usize) {
        self.active_subscriptions.store(count, Ordering::Relaxed);
    }
}

/// Handle to the websocket reader task feeding sightings into the pipeline.
pub struct LogsSubscription {
    runtime_config: Arc<SubscriptionRuntimeConfig>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LogsSubscription {
    pub fn spawn(
        config: &IngestionConfig,
        sighting_tx: mpsc::Sender<SignatureSighting>,
    ) -> Result<Self> {
        let ws_url = config.helius_ws_url.trim().to_string();
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(anyhow!("helius ws url must use ws:// or wss://"));
        }
        let targets = subscription_targets(config);
        if targets.is_empty() {
            return Err(anyhow!("no logs subscription targets configured"));
        }

        let reconnect_initial_ms = config.reconnect_initial_ms.max(100);
        let runtime_config = Arc::new(SubscriptionRuntimeConfig {
            ws_url_label: redact_api_key(&ws_url),
            ws_url,
            commitment: config.commitment.trim().to_string(),
            targets,
            reconnect_initial_ms,
            reconnect_max_ms: config.reconnect_max_ms.max(reconnect_initial_ms),
            telemetry: SubscriptionTelemetry::default(),
            active_subscriptions: AtomicUsize::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(ws_reader_loop(
            Arc::clone(&runtime_config),
            sighting_tx,
            shutdown_rx,
        ));
        Ok(Self {
            runtime_config,
            shutdown_tx,
            task,
        })
    }

    pub fn target_count(&self) -> usize {
        self.runtime_config.targets.len()
    }

    pub fn report_telemetry(&self, report_seconds: u64) {
        self.runtime_config.telemetry.maybe_report(
            report_seconds,
            self.runtime_config.active_subscriptions.load(Ordering::Relaxed),
        );
    }

    /// Unsubscribes and closes the socket; aborts the reader if that takes
    /// longer than `timeout`.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        match time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(error = %error, "logs subscription task failed"),
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "logs subscription shutdown timed out; aborting reader"
                );
                task.abort();
            }
        }
    }
}

fn redact_api_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(key, value)| {
                    let value = if key.eq_ignore_ascii_case("api-key") {
                        "***".to_string()
                    } else {
                        value.into_owned()
                    };
                    (key.into_owned(), value)
                })
                .collect();
            if pairs.is_empty() {
                return parsed.to_string();
            }
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
