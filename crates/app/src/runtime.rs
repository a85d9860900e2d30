use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Instant;
use tipscan_config::{AppConfig, OutputConfig};
use tipscan_core_types::SignatureSighting;
use tipscan_ingestion::{
    EnrichedBatch, EnrichmentClient, EnrichmentError, HeliusEnhancedClient, IngestOutcome,
    LogsSubscription,
};
use tipscan_storage::{RecordLog, SnapshotWriter};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::pipeline::{PipelineSettings, PipelineState, SummaryConfigEcho};
use crate::scheduler::{BatchScheduler, TickSkip};

const SUBSCRIPTION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type BatchOutput = (Vec<String>, Result<EnrichedBatch, EnrichmentError>);
type BatchFuture<'a> = Pin<Box<dyn Future<Output = BatchOutput> + Send + 'a>>;

#[derive(Debug, Clone)]
pub(crate) struct LoopSettings {
    pub(crate) run_for: Duration,
    pub(crate) batch_size: usize,
    pub(crate) batch_interval: Duration,
    pub(crate) summary_interval: Duration,
    pub(crate) telemetry_report_seconds: u64,
}

impl LoopSettings {
    pub(crate) fn from_config(config: &AppConfig) -> Self {
        Self {
            run_for: Duration::from_secs(config.pipeline.run_seconds),
            batch_size: config.pipeline.batch_size,
            batch_interval: Duration::from_millis(config.pipeline.batch_interval_ms),
            summary_interval: Duration::from_secs(config.output.summary_every_seconds.max(1)),
            telemetry_report_seconds: config.enrichment.telemetry_report_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    Deadline,
    Interrupted,
}

impl LoopExit {
    fn as_str(self) -> &'static str {
        match self {
            Self::Deadline => "deadline",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Loop-side sinks that are optional in tests.
pub(crate) struct LoopOutputs<'a> {
    pub(crate) snapshot: &'a SnapshotWriter,
    pub(crate) config_echo: &'a SummaryConfigEcho,
    pub(crate) subscription: Option<&'a LogsSubscription>,
}

pub(crate) async fn run(config: AppConfig) -> Result<()> {
    let (out_path, summary_path) = resolve_output_paths(&config.output, Utc::now());
    let mut log = RecordLog::open(&out_path).context("failed to open record log")?;
    let snapshot = match SnapshotWriter::new(&summary_path) {
        Ok(snapshot) => snapshot,
        Err(error) => {
            let _ = log.close();
            return Err(error.context("failed to prepare summary snapshot"));
        }
    };
    let client = HeliusEnhancedClient::new(&config.enrichment)
        .context("failed to initialize enhanced transactions client")?;

    let (sighting_tx, mut sighting_rx) =
        mpsc::channel(config.ingestion.sighting_channel_capacity.max(1));
    let subscription = LogsSubscription::spawn(&config.ingestion, sighting_tx)
        .context("failed to start logs subscription")?;
    info!(
        out_file = %out_path.display(),
        summary_file = %summary_path.display(),
        subscriptions = subscription.target_count(),
        run_seconds = config.pipeline.run_seconds,
        batch_size = config.pipeline.batch_size,
        sample_pct = config.pipeline.ingress_sample_pct,
        "tip surface pipeline started"
    );

    let mut state = PipelineState::new(PipelineSettings::from_config(&config), log);
    let settings = LoopSettings::from_config(&config);
    let config_echo = SummaryConfigEcho::from_config(&config);
    let outputs = LoopOutputs {
        snapshot: &snapshot,
        config_echo: &config_echo,
        subscription: Some(&subscription),
    };
    let exit = run_control_loop(
        &mut state,
        &client,
        &mut sighting_rx,
        &outputs,
        &settings,
        wait_for_ctrl_c(),
    )
    .await;
    info!(reason = exit.as_str(), "control loop stopped");

    // timers died with the loop; the rest is best effort
    write_snapshot(&state, &outputs);
    drop(sighting_rx);
    subscription.shutdown(SUBSCRIPTION_SHUTDOWN_TIMEOUT).await;
    if let Err(error) = state.close_log() {
        warn!(error = %error, "failed closing record log");
    }
    client.report_telemetry();

    let counters = state.counters();
    info!(
        ingested = counters.ingested,
        processed = counters.processed,
        dropped_missing = counters.dropped_missing,
        pending = counters.pending,
        "tip surface pipeline finished"
    );
    Ok(())
}

/// Drives intake, batching, summaries and the deadline until the run ends.
/// Neither the deadline nor an interrupt abandons a batch already in flight.
pub(crate) async fn run_control_loop<C, S>(
    state: &mut PipelineState,
    client: &C,
    sightings: &mut mpsc::Receiver<SignatureSighting>,
    outputs: &LoopOutputs<'_>,
    settings: &LoopSettings,
    shutdown: S,
) -> LoopExit
where
    C: EnrichmentClient + ?Sized,
    S: Future<Output = ()>,
{
    let started_at = Instant::now();
    let mut scheduler = BatchScheduler::new(started_at, settings.run_for, settings.batch_size);
    let mut batch_interval = time::interval(settings.batch_interval);
    let mut summary_interval = time::interval_at(
        time::Instant::now() + settings.summary_interval,
        settings.summary_interval,
    );
    batch_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    summary_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let deadline = time::sleep(settings.run_for);
    tokio::pin!(deadline);
    tokio::pin!(shutdown);

    let mut in_flight: Option<BatchFuture<'_>> = None;
    let mut stopping: Option<LoopExit> = None;
    let mut sightings_open = true;

    loop {
        tokio::select! {
            (signatures, result) = poll_batch(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                let report = state.complete_batch(&signatures, result, Instant::now());
                debug!(
                    requested = report.requested,
                    processed = report.processed,
                    aggregated = report.aggregated,
                    missing = report.missing,
                    dropped = report.dropped,
                    failed = report.failed,
                    pending = state.pending_len(),
                    "enhanced batch completed"
                );
                if let Some(exit) = stopping {
                    return exit;
                }
            }
            _ = batch_interval.tick(), if stopping.is_none() => {
                let now = Instant::now();
                if let Err(skip) = scheduler.gate(now, in_flight.is_some(), state.pending_len()) {
                    if skip != TickSkip::Empty {
                        debug!(reason = skip.as_str(), "batch tick skipped");
                    }
                    continue;
                }
                let signatures = state.select_batch(now, scheduler.batch_size());
                if signatures.is_empty() {
                    debug!(reason = TickSkip::NothingReady.as_str(), "batch tick skipped");
                    continue;
                }
                in_flight = Some(Box::pin(async move {
                    let result = client.fetch_batch(&signatures).await;
                    (signatures, result)
                }));
            }
            _ = summary_interval.tick() => {
                write_snapshot(state, outputs);
                client.report_telemetry();
                if let Some(subscription) = outputs.subscription {
                    subscription.report_telemetry(settings.telemetry_report_seconds);
                }
            }
            maybe_sighting = sightings.recv(), if sightings_open => {
                match maybe_sighting {
                    Some(sighting) => {
                        if let IngestOutcome::Rejected = state.ingest(&sighting, Instant::now()) {
                            debug!(source = %sighting.source, "empty signature rejected");
                        }
                    }
                    None => {
                        sightings_open = false;
                        warn!("sighting channel closed; no further intake this run");
                    }
                }
            }
            _ = &mut deadline, if stopping.is_none() => {
                info!(
                    in_flight = in_flight.is_some(),
                    skipped_in_flight_ticks = scheduler.skipped_in_flight(),
                    "run deadline reached"
                );
                if in_flight.is_none() {
                    return LoopExit::Deadline;
                }
                stopping = Some(LoopExit::Deadline);
            }
            _ = &mut shutdown, if stopping.is_none() => {
                info!(in_flight = in_flight.is_some(), "shutdown signal received");
                if in_flight.is_none() {
                    return LoopExit::Interrupted;
                }
                stopping = Some(LoopExit::Interrupted);
            }
        }
    }
}

async fn poll_batch(in_flight: &mut Option<BatchFuture<'_>>) -> BatchOutput {
    match in_flight.as_mut() {
        Some(batch) => batch.await,
        None => std::future::pending().await,
    }
}

fn write_snapshot(state: &PipelineState, outputs: &LoopOutputs<'_>) {
    let summary = state.summary(outputs.config_echo, Utc::now());
    let counters = summary.counters;
    match outputs.snapshot.write(&summary) {
        Ok(()) => info!(
            ingested = counters.ingested,
            sampled_out = counters.sampled_out,
            evicted = counters.evicted,
            processed = counters.processed,
            dropped_missing = counters.dropped_missing,
            enhanced_missing = counters.enhanced_missing,
            enhanced_rate_limited = counters.enhanced_rate_limited,
            enhanced_other_errors = counters.enhanced_other_errors,
            log_write_errors = counters.log_write_errors,
            pending = counters.pending,
            fingerprints = state.aggregator().fingerprint_count(),
            programs = state.aggregator().program_count(),
            "surface summary"
        ),
        Err(error) => warn!(
            error = %error,
            path = %outputs.snapshot.path().display(),
            "failed writing summary snapshot"
        ),
    }
}

async fn wait_for_ctrl_c() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed listening for ctrl-c; relying on run deadline");
        std::future::pending::<()>().await;
    }
}

/// Empty paths become timestamped files in the working directory.
pub(crate) fn resolve_output_paths(output: &OutputConfig, now: DateTime<Utc>) -> (PathBuf, PathBuf) {
    let stamp = now.format("%Y%m%dT%H%M%SZ");
    let pick = |configured: &str, fallback: String| {
        let configured = configured.trim();
        if configured.is_empty() {
            PathBuf::from(fallback)
        } else {
            PathBuf::from(configured)
        }
    };
    (
        pick(&output.out_file, format!("tip_surface_{stamp}.jsonl")),
        pick(
            &output.summary_file,
            format!("tip_surface_summary_{stamp}.json"),
        ),
    )
}
