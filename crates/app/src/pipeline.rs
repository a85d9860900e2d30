use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tipscan_config::AppConfig;
use tipscan_core_types::{PipelineCounters, SightingMeta, SignatureSighting, SUMMARY_SCHEMA};
use tipscan_ingestion::{
    EnrichedBatch, EnrichmentError, EnrichmentErrorKind, IngestOutcome, MissingOutcome,
    PendingBuffer, PendingBufferConfig, SignatureIntake,
};
use tipscan_storage::RecordLog;
use tipscan_surface::{assemble_record, FingerprintRow, ProgramRow, SurfaceAggregator};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub(crate) struct PipelineSettings {
    pub(crate) buffer: PendingBufferConfig,
    pub(crate) sample_pct: f64,
    pub(crate) store_enhanced: bool,
    pub(crate) batch_failure_delay: Duration,
    pub(crate) summary_top_n: usize,
}

impl PipelineSettings {
    pub(crate) fn from_config(config: &AppConfig) -> Self {
        let pipeline = &config.pipeline;
        Self {
            buffer: PendingBufferConfig {
                max_pending: pipeline.max_pending,
                initial_delay: Duration::from_millis(pipeline.initial_delay_ms),
                max_missing_retries: pipeline.max_missing_retries,
                missing_retry_base: Duration::from_millis(pipeline.missing_retry_base_ms),
                missing_retry_max: Duration::from_millis(pipeline.missing_retry_max_ms),
            },
            sample_pct: pipeline.ingress_sample_pct,
            store_enhanced: config.output.store_enhanced,
            batch_failure_delay: Duration::from_millis(pipeline.batch_failure_delay_ms),
            summary_top_n: config.output.summary_top_n,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BatchReport {
    pub(crate) requested: usize,
    pub(crate) processed: usize,
    pub(crate) aggregated: usize,
    pub(crate) missing: usize,
    pub(crate) dropped: usize,
    pub(crate) failed: bool,
}

/// Snapshot echo of the knobs that shape the numbers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SummaryConfigEcho {
    pub(crate) run_seconds: u64,
    pub(crate) batch_size: usize,
    pub(crate) batch_interval_ms: u64,
    pub(crate) initial_delay_ms: u64,
    pub(crate) max_missing_retries: u32,
    pub(crate) max_pending: usize,
    pub(crate) ingress_sample_pct: f64,
    pub(crate) store_enhanced: bool,
    pub(crate) commitment: String,
    pub(crate) summary_top_n: usize,
}

impl SummaryConfigEcho {
    pub(crate) fn from_config(config: &AppConfig) -> Self {
        Self {
            run_seconds: config.pipeline.run_seconds,
            batch_size: config.pipeline.batch_size,
            batch_interval_ms: config.pipeline.batch_interval_ms,
            initial_delay_ms: config.pipeline.initial_delay_ms,
            max_missing_retries: config.pipeline.max_missing_retries,
            max_pending: config.pipeline.max_pending,
            ingress_sample_pct: config.pipeline.ingress_sample_pct,
            store_enhanced: config.output.store_enhanced,
            commitment: config.ingestion.commitment.clone(),
            summary_top_n: config.output.summary_top_n,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SummarySnapshot<'a> {
    pub(crate) schema: &'static str,
    pub(crate) generated_at: String,
    pub(crate) config: &'a SummaryConfigEcho,
    pub(crate) counters: PipelineCounters,
    pub(crate) top_fingerprints_by_max_stable: Vec<FingerprintRow>,
    pub(crate) top_programs_by_total_stable: Vec<ProgramRow>,
}

/// All mutable pipeline state, owned by the control loop.
pub(crate) struct PipelineState {
    settings: PipelineSettings,
    intake: SignatureIntake,
    buffer: PendingBuffer,
    aggregator: SurfaceAggregator,
    log: RecordLog,
    processed: u64,
    enhanced_missing: u64,
    enhanced_rate_limited: u64,
    enhanced_other_errors: u64,
    log_write_errors: u64,
}

impl PipelineState {
    pub(crate) fn new(settings: PipelineSettings, log: RecordLog) -> Self {
        Self::with_intake(SignatureIntake::new(settings.sample_pct), settings, log)
    }

    pub(crate) fn with_intake(
        intake: SignatureIntake,
        settings: PipelineSettings,
        log: RecordLog,
    ) -> Self {
        Self {
            buffer: PendingBuffer::new(settings.buffer.clone()),
            settings,
            intake,
            aggregator: SurfaceAggregator::new(),
            log,
            processed: 0,
            enhanced_missing: 0,
            enhanced_rate_limited: 0,
            enhanced_other_errors: 0,
            log_write_errors: 0,
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn aggregator(&self) -> &SurfaceAggregator {
        &self.aggregator
    }

    pub(crate) fn ingest(&mut self, sighting: &SignatureSighting, now: Instant) -> IngestOutcome {
        let outcome = self.intake.ingest(&mut self.buffer, sighting, now);
        if let IngestOutcome::Accepted {
            evicted: Some(evicted),
        } = &outcome
        {
            debug!(signature = %evicted, "pending buffer full; evicted oldest signature");
        }
        outcome
    }

    pub(crate) fn select_batch(&mut self, now: Instant, batch_size: usize) -> Vec<String> {
        self.buffer.select_ready(now, batch_size)
    }

    pub(crate) fn complete_batch(
        &mut self,
        signatures: &[String],
        result: Result<EnrichedBatch, EnrichmentError>,
        now: Instant,
    ) -> BatchReport {
        let mut report = BatchReport {
            requested: signatures.len(),
            ..BatchReport::default()
        };
        let batch = match result {
            Ok(batch) => batch,
            Err(error) => {
                report.failed = true;
                self.fail_batch(signatures, &error, now);
                return report;
            }
        };

        let EnrichedBatch {
            mut records,
            missing,
            rate_limited,
        } = batch;
        self.enhanced_rate_limited = self.enhanced_rate_limited.saturating_add(rate_limited);
        for signature in signatures {
            let Some(enhanced) = records.remove(signature) else {
                continue;
            };
            let Some(entry) = self.buffer.remove(signature) else {
                debug!(signature = %signature, "enriched signature no longer pending; skipping");
                continue;
            };
            let meta = SightingMeta {
                seen_at: entry.seen_at,
                hint_slot: entry.hint_slot,
                source: entry.source,
            };
            let assembled = assemble_record(signature, enhanced, &meta, self.settings.store_enhanced);
            if let Some(error) = &assembled.record.extraction_error {
                warn!(signature = %signature, error = %error, "enhanced record extraction failed");
            }
            if let Some(observation) = &assembled.observation {
                if self.aggregator.observe(observation, Utc::now()) {
                    report.aggregated += 1;
                }
            }
            if let Err(error) = self.log.append(&assembled.record) {
                self.log_write_errors = self.log_write_errors.saturating_add(1);
                warn!(signature = %signature, error = %error, "failed appending record to log");
            }
            self.processed = self.processed.saturating_add(1);
            report.processed += 1;
        }

        for signature in &missing {
            self.enhanced_missing = self.enhanced_missing.saturating_add(1);
            report.missing += 1;
            if let MissingOutcome::Dropped { attempts } = self.buffer.mark_missing(signature, now) {
                report.dropped += 1;
                debug!(signature = %signature, attempts, "signature dropped after missing retries");
            }
        }
        report
    }

    fn fail_batch(&mut self, signatures: &[String], error: &EnrichmentError, now: Instant) {
        self.enhanced_rate_limited = self
            .enhanced_rate_limited
            .saturating_add(error.rate_limited);
        if error.kind != EnrichmentErrorKind::RateLimited {
            self.enhanced_other_errors = self.enhanced_other_errors.saturating_add(1);
        }
        let rescheduled =
            self.buffer
                .mark_failed(signatures, now, self.settings.batch_failure_delay);
        warn!(
            kind = error.kind.as_str(),
            error = %error,
            requested = signatures.len(),
            rescheduled,
            "enhanced batch failed; rescheduling"
        );
    }

    pub(crate) fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            ingested: self.intake.ingested(),
            sampled_out: self.intake.sampled_out(),
            evicted: self.buffer.evicted(),
            processed: self.processed,
            dropped_missing: self.buffer.dropped_missing(),
            enhanced_missing: self.enhanced_missing,
            enhanced_rate_limited: self.enhanced_rate_limited,
            enhanced_other_errors: self.enhanced_other_errors,
            log_write_errors: self.log_write_errors,
            pending: self.buffer.len(),
        }
    }

    pub(crate) fn summary<'a>(
        &self,
        config: &'a SummaryConfigEcho,
        generated_at: DateTime<Utc>,
    ) -> SummarySnapshot<'a> {
        SummarySnapshot {
            schema: SUMMARY_SCHEMA,
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            config,
            counters: self.counters(),
            top_fingerprints_by_max_stable: self
                .aggregator
                .fingerprint_rows(self.settings.summary_top_n),
            top_programs_by_total_stable: self.aggregator.program_rows(self.settings.summary_top_n),
        }
    }

    pub(crate) fn close_log(&mut self) -> anyhow::Result<()> {
        self.log.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::path::Path;
    use tipscan_core_types::{JITO_TIP_ACCOUNTS, USDC_MINT};

    fn test_settings() -> PipelineSettings {
        PipelineSettings {
            buffer: PendingBufferConfig {
                max_pending: 1_000,
                initial_delay: Duration::from_millis(1_500),
                max_missing_retries: 6,
                missing_retry_base: Duration::from_millis(500),
                missing_retry_max: Duration::from_millis(20_000),
            },
            sample_pct: 1.0,
            store_enhanced: false,
            batch_failure_delay: Duration::from_millis(1_000),
            summary_top_n: 0,
        }
    }

    fn state(dir: &Path, settings: PipelineSettings) -> Result<PipelineState> {
        let log = RecordLog::open(&dir.join("records.ndjson"))?;
        Ok(PipelineState::with_intake(
            SignatureIntake::with_seed(settings.sample_pct, 11),
            settings,
            log,
        ))
    }

    fn sighting(signature: &str) -> SignatureSighting {
        SignatureSighting::new(signature, Some(7), "jito_tip_program:test")
    }

    fn tipped_record(signature: &str) -> Value {
        json!({
            "signature": signature,
            "type": "SWAP",
            "source": "JUPITER",
            "fee": 5000,
            "feePayer": "Payer111111111111111111111111111111111111111",
            "instructions": [{"programId": "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4"}],
            "accountData": [
                {"account": JITO_TIP_ACCOUNTS[1], "nativeBalanceChange": 2000, "tokenBalanceChanges": []},
                {"account": "Payer111111111111111111111111111111111111111", "nativeBalanceChange": -7000,
                 "tokenBalanceChanges": [{
                    "userAccount": "Payer111111111111111111111111111111111111111",
                    "mint": USDC_MINT,
                    "rawTokenAmount": {"tokenAmount": "1500000", "decimals": 6}
                 }]}
            ]
        })
    }

    fn resolved(signatures: &[&str], missing: &[&str]) -> EnrichedBatch {
        EnrichedBatch {
            records: signatures
                .iter()
                .map(|signature| (signature.to_string(), tipped_record(signature)))
                .collect::<HashMap<_, _>>(),
            missing: missing.iter().map(|signature| signature.to_string()).collect(),
            rate_limited: 0,
        }
    }

    fn log_lines(dir: &Path) -> Result<Vec<Value>> {
        std::fs::read_to_string(dir.join("records.ndjson"))?
            .lines()
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    #[test]
    fn three_signatures_resolve_across_two_batches() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut state = state(dir.path(), test_settings())?;
        let start = Instant::now();
        for signature in ["sig-1", "sig-2", "sig-3"] {
            state.ingest(&sighting(signature), start);
        }

        let first_tick = start + Duration::from_millis(1_500);
        let first = state.select_batch(first_tick, 2);
        assert_eq!(first, vec!["sig-1".to_string(), "sig-2".to_string()]);
        let report = state.complete_batch(&first, Ok(resolved(&["sig-1"], &["sig-2"])), first_tick);
        assert_eq!((report.processed, report.missing), (1, 1));
        assert_eq!(state.pending_len(), 2);

        // sig-2 waits 1s after its first missing outcome
        let second_tick = first_tick + Duration::from_millis(1_000);
        let second = state.select_batch(second_tick, 2);
        assert_eq!(second.len(), 2);
        state.complete_batch(&second, Ok(resolved(&["sig-2", "sig-3"], &[])), second_tick);

        let counters = state.counters();
        assert_eq!(counters.processed, 3);
        assert_eq!(counters.dropped_missing, 0);
        assert_eq!(counters.pending, 0);
        assert_eq!(counters.ingested, 3);
        assert_eq!(counters.enhanced_missing, 1);
        assert_eq!(state.aggregator().fingerprint_count(), 1);

        let lines = log_lines(dir.path())?;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["signature"], "sig-1");
        assert_eq!(lines[0]["slot"], 7);
        assert_eq!(lines[0]["source"], "jito_tip_program:test");
        Ok(())
    }

    #[test]
    fn batch_failure_keeps_every_signature_and_counts_by_kind() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut state = state(dir.path(), test_settings())?;
        let start = Instant::now();
        state.ingest(&sighting("sig-1"), start);
        state.ingest(&sighting("sig-2"), start);

        let tick = start + Duration::from_millis(1_500);
        let batch = state.select_batch(tick, 10);
        let rate_limited = EnrichmentError::new(EnrichmentErrorKind::RateLimited, anyhow!("429"));
        let report = state.complete_batch(&batch, Err(rate_limited), tick);
        assert!(report.failed);
        assert_eq!(state.pending_len(), 2);
        assert!(state.select_batch(tick + Duration::from_millis(999), 10).is_empty());

        let retry_tick = tick + Duration::from_millis(1_000);
        let batch = state.select_batch(retry_tick, 10);
        assert_eq!(batch.len(), 2);
        let server = EnrichmentError::new(EnrichmentErrorKind::Server, anyhow!("503"))
            .with_rate_limited(2);
        state.complete_batch(&batch, Err(server), retry_tick);

        let counters = state.counters();
        assert_eq!(counters.enhanced_rate_limited, 3);
        assert_eq!(counters.enhanced_other_errors, 1);
        assert_eq!(counters.processed, 0);
        assert_eq!(counters.pending, 2);
        Ok(())
    }

    #[test]
    fn rate_limits_retried_through_reach_the_counters() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut state = state(dir.path(), test_settings())?;
        let start = Instant::now();
        state.ingest(&sighting("sig-1"), start);

        let tick = start + Duration::from_millis(1_500);
        let batch = state.select_batch(tick, 10);
        let mut enriched = resolved(&["sig-1"], &[]);
        enriched.rate_limited = 2;
        let report = state.complete_batch(&batch, Ok(enriched), tick);
        assert!(!report.failed);

        let counters = state.counters();
        assert_eq!(counters.processed, 1);
        assert_eq!(counters.enhanced_rate_limited, 2);
        assert_eq!(counters.enhanced_other_errors, 0);
        Ok(())
    }

    #[test]
    fn repeated_missing_outcomes_drop_the_signature() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut settings = test_settings();
        settings.buffer.max_missing_retries = 2;
        let mut state = state(dir.path(), settings)?;
        let mut now = Instant::now();
        state.ingest(&sighting("sig-gone"), now);

        for _ in 0..3 {
            now += Duration::from_secs(30);
            let batch = state.select_batch(now, 10);
            assert_eq!(batch, vec!["sig-gone".to_string()]);
            state.complete_batch(&batch, Ok(resolved(&[], &["sig-gone"])), now);
        }

        let counters = state.counters();
        assert_eq!(counters.dropped_missing, 1);
        assert_eq!(counters.enhanced_missing, 3);
        assert_eq!(counters.pending, 0);
        Ok(())
    }

    #[test]
    fn malformed_record_is_processed_and_logged_but_not_aggregated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut state = state(dir.path(), test_settings())?;
        let start = Instant::now();
        state.ingest(&sighting("sig-bad"), start);
        let tick = start + Duration::from_secs(2);
        let batch = state.select_batch(tick, 10);
        let records = HashMap::from([(
            "sig-bad".to_string(),
            json!({"type": "SWAP", "fee": 1.5}),
        )]);
        state.complete_batch(
            &batch,
            Ok(EnrichedBatch {
                records,
                ..EnrichedBatch::default()
            }),
            tick,
        );

        assert_eq!(state.counters().processed, 1);
        assert_eq!(state.aggregator().fingerprint_count(), 0);
        let lines = log_lines(dir.path())?;
        assert!(lines[0]["extractionError"].is_string());
        Ok(())
    }

    #[test]
    fn log_write_failure_is_counted_without_requeue() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut state = state(dir.path(), test_settings())?;
        state.close_log()?;
        let start = Instant::now();
        state.ingest(&sighting("sig-1"), start);
        let tick = start + Duration::from_secs(2);
        let batch = state.select_batch(tick, 10);
        state.complete_batch(&batch, Ok(resolved(&["sig-1"], &[])), tick);

        let counters = state.counters();
        assert_eq!(counters.log_write_errors, 1);
        assert_eq!(counters.processed, 1);
        assert_eq!(counters.pending, 0);
        Ok(())
    }

    #[test]
    fn summary_snapshot_serializes_counters_and_tables() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut state = state(dir.path(), test_settings())?;
        let start = Instant::now();
        state.ingest(&sighting("sig-1"), start);
        let tick = start + Duration::from_secs(2);
        let batch = state.select_batch(tick, 10);
        state.complete_batch(&batch, Ok(resolved(&["sig-1"], &[])), tick);

        let echo = SummaryConfigEcho::from_config(&AppConfig::default());
        let value = serde_json::to_value(state.summary(&echo, Utc::now()))?;
        assert_eq!(value["schema"], SUMMARY_SCHEMA);
        assert_eq!(value["counters"]["processed"], 1);
        assert_eq!(value["config"]["batchSize"], 100);
        assert_eq!(value["topFingerprintsByMaxStable"][0]["maxStableRaw"], "1500000");
        assert_eq!(
            value["topProgramsByTotalStable"][0]["programId"],
            "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4"
        );
        Ok(())
    }
}
