use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tipscan_core_types::SignatureSighting;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::helius_parser::{parse_ws_message, split_enhanced_response};
use super::{
    compute_retry_delay, parse_retry_after, sleep_with_backoff, EnrichedBatch, EnrichmentError,
    EnrichmentErrorKind, HeliusEnhancedClient, HeliusWsStream, LogsNotification,
    SubscriptionRuntimeConfig, WsEvent, WS_IDLE_TIMEOUT_SECS,
};

struct WsSession {
    stream: HeliusWsStream,
    pending_acks: HashMap<u64, String>,
    subscriptions: HashMap<u64, String>,
}

enum ReaderStep {
    Continue,
    Reconnect,
    Stop,
}

pub(super) async fn ws_reader_loop(
    runtime_config: Arc<SubscriptionRuntimeConfig>,
    sighting_tx: mpsc::Sender<SignatureSighting>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut request_id: u64 = 1000;
    let mut session: Option<WsSession> = None;
    let mut next_backoff_ms = runtime_config.reconnect_initial_ms;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if session.is_none() {
            match connect_ws_session(&runtime_config, &mut request_id).await {
                Ok(connected) => {
                    session = Some(connected);
                    next_backoff_ms = runtime_config.reconnect_initial_ms;
                }
                Err(error) => {
                    warn!(error = ?error, "helius ws connect failed");
                    if backoff_or_shutdown(&runtime_config, &mut next_backoff_ms, &mut shutdown_rx)
                        .await
                    {
                        break;
                    }
                    continue;
                }
            }
        }
        let Some(active) = session.as_mut() else {
            continue;
        };

        let next_message = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            message = time::timeout(
                Duration::from_secs(WS_IDLE_TIMEOUT_SECS),
                active.stream.next(),
            ) => message,
        };

        let step = match next_message {
            Ok(Some(Ok(Message::Text(text)))) => {
                handle_text_message(
                    &runtime_config,
                    active,
                    text.as_str(),
                    &sighting_tx,
                    &mut shutdown_rx,
                )
                .await
            }
            Ok(Some(Ok(Message::Ping(payload)))) => {
                match active.stream.send(Message::Pong(payload)).await {
                    Ok(()) => ReaderStep::Continue,
                    Err(error) => {
                        warn!(error = %error, "failed to send ws pong");
                        ReaderStep::Reconnect
                    }
                }
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                warn!(?frame, "helius ws closed");
                ReaderStep::Reconnect
            }
            Ok(Some(Ok(_))) => ReaderStep::Continue,
            Ok(Some(Err(error))) => {
                warn!(error = %error, "helius ws stream error");
                ReaderStep::Reconnect
            }
            Ok(None) => {
                warn!("helius ws stream ended");
                ReaderStep::Reconnect
            }
            Err(_) => {
                warn!(
                    idle_timeout_seconds = WS_IDLE_TIMEOUT_SECS,
                    "helius ws idle timeout, reconnecting"
                );
                ReaderStep::Reconnect
            }
        };

        match step {
            ReaderStep::Continue => {}
            ReaderStep::Stop => break,
            ReaderStep::Reconnect => {
                session = None;
                runtime_config.set_active_subscriptions(0);
                runtime_config
                    .telemetry
                    .reconnect_count
                    .fetch_add(1, Ordering::Relaxed);
                if backoff_or_shutdown(&runtime_config, &mut next_backoff_ms, &mut shutdown_rx)
                    .await
                {
                    break;
                }
            }
        }
    }

    if let Some(session) = session.take() {
        unsubscribe_and_close(session, &mut request_id).await;
    }
    runtime_config.set_active_subscriptions(0);
    debug!("logs subscription reader stopped");
}

async fn handle_text_message(
    runtime_config: &SubscriptionRuntimeConfig,
    session: &mut WsSession,
    text: &str,
    sighting_tx: &mpsc::Sender<SignatureSighting>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ReaderStep {
    let Some(event) = parse_ws_message(text) else {
        return ReaderStep::Continue;
    };

    match event {
        WsEvent::SubscribeAck {
            request_id,
            subscription,
        } => {
            if let Some(source) = session.pending_acks.remove(&request_id) {
                debug!(request_id, subscription, source = %source, "logsSubscribe acknowledged");
                session.subscriptions.insert(subscription, source);
                runtime_config
                    .telemetry
                    .subscribe_acks
                    .fetch_add(1, Ordering::Relaxed);
                runtime_config.set_active_subscriptions(session.subscriptions.len());
            }
            ReaderStep::Continue
        }
        WsEvent::RequestRejected { request_id } => {
            if let Some(source) = session.pending_acks.remove(&request_id) {
                warn!(request_id, source = %source, "logsSubscribe rejected");
            }
            ReaderStep::Continue
        }
        WsEvent::Notification(notification) => {
            forward_notification(runtime_config, session, notification, sighting_tx, shutdown_rx)
                .await
        }
    }
}

async fn forward_notification(
    runtime_config: &SubscriptionRuntimeConfig,
    session: &WsSession,
    notification: LogsNotification,
    sighting_tx: &mpsc::Sender<SignatureSighting>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ReaderStep {
    let telemetry = &runtime_config.telemetry;
    telemetry.notifications_seen.fetch_add(1, Ordering::Relaxed);
    if notification.is_failed {
        // failed txs can still pay tips, keep them
        telemetry
            .failed_tx_notifications
            .fetch_add(1, Ordering::Relaxed);
    }
    let Some(source) = session.subscriptions.get(&notification.subscription) else {
        telemetry
            .unrouted_notifications
            .fetch_add(1, Ordering::Relaxed);
        return ReaderStep::Continue;
    };

    let sighting = SignatureSighting::new(notification.signature, notification.slot, source.clone());
    tokio::select! {
        sent = sighting_tx.send(sighting) => {
            if sent.is_err() {
                warn!("sighting channel closed; stopping ws reader");
                return ReaderStep::Stop;
            }
            telemetry.sightings_forwarded.fetch_add(1, Ordering::Relaxed);
            ReaderStep::Continue
        }
        _ = shutdown_rx.changed() => ReaderStep::Stop,
    }
}

async fn backoff_or_shutdown(
    runtime_config: &SubscriptionRuntimeConfig,
    next_backoff_ms: &mut u64,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = sleep_with_backoff(
            next_backoff_ms,
            runtime_config.reconnect_initial_ms,
            runtime_config.reconnect_max_ms,
        ) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

async fn connect_ws_session(
    runtime_config: &SubscriptionRuntimeConfig,
    request_id: &mut u64,
) -> Result<WsSession> {
    let (mut stream, _response) = connect_async(runtime_config.ws_url.as_str())
        .await
        .with_context(|| format!("failed connecting to {}", runtime_config.ws_url_label))?;

    let mut pending_acks = HashMap::with_capacity(runtime_config.targets.len());
    for target in &runtime_config.targets {
        *request_id = request_id.saturating_add(1);
        let request = json!({
            "jsonrpc": "2.0",
            "id": *request_id,
            "method": "logsSubscribe",
            "params": [
                {"mentions": [target.mention]},
                {"commitment": runtime_config.commitment}
            ]
        });
        stream
            .send(Message::Text(request.to_string().into()))
            .await
            .with_context(|| format!("failed sending logsSubscribe for {}", target.mention))?;
        pending_acks.insert(*request_id, target.source_tag.clone());
    }

    info!(
        ws_url = %runtime_config.ws_url_label,
        subscriptions = runtime_config.targets.len(),
        commitment = %runtime_config.commitment,
        "helius ws connected and subscriptions sent"
    );

    Ok(WsSession {
        stream,
        pending_acks,
        subscriptions: HashMap::new(),
    })
}

async fn unsubscribe_and_close(mut session: WsSession, request_id: &mut u64) {
    let mut unsubscribed = 0usize;
    for subscription in session.subscriptions.keys() {
        *request_id = request_id.saturating_add(1);
        let request = json!({
            "jsonrpc": "2.0",
            "id": *request_id,
            "method": "logsUnsubscribe",
            "params": [subscription]
        });
        match session
            .stream
            .send(Message::Text(request.to_string().into()))
            .await
        {
            Ok(()) => unsubscribed += 1,
            Err(error) => {
                warn!(error = %error, subscription, "failed sending logsUnsubscribe");
                break;
            }
        }
    }
    if let Err(error) = session.stream.close(None).await {
        debug!(error = %error, "ws close after unsubscribe failed");
    }
    info!(unsubscribed, "logs subscriptions closed");
}

pub(super) async fn fetch_enhanced_with_retries(
    client: &HeliusEnhancedClient,
    signatures: &[String],
) -> std::result::Result<EnrichedBatch, EnrichmentError> {
    let telemetry = &client.telemetry;
    telemetry.batches.fetch_add(1, Ordering::Relaxed);
    telemetry
        .signatures_requested
        .fetch_add(signatures.len() as u64, Ordering::Relaxed);
    let jitter_key = signatures.first().map(String::as_str).unwrap_or_default();

    let mut attempt: u32 = 0;
    let mut rate_limited: u64 = 0;
    loop {
        let started = Instant::now();
        telemetry.attempts.fetch_add(1, Ordering::Relaxed);
        let result = fetch_enhanced_attempt(client, signatures).await;
        telemetry.push_latency(started.elapsed().as_millis() as u64);

        let fetch_error = match result {
            Ok(body) => {
                let mut batch = resolve_enhanced_body(client, signatures, body);
                batch.rate_limited = rate_limited;
                return Ok(batch);
            }
            Err(fetch_error) => fetch_error,
        };
        if fetch_error.kind == EnrichmentErrorKind::RateLimited {
            rate_limited += 1;
        }

        let can_retry = fetch_error.retryable && attempt + 1 < client.max_attempts;
        if !can_retry {
            if fetch_error.retryable {
                telemetry.retry_exhausted.fetch_add(1, Ordering::Relaxed);
            } else {
                telemetry.retry_terminal.fetch_add(1, Ordering::Relaxed);
            }
            warn!(
                error = %fetch_error.error,
                batch_size = signatures.len(),
                attempt,
                retryable = fetch_error.retryable,
                "enhanced transactions request failed"
            );
            return Err(EnrichmentError::new(fetch_error.kind, fetch_error.error)
                .with_rate_limited(rate_limited));
        }

        telemetry.retry_attempts.fetch_add(1, Ordering::Relaxed);
        let wait = compute_retry_delay(
            client.retry_base_ms,
            client.retry_max_ms,
            client.retry_jitter_ms,
            attempt,
            jitter_key,
            fetch_error.retry_after,
        );
        debug!(
            error = %fetch_error.error,
            batch_size = signatures.len(),
            attempt,
            wait_ms = wait.as_millis() as u64,
            "retrying enhanced transactions request after backoff"
        );
        time::sleep(wait).await;
        attempt += 1;
    }
}

fn resolve_enhanced_body(
    client: &HeliusEnhancedClient,
    signatures: &[String],
    body: Value,
) -> EnrichedBatch {
    let batch = split_enhanced_response(signatures, body).unwrap_or_else(|| {
        client
            .telemetry
            .non_array_bodies
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            batch_size = signatures.len(),
            "enhanced transactions response is not an array; treating batch as missing"
        );
        EnrichedBatch {
            records: HashMap::new(),
            missing: signatures.to_vec(),
            rate_limited: 0,
        }
    });
    client
        .telemetry
        .signatures_missing
        .fetch_add(batch.missing.len() as u64, Ordering::Relaxed);
    batch
}

#[derive(Debug)]
struct FetchAttemptError {
    kind: EnrichmentErrorKind,
    error: anyhow::Error,
    retryable: bool,
    retry_after: Option<Duration>,
}

impl FetchAttemptError {
    fn retryable(
        kind: EnrichmentErrorKind,
        error: anyhow::Error,
        retry_after: Option<Duration>,
    ) -> Self {
        Self {
            kind,
            error,
            retryable: true,
            retry_after,
        }
    }

    fn terminal(error: anyhow::Error) -> Self {
        Self {
            kind: EnrichmentErrorKind::Terminal,
            error,
            retryable: false,
            retry_after: None,
        }
    }
}

async fn fetch_enhanced_attempt(
    client: &HeliusEnhancedClient,
    signatures: &[String],
) -> std::result::Result<Value, FetchAttemptError> {
    if let Some(limiter) = client.limiter.as_ref() {
        limiter.acquire().await;
    }

    let endpoint = client.endpoint_label.as_str();
    let request = json!({ "transactions": signatures });
    let response = client
        .http_client
        .post(client.request_url.as_str())
        .json(&request)
        .send()
        .await
        .map_err(|error| {
            client
                .telemetry
                .transport_errors
                .fetch_add(1, Ordering::Relaxed);
            let reason = if error.is_timeout() {
                "timed out"
            } else {
                "failed"
            };
            FetchAttemptError::retryable(
                EnrichmentErrorKind::Transport,
                anyhow!(
                    "enhanced transactions POST {reason} via {endpoint}: {}",
                    error.without_url()
                ),
                None,
            )
        })?;

    let status = response.status();
    let retry_after = parse_retry_after(&response);
    if status.as_u16() == 429 {
        client.telemetry.http_429.fetch_add(1, Ordering::Relaxed);
        return Err(FetchAttemptError::retryable(
            EnrichmentErrorKind::RateLimited,
            anyhow!("enhanced transactions rate limited (status {status}) via {endpoint}"),
            retry_after,
        ));
    }
    if status.is_server_error() {
        client.telemetry.http_5xx.fetch_add(1, Ordering::Relaxed);
        return Err(FetchAttemptError::retryable(
            EnrichmentErrorKind::Server,
            anyhow!("retryable enhanced transactions status {status} via {endpoint}"),
            retry_after,
        ));
    }
    if !status.is_success() {
        return Err(FetchAttemptError::terminal(anyhow!(
            "non-success enhanced transactions status {status} via {endpoint}"
        )));
    }

    let bytes = response.bytes().await.map_err(|error| {
        client
            .telemetry
            .transport_errors
            .fetch_add(1, Ordering::Relaxed);
        FetchAttemptError::retryable(
            EnrichmentErrorKind::Transport,
            anyhow!(
                "failed reading enhanced transactions body via {endpoint}: {}",
                error.without_url()
            ),
            None,
        )
    })?;
    serde_json::from_slice::<Value>(&bytes).map_err(|error| {
        FetchAttemptError::terminal(anyhow!(
            "failed parsing enhanced transactions json via {endpoint}: {error}"
        ))
    })
}
