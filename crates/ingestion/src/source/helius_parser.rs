use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::{EnrichedBatch, LogsNotification, WsEvent};

pub(super) fn parse_ws_message(text: &str) -> Option<WsEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(error) => {
            debug!(error = %error, "skipping invalid ws message json");
            return None;
        }
    };

    if let (Some(id), Some(result)) = (value.get("id"), value.get("result")) {
        let request_id = id.as_u64()?;
        if let Some(subscription) = result.as_u64() {
            return Some(WsEvent::SubscribeAck {
                request_id,
                subscription,
            });
        }
        // logsUnsubscribe answers with a bool
        return None;
    }
    if let Some(error) = value.get("error") {
        debug!(id = ?value.get("id"), error = %error, "ws request rejected");
        return value
            .get("id")
            .and_then(Value::as_u64)
            .map(|request_id| WsEvent::RequestRejected { request_id });
    }

    let method = value.get("method").and_then(Value::as_str)?;
    if method != "logsNotification" {
        return None;
    }

    let params = value.get("params")?;
    let subscription = params.get("subscription").and_then(Value::as_u64)?;
    let result = params.get("result")?;
    let event = result.get("value")?;

    let signature = event.get("signature")?.as_str()?.trim().to_string();
    if signature.is_empty() {
        return None;
    }
    let slot = result
        .get("context")
        .and_then(|context| context.get("slot"))
        .and_then(Value::as_u64);
    let is_failed = event.get("err").map(|err| !err.is_null()).unwrap_or(false);

    Some(WsEvent::Notification(LogsNotification {
        subscription,
        signature,
        slot,
        is_failed,
    }))
}

/// Splits an enhanced-transactions response into resolved records and the
/// requested signatures the endpoint did not return.
///
/// Returns `None` when the body is not a JSON array.
pub(super) fn split_enhanced_response(requested: &[String], body: Value) -> Option<EnrichedBatch> {
    let Value::Array(items) = body else {
        return None;
    };
    let wanted: HashSet<&str> = requested.iter().map(String::as_str).collect();
    let mut records: HashMap<String, Value> = HashMap::with_capacity(items.len());
    for item in items {
        let Some(signature) = item.get("signature").and_then(Value::as_str) else {
            continue;
        };
        if !wanted.contains(signature) || records.contains_key(signature) {
            continue;
        }
        records.insert(signature.to_string(), item);
    }

    let mut seen = HashSet::with_capacity(requested.len());
    let missing = requested
        .iter()
        .filter(|signature| !records.contains_key(signature.as_str()))
        .filter(|signature| seen.insert(signature.as_str()))
        .cloned()
        .collect();
    Some(EnrichedBatch {
        records,
        missing,
        rate_limited: 0,
    })
}
