//! Token-usage extraction from buffered Anthropic response bodies.
//!
//! Two body shapes exist: a plain JSON message (non-streaming) with a
//! top-level `usage` object, and an SSE stream where `message_start` carries
//! the initial usage under `message.usage` and later `message_delta` events
//! carry cumulative counters at the top level. Later deltas win.

use serde_json::Value;

use crate::proxy::sse::SseFramer;
use crate::usage::TokenUsage;

/// Extract token usage from a complete response body.
///
/// Returns `None` when no usage object is found anywhere; the caller records
/// zeros in that case.
pub fn extract_usage(body: &[u8]) -> Option<TokenUsage> {
    if let Ok(doc) = serde_json::from_slice::<Value>(body) {
        return usage_from_value(doc.get("usage")?);
    }
    extract_from_sse(body)
}

/// Walk a buffered SSE body and merge usage from `message_start` and
/// `message_delta` events.
fn extract_from_sse(body: &[u8]) -> Option<TokenUsage> {
    let mut framer = SseFramer::new();
    let mut frames = framer.feed(body);
    if let Some(tail) = framer.finish() {
        frames.push(tail);
    }

    let mut seen: Option<TokenUsage> = None;
    for frame in frames {
        let Ok(data) = serde_json::from_str::<Value>(&frame.data) else {
            continue;
        };
        // The event name may arrive via the `event:` line or the payload's
        // own `type` field; accept either.
        let kind = frame
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        let usage_value = match kind.as_str() {
            "message_start" => data.get("message").and_then(|m| m.get("usage")),
            "message_delta" => data.get("usage"),
            _ => None,
        };
        let Some(usage_value) = usage_value else {
            continue;
        };

        let mut merged = seen.unwrap_or_default();
        merge_usage(&mut merged, usage_value);
        seen = Some(merged);
    }
    seen.filter(|u| !u.is_empty())
}

/// Read a complete usage object; absent fields become zero.
fn usage_from_value(value: &Value) -> Option<TokenUsage> {
    if !value.is_object() {
        return None;
    }
    let mut usage = TokenUsage::default();
    merge_usage(&mut usage, value);
    Some(usage)
}

/// Overwrite only the counters present in `value`, so a `message_delta`
/// that carries just `output_tokens` keeps the `message_start` input counts.
fn merge_usage(usage: &mut TokenUsage, value: &Value) {
    if let Some(n) = value.get("input_tokens").and_then(Value::as_u64) {
        usage.input_tokens = n;
    }
    if let Some(n) = value.get("output_tokens").and_then(Value::as_u64) {
        usage.output_tokens = n;
    }
    if let Some(n) = value
        .get("cache_creation_input_tokens")
        .and_then(Value::as_u64)
    {
        usage.cache_creation_input_tokens = n;
    }
    if let Some(n) = value.get("cache_read_input_tokens").and_then(Value::as_u64) {
        usage.cache_read_input_tokens = n;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
