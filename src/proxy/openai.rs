//! OpenAI Chat Completions front-end.
//!
//! Wraps the Anthropic proxy pipeline: the request is re-shaped into a
//! Messages call, forwarded through the same authenticate/limit/balance
//! path, and the upstream's response (JSON or SSE) is translated back into
//! the Chat Completions shape. The translator owns the response status and
//! headers; the underlying proxy only supplies the metered byte stream.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::OpenAiConfig;
use crate::error::{openai_error_body, ProxyError};
use crate::proxy::sse::{SseFrame, SseFramer};
use crate::proxy::{
    authorize, describe_client, forward, new_request_id, MeteredStream, RequestContext,
    UpstreamResponse,
};
use crate::AppState;

/// Synthetic path handed to the shared pipeline; the `/anthropic` prefix is
/// stripped there, so upstreams with a base path still get it grafted on.
const MESSAGES_PATH: &str = "/anthropic/v1/messages";

/// Stable identity presented to upstreams in place of the caller's UA.
const TRANSLATOR_USER_AGENT: &str = concat!("ccgate-openai-compat/", env!("CARGO_PKG_VERSION"));

const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Wrapper-injected system prompts that must not reach the upstream.
const WRAPPER_MARKERS: [&str; 3] = ["Current model:", "GPT", "You are a helpful assistant"];

const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    stop: Option<StopSpec>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Value,
}

/// `stop` accepts a single string or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StopSpec {
    One(String),
    Many(Vec<String>),
}

impl StopSpec {
    fn into_sequences(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

// ---------------------------------------------------------------------------
// Request transform
// ---------------------------------------------------------------------------

/// Map the OpenAI request onto an Anthropic Messages body. Returns the body
/// plus the resolved Anthropic model and the stream flag.
fn transform_request(config: &OpenAiConfig, request: ChatCompletionRequest) -> (Value, String, bool) {
    let model = config
        .models
        .get(&request.model)
        .cloned()
        .or_else(|| config.default_model.clone())
        .unwrap_or(request.model);

    let messages: Vec<Value> = request
        .messages
        .into_iter()
        .filter_map(scrub_message)
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();

    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), Value::String(model.clone()));
    body.insert(
        "max_tokens".to_string(),
        json!(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    body.insert("messages".to_string(), Value::Array(messages));
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = request.stop {
        body.insert("stop_sequences".to_string(), json!(stop.into_sequences()));
    }
    if request.stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }

    (Value::Object(body), model, request.stream)
}

/// Drop wrapper-injected system/developer messages; coerce the remaining
/// ones to user role (the Messages API has no inline system role).
fn scrub_message(message: ChatMessage) -> Option<ChatMessage> {
    match message.role.as_str() {
        "system" | "developer" => {
            let text = content_text(&message.content);
            if WRAPPER_MARKERS.iter().any(|marker| text.contains(marker)) {
                return None;
            }
            Some(ChatMessage {
                role: "user".to_string(),
                content: message.content,
            })
        }
        _ => Some(message),
    }
}

/// Visible text of a message content value (plain string or content parts).
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// Remove browser-origin headers and present a stable upstream identity.
fn scrub_headers(client: &HeaderMap) -> HeaderMap {
    let mut headers = client.clone();
    headers.remove(header::REFERER);
    headers.remove(header::ORIGIN);

    let browser_prefixed: Vec<_> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name.starts_with("sec-fetch-") || name.starts_with("sec-ch-ua")
        })
        .cloned()
        .collect();
    for name in browser_prefixed {
        headers.remove(name);
    }

    headers.insert(
        header::USER_AGENT,
        header::HeaderValue::from_static(TRANSLATOR_USER_AGENT),
    );
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    headers
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// `POST /openai/v1/chat/completions`
pub async fn chat_completions(State(state): State<AppState>, request: Request) -> Response {
    let request_id = new_request_id();
    let start = Instant::now();

    let config = state.config.snapshot().await;
    if !config.openai.enabled {
        return ProxyError::ServiceUnavailable("OpenAI layer disabled".to_string())
            .into_openai_response();
    }

    let (parts, body) = request.into_parts();
    let (user_agent, client_ip) = describe_client(&parts.headers, &parts.extensions);

    let body = match to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("failed to read request body: {e}"))
                .into_openai_response();
        }
    };
    let chat_request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("bad JSON: {e}")).into_openai_response();
        }
    };

    let requested_model = chat_request.model.clone();
    let (anthropic_body, model, stream) = transform_request(&config.openai, chat_request);
    let anthropic_bytes = match serde_json::to_vec(&anthropic_body) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => return ProxyError::Internal(e.to_string()).into_openai_response(),
    };

    // Authentication sees the client's own headers but the translated body,
    // so allow-lists gate the Anthropic model that will actually run.
    let outcome = match authorize(&state, &parts.headers, parts.uri.query(), &anthropic_bytes).await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(request_id = %request_id, kind = e.kind(), "OpenAI request rejected");
            return e.into_openai_response();
        }
    };

    tracing::info!(
        request_id = %request_id,
        tenant_id = %outcome.tenant.id,
        requested_model = %requested_model,
        model = %model,
        stream,
        "Translating OpenAI request"
    );

    let ctx = RequestContext {
        request_id: request_id.clone(),
        start,
        tenant: outcome.tenant,
        model: Some(model.clone()),
        user_agent,
        client_ip,
    };

    let upstream = match forward(
        &state,
        ctx,
        Method::POST,
        MESSAGES_PATH,
        None,
        &scrub_headers(&parts.headers),
        anthropic_bytes,
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(e) => return e.into_openai_response(),
    };

    if !upstream.status.is_success() {
        return upstream_error_response(upstream).await;
    }

    if stream {
        streaming_response(upstream, model)
    } else {
        non_streaming_response(upstream, model).await
    }
}

/// Re-shape an upstream error body (Anthropic error JSON) into the OpenAI
/// error format, preserving the upstream status.
async fn upstream_error_response(upstream: UpstreamResponse) -> Response {
    let status = upstream.status;
    let body = match upstream.stream.collect_body().await {
        Ok(body) => body,
        Err(e) => return e.into_openai_response(),
    };

    let message = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|doc| {
            doc.get("error")?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());

    json_response(status, openai_error_body(&message, "api_error", None))
}

/// Buffer the whole upstream message and emit one `chat.completion`.
async fn non_streaming_response(upstream: UpstreamResponse, model: String) -> Response {
    let body = match upstream.stream.collect_body().await {
        Ok(body) => body,
        Err(e) => return e.into_openai_response(),
    };

    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(_) => {
            return ProxyError::Upstream("upstream returned invalid JSON".to_string())
                .into_openai_response();
        }
    };

    let completion = completion_from_message(&message, &model);
    match serde_json::to_vec(&completion) {
        Ok(bytes) => json_response(StatusCode::OK, bytes),
        Err(e) => ProxyError::Internal(e.to_string()).into_openai_response(),
    }
}

fn completion_from_message(message: &Value, model: &str) -> Value {
    let content: String = message
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = finish_reason(message.get("stop_reason").and_then(Value::as_str));

    let usage = message.get("usage");
    let prompt_tokens = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion_tokens = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("end_turn") => "stop",
        _ => "length",
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Take over status and headers for the SSE case and translate the stream.
fn streaming_response(upstream: UpstreamResponse, model: String) -> Response {
    let stream = OpenAiStream::new(upstream.stream, model);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

// ---------------------------------------------------------------------------
// Streaming translator
// ---------------------------------------------------------------------------

/// Translates the Anthropic SSE stream into `chat.completion.chunk` frames.
///
/// Consumes the metered stream, so usage accounting still happens on the raw
/// Anthropic bytes. After the upstream ends (or errors, which re-emits the
/// error as a data chunk) a single `data: [DONE]` frame closes the stream.
struct OpenAiStream {
    inner: MeteredStream,
    framer: SseFramer,
    queue: VecDeque<Bytes>,
    id: String,
    created: i64,
    model: String,
    inner_done: bool,
    done_sent: bool,
}

impl OpenAiStream {
    fn new(inner: MeteredStream, model: String) -> Self {
        Self {
            inner,
            framer: SseFramer::new(),
            queue: VecDeque::new(),
            id: completion_id(),
            created: Utc::now().timestamp(),
            model,
            inner_done: false,
            done_sent: false,
        }
    }

    /// One OpenAI chunk frame.
    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Bytes {
        let payload = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        Bytes::from(format!("data: {payload}\n\n"))
    }

    /// Translate one Anthropic SSE frame; most event types emit nothing.
    fn translate(&self, frame: &SseFrame) -> Option<Bytes> {
        if frame.data.is_empty() {
            return None;
        }
        let data: Value = serde_json::from_str(&frame.data).ok()?;
        let kind = frame
            .event
            .clone()
            .or_else(|| data.get("type").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();

        match kind.as_str() {
            "message_start" => {
                Some(self.chunk(json!({"role": "assistant", "content": ""}), None))
            }
            "content_block_delta" => {
                let text = data.get("delta")?.get("text")?.as_str()?;
                Some(self.chunk(json!({"content": text}), None))
            }
            "message_delta" => {
                let stop_reason = data.get("delta")?.get("stop_reason")?.as_str()?;
                Some(self.chunk(json!({}), Some(finish_reason(Some(stop_reason)))))
            }
            "message_stop" => Some(self.chunk(json!({}), Some("stop"))),
            "error" => {
                // Surface the upstream's mid-stream error as one chunk.
                let error = data.get("error").cloned().unwrap_or(data);
                Some(Bytes::from(format!("data: {}\n\n", json!({"error": error}))))
            }
            _ => None,
        }
    }
}

impl Stream for OpenAiStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(frame) = this.queue.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            if this.inner_done {
                if !this.done_sent {
                    this.done_sent = true;
                    return Poll::Ready(Some(Ok(Bytes::from_static(b"data: [DONE]\n\n"))));
                }
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    for frame in this.framer.feed(&chunk) {
                        if let Some(out) = this.translate(&frame) {
                            this.queue.push_back(out);
                        }
                    }
                    // Loop: emit queued frames, or poll for more input.
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::warn!(error = %e, "Upstream stream error during translation");
                    let body = json!({"error": {"message": e.to_string(), "type": "api_error"}});
                    this.queue.push_back(Bytes::from(format!("data: {body}\n\n")));
                    this.inner_done = true;
                }
                Poll::Ready(None) => {
                    if let Some(frame) = this.framer.finish() {
                        if let Some(out) = this.translate(&frame) {
                            this.queue.push_back(out);
                        }
                    }
                    this.inner_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
