//! The Anthropic-facing reverse proxy.
//!
//! One pipeline serves both front-ends: buffer the request body, authenticate
//! the tenant, run the spend-limit preflight, pick an upstream, rewrite path
//! and headers, then stream the upstream response back while tee-ing the
//! bytes into a buffer that is read once, after the stream closes, to meter
//! token usage. The OpenAI front-end (`openai` module) wraps the same
//! `forward` call and transforms the returned stream instead of passing it
//! through.

pub mod openai;
pub mod sse;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures::Stream;
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::auth::{AuthOutcome, Authenticator};
use crate::config::{Config, Tenant};
use crate::error::ProxyError;
use crate::limits::LimitGuard;
use crate::pricing::Pricer;
use crate::usage::extract::extract_usage;
use crate::usage::{TokenUsage, UsageRecord};
use crate::AppState;

/// Upper bound on buffered request bodies.
const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Per-request metadata carried into the meter.
pub struct RequestContext {
    pub request_id: String,
    pub start: Instant,
    pub tenant: Tenant,
    pub model: Option<String>,
    pub user_agent: String,
    pub client_ip: String,
}

/// 8 random bytes as lowercase hex; tags every log line and error body.
pub fn new_request_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// User agent and client IP for the usage record. The IP prefers the first
/// `X-Forwarded-For` hop, then the socket peer address.
pub fn describe_client(headers: &HeaderMap, extensions: &axum::http::Extensions) -> (String, String) {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            extensions
                .get::<ConnectInfo<std::net::SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_default();

    (user_agent, client_ip)
}

// ---------------------------------------------------------------------------
// Authentication + limit preflight
// ---------------------------------------------------------------------------

/// Authenticate against the current snapshot and, when a model was present
/// in the body, run the daily-limit preflight (with a zero token projection,
/// which catches tenants whose spend already meets the cap).
pub async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: Option<&str>,
    body: &[u8],
) -> Result<AuthOutcome, ProxyError> {
    let config = state.config.snapshot().await;
    let outcome = Authenticator::new(config.clone()).authenticate(headers, query, body)?;

    if let Some(ref model) = outcome.model {
        let guard = LimitGuard::new(state.store.clone(), Pricer::new(config));
        guard
            .check(&outcome.tenant, model, &TokenUsage::default())
            .await?;
    }
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

/// The upstream's answer, with the body wrapped in a metering tee.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub upstream_id: String,
    pub stream: MeteredStream,
}

/// Select an upstream and forward the buffered request to it.
///
/// Fails with `upstream_error` only before any response byte exists, so the
/// caller can still render a clean 502.
pub async fn forward(
    state: &AppState,
    ctx: RequestContext,
    method: Method,
    path: &str,
    query: Option<&str>,
    client_headers: &HeaderMap,
    body: Bytes,
) -> Result<UpstreamResponse, ProxyError> {
    let config = state.config.snapshot().await;
    let upstream = state.balancer.write().await.select()?;

    let base = Url::parse(&upstream.url)
        .map_err(|e| ProxyError::Internal(format!("upstream '{}' url: {e}", upstream.id)))?;
    let mut target = base.clone();
    target.set_path(&rewrite_path(&base, path));
    target.set_query(query);

    let headers = upstream_headers(client_headers, upstream.key.as_deref());
    let timeout = Duration::from_millis(config.proxy.timeout);

    tracing::debug!(
        request_id = %ctx.request_id,
        upstream_id = %upstream.id,
        url = %target,
        "Forwarding to upstream"
    );

    let response = state
        .client
        .request(method, target)
        .headers(headers)
        .timeout(timeout)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(
                request_id = %ctx.request_id,
                upstream_id = %upstream.id,
                error = %e,
                "Upstream request failed"
            );
            ProxyError::Upstream(e.to_string())
        })?;

    let status = response.status();
    let headers = response.headers().clone();
    let meter = Meter {
        tx: state.usage_tx.clone(),
        config,
        request_id: ctx.request_id,
        tenant_id: ctx.tenant.id,
        model: ctx.model.unwrap_or_default(),
        upstream_id: upstream.id.clone(),
        status_code: status.as_u16(),
        user_agent: ctx.user_agent,
        client_ip: ctx.client_ip,
        start: ctx.start,
    };

    Ok(UpstreamResponse {
        status,
        headers,
        upstream_id: upstream.id,
        stream: MeteredStream::new(Box::pin(response.bytes_stream()), meter),
    })
}

/// Strip the `/anthropic` mount prefix and graft the upstream's own base
/// path in front; other paths pass through unchanged.
fn rewrite_path(base: &Url, incoming: &str) -> String {
    match incoming.strip_prefix("/anthropic") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let rest = if rest.is_empty() { "/" } else { rest };
            let base_path = base.path().trim_end_matches('/');
            if base_path.is_empty() {
                rest.to_string()
            } else {
                format!("{base_path}{rest}")
            }
        }
        _ => incoming.to_string(),
    }
}

/// Headers for the upstream request: the client's headers minus hop-by-hop
/// fields, with the upstream's credential swapped in.
fn upstream_headers(client_headers: &HeaderMap, upstream_key: Option<&str>) -> HeaderMap {
    let mut headers = client_headers.clone();

    // The HTTP client derives these from the new request.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    for name in [
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
    ] {
        headers.remove(name);
    }
    // Keep the upstream body identity-encoded so the meter can read it; the
    // bytes forwarded to the client are whatever the upstream sends.
    headers.remove(header::ACCEPT_ENCODING);

    if let Some(key) = upstream_key {
        if let Ok(value) = format!("Bearer {key}").parse() {
            headers.insert(header::AUTHORIZATION, value);
        }
        headers.remove("x-api-key");
    }
    headers
}

/// Response headers forwarded back to the client (hop-by-hop fields are
/// owned by each connection and dropped).
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in [
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::TE,
        header::TRAILER,
    ] {
        headers.remove(name);
    }
    headers
}

// ---------------------------------------------------------------------------
// Metering tee
// ---------------------------------------------------------------------------

/// Everything needed to assemble and enqueue the usage record once the
/// response body is complete.
struct Meter {
    tx: UnboundedSender<UsageRecord>,
    config: Arc<Config>,
    request_id: String,
    tenant_id: String,
    model: String,
    upstream_id: String,
    status_code: u16,
    user_agent: String,
    client_ip: String,
    start: Instant,
}

impl Meter {
    fn finalize(self, body: &[u8]) {
        let usage = extract_usage(body).unwrap_or_default();
        let cost = Pricer::new(self.config.clone()).cost(&self.model, &usage);
        let record = UsageRecord {
            request_id: self.request_id,
            tenant_id: self.tenant_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            model: self.model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            total_tokens: usage.total(),
            input_cost: cost.input_cost,
            output_cost: cost.output_cost,
            cache_creation_cost: cost.cache_creation_cost,
            cache_read_cost: cost.cache_read_cost,
            total_cost: cost.total_cost,
            duration: self.start.elapsed().as_millis() as u64,
            status_code: self.status_code,
            upstream_id: self.upstream_id,
            user_agent: self.user_agent,
            client_ip: self.client_ip,
        };
        if self.tx.send(record).is_err() {
            tracing::warn!("Usage writer channel closed; dropping record");
        }
    }
}

/// Forwards upstream bytes unchanged while copying them aside for metering.
///
/// The copy is write-only during streaming and read exactly once when the
/// body ends. Ending means: upstream EOF, an upstream mid-body error, or the
/// client going away (the response body is dropped) -- in every case the
/// record is written exactly once, with whatever tokens were observed.
pub struct MeteredStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    captured: Vec<u8>,
    meter: Option<Meter>,
}

impl MeteredStream {
    fn new(
        inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
        meter: Meter,
    ) -> Self {
        Self {
            inner,
            captured: Vec::new(),
            meter: Some(meter),
        }
    }

    fn finalize(&mut self) {
        if let Some(meter) = self.meter.take() {
            meter.finalize(&self.captured);
        }
    }

    /// Drain the stream and return the whole body (used by the OpenAI
    /// non-streaming transform). Metering fires as part of the drain.
    pub async fn collect_body(mut self) -> Result<Bytes, ProxyError> {
        use futures::StreamExt;
        while let Some(chunk) = self.next().await {
            chunk.map_err(|e| ProxyError::Upstream(e.to_string()))?;
        }
        Ok(Bytes::from(std::mem::take(&mut self.captured)))
    }
}

impl Stream for MeteredStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.captured.extend_from_slice(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Headers are long gone; terminate the stream and account
                // for what was delivered.
                tracing::warn!(error = %e, "Upstream body error mid-stream");
                this.finalize();
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                this.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        // Client disconnects drop the body without polling to EOF.
        self.finalize();
    }
}

// ---------------------------------------------------------------------------
// Anthropic handler
// ---------------------------------------------------------------------------

/// `/anthropic/**` and pass-through paths: transparent reverse proxy.
pub async fn handle_anthropic(State(state): State<AppState>, request: Request) -> Response {
    let request_id = new_request_id();
    let start = Instant::now();

    let (parts, body) = request.into_parts();
    let (user_agent, client_ip) = describe_client(&parts.headers, &parts.extensions);

    let body = match to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("failed to read request body: {e}"))
                .into_anthropic_response(&request_id);
        }
    };

    let outcome = match authorize(&state, &parts.headers, parts.uri.query(), &body).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(request_id = %request_id, kind = e.kind(), "Request rejected");
            return e.into_anthropic_response(&request_id);
        }
    };

    tracing::info!(
        request_id = %request_id,
        tenant_id = %outcome.tenant.id,
        model = outcome.model.as_deref().unwrap_or("-"),
        method = %parts.method,
        path = %parts.uri.path(),
        "Proxying request"
    );

    let ctx = RequestContext {
        request_id: request_id.clone(),
        start,
        tenant: outcome.tenant,
        model: outcome.model,
        user_agent,
        client_ip,
    };

    let upstream = match forward(
        &state,
        ctx,
        parts.method,
        parts.uri.path(),
        parts.uri.query(),
        &parts.headers,
        body,
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(e) => return e.into_anthropic_response(&request_id),
    };

    stream_response(upstream, &request_id)
}

/// Write the upstream's status and headers once, then stream the body
/// verbatim.
fn stream_response(upstream: UpstreamResponse, request_id: &str) -> Response {
    let mut builder = Response::builder().status(upstream.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response_headers(&upstream.headers);
    }

    match builder.body(Body::from_stream(upstream.stream)) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "Failed to build response");
            ProxyError::Internal("failed to build response".to_string())
                .into_anthropic_response(request_id)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
