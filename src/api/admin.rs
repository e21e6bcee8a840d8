//! Admin usage API.
//!
//! Mounted under `admin.path` when `admin.enabled`, guarded by HTTP Basic
//! auth against the configured credentials, and exempt from tenant
//! authentication. Unknown tenants simply have no usage files, so usage
//! queries return zeroed aggregations rather than 404.

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::config::AdminConfig;
use crate::AppState;

const ADMIN_CHALLENGE: &str = "Basic realm=\"CCGate Admin\"";

/// Assemble the admin routes with the Basic-auth gate applied.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/usage/{tenant}/daily", get(daily_usage))
        .route("/usage/{tenant}/weekly", get(weekly_usage))
        .route("/usage/{tenant}/monthly", get(monthly_usage))
        .route("/usage/{tenant}/range", get(range_usage))
        .route("/limits/{tenant}", get(limit_status))
        .route("/upstreams", get(upstreams))
        .route("/reload", post(reload))
        .layer(middleware::from_fn_with_state(state, require_admin))
}

// ---------------------------------------------------------------------------
// Basic auth
// ---------------------------------------------------------------------------

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let config = state.config.snapshot().await;
    if !credentials_match(request.headers().get(header::AUTHORIZATION), &config.admin) {
        return unauthorized();
    }
    next.run(request).await
}

/// Validate `Authorization: Basic <b64(user:pass)>` without revealing which
/// part mismatched.
fn credentials_match(
    authorization: Option<&axum::http::HeaderValue>,
    admin: &AdminConfig,
) -> bool {
    let Some(value) = authorization.and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((username, password)) = decoded.split_once(':') else {
        return false;
    };
    username == admin.username && password == admin.password
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, ADMIN_CHALLENGE)],
        Json(json!({
            "error": {"type": "unauthorized", "message": "admin credentials required"}
        })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"type": "invalid_request_error", "message": message}})),
    )
        .into_response()
}

/// Tenant ids become path components of the usage layout; refuse anything
/// that could escape it.
fn validate_tenant(tenant: &str) -> Result<(), Response> {
    if tenant.is_empty()
        || tenant.contains('/')
        || tenant.contains('\\')
        || tenant.contains("..")
    {
        return Err(bad_request("invalid tenant id"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Usage queries
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DailyParams {
    date: Option<String>,
}

/// GET {admin}/usage/{tenant}/daily?date=YYYY-MM-DD (defaults to today UTC)
async fn daily_usage(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<DailyParams>,
) -> Response {
    if let Err(response) = validate_tenant(&tenant) {
        return response;
    }
    let date = match parse_date_or_today(params.date.as_deref()) {
        Ok(date) => date,
        Err(response) => return response,
    };
    Json(state.store.daily_usage(&tenant, date).await).into_response()
}

#[derive(Debug, Deserialize)]
struct WeeklyParams {
    start: Option<String>,
}

/// GET {admin}/usage/{tenant}/weekly?start=YYYY-MM-DD (defaults to the
/// 7-day window ending today)
async fn weekly_usage(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<WeeklyParams>,
) -> Response {
    if let Err(response) = validate_tenant(&tenant) {
        return response;
    }
    let start = match params.start.as_deref() {
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => return bad_request("start must be YYYY-MM-DD"),
        },
        None => Utc::now().date_naive() - Duration::days(6),
    };
    Json(state.store.weekly_usage(&tenant, start).await).into_response()
}

#[derive(Debug, Deserialize)]
struct MonthlyParams {
    year: Option<i32>,
    month: Option<u32>,
}

/// GET {admin}/usage/{tenant}/monthly?year=YYYY&month=M (defaults to the
/// current month)
async fn monthly_usage(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<MonthlyParams>,
) -> Response {
    if let Err(response) = validate_tenant(&tenant) {
        return response;
    }
    let today = Utc::now().date_naive();
    let year = params.year.unwrap_or_else(|| today.year());
    let month = params.month.unwrap_or_else(|| today.month());

    match state.store.monthly_usage(&tenant, year, month).await {
        Some(usage) => Json(usage).into_response(),
        None => bad_request("invalid year/month"),
    }
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    from: Option<String>,
    to: Option<String>,
}

/// GET {admin}/usage/{tenant}/range?from=YYYY-MM-DD&to=YYYY-MM-DD
async fn range_usage(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<RangeParams>,
) -> Response {
    if let Err(response) = validate_tenant(&tenant) {
        return response;
    }
    let (Some(from), Some(to)) = (params.from.as_deref(), params.to.as_deref()) else {
        return bad_request("from and to are required");
    };
    let (Ok(from), Ok(to)) = (
        NaiveDate::parse_from_str(from, "%Y-%m-%d"),
        NaiveDate::parse_from_str(to, "%Y-%m-%d"),
    ) else {
        return bad_request("dates must be YYYY-MM-DD");
    };
    if from > to {
        return bad_request("from must not be after to");
    }
    Json(state.store.usage_in_range(&tenant, from, to).await).into_response()
}

/// GET {admin}/limits/{tenant}
async fn limit_status(State(state): State<AppState>, Path(tenant): Path<String>) -> Response {
    if let Err(response) = validate_tenant(&tenant) {
        return response;
    }
    let config = state.config.snapshot().await;
    let max_usd = config
        .tenant_by_id(&tenant)
        .and_then(|t| t.daily_max_usd());
    Json(state.store.limit_status(&tenant, max_usd).await).into_response()
}

/// GET {admin}/upstreams
async fn upstreams(State(state): State<AppState>) -> Response {
    let status = state.balancer.read().await.status();
    Json(json!({"upstreams": status})).into_response()
}

/// POST {admin}/reload
async fn reload(State(state): State<AppState>) -> Response {
    match state.reload().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Config reload failed");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"type": "invalid_config", "message": e.to_string()}})),
            )
                .into_response()
        }
    }
}

fn parse_date_or_today(raw: Option<&str>) -> Result<NaiveDate, Response> {
    match raw {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| bad_request("date must be YYYY-MM-DD")),
        None => Ok(Utc::now().date_naive()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
