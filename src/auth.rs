//! Tenant authentication and model gating.
//!
//! Credentials are accepted from four places, in order: `Authorization:
//! Bearer`, `Authorization: API-Key`, the `X-Api-Key` header, and the
//! `api_key` query parameter. Tenants are resolved by exact key match
//! against the current config snapshot. The health and admin paths never
//! reach this code.

use std::sync::Arc;

use axum::http::{header, HeaderMap};

use crate::config::{Config, Tenant};
use crate::error::ProxyError;
use crate::wildcard;

/// A successfully authenticated request.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub tenant: Tenant,
    /// Model name pulled from the JSON request body, when present.
    pub model: Option<String>,
}

pub struct Authenticator {
    config: Arc<Config>,
}

impl Authenticator {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Authenticate a request and run the model allow-list gate.
    ///
    /// `query` is the raw query string (for the `api_key` fallback); `body`
    /// is the buffered request body the model is read from. A body that is
    /// not JSON, or has no `model` field, skips the model check -- the
    /// upstream may still reject it.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
        body: &[u8],
    ) -> Result<AuthOutcome, ProxyError> {
        let key = extract_credential(headers, query).ok_or(ProxyError::MissingAuth)?;

        let tenant = self
            .config
            .tenant_by_key(&key)
            .ok_or(ProxyError::InvalidKey)?;

        if !tenant.enabled {
            tracing::warn!(tenant_id = %tenant.id, "Rejected request for disabled tenant");
            return Err(ProxyError::TenantDisabled);
        }

        let model = model_from_body(body);
        if let Some(ref model) = model {
            if !tenant.allowed_models.is_empty()
                && wildcard::find_first(&tenant.allowed_models, model).is_none()
            {
                tracing::warn!(
                    tenant_id = %tenant.id,
                    model = %model,
                    "Model not in tenant allow-list"
                );
                return Err(ProxyError::ModelNotAllowed(model.clone()));
            }
        }

        Ok(AuthOutcome {
            tenant: tenant.clone(),
            model,
        })
    }
}

/// Pull the client credential out of the request, first match wins.
fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
        if let Some(token) = value.strip_prefix("API-Key ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(token) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    if let Some(query) = query {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if name == "api_key" && !value.is_empty() {
                return Some(value.into_owned());
            }
        }
    }

    None
}

/// Read the `model` field from a JSON request body, if any.
fn model_from_body(body: &[u8]) -> Option<String> {
    let doc: serde_json::Value = serde_json::from_slice(body).ok()?;
    doc.get("model")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
