//! Per-request error kinds and their wire renderings.
//!
//! Every failure that reaches a client maps to one stable kind (the strings
//! below appear verbatim in response bodies and logs). The Anthropic-facing
//! front-end renders `{error:{type,message,timestamp},requestId}`; the
//! OpenAI-facing front-end renders `{error:{message,type,code}}`.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use chrono::Utc;
use serde::Serialize;

/// Challenge attached to 401 responses on the Anthropic front-end.
pub const WWW_AUTHENTICATE: &str = "Bearer realm=\"CCGate API\", charset=\"UTF-8\"";

// ---------------------------------------------------------------------------
// ProxyError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing credentials")]
    MissingAuth,

    #[error("invalid API key")]
    InvalidKey,

    #[error("tenant disabled")]
    TenantDisabled,

    #[error("model {0} not permitted")]
    ModelNotAllowed(String),

    #[error("{0}")]
    LimitExceeded(String),

    #[error("no healthy upstream")]
    NoUpstream,

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    /// Stable identifier, used as the Anthropic-side error `type` and the
    /// OpenAI-side error `code`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingAuth => "missing_auth",
            Self::InvalidKey => "invalid_key",
            Self::TenantDisabled => "tenant_disabled",
            Self::ModelNotAllowed(_) => "model_not_allowed",
            Self::LimitExceeded(_) => "limit_exceeded",
            Self::NoUpstream => "no_upstream",
            Self::Upstream(_) => "upstream_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingAuth | Self::InvalidKey => StatusCode::UNAUTHORIZED,
            Self::TenantDisabled | Self::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NoUpstream | Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI error-family name for this kind.
    fn openai_type(&self) -> &'static str {
        match self {
            Self::MissingAuth | Self::InvalidKey => "authentication_error",
            Self::TenantDisabled | Self::ModelNotAllowed(_) => "permission_error",
            Self::LimitExceeded(_) => "rate_limit_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::NoUpstream | Self::Upstream(_) | Self::ServiceUnavailable(_) => "api_error",
            Self::Internal(_) => "server_error",
        }
    }

    /// Render for the Anthropic front-end, tagged with the request id.
    pub fn into_anthropic_response(self, request_id: &str) -> Response {
        #[derive(Serialize)]
        struct Detail {
            #[serde(rename = "type")]
            kind: &'static str,
            message: String,
            timestamp: String,
        }
        #[derive(Serialize)]
        struct ErrorBody {
            error: Detail,
            #[serde(rename = "requestId")]
            request_id: String,
        }

        let status = self.status();
        let body = ErrorBody {
            error: Detail {
                kind: self.kind(),
                message: self.to_string(),
                timestamp: Utc::now().to_rfc3339(),
            },
            request_id: request_id.to_string(),
        };

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");
        if status == StatusCode::UNAUTHORIZED {
            builder = builder.header(header::WWW_AUTHENTICATE, WWW_AUTHENTICATE);
        }
        builder
            .body(Body::from(
                serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec()),
            ))
            .unwrap_or_else(|_| {
                Response::new(Body::from(r#"{"error":{"type":"internal_error"}}"#))
            })
    }

    /// Render for the OpenAI front-end.
    pub fn into_openai_response(self) -> Response {
        let status = self.status();
        let body = openai_error_body(&self.to_string(), self.openai_type(), Some(self.kind()));

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| {
                Response::new(Body::from(r#"{"error":{"type":"server_error"}}"#))
            })
    }
}

/// Serialized OpenAI-shape error object.
pub fn openai_error_body(message: &str, kind: &str, code: Option<&str>) -> Vec<u8> {
    #[derive(Serialize)]
    struct Detail<'a> {
        message: &'a str,
        #[serde(rename = "type")]
        kind: &'a str,
        code: Option<&'a str>,
    }
    #[derive(Serialize)]
    struct ErrorBody<'a> {
        error: Detail<'a>,
    }

    serde_json::to_vec(&ErrorBody {
        error: Detail {
            message,
            kind,
            code,
        },
    })
    .unwrap_or_else(|_| b"{}".to_vec())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_statuses() {
        assert_eq!(ProxyError::MissingAuth.kind(), "missing_auth");
        assert_eq!(ProxyError::MissingAuth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyError::InvalidKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyError::TenantDisabled.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ProxyError::ModelNotAllowed("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProxyError::LimitExceeded("over".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ProxyError::NoUpstream.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ProxyError::Upstream("io".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::InvalidRequest("bad".into()).kind(),
            "invalid_request_error"
        );
        assert_eq!(
            ProxyError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_anthropic_rendering_includes_request_id_and_challenge() {
        let resp = ProxyError::MissingAuth.into_anthropic_response("a1b2c3d4e5f60708");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            WWW_AUTHENTICATE
        );

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "missing_auth");
        assert_eq!(json["error"]["message"], "missing credentials");
        assert_eq!(json["requestId"], "a1b2c3d4e5f60708");
        assert!(json["error"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_anthropic_rendering_non_401_has_no_challenge() {
        let resp = ProxyError::NoUpstream.into_anthropic_response("00");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().get(header::WWW_AUTHENTICATE).is_none());
    }

    #[tokio::test]
    async fn test_openai_rendering_shape() {
        let resp = ProxyError::ServiceUnavailable("OpenAI layer disabled".into())
            .into_openai_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["message"], "OpenAI layer disabled");
        assert_eq!(json["error"]["type"], "api_error");
        assert_eq!(json["error"]["code"], "service_unavailable");
    }
}
