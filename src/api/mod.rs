pub mod admin;
pub mod health;

use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::proxy;
use crate::AppState;

/// Build the full application router.
///
/// Route layout:
/// ```text
/// /health                         GET     health JSON (no auth)
/// /openai/v1/chat/completions     POST    OpenAI translator
/// /anthropic[/**]                 any     Anthropic proxy (prefix strip)
/// /*                              any     Anthropic proxy (pass-through)
/// {admin.path}/...                        admin usage API (Basic auth)
/// OPTIONS *                               200 + permissive CORS
/// ```
///
/// The admin mount point is fixed at build time; changing `admin.path` or
/// `admin.enabled` needs a restart (reload swaps everything else).
pub fn build_router(state: AppState, config: &Config) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/openai/v1/chat/completions",
            post(proxy::openai::chat_completions),
        )
        .route("/anthropic", any(proxy::handle_anthropic))
        .route("/anthropic/{*rest}", any(proxy::handle_anthropic))
        .fallback(proxy::handle_anthropic);

    if config.admin.enabled {
        app = app.nest(&config.admin.path, admin::router(state.clone()));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    app.layer(middleware::from_fn(options_ok))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bare OPTIONS requests (no CORS preflight headers) must not be proxied.
async fn options_ok(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Instant;

    use axum::body::Body;
    use axum::http::{header, Request as HttpRequest};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::balancer::LoadBalancer;
    use crate::config::ConfigStore;
    use crate::usage::store::UsageStore;
    use crate::usage::writer::spawn_usage_writer;

    /// Spin up a stub Anthropic upstream; returns its base URL.
    async fn spawn_upstream() -> String {
        use axum::routing::post as axum_post;

        let app = Router::new()
            .route(
                "/v1/messages",
                axum_post(|body: String| async move {
                    let request: Value = serde_json::from_str(&body).unwrap_or_default();
                    if request["stream"] == json!(true) {
                        let sse = concat!(
                            "event: message_start\n",
                            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":103,\"output_tokens\":2}}}\n\n",
                            "event: content_block_delta\n",
                            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
                            "event: message_delta\n",
                            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":57}}\n\n",
                            "event: message_stop\n",
                            "data: {\"type\":\"message_stop\"}\n\n",
                        );
                        axum::response::Response::builder()
                            .header(header::CONTENT_TYPE, "text/event-stream")
                            .body(Body::from(sse))
                            .unwrap()
                    } else {
                        let reply = json!({
                            "id": "msg_01",
                            "model": request["model"],
                            "content": [{"type": "text", "text": "Hello!"}],
                            "stop_reason": "end_turn",
                            "usage": {"input_tokens": 100, "output_tokens": 50}
                        });
                        axum::response::Response::builder()
                            .header(header::CONTENT_TYPE, "application/json")
                            .body(Body::from(reply.to_string()))
                            .unwrap()
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn write_config(dir: &Path, upstream_url: &str) {
        std::fs::write(
            dir.join("server.json"),
            r#"{
                "admin": {"enabled": true, "path": "/admin", "username": "root", "password": "hunter2"},
                "openai": {"enabled": true,
                           "models": {"gpt-5-mini": "claude-3-7-sonnet-20250219"}}
            }"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("upstreams.json"),
            format!(
                r#"{{"upstreams": [{{"id": "primary", "name": "Primary", "url": "{upstream_url}", "key": "sk-upstream"}}]}}"#
            ),
        )
        .unwrap();
        std::fs::write(
            dir.join("tenants.json"),
            r#"{"tenants": [
                {"id": "acme", "name": "Acme", "key": "sk-acme",
                 "allowedModels": ["*"], "limits": {"daily": {"maxUSD": 100}}},
                {"id": "haiku-only", "name": "HaikuOnly", "key": "sk-haiku",
                 "allowedModels": ["*haiku*"]}
            ]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("pricing.json"),
            r#"{"modelPricing": {
                "*": {"input": 0.003, "output": 0.015, "cacheCreation": 0.00375, "cacheRead": 0.0003}
            }}"#,
        )
        .unwrap();
    }

    /// Full AppState backed by temp dirs and a live stub upstream.
    async fn test_state(upstream_url: &str) -> (AppState, tempfile::TempDir, tempfile::TempDir) {
        let config_dir = tempfile::tempdir().unwrap();
        write_config(config_dir.path(), upstream_url);
        let config = Config::load(config_dir.path()).unwrap();

        let usage_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(UsageStore::new(usage_dir.path()));
        let (usage_tx, usage_rx) = tokio::sync::mpsc::unbounded_channel();
        let _writer = spawn_usage_writer(store.clone(), usage_rx);

        let balancer = Arc::new(tokio::sync::RwLock::new(LoadBalancer::from_config(&config)));
        let state = AppState {
            config: Arc::new(ConfigStore::new(config_dir.path(), config)),
            client: crate::http_client(),
            balancer,
            store,
            usage_tx,
            health_task: Arc::new(tokio::sync::Mutex::new(None)),
            started: Instant::now(),
        };
        (state, config_dir, usage_dir)
    }

    async fn app(upstream_url: &str) -> (Router, AppState, tempfile::TempDir, tempfile::TempDir) {
        let (state, config_dir, usage_dir) = test_state(upstream_url).await;
        let config = state.config.snapshot().await;
        (
            build_router(state.clone(), &config),
            state,
            config_dir,
            usage_dir,
        )
    }

    async fn body_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _state, _c, _u) = app("http://127.0.0.1:1").await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert!(json["uptime"].is_u64());
    }

    #[tokio::test]
    async fn test_missing_auth_gets_401_with_challenge() {
        let (app, _state, _c, _u) = app("http://127.0.0.1:1").await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/anthropic/v1/messages")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"model":"claude-sonnet-4"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer realm=\"CCGate API\", charset=\"UTF-8\""
        );
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "missing_auth");
        let request_id = json["requestId"].as_str().unwrap();
        assert_eq!(request_id.len(), 16);
    }

    #[tokio::test]
    async fn test_model_not_allowed_gets_403() {
        let (app, _state, _c, _u) = app("http://127.0.0.1:1").await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/anthropic/v1/messages")
                    .header(header::AUTHORIZATION, "Bearer sk-haiku")
                    .body(Body::from(r#"{"model":"claude-sonnet-4-20250514"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "model_not_allowed");
    }

    #[tokio::test]
    async fn test_happy_path_proxies_and_meters() {
        let upstream = spawn_upstream().await;
        let (app, state, _c, _u) = app(&upstream).await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/anthropic/v1/messages")
                    .header(header::AUTHORIZATION, "Bearer sk-acme")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"model":"claude-3-5-haiku-20241022","messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        // Pass-through body, untouched.
        assert_eq!(json["content"][0]["text"], "Hello!");
        assert_eq!(json["usage"]["input_tokens"], 100);

        // The usage record lands in today's file.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let today = chrono::Utc::now().date_naive();
        let day = state.store.daily_usage("acme", today).await;
        assert_eq!(day.totals.requests, 1);
        assert_eq!(day.totals.input_tokens, 100);
        assert_eq!(day.totals.output_tokens, 50);
    }

    #[tokio::test]
    async fn test_upstream_down_gets_502() {
        // Nothing listens on port 1.
        let (app, _state, _c, _u) = app("http://127.0.0.1:1").await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/anthropic/v1/messages")
                    .header(header::AUTHORIZATION, "Bearer sk-acme")
                    .body(Body::from(r#"{"model":"claude-3-5-haiku-20241022"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn test_openai_translation_streaming() {
        let upstream = spawn_upstream().await;
        let (app, _state, _c, _u) = app(&upstream).await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/openai/v1/chat/completions")
                    .header(header::AUTHORIZATION, "Bearer sk-acme")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"model":"gpt-5-mini","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("chat.completion.chunk"));
        assert!(text.contains("\"content\":\"hi\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_openai_translation_non_streaming() {
        let upstream = spawn_upstream().await;
        let (app, _state, _c, _u) = app(&upstream).await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/openai/v1/chat/completions")
                    .header(header::AUTHORIZATION, "Bearer sk-acme")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"model":"gpt-5-mini","messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["object"], "chat.completion");
        // The upstream saw the mapped Anthropic model.
        assert_eq!(json["model"], "claude-3-7-sonnet-20250219");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(json["usage"]["prompt_tokens"], 100);
        assert_eq!(json["usage"]["total_tokens"], 150);
    }

    #[tokio::test]
    async fn test_openai_bad_json_gets_400() {
        let (app, _state, _c, _u) = app("http://127.0.0.1:1").await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/openai/v1/chat/completions")
                    .header(header::AUTHORIZATION, "Bearer sk-acme")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_options_gets_200() {
        let (app, _state, _c, _u) = app("http://127.0.0.1:1").await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("OPTIONS")
                    .uri("/anthropic/v1/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_requires_basic_auth() {
        let (app, _state, _c, _u) = app("http://127.0.0.1:1").await;

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/admin/upstreams")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        use base64::Engine as _;
        let credentials =
            base64::engine::general_purpose::STANDARD.encode("root:hunter2");
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/admin/upstreams")
                    .header(header::AUTHORIZATION, format!("Basic {credentials}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["upstreams"][0]["id"], "primary");
    }

    #[tokio::test]
    async fn test_admin_usage_query() {
        let upstream = spawn_upstream().await;
        let (app, _state, _c, _u) = app(&upstream).await;

        // Drive one request through, then query its usage via the admin API.
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/anthropic/v1/messages")
                    .header(header::AUTHORIZATION, "Bearer sk-acme")
                    .body(Body::from(r#"{"model":"claude-3-5-haiku-20241022"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let _ = body_json(response).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        use base64::Engine as _;
        let credentials =
            base64::engine::general_purpose::STANDARD.encode("root:hunter2");
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/admin/usage/acme/daily")
                    .header(header::AUTHORIZATION, format!("Basic {credentials}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["requests"], 1);
        assert_eq!(json["inputTokens"], 100);
    }

    #[tokio::test]
    async fn test_unknown_path_passes_through_to_proxy() {
        let (app, _state, _c, _u) = app("http://127.0.0.1:1").await;

        // No credential: the pass-through path still authenticates.
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
