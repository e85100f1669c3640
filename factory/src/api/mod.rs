pub mod auth;
pub mod i18n;
pub mod instances;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::instance::InstanceManager;

/// Shared state for all API handlers, passed via axum `State`.
pub struct ApiState {
    pub instances: Arc<InstanceManager>,
    /// Loaded once at start-up. Empty means every instance request is refused.
    pub admin_key: String,
}

/// Error body: `{"error": <localized>, "code": <stable code>}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_removed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_removed: Option<bool>,
}

impl ApiError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code,
            process_removed: None,
            data_removed: None,
        }
    }
}

pub fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (status, Json(ApiError::new(code, message))).into_response()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let h = response.headers_mut();
    h.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    h.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    h.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    h.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

/// Build the full axum Router: `/api/instances/*` behind the admin key gate,
/// and an open `/health`.
pub fn build_router(state: Arc<ApiState>) -> Router {
    let api = instances::routes()
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin_key,
        ))
        .with_state(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT_LANGUAGE,
            HeaderName::from_static(auth::ADMIN_KEY_HEADER),
        ])
        .expose_headers([header::CONTENT_DISPOSITION]);

    Router::new()
        .nest("/api", api)
        .route("/health", get(health))
        .layer(cors)
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` resolves. In-flight requests are drained.
pub async fn serve(
    bind_addr: &str,
    port: u16,
    state: Arc<ApiState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if state.admin_key.is_empty() {
        warn!("no admin key configured (set ADMIN_KEY); every /api/instances request will fail");
    }

    let addr = format!("{}:{}", bind_addr, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding management API to {}", addr))?;
    info!(addr = %addr, "management API listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("management API server error")?;

    info!("management API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::instance::testing::manager;

    fn router(root: &std::path::Path, admin_key: &str) -> Router {
        let (_sup, mgr) = manager(root);
        build_router(Arc::new(ApiState {
            instances: Arc::new(mgr),
            admin_key: admin_key.to_string(),
        }))
    }

    #[test]
    fn api_error_serialization() {
        let json = serde_json::to_value(ApiError::new("INSTANCE_NOT_FOUND", "Instance not found")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error": "Instance not found", "code": "INSTANCE_NOT_FOUND"})
        );
    }

    #[tokio::test]
    async fn health_needs_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path(), "");

        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-frame-options"], "DENY");
        assert_eq!(resp.headers()["x-content-type-options"], "nosniff");

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn cors_preflight_allows_admin_key_header() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path(), "k");

        let resp = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/instances")
                    .header(header::ORIGIN, "http://example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-st-admin-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let allowed = resp.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(allowed.contains("x-st-admin-key"));
    }
}
