// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! HTTP handlers for the posting rate limiter service.
//!
//! The news server (or a filter hook) posts the submission fields to
//! `/check` and reads the decision from the JSON body.

use crate::config::Config;
use crate::limiter::{Decision, RateLimitEngine, RejectReason, SubmissionAttempt};
use crate::metrics::Metrics;
use crate::store::CounterStore;
use crate::sweeper::RetentionSweeper;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

/// Shared application state.
pub struct AppState<S> {
    pub engine: RateLimitEngine<S>,
    pub sweeper: RetentionSweeper<S>,
    pub metrics: Metrics,
    pub config: Config,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Submission check request. Missing fields are treated as empty strings
/// and rejected by the same contract checks as the command line.
#[derive(Debug, Default, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub newsgroups: String,
}

/// Submission check response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<&Decision> for CheckResponse {
    fn from(decision: &Decision) -> Self {
        match decision {
            Decision::Accept => CheckResponse {
                allowed: true,
                reason: None,
                message: None,
                retry_after_secs: None,
            },
            Decision::Reject(r) => CheckResponse {
                allowed: false,
                reason: Some(r.reason.code().to_string()),
                message: Some(r.message.clone()),
                retry_after_secs: r.retry_after_secs,
            },
        }
    }
}

/// Build the service router.
pub fn router<S: CounterStore>(state: Arc<AppState<S>>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/check", post(check::<S>));

    if state.config.metrics.enabled {
        app = app.route(&state.config.metrics.path, get(metrics::<S>));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "post-rate-limiter",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Decide on a submission.
///
/// Rate limit and contract rejections answer 200 so the caller can read
/// the body; only an unverifiable state answers 503.
pub async fn check<S: CounterStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CheckRequest>,
) -> impl IntoResponse {
    debug!(
        message_id = %req.message_id,
        newsgroups = %req.newsgroups,
        "Processing submission check"
    );

    let attempt = SubmissionAttempt {
        identity: req.identity,
        fingerprint: req.fingerprint,
        message_id: req.message_id,
        from: req.from,
        subject: req.subject,
        newsgroups: req.newsgroups,
        arrived_at: chrono::Utc::now().timestamp(),
    };

    let decision = state.engine.decide(&attempt).await;
    let status = match decision.rejection() {
        Some(r) if r.reason == RejectReason::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (status, Json(CheckResponse::from(&decision)))
}

/// Prometheus metrics endpoint.
pub async fn metrics<S: CounterStore>(State(state): State<Arc<AppState<S>>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> Arc<AppState<MemoryCounterStore>> {
        let config = Config::default();
        let store = Arc::new(MemoryCounterStore::new());
        let metrics = Metrics::new().unwrap();
        Arc::new(AppState {
            engine: RateLimitEngine::new(store.clone(), config.rate_limit.clone())
                .with_metrics(metrics.clone()),
            sweeper: RetentionSweeper::new(store, config.rate_limit.retention_secs),
            metrics,
            config,
        })
    }

    fn check_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/check")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: Response) -> CheckResponse {
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_check_accepts_then_limits() {
        let app = router(state());
        let body = serde_json::json!({
            "identity": "alice",
            "fingerprint": "ab".repeat(64),
            "message_id": "<1@news.example>",
            "newsgroups": "alt.test",
        });

        let first = app.clone().oneshot(check_request(body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(read_json(first).await.allowed);

        let second = app.oneshot(check_request(body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let decision = read_json(second).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("CONTENT_RATE_LIMITED"));
        // Both requests read the wall clock, which may tick between them
        assert!(matches!(decision.retry_after_secs, Some(299..=300)));
    }

    #[tokio::test]
    async fn test_check_missing_fingerprint() {
        let app = router(state());
        let response = app
            .oneshot(check_request(serde_json::json!({ "identity": "alice" })))
            .await
            .unwrap();

        let decision = read_json(response).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("INVALID_FINGERPRINT_FORMAT"));
    }

    #[tokio::test]
    async fn test_health_and_metrics_routes() {
        let app = router(state());

        let health = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let metrics = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
    }
}
