// =============================================================================
// Health & Status Endpoints — Axum 0.7
// =============================================================================
//
// Unauthenticated, read-only. `/health` answers 200 while the guardian is
// ticking and 503 once it has gone stale or is stuck in an error streak, so a
// container orchestrator can restart it. `/status` exposes the same snapshot
// the `/status` operator command renders.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};

use crate::guardian::GuardianController;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(controller: Arc<GuardianController>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(controller)
}

async fn health(State(controller): State<Arc<GuardianController>>) -> impl IntoResponse {
    let report = controller.health();
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn status(State(controller): State<Arc<GuardianController>>) -> impl IntoResponse {
    Json(controller.status())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::recording::RecordingSink;
    use crate::exchange::mock::MockExchange;
    use crate::runtime_config::RuntimeConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn controller(config: RuntimeConfig) -> Arc<GuardianController> {
        Arc::new(GuardianController::new(
            config,
            Arc::new(MockExchange::new()),
            Arc::new(RecordingSink::default()),
        ))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let code = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (code, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn fresh_guardian_is_healthy() {
        let (code, body) = get_json(router(controller(RuntimeConfig::default())), "/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["paused"], false);
        assert_eq!(body["consecutive_errors"], 0);
    }

    #[tokio::test]
    async fn error_streak_reports_unavailable() {
        let c = controller(RuntimeConfig::default());
        for _ in 0..RuntimeConfig::default().max_consecutive_errors {
            c.state().record_tick_error("boom".into());
        }

        let (code, body) = get_json(router(c), "/health").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["healthy"], false);
    }

    #[tokio::test]
    async fn status_reflects_pause() {
        let c = controller(RuntimeConfig::default());
        c.pause();

        let (code, body) = get_json(router(c), "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["paused"], true);
        assert!(body["positions"].as_array().unwrap().is_empty());
    }
}
