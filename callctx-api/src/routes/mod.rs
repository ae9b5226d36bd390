//! REST API Routes Module
//!
//! - Telephony carrier webhooks (inbound leg, status changes)
//! - Post-call transcript webhook from the voice-agent provider
//! - Call session reads
//! - Health check endpoints (Kubernetes-compatible)
//! - Prometheus `/metrics`

pub mod calls;
pub mod health;
pub mod telephony;
pub mod transcripts;

use axum::{middleware::from_fn, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};

pub use calls::{CallDetailResponse, CallSessionResponse, TranscriptSummary};
pub use health::{ComponentHealth, HealthDetails, HealthResponse, HealthStatus};
pub use transcripts::TranscriptAccepted;

/// Build the full application router.
///
/// Layout:
/// - `/api/v1/telephony/*`
/// - `/api/v1/webhooks/*`
/// - `/api/v1/calls/*`
/// - `/health/*`
/// - `/metrics`
pub fn create_api_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .nest("/telephony", telephony::create_router())
        .nest("/webhooks", transcripts::create_router())
        .nest("/calls", calls::create_router());

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health::create_router())
        .route("/metrics", get(metrics_handler))
        .layer(from_fn(observability_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
