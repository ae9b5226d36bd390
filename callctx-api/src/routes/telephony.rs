//! Telephony carrier webhooks
//!
//! The carrier reports a new inbound leg and then status changes for it.
//! Neither endpoint fails the caller's experience: an unknown number or a
//! context store outage still yields a session the agent can run with.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use callctx_core::{TelephonyStatus, Timestamp};
use callctx_storage::{CallSessionStore, CallctxStore};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::routes::calls::CallSessionResponse;
use crate::services::{CallCoordinator, InboundCall};
use crate::state::AppState;

// ============================================================================
// REQUEST TYPES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct InboundCallRequest {
    #[serde(alias = "from")]
    pub caller_number: String,
    #[serde(default, alias = "call_sid")]
    pub carrier_call_id: Option<String>,
    #[serde(default)]
    pub arrived_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallStatusRequest {
    #[serde(alias = "call_sid")]
    pub carrier_call_id: String,
    #[serde(alias = "call_status")]
    pub status: String,
    #[serde(default)]
    pub at: Option<Timestamp>,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// POST /api/v1/telephony/inbound
pub async fn inbound_call(
    State(coordinator): State<Arc<CallCoordinator>>,
    Json(req): Json<InboundCallRequest>,
) -> ApiResult<(StatusCode, Json<CallSessionResponse>)> {
    let mut call = InboundCall::new(req.caller_number);
    if let Some(carrier_call_id) = req.carrier_call_id.filter(|id| !id.trim().is_empty()) {
        call = call.with_carrier_call_id(carrier_call_id);
    }
    call.arrived_at = req.arrived_at;

    let session = coordinator.start_call(call).await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

/// POST /api/v1/telephony/status
pub async fn call_status(
    State(store): State<Arc<dyn CallctxStore>>,
    State(coordinator): State<Arc<CallCoordinator>>,
    Json(req): Json<CallStatusRequest>,
) -> ApiResult<Json<CallSessionResponse>> {
    if req.carrier_call_id.trim().is_empty() {
        return Err(ApiError::missing_field("carrier_call_id"));
    }
    let status = TelephonyStatus::from_db_str(&req.status)
        .map_err(|e| ApiError::invalid_input(e.to_string()))?;

    let session = store
        .find_by_carrier_call_id(&req.carrier_call_id)
        .await?
        .ok_or_else(|| ApiError::entity_not_found("CallSession", &req.carrier_call_id))?;

    let at = req.at.unwrap_or_else(Utc::now);
    let updated = coordinator
        .apply_telephony_status(session.call_id, status, at)
        .await?;
    Ok(Json(updated.into()))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/inbound", post(inbound_call))
        .route("/status", post(call_status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_request_accepts_carrier_aliases() {
        let req: InboundCallRequest =
            serde_json::from_str(r#"{"from":"+1 (555) 010-2000","call_sid":"CA123"}"#).unwrap();
        assert_eq!(req.caller_number, "+1 (555) 010-2000");
        assert_eq!(req.carrier_call_id.as_deref(), Some("CA123"));
        assert!(req.arrived_at.is_none());
    }

    #[test]
    fn test_status_request_accepts_carrier_aliases() {
        let req: CallStatusRequest =
            serde_json::from_str(r#"{"call_sid":"CA123","call_status":"no-answer"}"#).unwrap();
        assert_eq!(req.carrier_call_id, "CA123");
        assert_eq!(
            TelephonyStatus::from_db_str(&req.status).unwrap(),
            TelephonyStatus::NoAnswer
        );
    }
}
