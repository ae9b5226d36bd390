//! Call session read endpoints

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use callctx_core::{CallSession, Timestamp, TranscriptRecord};
use callctx_storage::{CallSessionStore, CallctxStore, TranscriptStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// ============================================================================
// RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallSessionResponse {
    pub call_id: Uuid,
    pub carrier_call_id: Option<String>,
    pub patient_id: Option<Uuid>,
    pub conversation_id: Option<String>,
    pub agent_id: String,
    pub state: String,
    pub context_release: String,
    pub has_context: bool,
    pub unidentified: bool,
    pub degraded: bool,
    pub failure_reason: Option<String>,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

impl From<CallSession> for CallSessionResponse {
    fn from(session: CallSession) -> Self {
        Self {
            call_id: session.call_id,
            carrier_call_id: session.carrier_call_id,
            patient_id: session.patient_id,
            conversation_id: session.external_conversation_id,
            agent_id: session.agent_id,
            state: session.state.as_db_str().to_string(),
            context_release: session.release.to_string(),
            has_context: session.context_handle.is_some(),
            unidentified: session.unidentified,
            degraded: session.degraded,
            failure_reason: session.failure_reason,
            started_at: session.started_at,
            ended_at: session.ended_at,
        }
    }
}

/// Transcript listing without the body text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSummary {
    pub transcript_id: Uuid,
    pub conversation_id: String,
    pub characters: usize,
    pub ended_at: Option<Timestamp>,
    pub received_at: Timestamp,
}

impl From<&TranscriptRecord> for TranscriptSummary {
    fn from(record: &TranscriptRecord) -> Self {
        Self {
            transcript_id: record.transcript_id,
            conversation_id: record.conversation_id.clone(),
            characters: record.text.chars().count(),
            ended_at: record.ended_at,
            received_at: record.received_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDetailResponse {
    #[serde(flatten)]
    pub session: CallSessionResponse,
    pub transcripts: Vec<TranscriptSummary>,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /api/v1/calls/{call_id}
pub async fn get_call(
    State(store): State<Arc<dyn CallctxStore>>,
    Path(call_id): Path<Uuid>,
) -> ApiResult<Json<CallDetailResponse>> {
    let session = store
        .get_session(call_id)
        .await?
        .ok_or_else(|| ApiError::entity_not_found("CallSession", call_id))?;

    let transcripts = store
        .list_transcripts_for_call(call_id)
        .await?
        .iter()
        .map(TranscriptSummary::from)
        .collect();

    Ok(Json(CallDetailResponse {
        session: session.into(),
        transcripts,
    }))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/:call_id", get(get_call))
}
