//! Post-call transcript webhook
//!
//! The voice-agent provider posts each finished conversation here. The body
//! is verified against `x-callctx-signature` before it is parsed, stored
//! before it is correlated, and acknowledged with 202 while extraction and
//! snippet teardown continue in the background.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use callctx_core::{AgentId, CallId, Timestamp};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::constants::SIGNATURE_HEADER;
use crate::error::{ApiError, ApiResult};
use crate::services::{CallCoordinator, TranscriptEvent};
use crate::state::AppState;
use crate::webhook_signature::WebhookVerifier;

// ============================================================================
// PAYLOAD
// ============================================================================

/// Either the provider's `{type, data}` envelope or a bare payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TranscriptWebhook {
    Envelope {
        #[serde(default, rename = "type")]
        event_type: Option<String>,
        data: TranscriptPayload,
    },
    Bare(TranscriptPayload),
}

impl TranscriptWebhook {
    pub fn into_payload(self) -> (Option<String>, TranscriptPayload) {
        match self {
            TranscriptWebhook::Envelope { event_type, data } => (event_type, data),
            TranscriptWebhook::Bare(data) => (None, data),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptPayload {
    pub conversation_id: String,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub transcript: TranscriptBody,
    #[serde(default)]
    pub ended_at: Option<Timestamp>,
    #[serde(default)]
    pub metadata: Option<TranscriptMetadata>,
    /// Variables we passed when the call was placed; carries our call id.
    #[serde(default)]
    pub conversation_initiation_client_data: Option<ClientData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TranscriptBody {
    Text(String),
    Turns(Vec<TranscriptTurn>),
}

impl Default for TranscriptBody {
    fn default() -> Self {
        TranscriptBody::Text(String::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptTurn {
    pub role: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptMetadata {
    #[serde(default)]
    pub call_id: Option<CallId>,
    /// Unix seconds at which the call ended.
    #[serde(default)]
    pub end_time_unix_secs: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientData {
    #[serde(default)]
    pub dynamic_variables: Option<DynamicVariables>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DynamicVariables {
    #[serde(default)]
    pub call_id: Option<CallId>,
}

impl TranscriptBody {
    /// Render as plain text, one `Speaker: message` line per turn.
    pub fn render(&self) -> String {
        match self {
            TranscriptBody::Text(text) => text.trim().to_string(),
            TranscriptBody::Turns(turns) => turns
                .iter()
                .filter_map(|turn| {
                    let message = turn.message.as_deref()?.trim();
                    if message.is_empty() {
                        return None;
                    }
                    Some(format!("{}: {}", speaker_label(&turn.role), message))
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

fn speaker_label(role: &str) -> String {
    match role.trim().to_lowercase().as_str() {
        "agent" | "assistant" => "Agent".to_string(),
        "user" | "caller" | "patient" => "Patient".to_string(),
        other => other.to_string(),
    }
}

impl TranscriptPayload {
    fn call_id_hint(&self) -> Option<CallId> {
        self.metadata
            .as_ref()
            .and_then(|m| m.call_id)
            .or_else(|| {
                self.conversation_initiation_client_data
                    .as_ref()
                    .and_then(|c| c.dynamic_variables.as_ref())
                    .and_then(|v| v.call_id)
            })
    }

    fn ended_at(&self) -> Option<Timestamp> {
        self.ended_at.or_else(|| {
            self.metadata
                .as_ref()
                .and_then(|m| m.end_time_unix_secs)
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        })
    }

    /// Convert into a coordinator event.
    pub fn into_event(self) -> ApiResult<TranscriptEvent> {
        let conversation_id = self.conversation_id.trim().to_string();
        if conversation_id.is_empty() {
            return Err(ApiError::missing_field("conversation_id"));
        }

        let mut event = TranscriptEvent::new(conversation_id, self.transcript.render());
        if let Some(call_id) = self.call_id_hint() {
            event = event.with_call_id_hint(call_id);
        }
        if let Some(ended_at) = self.ended_at() {
            event = event.with_ended_at(ended_at);
        }
        if let Some(agent_id) = self.agent_id.filter(|a| !a.trim().is_empty()) {
            event = event.with_agent_id(agent_id);
        }
        Ok(event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptAccepted {
    pub transcript_id: uuid::Uuid,
    pub call_id: Option<CallId>,
    pub correlated: bool,
    pub method: Option<String>,
    /// Fallback chose among several open calls; attribution may be wrong.
    #[serde(default)]
    pub ambiguous: bool,
}

// ============================================================================
// HANDLER
// ============================================================================

/// POST /api/v1/webhooks/transcript
pub async fn transcript_webhook(
    State(verifier): State<Arc<WebhookVerifier>>,
    State(coordinator): State<Arc<CallCoordinator>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<TranscriptAccepted>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if let Err(e) = verifier.verify(signature, &body, Utc::now().timestamp()) {
        tracing::warn!(reason = %e.message, "Rejected transcript webhook");
        return Err(e);
    }

    let webhook: TranscriptWebhook = serde_json::from_slice(&body)?;
    let (event_type, payload) = webhook.into_payload();
    let event = payload.into_event()?;

    tracing::info!(
        conversation_id = %event.conversation_id,
        event_type = event_type.as_deref().unwrap_or("bare"),
        "Transcript webhook received"
    );

    let receipt = coordinator.on_transcript_delivered(event).await?;
    let accepted = TranscriptAccepted {
        transcript_id: receipt.transcript_id,
        call_id: receipt.call_id,
        correlated: receipt.correlated(),
        method: receipt.method.map(|m| m.as_db_str().to_string()),
        ambiguous: receipt.ambiguous(),
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/transcript", post(transcript_webhook))
}
