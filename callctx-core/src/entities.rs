//! Entity types

use crate::identity::*;
use crate::{CallState, ContextRelease, ValidationError};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ============================================================================
// CALL SESSION
// ============================================================================

/// One inbound call, from ringing to completed/failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: CallId,
    /// Carrier-assigned id of the telephony leg.
    pub carrier_call_id: Option<String>,
    pub patient_id: Option<PatientId>,
    /// Assigned by the voice-AI provider once the call connects.
    pub external_conversation_id: Option<ConversationId>,
    pub context_handle: Option<SnippetHandle>,
    /// Shared agent this call was routed to.
    pub agent_id: AgentId,
    /// Normalized caller number.
    pub phone_digits: String,
    pub state: CallState,
    pub release: ContextRelease,
    /// No patient matched the caller number.
    pub unidentified: bool,
    /// Proceeding without personalized context.
    pub degraded: bool,
    pub failure_reason: Option<String>,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl CallSession {
    /// A fresh session in `Ringing`.
    pub fn new(phone_digits: impl Into<String>, agent_id: impl Into<AgentId>) -> Self {
        let now = Utc::now();
        Self {
            call_id: new_entity_id(),
            carrier_call_id: None,
            patient_id: None,
            external_conversation_id: None,
            context_handle: None,
            agent_id: agent_id.into(),
            phone_digits: phone_digits.into(),
            state: CallState::Ringing,
            release: ContextRelease::None,
            unidentified: false,
            degraded: false,
            failure_reason: None,
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn with_carrier_call_id(mut self, carrier_call_id: impl Into<String>) -> Self {
        self.carrier_call_id = Some(carrier_call_id.into());
        self
    }

    pub fn with_started_at(mut self, started_at: Timestamp) -> Self {
        self.started_at = started_at;
        self.updated_at = started_at;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Advance the state machine. Terminal states stamp `ended_at`.
    pub fn transition(&mut self, next: CallState) -> Result<(), ValidationError> {
        if !self.state.can_transition_to(next) {
            return Err(ValidationError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    /// Record a created snippet; the session now holds it.
    pub fn hold_context(&mut self, handle: SnippetHandle) {
        self.context_handle = Some(handle);
        self.release = ContextRelease::Held;
        self.updated_at = Utc::now();
    }

    /// Mark the call as proceeding without personalized context.
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
        self.updated_at = Utc::now();
    }

    pub fn age(&self, now: Timestamp) -> ChronoDuration {
        now - self.started_at
    }
}

// ============================================================================
// KNOWLEDGE SNIPPET
// ============================================================================

/// A patient-scoped document living at the voice-AI provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub handle: SnippetHandle,
    pub name: String,
    /// Parsed from `name`; `None` for documents not created here.
    pub owner_call_id: Option<CallId>,
    pub attached_agent_ids: Vec<AgentId>,
    pub created_at: Timestamp,
}

impl KnowledgeSnippet {
    pub fn new(handle: impl Into<SnippetHandle>, name: impl Into<String>, created_at: Timestamp) -> Self {
        let name = name.into();
        Self {
            handle: handle.into(),
            owner_call_id: owner_from_snippet_name(&name),
            name,
            attached_agent_ids: Vec::new(),
            created_at,
        }
    }

    /// Whether this system created the document.
    pub fn is_managed(&self) -> bool {
        self.owner_call_id.is_some()
    }

    pub fn age(&self, now: Timestamp) -> ChronoDuration {
        now - self.created_at
    }
}

// ============================================================================
// CLINICAL DELTA
// ============================================================================

/// Structured observations extracted from one transcript.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClinicalDelta {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default, alias = "progressUpdates")]
    pub progress_updates: Vec<String>,
    #[serde(default, alias = "suggestedFocusAreas")]
    pub suggested_focus_areas: Vec<String>,
    #[serde(default, alias = "actionItems")]
    pub action_items: Vec<String>,
}

impl ClinicalDelta {
    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty()
            && self.concerns.is_empty()
            && self.progress_updates.is_empty()
            && self.suggested_focus_areas.is_empty()
            && self.action_items.is_empty()
    }

    /// Trim entries and drop blanks.
    pub fn normalized(mut self) -> Self {
        fn clean(items: Vec<String>) -> Vec<String> {
            items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }
        self.summary = self.summary.trim().to_string();
        self.concerns = clean(self.concerns);
        self.progress_updates = clean(self.progress_updates);
        self.suggested_focus_areas = clean(self.suggested_focus_areas);
        self.action_items = clean(self.action_items);
        self
    }

    /// Stable fingerprint over the delta's content.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_else(|_| self.summary.clone());
        content_fingerprint(&canonical)
    }

    /// Render the note block body appended to the patient's clinical notes.
    pub fn render_note(&self, at: Timestamp) -> String {
        let mut out = format!("[Education call {}]\n", at.format("%Y-%m-%d %H:%M UTC"));
        if !self.summary.is_empty() {
            out.push_str("Summary: ");
            out.push_str(&self.summary);
            out.push('\n');
        }
        push_list(&mut out, "Concerns", &self.concerns);
        push_list(&mut out, "Progress", &self.progress_updates);
        push_list(&mut out, "Action items", &self.action_items);
        push_list(&mut out, "Suggested focus", &self.suggested_focus_areas);
        out.trim_end().to_string()
    }
}

fn push_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(heading);
    out.push_str(":\n");
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
}

// ============================================================================
// PATIENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    pub dose: Option<String>,
    pub frequency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabResult {
    pub name: String,
    pub value: String,
    pub unit: Option<String>,
    pub observed_at: Option<Timestamp>,
}

/// Directory view of a patient, used to build the per-call snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientProfile {
    pub patient_id: PatientId,
    pub display_name: String,
    /// Phone number as stored, in whatever format it was entered.
    pub phone: String,
    /// ISO 639-1 code, e.g. `en` or `es`.
    pub preferred_language: Option<String>,
    pub medications: Vec<Medication>,
    pub lab_results: Vec<LabResult>,
}

/// One immutable, timestamped section of a patient's clinical notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteBlock {
    pub at: Timestamp,
    /// Call that produced the block; `None` for human-entered notes.
    pub source_call_id: Option<CallId>,
    pub fingerprint: String,
    pub body: String,
}

impl NoteBlock {
    pub fn from_delta(delta: &ClinicalDelta, at: Timestamp, source_call_id: Option<CallId>) -> Self {
        Self {
            at,
            source_call_id,
            fingerprint: delta.fingerprint(),
            body: delta.render_note(at),
        }
    }

    /// A human-entered note.
    pub fn manual(body: impl Into<String>, at: Timestamp) -> Self {
        let body = body.into();
        Self {
            at,
            source_call_id: None,
            fingerprint: content_fingerprint(&body),
            body,
        }
    }
}

/// Long-lived clinical record; only ever appended to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: PatientId,
    pub clinical_notes: Vec<NoteBlock>,
    pub focus_areas: Vec<String>,
    pub updated_at: Timestamp,
}

impl PatientRecord {
    pub fn empty(patient_id: PatientId) -> Self {
        Self {
            patient_id,
            clinical_notes: Vec::new(),
            focus_areas: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn has_block(&self, fingerprint: &str) -> bool {
        self.clinical_notes.iter().any(|b| b.fingerprint == fingerprint)
    }

    /// Notes rendered oldest first.
    pub fn notes_text(&self) -> String {
        self.clinical_notes
            .iter()
            .map(|b| b.body.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Key used to compare focus tags: trimmed, case-insensitive.
pub fn focus_key(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// Tags from `incoming` not already present in `existing`, in input order.
///
/// Comparison is trimmed and case-insensitive; the first spelling wins.
pub fn new_focus_areas(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = existing.iter().map(|t| focus_key(t)).collect();
    let mut out = Vec::new();
    for tag in incoming {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(focus_key(trimmed)) {
            out.push(trimmed.to_string());
        }
    }
    out
}

// ============================================================================
// TRANSCRIPTS
// ============================================================================

/// A delivered transcript, persisted before any downstream processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub transcript_id: TranscriptId,
    /// `None` until (or unless) correlation succeeds.
    pub call_id: Option<CallId>,
    pub conversation_id: ConversationId,
    pub text: String,
    pub ended_at: Option<Timestamp>,
    pub received_at: Timestamp,
}

impl TranscriptRecord {
    pub fn new(conversation_id: impl Into<ConversationId>, text: impl Into<String>, ended_at: Option<Timestamp>) -> Self {
        Self {
            transcript_id: new_entity_id(),
            call_id: None,
            conversation_id: conversation_id.into(),
            text: text.into(),
            ended_at,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transition_stamps_end() {
        let mut session = CallSession::new("5550102000", "agent-en");
        session.transition(CallState::Identified).unwrap();
        assert!(session.ended_at.is_none());
        session.transition(CallState::Failed).unwrap();
        assert!(session.ended_at.is_some());
        assert!(session.is_terminal());
    }

    #[test]
    fn test_session_rejects_invalid_transition() {
        let mut session = CallSession::new("5550102000", "agent-en");
        let err = session.transition(CallState::Completed).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidTransition {
                from: CallState::Ringing,
                to: CallState::Completed,
            }
        );
        assert_eq!(session.state, CallState::Ringing);
    }

    #[test]
    fn test_hold_context_marks_release_held() {
        let mut session = CallSession::new("5550102000", "agent-en");
        session.hold_context("doc_1".to_string());
        assert_eq!(session.context_handle.as_deref(), Some("doc_1"));
        assert_eq!(session.release, ContextRelease::Held);
    }

    #[test]
    fn test_snippet_owner_parsed_from_name() {
        let call_id = new_entity_id();
        let snippet = KnowledgeSnippet::new("doc_1", snippet_name(call_id), Utc::now());
        assert!(snippet.is_managed());
        assert_eq!(snippet.owner_call_id, Some(call_id));

        let foreign = KnowledgeSnippet::new("doc_2", "Clinic FAQ", Utc::now());
        assert!(!foreign.is_managed());
    }

    #[test]
    fn test_delta_accepts_camel_case_fields() {
        let json = r#"{"summary":"A1C is 9.7%","suggestedFocusAreas":["Weight loss"],"actionItems":["Recheck A1C"]}"#;
        let delta: ClinicalDelta = serde_json::from_str(json).unwrap();
        assert_eq!(delta.suggested_focus_areas, vec!["Weight loss"]);
        assert_eq!(delta.action_items, vec!["Recheck A1C"]);
        assert!(delta.concerns.is_empty());
    }

    #[test]
    fn test_delta_fingerprint_is_content_based() {
        let a = ClinicalDelta {
            summary: "A1C is 9.7".to_string(),
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = ClinicalDelta {
            summary: "A1C is 9.8".to_string(),
            ..Default::default()
        };
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_normalized_drops_blank_entries() {
        let delta = ClinicalDelta {
            summary: "  ok ".to_string(),
            concerns: vec!["  ".to_string(), " thirst ".to_string()],
            ..Default::default()
        }
        .normalized();
        assert_eq!(delta.summary, "ok");
        assert_eq!(delta.concerns, vec!["thirst"]);
        assert!(!delta.is_empty());
        assert!(ClinicalDelta::default().is_empty());
    }

    #[test]
    fn test_render_note_includes_sections() {
        let delta = ClinicalDelta {
            summary: "Patient reports A1C is 9.7%.".to_string(),
            concerns: vec!["Frequent thirst".to_string()],
            action_items: vec!["Schedule follow-up".to_string()],
            ..Default::default()
        };
        let body = delta.render_note(Utc::now());
        assert!(body.starts_with("[Education call "));
        assert!(body.contains("Summary: Patient reports A1C is 9.7%."));
        assert!(body.contains("Concerns:\n- Frequent thirst"));
        assert!(body.contains("Action items:\n- Schedule follow-up"));
        assert!(!body.contains("Progress:"));
    }

    #[test]
    fn test_new_focus_areas_dedupes_case_insensitively() {
        let existing = vec!["Weight loss".to_string()];
        let incoming = vec![
            " weight LOSS ".to_string(),
            "Foot care".to_string(),
            "foot care".to_string(),
            "".to_string(),
        ];
        assert_eq!(new_focus_areas(&existing, &incoming), vec!["Foot care"]);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_focus_merge_is_idempotent(
            existing in prop::collection::vec("[a-zA-Z ]{1,12}", 0..6),
            incoming in prop::collection::vec("[a-zA-Z ]{1,12}", 0..6),
        ) {
            let mut merged = existing.clone();
            merged.extend(new_focus_areas(&existing, &incoming));
            prop_assert!(new_focus_areas(&merged, &incoming).is_empty());
        }

        #[test]
        fn prop_new_focus_areas_never_contains_existing(
            existing in prop::collection::vec("[a-zA-Z ]{1,12}", 0..6),
            incoming in prop::collection::vec("[a-zA-Z ]{1,12}", 0..6),
        ) {
            let keys: HashSet<String> = existing.iter().map(|t| focus_key(t)).collect();
            for tag in new_focus_areas(&existing, &incoming) {
                prop_assert!(!keys.contains(&focus_key(&tag)));
                prop_assert!(!tag.trim().is_empty());
            }
        }
    }
}
