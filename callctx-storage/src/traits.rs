//! Async storage traits.
//!
//! Every mutation that two concurrent paths may race on is a conditional
//! update returning whether it applied: conversation-id claims, state
//! transitions and the snippet release claim. Callers treat `false` as
//! "somebody else got there first", not as an error.

use async_trait::async_trait;
use callctx_core::{
    CallId, CallSession, CallState, CallctxResult, ContextRelease, NoteBlock, PatientId,
    PatientProfile, PatientRecord, SnippetHandle, Timestamp, TranscriptId, TranscriptRecord,
};

#[async_trait]
pub trait CallSessionStore: Send + Sync {
    // ========================================================================
    // INSERT + LOOKUP
    // ========================================================================

    async fn insert_session(&self, session: &CallSession) -> CallctxResult<()>;

    async fn get_session(&self, call_id: CallId) -> CallctxResult<Option<CallSession>>;

    async fn find_by_carrier_call_id(
        &self,
        carrier_call_id: &str,
    ) -> CallctxResult<Option<CallSession>>;

    async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> CallctxResult<Option<CallSession>>;

    /// Open sessions without a conversation id, newest first.
    ///
    /// Only `InProgress` and `ContextAttached` sessions qualify. When
    /// `agent_id` is given, sessions routed to other agents are excluded.
    async fn list_correlation_candidates(
        &self,
        agent_id: Option<&str>,
        limit: usize,
    ) -> CallctxResult<Vec<CallSession>>;

    /// Non-terminal sessions started before `cutoff`, oldest first.
    async fn list_stale_open(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> CallctxResult<Vec<CallSession>>;

    /// Terminal sessions whose snippet is still held or failed to release.
    async fn list_release_pending(&self, limit: usize) -> CallctxResult<Vec<CallSession>>;

    // ========================================================================
    // CONDITIONAL UPDATES
    // ========================================================================

    /// Move `from -> to` only if the session is still in `from`.
    async fn transition_state(
        &self,
        call_id: CallId,
        from: CallState,
        to: CallState,
        failure_reason: Option<&str>,
    ) -> CallctxResult<bool>;

    /// Set the conversation id only if it is still unset.
    async fn claim_conversation_id(
        &self,
        call_id: CallId,
        conversation_id: &str,
    ) -> CallctxResult<bool>;

    /// `Held | ReleaseFailed -> Claimed`. Exactly one caller wins.
    async fn claim_release(&self, call_id: CallId) -> CallctxResult<bool>;

    // ========================================================================
    // PLAIN UPDATES
    // ========================================================================

    /// Record the snippet handle and mark it held.
    async fn record_context(&self, call_id: CallId, handle: &SnippetHandle) -> CallctxResult<()>;

    async fn mark_degraded(&self, call_id: CallId) -> CallctxResult<()>;

    /// Stamp the telephony leg end without changing state.
    async fn mark_ended(&self, call_id: CallId, ended_at: Timestamp) -> CallctxResult<()>;

    /// Outcome of a claimed release: `Released` or `ReleaseFailed`.
    async fn finish_release(&self, call_id: CallId, outcome: ContextRelease) -> CallctxResult<()>;
}

#[async_trait]
pub trait PatientDirectory: Send + Sync {
    /// First patient whose stored phone matches any of `variants`.
    async fn find_by_phone(&self, variants: &[String]) -> CallctxResult<Option<PatientProfile>>;

    async fn get_patient(&self, patient_id: PatientId) -> CallctxResult<Option<PatientProfile>>;
}

/// Append-only access to patient clinical records.
///
/// No operation here replaces or truncates existing notes.
#[async_trait]
pub trait PatientRecordStore: Send + Sync {
    async fn get_record(&self, patient_id: PatientId) -> CallctxResult<Option<PatientRecord>>;

    /// Append a note block. Returns `false` if a block with the same
    /// fingerprint is already present.
    async fn append_note_block(&self, patient_id: PatientId, block: &NoteBlock)
        -> CallctxResult<bool>;

    /// Union tags into the record's focus areas; returns the tags added.
    async fn add_focus_areas(
        &self,
        patient_id: PatientId,
        tags: &[String],
    ) -> CallctxResult<Vec<String>>;
}

#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn save_transcript(&self, transcript: &TranscriptRecord) -> CallctxResult<()>;

    async fn attribute_transcript(
        &self,
        transcript_id: TranscriptId,
        call_id: CallId,
    ) -> CallctxResult<()>;

    async fn get_transcript(
        &self,
        transcript_id: TranscriptId,
    ) -> CallctxResult<Option<TranscriptRecord>>;

    async fn list_transcripts_for_call(&self, call_id: CallId)
        -> CallctxResult<Vec<TranscriptRecord>>;
}

/// Everything the API layer needs from a backend.
pub trait CallctxStore:
    CallSessionStore + PatientDirectory + PatientRecordStore + TranscriptStore
{
}

impl<T> CallctxStore for T where
    T: CallSessionStore + PatientDirectory + PatientRecordStore + TranscriptStore
{
}
