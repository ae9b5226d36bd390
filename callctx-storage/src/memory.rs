//! In-memory storage backend.
//!
//! Used for development (`CALLCTX_STORAGE=memory`) and throughout the test
//! suites. Every conditional update runs under a single write lock, so the
//! compare-and-set semantics match the Postgres backend.

use crate::traits::*;
use async_trait::async_trait;
use callctx_core::*;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory implementation of every storage trait.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    sessions: Arc<RwLock<HashMap<CallId, CallSession>>>,
    patients: Arc<RwLock<HashMap<PatientId, PatientProfile>>>,
    records: Arc<RwLock<HashMap<PatientId, PatientRecord>>>,
    transcripts: Arc<RwLock<HashMap<TranscriptId, TranscriptRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the patient directory.
    pub async fn add_patient(&self, profile: PatientProfile) {
        self.patients
            .write()
            .await
            .insert(profile.patient_id, profile);
    }

    /// Seed a clinical record, e.g. with human-entered notes.
    pub async fn put_record(&self, record: PatientRecord) {
        self.records.write().await.insert(record.patient_id, record);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn transcript_count(&self) -> usize {
        self.transcripts.read().await.len()
    }

    /// Transcripts no session could be matched to.
    pub async fn unattributed_transcripts(&self) -> Vec<TranscriptRecord> {
        let mut out: Vec<_> = self
            .transcripts
            .read()
            .await
            .values()
            .filter(|t| t.call_id.is_none())
            .cloned()
            .collect();
        out.sort_by_key(|t| t.received_at);
        out
    }

    async fn with_session<R>(
        &self,
        call_id: CallId,
        f: impl FnOnce(&mut CallSession) -> R,
    ) -> CallctxResult<R> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&call_id).ok_or_else(|| StorageError::NotFound {
            entity_type: EntityType::CallSession,
            id: call_id.to_string(),
        })?;
        let out = f(session);
        session.updated_at = Utc::now();
        Ok(out)
    }
}

fn matches_stored_phone(stored: &str, variants: &[String]) -> bool {
    let stored = stored.trim();
    if variants.iter().any(|v| v == stored) {
        return true;
    }
    match normalize_digits(stored) {
        Some(digits) => variants.iter().any(|v| *v == digits),
        None => false,
    }
}

#[async_trait]
impl CallSessionStore for InMemoryStore {
    async fn insert_session(&self, session: &CallSession) -> CallctxResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.call_id) {
            return Err(StorageError::InsertFailed {
                entity_type: EntityType::CallSession,
                reason: format!("duplicate call id {}", session.call_id),
            }
            .into());
        }
        sessions.insert(session.call_id, session.clone());
        Ok(())
    }

    async fn get_session(&self, call_id: CallId) -> CallctxResult<Option<CallSession>> {
        Ok(self.sessions.read().await.get(&call_id).cloned())
    }

    async fn find_by_carrier_call_id(
        &self,
        carrier_call_id: &str,
    ) -> CallctxResult<Option<CallSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.carrier_call_id.as_deref() == Some(carrier_call_id))
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> CallctxResult<Option<CallSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.external_conversation_id.as_deref() == Some(conversation_id))
            .cloned())
    }

    async fn list_correlation_candidates(
        &self,
        agent_id: Option<&str>,
        limit: usize,
    ) -> CallctxResult<Vec<CallSession>> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<CallSession> = sessions
            .values()
            .filter(|s| s.state.is_correlation_candidate())
            .filter(|s| s.external_conversation_id.is_none())
            .filter(|s| agent_id.map_or(true, |a| s.agent_id == a))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.call_id.cmp(&a.call_id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn list_stale_open(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> CallctxResult<Vec<CallSession>> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<CallSession> = sessions
            .values()
            .filter(|s| !s.is_terminal() && s.started_at < cutoff)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.started_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn list_release_pending(&self, limit: usize) -> CallctxResult<Vec<CallSession>> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<CallSession> = sessions
            .values()
            .filter(|s| s.is_terminal() && s.release.needs_release())
            .cloned()
            .collect();
        out.sort_by_key(|s| s.started_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn transition_state(
        &self,
        call_id: CallId,
        from: CallState,
        to: CallState,
        failure_reason: Option<&str>,
    ) -> CallctxResult<bool> {
        self.with_session(call_id, |s| -> Result<bool, ValidationError> {
            if s.state != from {
                return Ok(false);
            }
            s.transition(to)?;
            if let Some(reason) = failure_reason {
                s.failure_reason = Some(reason.to_string());
            }
            Ok(true)
        })
        .await?
        .map_err(CallctxError::from)
    }

    async fn claim_conversation_id(
        &self,
        call_id: CallId,
        conversation_id: &str,
    ) -> CallctxResult<bool> {
        let mut sessions = self.sessions.write().await;
        if sessions
            .values()
            .any(|s| s.external_conversation_id.as_deref() == Some(conversation_id))
        {
            return Ok(false);
        }
        let session = sessions.get_mut(&call_id).ok_or_else(|| StorageError::NotFound {
            entity_type: EntityType::CallSession,
            id: call_id.to_string(),
        })?;
        if session.external_conversation_id.is_some() {
            return Ok(false);
        }
        session.external_conversation_id = Some(conversation_id.to_string());
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn claim_release(&self, call_id: CallId) -> CallctxResult<bool> {
        self.with_session(call_id, |s| {
            if s.release.needs_release() {
                s.release = ContextRelease::Claimed;
                true
            } else {
                false
            }
        })
        .await
    }

    async fn record_context(&self, call_id: CallId, handle: &SnippetHandle) -> CallctxResult<()> {
        self.with_session(call_id, |s| s.hold_context(handle.clone()))
            .await
    }

    async fn mark_degraded(&self, call_id: CallId) -> CallctxResult<()> {
        self.with_session(call_id, |s| s.mark_degraded()).await
    }

    async fn mark_ended(&self, call_id: CallId, ended_at: Timestamp) -> CallctxResult<()> {
        self.with_session(call_id, |s| {
            if s.ended_at.is_none() {
                s.ended_at = Some(ended_at);
            }
        })
        .await
    }

    async fn finish_release(&self, call_id: CallId, outcome: ContextRelease) -> CallctxResult<()> {
        self.with_session(call_id, |s| s.release = outcome).await
    }
}

#[async_trait]
impl PatientDirectory for InMemoryStore {
    async fn find_by_phone(&self, variants: &[String]) -> CallctxResult<Option<PatientProfile>> {
        let patients = self.patients.read().await;
        let mut matches: Vec<&PatientProfile> = patients
            .values()
            .filter(|p| matches_stored_phone(&p.phone, variants))
            .collect();
        matches.sort_by_key(|p| p.patient_id);
        Ok(matches.first().map(|p| (*p).clone()))
    }

    async fn get_patient(&self, patient_id: PatientId) -> CallctxResult<Option<PatientProfile>> {
        Ok(self.patients.read().await.get(&patient_id).cloned())
    }
}

#[async_trait]
impl PatientRecordStore for InMemoryStore {
    async fn get_record(&self, patient_id: PatientId) -> CallctxResult<Option<PatientRecord>> {
        Ok(self.records.read().await.get(&patient_id).cloned())
    }

    async fn append_note_block(
        &self,
        patient_id: PatientId,
        block: &NoteBlock,
    ) -> CallctxResult<bool> {
        let mut records = self.records.write().await;
        let record = records
            .entry(patient_id)
            .or_insert_with(|| PatientRecord::empty(patient_id));
        if record.has_block(&block.fingerprint) {
            return Ok(false);
        }
        record.clinical_notes.push(block.clone());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn add_focus_areas(
        &self,
        patient_id: PatientId,
        tags: &[String],
    ) -> CallctxResult<Vec<String>> {
        let mut records = self.records.write().await;
        let record = records
            .entry(patient_id)
            .or_insert_with(|| PatientRecord::empty(patient_id));
        let added = new_focus_areas(&record.focus_areas, tags);
        if !added.is_empty() {
            record.focus_areas.extend(added.iter().cloned());
            record.updated_at = Utc::now();
        }
        Ok(added)
    }
}

#[async_trait]
impl TranscriptStore for InMemoryStore {
    async fn save_transcript(&self, transcript: &TranscriptRecord) -> CallctxResult<()> {
        self.transcripts
            .write()
            .await
            .insert(transcript.transcript_id, transcript.clone());
        Ok(())
    }

    async fn attribute_transcript(
        &self,
        transcript_id: TranscriptId,
        call_id: CallId,
    ) -> CallctxResult<()> {
        let mut transcripts = self.transcripts.write().await;
        let transcript = transcripts
            .get_mut(&transcript_id)
            .ok_or_else(|| StorageError::NotFound {
                entity_type: EntityType::Transcript,
                id: transcript_id.to_string(),
            })?;
        transcript.call_id = Some(call_id);
        Ok(())
    }

    async fn get_transcript(
        &self,
        transcript_id: TranscriptId,
    ) -> CallctxResult<Option<TranscriptRecord>> {
        Ok(self.transcripts.read().await.get(&transcript_id).cloned())
    }

    async fn list_transcripts_for_call(
        &self,
        call_id: CallId,
    ) -> CallctxResult<Vec<TranscriptRecord>> {
        let mut out: Vec<_> = self
            .transcripts
            .read()
            .await
            .values()
            .filter(|t| t.call_id == Some(call_id))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.received_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn session_in(state_path: &[CallState], agent: &str) -> CallSession {
        let mut s = CallSession::new("5550102000", agent);
        for next in state_path {
            s.transition(*next).unwrap();
        }
        s
    }

    fn profile(phone: &str) -> PatientProfile {
        PatientProfile {
            patient_id: Uuid::now_v7(),
            display_name: "Test Patient".to_string(),
            phone: phone.to_string(),
            preferred_language: Some("en".to_string()),
            medications: vec![],
            lab_results: vec![],
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_session() {
        let store = InMemoryStore::new();
        let session = CallSession::new("5550102000", "agent-en").with_carrier_call_id("CA1");
        store.insert_session(&session).await.unwrap();

        assert_eq!(store.get_session(session.call_id).await.unwrap(), Some(session.clone()));
        assert_eq!(
            store.find_by_carrier_call_id("CA1").await.unwrap().map(|s| s.call_id),
            Some(session.call_id)
        );
        assert!(store.insert_session(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_conversation_id_only_once() {
        let store = InMemoryStore::new();
        let a = session_in(&[CallState::Identified, CallState::InProgress], "agent-en");
        let b = session_in(&[CallState::Identified, CallState::InProgress], "agent-en");
        store.insert_session(&a).await.unwrap();
        store.insert_session(&b).await.unwrap();

        assert!(store.claim_conversation_id(a.call_id, "conv-1").await.unwrap());
        assert!(!store.claim_conversation_id(a.call_id, "conv-2").await.unwrap());
        // the same conversation id cannot be claimed by a second session
        assert!(!store.claim_conversation_id(b.call_id, "conv-1").await.unwrap());

        let found = store.find_by_conversation_id("conv-1").await.unwrap();
        assert_eq!(found.map(|s| s.call_id), Some(a.call_id));
    }

    #[tokio::test]
    async fn test_correlation_candidates_newest_first() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let older = session_in(&[CallState::Identified, CallState::InProgress], "agent-en")
            .with_started_at(now - ChronoDuration::seconds(30));
        let newer = session_in(&[CallState::Identified, CallState::ContextAttached], "agent-en")
            .with_started_at(now);
        let other_agent = session_in(&[CallState::Identified, CallState::InProgress], "agent-es")
            .with_started_at(now + ChronoDuration::seconds(1));
        let not_open = session_in(&[CallState::Identified], "agent-en");
        for s in [&older, &newer, &other_agent, &not_open] {
            store.insert_session(s).await.unwrap();
        }

        let all = store.list_correlation_candidates(None, 10).await.unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.call_id).collect();
        assert_eq!(ids, vec![other_agent.call_id, newer.call_id, older.call_id]);

        let en = store.list_correlation_candidates(Some("agent-en"), 1).await.unwrap();
        assert_eq!(en.len(), 1);
        assert_eq!(en[0].call_id, newer.call_id);
    }

    #[tokio::test]
    async fn test_transition_state_is_conditional() {
        let store = InMemoryStore::new();
        let s = session_in(&[CallState::Identified], "agent-en");
        store.insert_session(&s).await.unwrap();

        assert!(store
            .transition_state(s.call_id, CallState::Identified, CallState::InProgress, None)
            .await
            .unwrap());
        assert!(!store
            .transition_state(s.call_id, CallState::Identified, CallState::InProgress, None)
            .await
            .unwrap());
        assert!(store
            .transition_state(s.call_id, CallState::InProgress, CallState::Failed, Some("busy"))
            .await
            .unwrap());

        let stored = store.get_session(s.call_id).await.unwrap().unwrap();
        assert_eq!(stored.state, CallState::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("busy"));
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_transition_is_an_error() {
        let store = InMemoryStore::new();
        let s = session_in(&[CallState::Identified], "agent-en");
        store.insert_session(&s).await.unwrap();
        let result = store
            .transition_state(s.call_id, CallState::Identified, CallState::Completed, None)
            .await;
        assert!(matches!(result, Err(CallctxError::Validation(_))));
    }

    #[tokio::test]
    async fn test_claim_release_single_winner() {
        let store = InMemoryStore::new();
        let s = session_in(&[CallState::Identified], "agent-en");
        store.insert_session(&s).await.unwrap();

        // nothing held yet
        assert!(!store.claim_release(s.call_id).await.unwrap());

        store.record_context(s.call_id, &"doc_1".to_string()).await.unwrap();
        assert!(store.claim_release(s.call_id).await.unwrap());
        assert!(!store.claim_release(s.call_id).await.unwrap());

        store
            .finish_release(s.call_id, ContextRelease::ReleaseFailed)
            .await
            .unwrap();
        assert!(store.claim_release(s.call_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_pending_lists_terminal_unreleased() {
        let store = InMemoryStore::new();
        let s = session_in(&[CallState::Identified], "agent-en");
        store.insert_session(&s).await.unwrap();
        store.record_context(s.call_id, &"doc_1".to_string()).await.unwrap();
        assert!(store.list_release_pending(10).await.unwrap().is_empty());

        store
            .transition_state(s.call_id, CallState::Identified, CallState::Failed, None)
            .await
            .unwrap();
        assert_eq!(store.list_release_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_open_sessions() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let stale = session_in(&[CallState::Identified], "agent-en")
            .with_started_at(now - ChronoDuration::hours(3));
        let fresh = session_in(&[CallState::Identified], "agent-en");
        store.insert_session(&stale).await.unwrap();
        store.insert_session(&fresh).await.unwrap();

        let listed = store
            .list_stale_open(now - ChronoDuration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].call_id, stale.call_id);
    }

    #[tokio::test]
    async fn test_find_by_phone_across_formats() {
        let store = InMemoryStore::new();
        let patient = profile("5550102000");
        store.add_patient(patient.clone()).await;
        store.add_patient(profile("(555) 010-9999")).await;

        let found = store
            .find_by_phone(&phone_variants("+1-555-010-2000"))
            .await
            .unwrap();
        assert_eq!(found.map(|p| p.patient_id), Some(patient.patient_id));

        let missing = store.find_by_phone(&phone_variants("5550100000")).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_append_note_block_is_idempotent_and_append_only() {
        let store = InMemoryStore::new();
        let patient_id = Uuid::now_v7();
        let manual = NoteBlock::manual("Prefers morning calls.", Utc::now());
        let mut record = PatientRecord::empty(patient_id);
        record.clinical_notes.push(manual.clone());
        store.put_record(record).await;

        let delta = ClinicalDelta {
            summary: "A1C is 9.7%".to_string(),
            ..Default::default()
        };
        let block = NoteBlock::from_delta(&delta, Utc::now(), None);
        assert!(store.append_note_block(patient_id, &block).await.unwrap());
        assert!(!store.append_note_block(patient_id, &block).await.unwrap());

        let record = store.get_record(patient_id).await.unwrap().unwrap();
        assert_eq!(record.clinical_notes.len(), 2);
        assert_eq!(record.clinical_notes[0], manual);
    }

    #[tokio::test]
    async fn test_add_focus_areas_dedupes() {
        let store = InMemoryStore::new();
        let patient_id = Uuid::now_v7();
        let mut record = PatientRecord::empty(patient_id);
        record.focus_areas.push("weight loss".to_string());
        store.put_record(record).await;

        let added = store
            .add_focus_areas(
                patient_id,
                &["Weight Loss ".to_string(), "Foot care".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(added, vec!["Foot care"]);

        let record = store.get_record(patient_id).await.unwrap().unwrap();
        assert_eq!(record.focus_areas, vec!["weight loss", "Foot care"]);
    }

    #[tokio::test]
    async fn test_unattributed_transcripts() {
        let store = InMemoryStore::new();
        let t = TranscriptRecord::new("conv-1", "hello", None);
        store.save_transcript(&t).await.unwrap();
        assert_eq!(store.unattributed_transcripts().await.len(), 1);

        let call_id = Uuid::now_v7();
        store.attribute_transcript(t.transcript_id, call_id).await.unwrap();
        assert!(store.unattributed_transcripts().await.is_empty());
        assert_eq!(store.list_transcripts_for_call(call_id).await.unwrap().len(), 1);
    }
}
