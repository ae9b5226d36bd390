//! Call Session Coordinator
//!
//! Owns the lifecycle of one call: identify the caller, attach a knowledge
//! snippet for the voice agent, and on transcript delivery run clinical
//! extraction and snippet teardown concurrently before completing the call.
//!
//! Every step that touches the external context store is bounded by
//! `CoordinatorConfig::context_op_timeout` and is never fatal to the call:
//! a failed create or attach marks the session degraded and the agent runs
//! with generic context.
//!
//! Teardown is claimed through `claim_release`, so however many paths race
//! to tear a snippet down (completion, failure, the orphan sweeper) only one
//! of them issues the detach and destroy.

use crate::constants::MAX_FAIL_ATTEMPTS;
use crate::services::{
    Correlation, CorrelationQuery, CorrelationResolver, MergeOutcome, PatientRecordMerger,
};
use crate::telemetry::metrics;
use callctx_context::{release_snippet, with_timeout, ContextStore, SnippetAssembler};
use callctx_core::{
    normalize_digits, AgentId, CallId, CallSession, CallState, CallctxError, CallctxResult,
    ContextRelease, CoordinatorConfig, CorrelationMethod, EntityType, PatientProfile, PhoneNumber,
    StorageError, TelephonyStatus, Timestamp, TranscriptId, TranscriptRecord,
};
use callctx_llm::{ClinicalNoteExtractor, CompletionProvider};
use callctx_storage::{
    CallSessionStore, CallctxStore, PatientDirectory, PatientRecordStore, TranscriptStore,
};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

// ============================================================================
// EVENTS
// ============================================================================

/// An inbound call as reported by the telephony carrier.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCall {
    pub caller_number: String,
    pub carrier_call_id: Option<String>,
    pub arrived_at: Option<Timestamp>,
}

impl InboundCall {
    pub fn new(caller_number: impl Into<String>) -> Self {
        Self {
            caller_number: caller_number.into(),
            carrier_call_id: None,
            arrived_at: None,
        }
    }

    pub fn with_carrier_call_id(mut self, carrier_call_id: impl Into<String>) -> Self {
        self.carrier_call_id = Some(carrier_call_id.into());
        self
    }
}

/// A finished conversation delivered by the voice-agent provider.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub conversation_id: String,
    pub text: String,
    pub ended_at: Option<Timestamp>,
    pub call_id_hint: Option<CallId>,
    pub agent_id: Option<AgentId>,
}

impl TranscriptEvent {
    pub fn new(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            text: text.into(),
            ended_at: None,
            call_id_hint: None,
            agent_id: None,
        }
    }

    pub fn with_call_id_hint(mut self, call_id: CallId) -> Self {
        self.call_id_hint = Some(call_id);
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_ended_at(mut self, ended_at: Timestamp) -> Self {
        self.ended_at = Some(ended_at);
        self
    }
}

/// Result of accepting a transcript.
///
/// The transcript is durably stored before this is returned. Post-call work
/// continues in the background; `completion` lets a caller wait for this
/// call's work. Dropping the receipt does not cancel it, and shutdown waits
/// on all of it through [`CallCoordinator::drain_post_call`].
#[derive(Debug)]
pub struct TranscriptReceipt {
    pub transcript_id: TranscriptId,
    pub call_id: Option<CallId>,
    pub method: Option<CorrelationMethod>,
    /// Open calls the fallback passed over; see [`Correlation::passed_over`].
    pub passed_over: Vec<CallId>,
    pub completion: Option<JoinHandle<()>>,
}

impl TranscriptReceipt {
    pub fn correlated(&self) -> bool {
        self.call_id.is_some()
    }

    /// Correlated by fallback with other open calls in contention.
    pub fn ambiguous(&self) -> bool {
        !self.passed_over.is_empty()
    }

    /// Wait for background post-call work, if any was started.
    pub async fn wait(self) {
        if let Some(handle) = self.completion {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Post-call task panicked");
            }
        }
    }
}

/// Which component is tearing a snippet down, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownSource {
    Coordinator,
    Sweeper,
}

impl TeardownSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeardownSource::Coordinator => "coordinator",
            TeardownSource::Sweeper => "sweeper",
        }
    }
}

// ============================================================================
// POST-CALL TRACKING
// ============================================================================

/// Count of spawned post-call tasks still running.
#[derive(Debug, Default)]
struct PostCallTasks {
    running: AtomicUsize,
    idle: Notify,
}

impl PostCallTasks {
    fn enter(self: &Arc<Self>) -> PostCallGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        PostCallGuard(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a post-call task; released on completion, error or panic.
struct PostCallGuard(Arc<PostCallTasks>);

impl Drop for PostCallGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct CallCoordinator {
    store: Arc<dyn CallctxStore>,
    context: Arc<dyn ContextStore>,
    extractor: Option<ClinicalNoteExtractor>,
    resolver: CorrelationResolver,
    merger: PatientRecordMerger,
    assembler: SnippetAssembler,
    config: CoordinatorConfig,
    post_call: Arc<PostCallTasks>,
}

impl CallCoordinator {
    /// Build a coordinator. Without a completion provider transcripts are
    /// still stored and snippets torn down, but no notes are extracted.
    pub fn new(
        store: Arc<dyn CallctxStore>,
        context: Arc<dyn ContextStore>,
        completion: Option<Arc<dyn CompletionProvider>>,
        config: CoordinatorConfig,
    ) -> CallctxResult<Self> {
        config.validate()?;
        let assembler = SnippetAssembler::new(config.snippet_token_budget, config.snippet_recent_notes)?;
        let extractor =
            completion.map(|provider| ClinicalNoteExtractor::new(provider, config.completion_timeout));

        Ok(Self {
            resolver: CorrelationResolver::new(Arc::clone(&store)),
            merger: PatientRecordMerger::new(Arc::clone(&store)),
            store,
            context,
            extractor,
            assembler,
            config,
            post_call: Arc::new(PostCallTasks::default()),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn extractor(&self) -> Option<&ClinicalNoteExtractor> {
        self.extractor.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn CallctxStore> {
        &self.store
    }

    pub fn context_store(&self) -> &Arc<dyn ContextStore> {
        &self.context
    }

    /// Post-call tasks still running.
    pub fn post_call_in_flight(&self) -> usize {
        self.post_call.running.load(Ordering::SeqCst)
    }

    /// Wait until every spawned post-call task has finished, up to `limit`.
    ///
    /// Returns false if tasks were still running when the limit expired.
    pub async fn drain_post_call(&self, limit: Duration) -> bool {
        let drained = tokio::time::timeout(limit, self.post_call.wait_idle()).await.is_ok();
        if !drained {
            tracing::warn!(
                in_flight = self.post_call_in_flight(),
                "Post-call tasks still running at shutdown; sweeper reclaims their snippets"
            );
        }
        drained
    }

    async fn reload(&self, call_id: CallId) -> CallctxResult<CallSession> {
        self.store.get_session(call_id).await?.ok_or_else(|| {
            CallctxError::Storage(StorageError::NotFound {
                entity_type: EntityType::CallSession,
                id: call_id.to_string(),
            })
        })
    }

    // ------------------------------------------------------------------------
    // Call start
    // ------------------------------------------------------------------------

    /// Identify the caller and persist a new session in `Identified`.
    ///
    /// No external call is made before the session is stored, so every
    /// snippet created later has an owner record. An unknown or unparseable
    /// number still yields a session, flagged `unidentified`.
    pub async fn on_inbound_call(&self, call: InboundCall) -> CallctxResult<CallSession> {
        let (digits, variants) = match PhoneNumber::parse(&call.caller_number) {
            Ok(phone) => (phone.digits().to_string(), phone.variants()),
            Err(e) => {
                tracing::warn!(error = %e, "Caller number did not normalize; call proceeds unidentified");
                let digits = normalize_digits(&call.caller_number).unwrap_or_default();
                (digits, Vec::new())
            }
        };

        let patient = if variants.is_empty() {
            None
        } else {
            match self.store.find_by_phone(&variants).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(error = %e, "Patient lookup failed; call proceeds unidentified");
                    None
                }
            }
        };

        let language = patient.as_ref().and_then(|p| p.preferred_language.as_deref());
        let agent = self.config.routing.agent_for(language).clone();

        let mut session = CallSession::new(digits, agent);
        if let Some(carrier_call_id) = call.carrier_call_id {
            session = session.with_carrier_call_id(carrier_call_id);
        }
        if let Some(arrived_at) = call.arrived_at {
            session = session.with_started_at(arrived_at);
        }
        session.patient_id = patient.as_ref().map(|p| p.patient_id);
        session.unidentified = patient.is_none();
        session.transition(CallState::Identified)?;

        self.store.insert_session(&session).await?;

        if let Some(m) = metrics() {
            m.record_call_started(!session.unidentified);
        }
        tracing::info!(
            call_id = %session.call_id,
            patient_id = ?session.patient_id,
            agent_id = %session.agent_id,
            unidentified = session.unidentified,
            "Inbound call identified"
        );
        Ok(session)
    }

    /// Create the patient's snippet and attach it to the session's agent.
    ///
    /// Returns the session as stored afterwards. Context-store failures
    /// degrade the call instead of failing it.
    pub async fn attach_context(&self, session: &CallSession) -> CallctxResult<CallSession> {
        let Some(patient_id) = session.patient_id else {
            tracing::debug!(call_id = %session.call_id, "Unidentified caller, agent uses generic context");
            return Ok(session.clone());
        };
        let call_id = session.call_id;
        let op_timeout = self.config.context_op_timeout;

        let profile = match self.store.get_patient(patient_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                let reason = format!("patient {} vanished after identification", patient_id);
                return self.degrade(call_id, "lookup", &reason).await;
            }
            Err(e) => return self.degrade(call_id, "lookup", &e.to_string()).await,
        };
        let record = match self.store.get_record(patient_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Clinical record unavailable; snippet built from profile only");
                None
            }
        };
        let text = self.assembler.assemble(&profile, record.as_ref()).as_text();

        let handle = match with_timeout("create", op_timeout, self.context.create(call_id, &text)).await {
            Ok(handle) => handle,
            Err(e) => return self.degrade(call_id, "create", &e.to_string()).await,
        };
        if let Some(m) = metrics() {
            m.record_snippet_created();
        }

        if let Err(e) = self.store.record_context(call_id, &handle).await {
            // Unrecorded snippet: owner is known from its name, so the sweeper reclaims it
            tracing::error!(call_id = %call_id, handle = %handle, error = %e, "Failed to record snippet handle");
            return self.degrade(call_id, "create", &e.to_string()).await;
        }

        if let Err(e) = with_timeout(
            "attach",
            op_timeout,
            self.context.attach(&handle, &session.agent_id),
        )
        .await
        {
            // Snippet stays held; teardown destroys it with the call
            return self.degrade(call_id, "attach", &e.to_string()).await;
        }

        let current = self.reload(call_id).await?;
        if current.release != ContextRelease::Held {
            // Teardown claimed the snippet while the attach was in flight
            return self.undo_late_attach(&current, &handle).await;
        }

        if self
            .store
            .transition_state(call_id, CallState::Identified, CallState::ContextAttached, None)
            .await?
        {
            tracing::info!(call_id = %call_id, handle = %handle, agent_id = %session.agent_id, "Knowledge snippet attached");
            return self.reload(call_id).await;
        }

        let current = self.reload(call_id).await?;
        if current.release != ContextRelease::Held {
            return self.undo_late_attach(&current, &handle).await;
        }
        if current.is_terminal() {
            tracing::info!(call_id = %call_id, state = %current.state, "Call ended during attach, releasing snippet");
            self.release_context(call_id, TeardownSource::Coordinator).await?;
            return self.reload(call_id).await;
        }

        // Moved past Identified while the attach was in flight; the agent has the snippet
        tracing::info!(
            call_id = %call_id,
            handle = %handle,
            agent_id = %session.agent_id,
            state = %current.state,
            "Knowledge snippet attached after call moved on"
        );
        Ok(current)
    }

    /// Detach and destroy a snippet whose attach landed after teardown
    /// claimed it.
    ///
    /// Both operations are idempotent, so this runs whether or not the claim
    /// holder has finished. A failure after a finished release reopens it
    /// for the sweeper.
    async fn undo_late_attach(&self, session: &CallSession, handle: &str) -> CallctxResult<CallSession> {
        let call_id = session.call_id;
        tracing::info!(
            call_id = %call_id,
            handle = %handle,
            state = %session.state,
            release = session.release.as_db_str(),
            "Teardown began during attach, detaching snippet again"
        );

        let agents = [session.agent_id.clone()];
        if let Err(e) = release_snippet(&*self.context, handle, &agents, self.config.context_op_timeout).await {
            if let Some(m) = metrics() {
                m.record_teardown_failure(TeardownSource::Coordinator.as_str());
            }
            tracing::warn!(call_id = %call_id, handle = %handle, error = %e, "Late detach failed, left for sweeper");
            if session.release == ContextRelease::Released {
                self.store.finish_release(call_id, ContextRelease::ReleaseFailed).await?;
            }
        }
        self.reload(call_id).await
    }

    async fn degrade(&self, call_id: CallId, stage: &str, reason: &str) -> CallctxResult<CallSession> {
        tracing::warn!(
            call_id = %call_id,
            stage = stage,
            reason = reason,
            "Proceeding without personalized context"
        );
        if let Some(m) = metrics() {
            m.record_degraded(stage);
        }
        self.store.mark_degraded(call_id).await?;
        self.reload(call_id).await
    }

    /// Identify, persist and attach context in one step.
    pub async fn start_call(&self, call: InboundCall) -> CallctxResult<CallSession> {
        let session = self.on_inbound_call(call).await?;
        self.attach_context(&session).await
    }

    // ------------------------------------------------------------------------
    // Carrier status
    // ------------------------------------------------------------------------

    /// Move an answered call to `InProgress`. False if it had already moved on.
    pub async fn mark_in_progress(&self, call_id: CallId) -> CallctxResult<bool> {
        for _ in 0..MAX_FAIL_ATTEMPTS {
            let session = self.reload(call_id).await?;
            if !matches!(session.state, CallState::Identified | CallState::ContextAttached) {
                tracing::debug!(call_id = %call_id, state = %session.state, "Ignoring answer for call past ringing");
                return Ok(false);
            }
            if self
                .store
                .transition_state(call_id, session.state, CallState::InProgress, None)
                .await?
            {
                tracing::info!(call_id = %call_id, "Call in progress");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn record_call_ended(&self, call_id: CallId, ended_at: Timestamp) -> CallctxResult<()> {
        self.store.mark_ended(call_id, ended_at).await
    }

    /// Fail a call that has not reached a terminal state.
    ///
    /// The snippet is torn down before the state changes. Returns false when
    /// the call was already terminal.
    pub async fn fail_call(&self, call_id: CallId, reason: &str) -> CallctxResult<bool> {
        for _ in 0..MAX_FAIL_ATTEMPTS {
            let session = self.reload(call_id).await?;
            if session.is_terminal() {
                return Ok(false);
            }

            self.release_context(call_id, TeardownSource::Coordinator).await?;

            if self
                .store
                .transition_state(call_id, session.state, CallState::Failed, Some(reason))
                .await?
            {
                tracing::info!(call_id = %call_id, reason = reason, "Call failed");
                return Ok(true);
            }
        }

        tracing::warn!(call_id = %call_id, "Could not fail call after repeated state conflicts");
        Ok(false)
    }

    /// Apply a carrier status callback.
    pub async fn apply_telephony_status(
        &self,
        call_id: CallId,
        status: TelephonyStatus,
        at: Timestamp,
    ) -> CallctxResult<CallSession> {
        match status {
            TelephonyStatus::Answered => {
                self.mark_in_progress(call_id).await?;
            }
            TelephonyStatus::Completed => {
                self.record_call_ended(call_id, at).await?;
            }
            failure if failure.is_failure() => {
                self.record_call_ended(call_id, at).await?;
                self.fail_call(call_id, failure.as_db_str()).await?;
            }
            _ => {}
        }
        self.reload(call_id).await
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Detach and destroy the session's snippet if this caller wins the
    /// release claim.
    ///
    /// Returns true only when this call performed a successful teardown. A
    /// failed detach or destroy leaves the session `ReleaseFailed` for the
    /// sweeper to retry.
    pub async fn release_context(&self, call_id: CallId, source: TeardownSource) -> CallctxResult<bool> {
        if !self.store.claim_release(call_id).await? {
            return Ok(false);
        }

        let session = self.reload(call_id).await?;
        let Some(handle) = session.context_handle.as_deref() else {
            self.store.finish_release(call_id, ContextRelease::Released).await?;
            return Ok(true);
        };

        let agents = [session.agent_id.clone()];
        match release_snippet(&*self.context, handle, &agents, self.config.context_op_timeout).await {
            Ok(()) => {
                self.store.finish_release(call_id, ContextRelease::Released).await?;
                if let Some(m) = metrics() {
                    m.record_snippet_destroyed();
                }
                tracing::info!(call_id = %call_id, handle = %handle, source = source.as_str(), "Knowledge snippet released");
                Ok(true)
            }
            Err(e) => {
                self.store.finish_release(call_id, ContextRelease::ReleaseFailed).await?;
                if let Some(m) = metrics() {
                    m.record_teardown_failure(source.as_str());
                }
                tracing::warn!(
                    call_id = %call_id,
                    handle = %handle,
                    source = source.as_str(),
                    error = %e,
                    "Snippet teardown failed, left for sweeper"
                );
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transcript delivery
    // ------------------------------------------------------------------------

    /// Accept a finished conversation.
    ///
    /// The transcript is saved before anything else so no delivery is lost.
    /// When it correlates to an open call, clinical extraction and teardown
    /// start in the background and the call moves to `AwaitingTranscript`.
    /// A redelivery for a call already past that point is stored but not
    /// processed again.
    pub async fn on_transcript_delivered(
        self: &Arc<Self>,
        event: TranscriptEvent,
    ) -> CallctxResult<TranscriptReceipt> {
        let record = TranscriptRecord::new(event.conversation_id.clone(), event.text.clone(), event.ended_at);
        self.store.save_transcript(&record).await?;

        let mut query = CorrelationQuery::new(event.conversation_id.clone());
        if let Some(call_id) = event.call_id_hint {
            query = query.with_call_id_hint(call_id);
        }
        if let Some(agent_id) = event.agent_id.clone() {
            query = query.with_agent_id(agent_id);
        }

        let correlation = match self.resolver.resolve(&query).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(
                    transcript_id = %record.transcript_id,
                    error = %e,
                    "Correlation failed; transcript kept unattributed"
                );
                None
            }
        };

        let Some(Correlation {
            session,
            method,
            passed_over,
        }) = correlation
        else {
            return Ok(TranscriptReceipt {
                transcript_id: record.transcript_id,
                call_id: None,
                method: None,
                passed_over: Vec::new(),
                completion: None,
            });
        };
        let call_id = session.call_id;

        if let Err(e) = self.store.attribute_transcript(record.transcript_id, call_id).await {
            tracing::warn!(transcript_id = %record.transcript_id, call_id = %call_id, error = %e, "Failed to attribute transcript");
        }
        if let Some(ended_at) = event.ended_at {
            self.store.mark_ended(call_id, ended_at).await?;
        }

        let mut receipt = TranscriptReceipt {
            transcript_id: record.transcript_id,
            call_id: Some(call_id),
            method: Some(method),
            passed_over,
            completion: None,
        };

        if !self.begin_awaiting(call_id).await? {
            tracing::info!(call_id = %call_id, "Transcript for a call already processed or closed");
            return Ok(receipt);
        }

        let this = Arc::clone(self);
        let guard = self.post_call.enter();
        let transcript = event.text;
        let at = event.ended_at.unwrap_or_else(Utc::now);
        receipt.completion = Some(tokio::spawn(async move {
            let _guard = guard;
            this.complete_call(call_id, transcript, at).await;
        }));
        Ok(receipt)
    }

    /// Claim post-call processing by moving an open call to `AwaitingTranscript`.
    async fn begin_awaiting(&self, call_id: CallId) -> CallctxResult<bool> {
        for _ in 0..MAX_FAIL_ATTEMPTS {
            let session = self.reload(call_id).await?;
            if !session.state.can_transition_to(CallState::AwaitingTranscript) {
                return Ok(false);
            }
            if self
                .store
                .transition_state(call_id, session.state, CallState::AwaitingTranscript, None)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run extraction/merge and teardown together, then mark the call complete.
    ///
    /// Neither branch can block or fail the other. A failed extraction
    /// leaves the patient record untouched and still completes the call.
    pub async fn complete_call(&self, call_id: CallId, transcript: String, at: Timestamp) {
        let session = match self.reload(call_id).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e, "Cannot load session for completion");
                return;
            }
        };

        let (clinical, teardown) = tokio::join!(
            self.process_clinical(&session, &transcript, at),
            self.release_context(call_id, TeardownSource::Coordinator),
        );

        if let Err(e) = clinical {
            tracing::warn!(call_id = %call_id, error = %e, "Clinical processing failed; patient record unchanged");
        }
        if let Err(e) = teardown {
            tracing::error!(call_id = %call_id, error = %e, "Snippet teardown errored; sweeper will retry");
        }

        match self
            .store
            .transition_state(call_id, CallState::AwaitingTranscript, CallState::Completed, None)
            .await
        {
            Ok(true) => tracing::info!(call_id = %call_id, "Call completed"),
            Ok(false) => tracing::debug!(call_id = %call_id, "Call left AwaitingTranscript before completion"),
            Err(e) => tracing::error!(call_id = %call_id, error = %e, "Failed to complete call"),
        }
    }

    async fn process_clinical(
        &self,
        session: &CallSession,
        transcript: &str,
        at: Timestamp,
    ) -> CallctxResult<Option<MergeOutcome>> {
        let (Some(patient_id), Some(extractor)) = (session.patient_id, self.extractor.as_ref()) else {
            record_extraction("skipped");
            return Ok(None);
        };

        let profile = self.store.get_patient(patient_id).await?;
        let record = self.store.get_record(patient_id).await?;
        let patient_context = profile
            .as_ref()
            .map(|p: &PatientProfile| self.assembler.assemble(p, record.as_ref()).as_text())
            .unwrap_or_default();

        let delta = match extractor.extract(transcript, &patient_context).await {
            Ok(delta) => {
                record_extraction("success");
                delta
            }
            Err(e) => {
                record_extraction("failure");
                return Err(e);
            }
        };

        let outcome = self
            .merger
            .merge(patient_id, &delta, at, Some(session.call_id))
            .await?;
        Ok(Some(outcome))
    }
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoordinator")
            .field("extractor", &self.extractor)
            .field("config", &self.config)
            .finish()
    }
}

fn record_extraction(outcome: &str) {
    if let Some(m) = metrics() {
        m.record_extraction(outcome);
    }
}
