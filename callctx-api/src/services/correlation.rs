//! Correlation Resolver
//!
//! Matches a transcript-delivery event back to the call session it
//! describes. Order of attempts:
//!
//! 1. our call id, when the provider echoes it back in event metadata
//! 2. exact match on the stored conversation id
//! 3. fallback: newest open session without a conversation id, claimed with
//!    a compare-and-set so two events never take the same session
//!
//! Nothing found is a normal outcome (`Ok(None)`), not an error.

use crate::constants::{FALLBACK_CANDIDATE_LIMIT, MAX_FALLBACK_ATTEMPTS};
use crate::telemetry::metrics;
use callctx_core::{AgentId, CallId, CallSession, CallctxResult, CorrelationMethod};
use callctx_storage::{CallSessionStore, CallctxStore};
use std::sync::Arc;

/// What the resolver needs from a transcript event.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationQuery {
    pub conversation_id: String,
    /// Call id we passed to the provider as dynamic metadata, if echoed.
    pub call_id_hint: Option<CallId>,
    /// Agent that handled the conversation; restricts fallback candidates.
    pub agent_id: Option<AgentId>,
}

impl CorrelationQuery {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
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
}

/// A resolved session and how it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub session: CallSession,
    pub method: CorrelationMethod,
    /// Other open calls the fallback could have chosen, newest first.
    /// Non-empty means the transcript may belong to one of these instead.
    pub passed_over: Vec<CallId>,
}

impl Correlation {
    fn new(session: CallSession, method: CorrelationMethod) -> Self {
        Self {
            session,
            method,
            passed_over: Vec::new(),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        !self.passed_over.is_empty()
    }
}

#[derive(Clone)]
pub struct CorrelationResolver {
    store: Arc<dyn CallctxStore>,
    max_fallback_attempts: usize,
}

impl CorrelationResolver {
    pub fn new(store: Arc<dyn CallctxStore>) -> Self {
        Self {
            store,
            max_fallback_attempts: MAX_FALLBACK_ATTEMPTS,
        }
    }

    /// Resolve `query` to a session, binding the conversation id on success.
    pub async fn resolve(&self, query: &CorrelationQuery) -> CallctxResult<Option<Correlation>> {
        let conversation_id = query.conversation_id.as_str();

        if let Some(call_id) = query.call_id_hint {
            if let Some(found) = self.resolve_hint(call_id, conversation_id).await? {
                return Ok(Some(found));
            }
        }

        for attempt in 0..self.max_fallback_attempts {
            if let Some(session) = self.store.find_by_conversation_id(conversation_id).await? {
                record(CorrelationMethod::Exact.as_db_str());
                return Ok(Some(Correlation::new(session, CorrelationMethod::Exact)));
            }

            let candidates = self
                .store
                .list_correlation_candidates(query.agent_id.as_deref(), FALLBACK_CANDIDATE_LIMIT)
                .await?;
            let Some(newest) = candidates.first() else {
                break;
            };

            if candidates.len() > 1 {
                let candidate_ids: Vec<String> =
                    candidates.iter().map(|c| c.call_id.to_string()).collect();
                tracing::warn!(
                    conversation_id = %conversation_id,
                    chosen = %newest.call_id,
                    candidates = ?candidate_ids,
                    "Ambiguous correlation: several open calls lack a conversation id"
                );
                record("ambiguous");
            }

            if self
                .store
                .claim_conversation_id(newest.call_id, conversation_id)
                .await?
            {
                let mut session = newest.clone();
                session.external_conversation_id = Some(conversation_id.to_string());
                tracing::warn!(
                    call_id = %session.call_id,
                    conversation_id = %conversation_id,
                    "Transcript correlated by fallback"
                );
                record(CorrelationMethod::Fallback.as_db_str());
                return Ok(Some(Correlation {
                    session,
                    method: CorrelationMethod::Fallback,
                    passed_over: candidates[1..].iter().map(|c| c.call_id).collect(),
                }));
            }

            tracing::debug!(
                call_id = %newest.call_id,
                attempt = attempt + 1,
                "Fallback claim lost to a concurrent event, retrying"
            );
        }

        // The winner of a lost claim may have been this same conversation
        if let Some(session) = self.store.find_by_conversation_id(conversation_id).await? {
            record(CorrelationMethod::Exact.as_db_str());
            return Ok(Some(Correlation::new(session, CorrelationMethod::Exact)));
        }

        tracing::warn!(
            conversation_id = %conversation_id,
            agent_id = ?query.agent_id,
            "No call session matches transcript; left unattributed"
        );
        record("miss");
        Ok(None)
    }

    async fn resolve_hint(
        &self,
        call_id: CallId,
        conversation_id: &str,
    ) -> CallctxResult<Option<Correlation>> {
        let Some(mut session) = self.store.get_session(call_id).await? else {
            tracing::warn!(call_id = %call_id, "Call id hint names an unknown session");
            return Ok(None);
        };

        match session.external_conversation_id.as_deref() {
            Some(existing) if existing == conversation_id => {}
            Some(existing) => {
                tracing::warn!(
                    call_id = %call_id,
                    existing = %existing,
                    conversation_id = %conversation_id,
                    "Call id hint conflicts with stored conversation id; ignoring hint"
                );
                return Ok(None);
            }
            None => {
                if !self.store.claim_conversation_id(call_id, conversation_id).await? {
                    return Ok(None);
                }
                session.external_conversation_id = Some(conversation_id.to_string());
            }
        }

        record(CorrelationMethod::CallIdHint.as_db_str());
        Ok(Some(Correlation::new(session, CorrelationMethod::CallIdHint)))
    }
}

fn record(outcome: &str) {
    if let Some(m) = metrics() {
        m.record_correlation(outcome);
    }
}
