//! callctx Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - a failure-injecting context store
//! - fixtures for the standard patient and call scenarios
//! - proptest generators
//! - custom assertions

pub use callctx_context::InMemoryContextStore;
pub use callctx_llm::{MockCompletionProvider, MockReply};
pub use callctx_storage::InMemoryStore;

pub use callctx_core::{
    AgentId, CallId, CallSession, CallState, CallctxError, CallctxResult, ClinicalDelta,
    ContextRelease, ContextStoreError, EntityType, KnowledgeSnippet, LabResult, Medication,
    NoteBlock, PatientId, PatientProfile, PatientRecord, SnippetHandle, StorageError, Timestamp,
};

use async_trait::async_trait;
use callctx_context::ContextStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// FAILURE INJECTION
// ============================================================================

/// Context store operation, for targeting injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextOp {
    Create,
    Attach,
    Detach,
    Destroy,
    List,
}

impl ContextOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextOp::Create => "create",
            ContextOp::Attach => "attach",
            ContextOp::Detach => "detach",
            ContextOp::Destroy => "destroy",
            ContextOp::List => "list",
        }
    }
}

/// Wraps [`InMemoryContextStore`] with per-operation failures and delays.
///
/// Every call is counted, including ones that fail, so tests can assert how
/// often an operation was attempted rather than how often it took effect.
#[derive(Debug)]
pub struct FlakyContextStore {
    inner: Arc<InMemoryContextStore>,
    /// Remaining injected failures per operation; `u32::MAX` means forever.
    failures: DashMap<ContextOp, u32>,
    delays: DashMap<ContextOp, Duration>,
    calls: DashMap<ContextOp, u64>,
}

impl Default for FlakyContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlakyContextStore {
    pub fn new() -> Self {
        Self::wrap(Arc::new(InMemoryContextStore::new()))
    }

    pub fn wrap(inner: Arc<InMemoryContextStore>) -> Self {
        Self {
            inner,
            failures: DashMap::new(),
            delays: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryContextStore> {
        &self.inner
    }

    /// Fail the next `times` calls to `op`.
    pub fn fail_next(&self, op: ContextOp, times: u32) {
        self.failures.insert(op, times);
    }

    pub fn fail_always(&self, op: ContextOp) {
        self.failures.insert(op, u32::MAX);
    }

    /// Stop failing and delaying `op`.
    pub fn heal(&self, op: ContextOp) {
        self.failures.remove(&op);
        self.delays.remove(&op);
    }

    pub fn delay(&self, op: ContextOp, delay: Duration) {
        self.delays.insert(op, delay);
    }

    /// Attempts made for `op`, successful or not.
    pub fn calls(&self, op: ContextOp) -> u64 {
        self.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    async fn enter(&self, op: ContextOp) -> CallctxResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;

        let delay = self.delays.get(&op).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail = match self.failures.get_mut(&op) {
            Some(mut remaining) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        };
        if fail {
            return Err(CallctxError::ContextStore(ContextStoreError::RequestFailed {
                operation: op.as_str().to_string(),
                status: 503,
                message: "injected failure".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl ContextStore for FlakyContextStore {
    async fn create(&self, owner: CallId, summary_text: &str) -> CallctxResult<SnippetHandle> {
        self.enter(ContextOp::Create).await?;
        self.inner.create(owner, summary_text).await
    }

    async fn attach(&self, handle: &str, agent_id: &str) -> CallctxResult<()> {
        self.enter(ContextOp::Attach).await?;
        self.inner.attach(handle, agent_id).await
    }

    async fn detach(&self, handle: &str, agent_id: &str) -> CallctxResult<()> {
        self.enter(ContextOp::Detach).await?;
        self.inner.detach(handle, agent_id).await
    }

    async fn destroy(&self, handle: &str) -> CallctxResult<()> {
        self.enter(ContextOp::Destroy).await?;
        self.inner.destroy(handle).await
    }

    async fn list(&self) -> CallctxResult<Vec<KnowledgeSnippet>> {
        self.enter(ContextOp::List).await?;
        self.inner.list().await
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for callctx types.

    use super::*;
    use proptest::prelude::*;

    /// A 10-digit North American number (area and exchange start 2-9).
    pub fn arb_nanp_digits() -> impl Strategy<Value = String> {
        ("[2-9][0-9]{2}", "[2-9][0-9]{2}", "[0-9]{4}").prop_map(|(a, e, l)| format!("{a}{e}{l}"))
    }

    /// `digits` written in one of the ways callers and carriers format it.
    pub fn arb_formatting(digits: String) -> impl Strategy<Value = String> {
        let (a, e, l) = (
            digits[0..3].to_string(),
            digits[3..6].to_string(),
            digits[6..10].to_string(),
        );
        prop_oneof![
            Just(digits.clone()),
            Just(format!("+1{digits}")),
            Just(format!("1{digits}")),
            Just(format!("({a}) {e}-{l}")),
            Just(format!("{a}-{e}-{l}")),
            Just(format!("{a}.{e}.{l}")),
            Just(format!("+1 ({a}) {e}-{l}")),
            Just(format!("+1-{a}-{e}-{l}")),
            Just(format!("  {a} {e} {l} ")),
            Just(format!("tel:+1{digits}")),
        ]
    }

    /// A NANP number paired with one formatted rendering of it.
    pub fn arb_formatted_phone() -> impl Strategy<Value = (String, String)> {
        arb_nanp_digits().prop_flat_map(|digits| {
            let d = digits.clone();
            arb_formatting(digits).prop_map(move |formatted| (d.clone(), formatted))
        })
    }

    /// Focus tag with random casing and padding.
    pub fn arb_focus_tag() -> impl Strategy<Value = String> {
        (
            prop::sample::select(vec!["weight loss", "carb counting", "exercise", "sleep", "foot care"]),
            any::<bool>(),
            "[ ]{0,2}",
        )
            .prop_map(|(tag, upper, pad)| {
                let tag = if upper { tag.to_uppercase() } else { tag.to_string() };
                format!("{pad}{tag}{pad}")
            })
    }

    pub fn arb_clinical_delta() -> impl Strategy<Value = ClinicalDelta> {
        (
            "[A-Za-z0-9 .%]{0,60}",
            prop::collection::vec("[a-z ]{1,20}", 0..3),
            prop::collection::vec("[a-z ]{1,20}", 0..3),
            prop::collection::vec(arb_focus_tag(), 0..4),
            prop::collection::vec("[a-z ]{1,20}", 0..3),
        )
            .prop_map(
                |(summary, concerns, progress_updates, suggested_focus_areas, action_items)| {
                    ClinicalDelta {
                        summary,
                        concerns,
                        progress_updates,
                        suggested_focus_areas,
                        action_items,
                    }
                },
            )
    }

    pub fn arb_call_state() -> impl Strategy<Value = CallState> {
        prop_oneof![
            Just(CallState::Ringing),
            Just(CallState::Identified),
            Just(CallState::ContextAttached),
            Just(CallState::InProgress),
            Just(CallState::AwaitingTranscript),
            Just(CallState::Completed),
            Just(CallState::Failed),
        ]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for the standard patient-education call.

    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    /// Stored phone of the standard patient, in canonical digits.
    pub const PATIENT_PHONE: &str = "5550102000";

    /// How the carrier reports the same caller.
    pub const CALLER_NUMBER: &str = "+1-555-010-2000";

    pub const A1C_TRANSCRIPT: &str = "Agent: Hi, this is your diabetes education line. How have \
        things been since last time?\nPatient: Okay. I got my lab results back and my A1C is 9.7%.\n\
        Agent: Thanks for sharing that. Have you been able to keep up with the walking plan?\n\
        Patient: Mostly, and I still want to work on weight loss.";

    /// Completion reply the extractor turns into the A1C delta.
    pub const A1C_DELTA_JSON: &str = r#"{
        "summary": "Patient reports A1C is 9.7%, higher than the last reading.",
        "concerns": ["Rising A1C"],
        "progressUpdates": ["Walking most days"],
        "suggestedFocusAreas": ["Weight Loss", "carb counting"],
        "actionItems": ["Review meal plan at next visit"]
    }"#;

    pub fn patient_profile() -> PatientProfile {
        PatientProfile {
            patient_id: Uuid::now_v7(),
            display_name: "Dana Reyes".to_string(),
            phone: PATIENT_PHONE.to_string(),
            preferred_language: Some("en".to_string()),
            medications: vec![Medication {
                name: "Metformin".to_string(),
                dose: Some("500 mg".to_string()),
                frequency: Some("twice daily".to_string()),
            }],
            lab_results: vec![LabResult {
                name: "A1C".to_string(),
                value: "8.9".to_string(),
                unit: Some("%".to_string()),
                observed_at: Some(Utc::now() - ChronoDuration::days(90)),
            }],
        }
    }

    /// Existing record: one clinician note and the "weight loss" focus tag.
    pub fn patient_record(patient_id: PatientId) -> PatientRecord {
        let mut record = PatientRecord::empty(patient_id);
        record.clinical_notes = vec![NoteBlock::manual(
            "Clinician: started metformin, discussed diet basics.",
            Utc::now() - ChronoDuration::days(30),
        )];
        record.focus_areas = vec!["weight loss".to_string()];
        record
    }

    pub fn a1c_delta() -> ClinicalDelta {
        serde_json::from_str::<ClinicalDelta>(A1C_DELTA_JSON)
            .map(ClinicalDelta::normalized)
            .unwrap_or_default()
    }

    /// In-memory store seeded with the standard patient and record.
    pub async fn seeded_store() -> (InMemoryStore, PatientProfile) {
        let store = InMemoryStore::new();
        let patient = patient_profile();
        store.add_patient(patient.clone()).await;
        store.put_record(patient_record(patient.patient_id)).await;
        (store, patient)
    }

    /// A session already identified and answered.
    pub fn session_in_progress(agent: &str) -> CallSession {
        let mut session = CallSession::new(PATIENT_PHONE, agent);
        session.state = CallState::InProgress;
        session
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for callctx invariants.

    use super::*;

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CallctxResult<T>, entity_type: EntityType) {
        match result {
            Err(CallctxError::Storage(StorageError::NotFound { entity_type: et, .. })) => {
                assert_eq!(*et, entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", entity_type, other),
        }
    }

    /// Terminal sessions must have released their snippet.
    #[track_caller]
    pub fn assert_released(session: &CallSession) {
        assert!(session.is_terminal(), "Expected terminal session, got {}", session.state);
        assert!(
            matches!(session.release, ContextRelease::Released | ContextRelease::None),
            "Terminal session {} still holds its snippet ({})",
            session.call_id,
            session.release
        );
    }

    /// No two focus tags may share a trimmed, case-folded key.
    #[track_caller]
    pub fn assert_unique_focus(record: &PatientRecord) {
        let mut keys: Vec<String> = record
            .focus_areas
            .iter()
            .map(|t| callctx_core::focus_key(t))
            .collect();
        keys.sort();
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len(), "Duplicate focus areas: {:?}", record.focus_areas);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callctx_core::{normalize_digits, PhoneNumber};
    use proptest::prelude::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_flaky_store_fails_then_recovers() {
        let store = FlakyContextStore::new();
        store.fail_next(ContextOp::Create, 1);

        assert!(store.create(Uuid::now_v7(), "a").await.is_err());
        let handle = store.create(Uuid::now_v7(), "b").await.unwrap();
        assert!(store.inner().contains(&handle).await);
        assert_eq!(store.calls(ContextOp::Create), 2);
    }

    #[tokio::test]
    async fn test_flaky_store_heal() {
        let store = FlakyContextStore::new();
        let handle = store.create(Uuid::now_v7(), "a").await.unwrap();
        store.fail_always(ContextOp::Destroy);
        assert!(store.destroy(&handle).await.is_err());
        assert!(store.destroy(&handle).await.is_err());
        store.heal(ContextOp::Destroy);
        store.destroy(&handle).await.unwrap();
        assert!(!store.inner().contains(&handle).await);
        assert_eq!(store.calls(ContextOp::Destroy), 3);
    }

    #[test]
    fn test_a1c_delta_fixture_parses() {
        let delta = fixtures::a1c_delta();
        assert!(delta.summary.contains("9.7"));
        assert_eq!(delta.suggested_focus_areas, vec!["Weight Loss", "carb counting"]);
    }

    #[test]
    fn test_caller_number_matches_fixture_phone() {
        assert_eq!(
            normalize_digits(fixtures::CALLER_NUMBER).as_deref(),
            Some(fixtures::PATIENT_PHONE)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_generated_formatting_normalizes((digits, formatted) in generators::arb_formatted_phone()) {
            let parsed = PhoneNumber::parse(&formatted).unwrap();
            prop_assert_eq!(parsed.digits(), digits.as_str());
        }
    }
}
