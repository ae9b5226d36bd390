//! Patient Record Merger
//!
//! Folds an extracted clinical delta into the patient's long-lived record.
//! The record store only exposes append operations, so a merge can add a
//! note block and new focus tags but never rewrite earlier notes.

use callctx_core::{CallId, CallctxResult, ClinicalDelta, NoteBlock, PatientId, Timestamp};
use callctx_storage::{CallctxStore, PatientRecordStore};
use serde::Serialize;
use std::sync::Arc;

/// What a merge actually changed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MergeOutcome {
    /// False when an identical delta was merged before or the delta was empty.
    pub note_appended: bool,
    pub focus_areas_added: Vec<String>,
}

#[derive(Clone)]
pub struct PatientRecordMerger {
    store: Arc<dyn CallctxStore>,
}

impl PatientRecordMerger {
    pub fn new(store: Arc<dyn CallctxStore>) -> Self {
        Self { store }
    }

    /// Append `delta` as a timestamped note block and union its suggested
    /// focus areas into the record.
    ///
    /// Idempotent: the block is keyed by the delta's fingerprint and focus
    /// tags are compared trimmed and case-insensitively.
    pub async fn merge(
        &self,
        patient_id: PatientId,
        delta: &ClinicalDelta,
        at: Timestamp,
        source_call_id: Option<CallId>,
    ) -> CallctxResult<MergeOutcome> {
        let delta = delta.clone().normalized();
        if delta.is_empty() {
            tracing::debug!(patient_id = %patient_id, "Empty clinical delta, nothing to merge");
            return Ok(MergeOutcome::default());
        }

        let block = NoteBlock::from_delta(&delta, at, source_call_id);
        let note_appended = self.store.append_note_block(patient_id, &block).await?;
        if !note_appended {
            tracing::debug!(
                patient_id = %patient_id,
                fingerprint = %block.fingerprint,
                "Note block already present, skipping"
            );
        }

        let focus_areas_added = self
            .store
            .add_focus_areas(patient_id, &delta.suggested_focus_areas)
            .await?;

        tracing::info!(
            patient_id = %patient_id,
            call_id = ?source_call_id,
            note_appended,
            focus_areas_added = focus_areas_added.len(),
            "Clinical delta merged"
        );

        Ok(MergeOutcome {
            note_appended,
            focus_areas_added,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callctx_core::PatientRecord;
    use callctx_storage::InMemoryStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn delta(summary: &str, focus: &[&str]) -> ClinicalDelta {
        ClinicalDelta {
            summary: summary.to_string(),
            suggested_focus_areas: focus.iter().map(|s| s.to_string()).collect(),
            ..ClinicalDelta::default()
        }
    }

    async fn store_with_record(focus: &[&str], notes: &[&str]) -> (InMemoryStore, PatientId) {
        let store = InMemoryStore::new();
        let patient_id = Uuid::now_v7();
        let mut record = PatientRecord::empty(patient_id);
        record.focus_areas = focus.iter().map(|s| s.to_string()).collect();
        record.clinical_notes = notes
            .iter()
            .map(|n| NoteBlock::manual(*n, Utc::now()))
            .collect();
        store.put_record(record).await;
        (store, patient_id)
    }

    #[tokio::test]
    async fn test_merge_appends_and_dedups_focus() {
        let (store, patient_id) =
            store_with_record(&["weight loss"], &["Clinician: started metformin"]).await;
        let merger = PatientRecordMerger::new(Arc::new(store.clone()));

        let outcome = merger
            .merge(
                patient_id,
                &delta("A1C is 9.7%", &["Weight Loss ", "carb counting"]),
                Utc::now(),
                None,
            )
            .await
            .unwrap();
        assert!(outcome.note_appended);
        assert_eq!(outcome.focus_areas_added, vec!["carb counting"]);

        let record = store.get_record(patient_id).await.unwrap().unwrap();
        assert_eq!(record.clinical_notes.len(), 2);
        assert_eq!(record.clinical_notes[0].body, "Clinician: started metformin");
        assert!(record.clinical_notes[1].body.contains("9.7"));
        assert_eq!(record.focus_areas, vec!["weight loss", "carb counting"]);
    }

    #[tokio::test]
    async fn test_identical_delta_merges_once() {
        let (store, patient_id) = store_with_record(&[], &[]).await;
        let merger = PatientRecordMerger::new(Arc::new(store.clone()));
        let d = delta("Walks daily now", &["exercise"]);
        let at = Utc::now();

        let first = merger.merge(patient_id, &d, at, None).await.unwrap();
        let second = merger.merge(patient_id, &d, at, None).await.unwrap();
        assert!(first.note_appended);
        assert!(!second.note_appended);
        assert!(second.focus_areas_added.is_empty());

        let record = store.get_record(patient_id).await.unwrap().unwrap();
        assert_eq!(record.clinical_notes.len(), 1);
        assert_eq!(record.focus_areas, vec!["exercise"]);
    }

    #[tokio::test]
    async fn test_empty_delta_is_noop() {
        let (store, patient_id) = store_with_record(&[], &["keep me"]).await;
        let merger = PatientRecordMerger::new(Arc::new(store.clone()));
        let outcome = merger
            .merge(patient_id, &delta("   ", &["  "]), Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::default());
        let record = store.get_record(patient_id).await.unwrap().unwrap();
        assert_eq!(record.clinical_notes.len(), 1);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use callctx_core::focus_key;
    use callctx_storage::InMemoryStore;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use uuid::Uuid;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Merging never drops earlier notes and never yields duplicate focus keys.
        #[test]
        fn prop_merge_is_append_only(
            summaries in prop::collection::vec("[a-z ]{1,20}", 1..4),
            tags in prop::collection::vec("[a-zA-Z ]{1,10}", 0..6),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let store = InMemoryStore::new();
                let patient_id = Uuid::now_v7();
                let merger = PatientRecordMerger::new(Arc::new(store.clone()));
                let mut previous_notes = 0usize;

                for summary in &summaries {
                    let delta = ClinicalDelta {
                        summary: summary.clone(),
                        suggested_focus_areas: tags.clone(),
                        ..ClinicalDelta::default()
                    };
                    merger.merge(patient_id, &delta, Utc::now(), None).await.unwrap();
                    if let Some(record) = store.get_record(patient_id).await.unwrap() {
                        prop_assert!(record.clinical_notes.len() >= previous_notes);
                        previous_notes = record.clinical_notes.len();
                        let keys: HashSet<String> =
                            record.focus_areas.iter().map(|t| focus_key(t)).collect();
                        prop_assert_eq!(keys.len(), record.focus_areas.len());
                    }
                }
                Ok(())
            })?;
        }
    }
}
