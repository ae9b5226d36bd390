//! Snippet assembly with token budget management.
//!
//! Builds the private, patient-scoped text document attached to the shared
//! agent for one call. Sections are added by priority until the budget runs
//! out; compressible sections are truncated at sentence or word boundaries.

use callctx_core::{
    CallctxResult, ConfigError, LabResult, Medication, PatientProfile, PatientRecord, Timestamp,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// SECTIONS AND WINDOW
// ============================================================================

/// Type of snippet section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionType {
    /// Who the caller is and how to use this document
    Header,
    Medications,
    Labs,
    FocusAreas,
    /// Most recent clinical note blocks
    ClinicalNotes,
}

impl SectionType {
    pub fn default_priority(&self) -> i32 {
        match self {
            SectionType::Header => 100,
            SectionType::Medications => 90,
            SectionType::Labs => 80,
            SectionType::FocusAreas => 70,
            SectionType::ClinicalNotes => 60,
        }
    }
}

/// One section of the assembled snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnippetSection {
    pub section_type: SectionType,
    pub content: String,
    pub token_count: i32,
    /// Higher = more important
    pub priority: i32,
    pub compressible: bool,
}

impl SnippetSection {
    pub fn new(section_type: SectionType, content: String) -> Self {
        let token_count = estimate_tokens(&content);
        Self {
            section_type,
            content,
            token_count,
            priority: section_type.default_priority(),
            compressible: true,
        }
    }

    pub fn with_compressible(mut self, compressible: bool) -> Self {
        self.compressible = compressible;
        self
    }
}

/// Action taken during assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssemblyAction {
    Include,
    Exclude,
    Truncate,
}

/// Audit entry for one assembly decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyDecision {
    pub timestamp: Timestamp,
    pub action: AssemblyAction,
    pub section_type: SectionType,
    pub reason: String,
    pub tokens_affected: i32,
}

/// Assembled snippet text under a token budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnippetWindow {
    pub max_tokens: i32,
    pub used_tokens: i32,
    pub sections: Vec<SnippetSection>,
    pub truncated: bool,
    pub assembly_trace: Vec<AssemblyDecision>,
}

impl SnippetWindow {
    pub fn new(max_tokens: i32) -> Self {
        Self {
            max_tokens,
            used_tokens: 0,
            sections: Vec::new(),
            truncated: false,
            assembly_trace: Vec::new(),
        }
    }

    pub fn remaining_tokens(&self) -> i32 {
        self.max_tokens - self.used_tokens
    }

    /// Add a section if it fits. Returns whether it was added.
    pub fn add_section(&mut self, section: SnippetSection) -> bool {
        if section.token_count <= self.remaining_tokens() {
            self.used_tokens += section.token_count;
            self.record(
                AssemblyAction::Include,
                section.section_type,
                "Fits within budget".to_string(),
                section.token_count,
            );
            self.sections.push(section);
            true
        } else {
            let reason = format!(
                "Exceeds budget: needs {} tokens, only {} available",
                section.token_count,
                self.remaining_tokens()
            );
            self.record(AssemblyAction::Exclude, section.section_type, reason, 0);
            false
        }
    }

    /// Add a section cut down to the remaining budget.
    pub fn add_truncated_section(&mut self, mut section: SnippetSection) {
        let available = self.remaining_tokens();
        if available <= 0 {
            self.record(
                AssemblyAction::Exclude,
                section.section_type,
                "No budget remaining".to_string(),
                0,
            );
            return;
        }

        let original_tokens = section.token_count;
        section.content = truncate_to_token_budget(&section.content, available);
        section.token_count = estimate_tokens(&section.content);
        if section.content.trim().is_empty() {
            self.record(
                AssemblyAction::Exclude,
                section.section_type,
                "Nothing left after truncation".to_string(),
                0,
            );
            return;
        }

        self.used_tokens += section.token_count;
        self.truncated = true;
        let reason = format!(
            "Truncated from {} to {} tokens",
            original_tokens, section.token_count
        );
        self.record(
            AssemblyAction::Truncate,
            section.section_type,
            reason,
            section.token_count,
        );
        self.sections.push(section);
    }

    pub fn includes(&self, section_type: SectionType) -> bool {
        self.sections.iter().any(|s| s.section_type == section_type)
    }

    pub fn as_text(&self) -> String {
        self.sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn record(
        &mut self,
        action: AssemblyAction,
        section_type: SectionType,
        reason: String,
        tokens_affected: i32,
    ) {
        self.assembly_trace.push(AssemblyDecision {
            timestamp: Utc::now(),
            action,
            section_type,
            reason,
            tokens_affected,
        });
    }
}

impl std::fmt::Display for SnippetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

// ============================================================================
// TOKEN UTILITIES
// ============================================================================

/// Rough token estimate: ~0.75 tokens per byte of English text.
pub fn estimate_tokens(text: &str) -> i32 {
    if text.is_empty() {
        return 0;
    }
    (text.len() as f32 * 0.75).ceil() as i32
}

/// Truncate text to fit within a token budget.
/// Prefers sentence boundaries, falls back to word boundaries.
pub fn truncate_to_token_budget(text: &str, budget: i32) -> String {
    if budget <= 0 {
        return String::new();
    }

    let max_chars = (budget as f32 / 0.75).floor() as usize;
    if text.len() <= max_chars {
        return text.to_string();
    }

    let truncated = safe_truncate(text, max_chars);

    let last_sentence = [truncated.rfind('.'), truncated.rfind('?'), truncated.rfind('!'), truncated.rfind('\n')]
        .into_iter()
        .flatten()
        .max();

    if let Some(pos) = last_sentence {
        if pos > max_chars / 2 {
            return truncated[..=pos].trim_end().to_string();
        }
    }

    if let Some(pos) = truncated.rfind(' ') {
        if pos > max_chars * 4 / 5 {
            return truncated[..pos].to_string();
        }
    }

    truncated.to_string()
}

/// Truncate at a UTF-8 boundary.
fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ============================================================================
// ASSEMBLER
// ============================================================================

/// Builds the per-call snippet from a patient's profile and clinical record.
#[derive(Debug, Clone)]
pub struct SnippetAssembler {
    token_budget: i32,
    recent_notes: usize,
}

impl SnippetAssembler {
    pub fn new(token_budget: i32, recent_notes: usize) -> CallctxResult<Self> {
        if token_budget <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "snippet_token_budget".to_string(),
                value: token_budget.to_string(),
                reason: "snippet_token_budget must be greater than 0".to_string(),
            }
            .into());
        }
        Ok(Self {
            token_budget,
            recent_notes,
        })
    }

    pub fn token_budget(&self) -> i32 {
        self.token_budget
    }

    /// Assemble the snippet. The header is never truncated.
    pub fn assemble(&self, profile: &PatientProfile, record: Option<&PatientRecord>) -> SnippetWindow {
        let mut window = SnippetWindow::new(self.token_budget);
        let mut sections = self.build_sections(profile, record);
        sections.sort_by(|a, b| b.priority.cmp(&a.priority));

        for section in sections {
            if window.remaining_tokens() <= 0 {
                window.record(
                    AssemblyAction::Exclude,
                    section.section_type,
                    "Budget exhausted".to_string(),
                    0,
                );
                continue;
            }

            if section.token_count <= window.remaining_tokens() {
                window.add_section(section);
            } else if section.compressible {
                window.add_truncated_section(section);
            } else {
                let reason = format!(
                    "Exceeds budget ({} tokens) and not compressible",
                    section.token_count
                );
                window.record(AssemblyAction::Exclude, section.section_type, reason, 0);
            }
        }

        window
    }

    fn build_sections(&self, profile: &PatientProfile, record: Option<&PatientRecord>) -> Vec<SnippetSection> {
        let mut sections = vec![SnippetSection::new(SectionType::Header, format_header(profile))
            .with_compressible(false)];

        if !profile.medications.is_empty() {
            sections.push(SnippetSection::new(
                SectionType::Medications,
                format_medications(&profile.medications),
            ));
        }

        if !profile.lab_results.is_empty() {
            sections.push(SnippetSection::new(
                SectionType::Labs,
                format_labs(&profile.lab_results),
            ));
        }

        if let Some(record) = record {
            if !record.focus_areas.is_empty() {
                sections.push(SnippetSection::new(
                    SectionType::FocusAreas,
                    format!("Education focus areas: {}.", record.focus_areas.join(", ")),
                ));
            }

            let notes = format_recent_notes(record, self.recent_notes);
            if !notes.is_empty() {
                sections.push(SnippetSection::new(SectionType::ClinicalNotes, notes));
            }
        }

        sections
    }
}

fn format_header(profile: &PatientProfile) -> String {
    let mut out = format!(
        "Private context for the current call only. Caller: {}.",
        profile.display_name
    );
    if let Some(lang) = &profile.preferred_language {
        out.push_str(&format!(" Preferred language: {}.", lang));
    }
    out
}

fn format_medications(medications: &[Medication]) -> String {
    let mut out = String::from("Current medications:");
    for med in medications {
        out.push_str("\n- ");
        out.push_str(&med.name);
        if let Some(dose) = &med.dose {
            out.push(' ');
            out.push_str(dose);
        }
        if let Some(freq) = &med.frequency {
            out.push_str(", ");
            out.push_str(freq);
        }
    }
    out
}

fn format_labs(labs: &[LabResult]) -> String {
    let mut out = String::from("Recent lab values:");
    for lab in labs {
        out.push_str(&format!("\n- {}: {}", lab.name, lab.value));
        if let Some(unit) = &lab.unit {
            out.push_str(unit);
        }
        if let Some(at) = lab.observed_at {
            out.push_str(&format!(" ({})", at.format("%Y-%m-%d")));
        }
    }
    out
}

fn format_recent_notes(record: &PatientRecord, limit: usize) -> String {
    if limit == 0 || record.clinical_notes.is_empty() {
        return String::new();
    }
    let recent: Vec<&str> = record
        .clinical_notes
        .iter()
        .rev()
        .take(limit)
        .map(|b| b.body.as_str())
        .collect();
    format!("Recent clinical notes (newest first):\n{}", recent.join("\n\n"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use callctx_core::NoteBlock;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn profile() -> PatientProfile {
        PatientProfile {
            patient_id: Uuid::now_v7(),
            display_name: "Maria Lopez".to_string(),
            phone: "5550102000".to_string(),
            preferred_language: Some("es".to_string()),
            medications: vec![Medication {
                name: "Metformin".to_string(),
                dose: Some("500 mg".to_string()),
                frequency: Some("twice daily".to_string()),
            }],
            lab_results: vec![LabResult {
                name: "A1C".to_string(),
                value: "9.7".to_string(),
                unit: Some("%".to_string()),
                observed_at: None,
            }],
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 3);
    }

    #[test]
    fn test_truncate_prefers_sentence_boundary() {
        let text = "First sentence here. Second sentence is much longer and keeps going on.";
        let out = truncate_to_token_budget(text, 20);
        assert_eq!(out, "First sentence here.");
    }

    #[test]
    fn test_truncate_zero_budget() {
        assert_eq!(truncate_to_token_budget("anything", 0), "");
    }

    #[test]
    fn test_truncate_respects_utf8() {
        let text = "ñ".repeat(100);
        let out = truncate_to_token_budget(&text, 10);
        assert!(out.len() <= 13);
        assert!(out.chars().all(|c| c == 'ñ'));
    }

    #[test]
    fn test_assemble_full_profile() {
        let assembler = SnippetAssembler::new(2000, 3).unwrap();
        let p = profile();
        let mut record = PatientRecord::empty(p.patient_id);
        record.focus_areas = vec!["weight loss".to_string()];
        record
            .clinical_notes
            .push(NoteBlock::manual("Discussed diet changes.", Utc::now()));

        let window = assembler.assemble(&p, Some(&record));
        let text = window.as_text();
        assert!(text.contains("Maria Lopez"));
        assert!(text.contains("Metformin 500 mg, twice daily"));
        assert!(text.contains("A1C: 9.7%"));
        assert!(text.contains("weight loss"));
        assert!(text.contains("Discussed diet changes."));
        assert!(!window.truncated);
        assert!(window.used_tokens <= 2000);
    }

    #[test]
    fn test_recent_notes_newest_first_and_limited() {
        let assembler = SnippetAssembler::new(4000, 2).unwrap();
        let p = profile();
        let mut record = PatientRecord::empty(p.patient_id);
        let now = Utc::now();
        for (i, body) in ["oldest", "middle", "newest"].iter().enumerate() {
            record
                .clinical_notes
                .push(NoteBlock::manual(*body, now + ChronoDuration::seconds(i as i64)));
        }
        let text = assembler.assemble(&p, Some(&record)).as_text();
        assert!(!text.contains("oldest"));
        let newest = text.find("newest").unwrap();
        let middle = text.find("middle").unwrap();
        assert!(newest < middle);
    }

    #[test]
    fn test_small_budget_keeps_header_and_truncates_notes() {
        let p = profile();
        let header_tokens = estimate_tokens(&format_header(&p));
        let assembler = SnippetAssembler::new(header_tokens + 120, 5).unwrap();
        let mut record = PatientRecord::empty(p.patient_id);
        record
            .clinical_notes
            .push(NoteBlock::manual("Long note. ".repeat(200), Utc::now()));

        let window = assembler.assemble(&p, Some(&record));
        assert!(window.includes(SectionType::Header));
        assert!(window.used_tokens <= window.max_tokens);
        assert!(window
            .assembly_trace
            .iter()
            .any(|d| d.section_type == SectionType::ClinicalNotes && d.action != AssemblyAction::Include));
    }

    #[test]
    fn test_assembler_rejects_zero_budget() {
        assert!(SnippetAssembler::new(0, 3).is_err());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use callctx_core::NoteBlock;
    use proptest::prelude::*;
    use uuid::Uuid;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_truncation_fits_budget(text in ".{0,500}", budget in 1i32..400) {
            let out = truncate_to_token_budget(&text, budget);
            prop_assert!(estimate_tokens(&out) <= budget);
            prop_assert!(text.starts_with(out.trim_end()));
        }

        #[test]
        fn prop_assembly_respects_token_budget(
            budget in 1i32..3000,
            notes in prop::collection::vec("[a-zA-Z .]{0,200}", 0..6),
            focus in prop::collection::vec("[a-z ]{1,20}", 0..4),
        ) {
            let assembler = SnippetAssembler::new(budget, 3).unwrap();
            let profile = PatientProfile {
                patient_id: Uuid::now_v7(),
                display_name: "Test".to_string(),
                phone: "5550102000".to_string(),
                preferred_language: None,
                medications: vec![],
                lab_results: vec![],
            };
            let mut record = PatientRecord::empty(profile.patient_id);
            record.focus_areas = focus;
            for note in notes {
                record.clinical_notes.push(NoteBlock::manual(note, Utc::now()));
            }
            let window = assembler.assemble(&profile, Some(&record));
            prop_assert!(window.used_tokens <= budget);
        }
    }
}
