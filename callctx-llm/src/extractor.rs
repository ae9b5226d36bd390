//! Clinical note extraction from call transcripts

use crate::{CompletionPrompt, CompletionProvider, UsageTracker};
use callctx_core::{CallctxError, CallctxResult, ClinicalDelta, LlmError};
use std::sync::Arc;
use std::time::Duration;

/// Fixed instruction format for the completion call.
pub const EXTRACTION_INSTRUCTIONS: &str = "\
You review transcripts of patient education phone calls and record what a clinician \
should know afterwards. Use only what the patient or agent actually said. Quote \
numeric values (lab results, weights, doses) exactly as spoken.

Return one JSON object with these fields:
  \"summary\": string, two or three sentences
  \"concerns\": array of strings, worries or symptoms the patient raised
  \"progress_updates\": array of strings, changes since earlier calls
  \"suggested_focus_areas\": array of short topic tags for future education
  \"action_items\": array of strings, follow-ups for the care team
Use empty arrays when nothing applies.";

/// Turns a transcript into a [`ClinicalDelta`] with one completion call.
///
/// No retries: a timeout, quota error or malformed reply fails the
/// extraction and the caller skips the note update.
pub struct ClinicalNoteExtractor {
    provider: Arc<dyn CompletionProvider>,
    timeout: Duration,
    max_tokens: i32,
    usage: UsageTracker,
}

impl ClinicalNoteExtractor {
    pub fn new(provider: Arc<dyn CompletionProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            max_tokens: 800,
            usage: UsageTracker::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    fn build_prompt(&self, transcript: &str, patient_context: &str) -> CompletionPrompt {
        let context = if patient_context.trim().is_empty() {
            "(no patient context available)"
        } else {
            patient_context
        };
        CompletionPrompt::new(
            EXTRACTION_INSTRUCTIONS,
            format!(
                "Patient context:\n{}\n\nTranscript:\n{}",
                context.trim(),
                transcript.trim()
            ),
        )
        .with_max_tokens(self.max_tokens)
        .with_temperature(0.1)
        .with_json_output()
    }

    /// Extract a delta from `transcript`.
    ///
    /// # Errors
    /// * `LlmError::ExtractionFailed` - blank transcript
    /// * `LlmError::Timeout` - the provider did not answer in time
    /// * `LlmError::InvalidResponse` - the reply is not a delta object
    pub async fn extract(
        &self,
        transcript: &str,
        patient_context: &str,
    ) -> CallctxResult<ClinicalDelta> {
        if transcript.trim().is_empty() {
            return Err(CallctxError::Llm(LlmError::ExtractionFailed {
                reason: "transcript is empty".to_string(),
            }));
        }

        let prompt = self.build_prompt(transcript, patient_context);
        let provider = self.provider.provider_name().to_string();

        let completion = match tokio::time::timeout(self.timeout, self.provider.complete(&prompt)).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(e)) => {
                self.usage.record_failure();
                return Err(e);
            }
            Err(_) => {
                self.usage.record_failure();
                return Err(CallctxError::Llm(LlmError::Timeout {
                    provider,
                    timeout_ms: self.timeout.as_millis() as u64,
                }));
            }
        };
        self.usage.record(&completion);

        let delta = parse_delta(&completion.text).map_err(|reason| {
            CallctxError::Llm(LlmError::InvalidResponse {
                provider: provider.clone(),
                reason,
            })
        })?;

        tracing::debug!(
            provider = %provider,
            concerns = delta.concerns.len(),
            focus_areas = delta.suggested_focus_areas.len(),
            "Clinical delta extracted"
        );
        Ok(delta)
    }
}

impl std::fmt::Debug for ClinicalNoteExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClinicalNoteExtractor")
            .field("provider", &self.provider.provider_name())
            .field("timeout", &self.timeout)
            .field("usage", &self.usage)
            .finish()
    }
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string (```json)
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_delta(raw: &str) -> Result<ClinicalDelta, String> {
    let text = strip_code_fences(raw);
    let object = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => return Err("no JSON object in completion".to_string()),
    };
    let delta: ClinicalDelta =
        serde_json::from_str(object).map_err(|e| format!("malformed delta: {}", e))?;
    Ok(delta.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockCompletionProvider;

    const A1C_REPLY: &str = r#"{
        "summary": "Patient reports A1C is 9.7%, up from last quarter.",
        "concerns": ["worried about ", "  "],
        "suggestedFocusAreas": ["Weight loss ", "carb counting"],
        "action_items": ["Schedule dietitian follow-up"]
    }"#;

    fn extractor(provider: MockCompletionProvider) -> (ClinicalNoteExtractor, Arc<MockCompletionProvider>) {
        let provider = Arc::new(provider);
        (
            ClinicalNoteExtractor::new(provider.clone(), Duration::from_secs(5)),
            provider,
        )
    }

    #[tokio::test]
    async fn test_extracts_lab_value_into_summary() {
        let (extractor, provider) = extractor(MockCompletionProvider::replying(A1C_REPLY));
        let delta = extractor
            .extract("Agent: how are things? Patient: my A1C is 9.7% now.", "Caller: Dana")
            .await
            .unwrap();

        assert!(delta.summary.contains("9.7"));
        assert_eq!(delta.concerns, vec!["worried about"]);
        assert_eq!(delta.suggested_focus_areas, vec!["Weight loss", "carb counting"]);

        let prompts = provider.prompts().await;
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].json_output);
        assert!(prompts[0].user.contains("A1C is 9.7%"));
        assert!(prompts[0].user.contains("Caller: Dana"));
        assert_eq!(extractor.usage().requests(), 1);
    }

    #[tokio::test]
    async fn test_fenced_reply_is_accepted() {
        let fenced = format!("```json\n{}\n```", A1C_REPLY);
        let (extractor, _) = extractor(MockCompletionProvider::replying(fenced));
        let delta = extractor.extract("transcript", "").await.unwrap();
        assert!(delta.summary.contains("9.7"));
    }

    #[tokio::test]
    async fn test_malformed_reply_is_invalid_response() {
        let (extractor, _) = extractor(MockCompletionProvider::replying("Sorry, I can't help."));
        let err = extractor.extract("transcript", "").await.unwrap_err();
        assert!(matches!(err, CallctxError::Llm(LlmError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let provider = Arc::new(
            MockCompletionProvider::replying(A1C_REPLY).with_delay(Duration::from_secs(5)),
        );
        let extractor = ClinicalNoteExtractor::new(provider, Duration::from_millis(20));
        let err = extractor.extract("transcript", "").await.unwrap_err();
        assert!(matches!(
            err,
            CallctxError::Llm(LlmError::Timeout { timeout_ms: 20, .. })
        ));
        assert_eq!(extractor.usage().failures(), 1);
    }

    #[tokio::test]
    async fn test_blank_transcript_skips_provider() {
        let (extractor, provider) = extractor(MockCompletionProvider::replying(A1C_REPLY));
        let err = extractor.extract("   \n", "ctx").await.unwrap_err();
        assert!(matches!(err, CallctxError::Llm(LlmError::ExtractionFailed { .. })));
        assert_eq!(provider.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let (extractor, _) = extractor(MockCompletionProvider::failing("quota"));
        let err = extractor.extract("transcript", "").await.unwrap_err();
        assert!(matches!(err, CallctxError::Llm(LlmError::RequestFailed { .. })));
    }

    #[test]
    fn test_strip_code_fences_variants() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```  "), "{}");
        assert_eq!(strip_code_fences("  {}  "), "{}");
    }
}
