//! CALLCTX LLM
//!
//! Provider-agnostic completion interface, rate-limited HTTP providers and
//! the clinical note extractor that turns a call transcript into a
//! structured delta.

use async_trait::async_trait;
use callctx_core::{CallctxError, CallctxResult, LlmError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

mod extractor;
pub mod providers;

pub use extractor::{strip_code_fences, ClinicalNoteExtractor, EXTRACTION_INSTRUCTIONS};
pub use providers::{
    AnthropicClient, AnthropicCompletionProvider, OpenAIClient, OpenAICompletionProvider,
};

// ============================================================================
// COMPLETION PROVIDER TRAIT
// ============================================================================

/// One-shot completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionPrompt {
    pub system: String,
    pub user: String,
    pub max_tokens: i32,
    pub temperature: f32,
    /// Ask the provider to constrain output to a JSON object.
    pub json_output: bool,
}

impl CompletionPrompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 1000,
            temperature: 0.2,
            json_output: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_json_output(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// Provider output plus token usage when the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Trait for completion providers.
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short name used in logs and error variants.
    fn provider_name(&self) -> &str;

    /// Run a single completion.
    ///
    /// # Returns
    /// * `Ok(Completion)` - The provider's text output
    /// * `Err(CallctxError::Llm)` - Transport failure, quota, or unusable output
    async fn complete(&self, prompt: &CompletionPrompt) -> CallctxResult<Completion>;
}

// ============================================================================
// USAGE TRACKER
// ============================================================================

/// Token and request counters across completions.
/// Thread-safe via atomic operations.
#[derive(Default)]
pub struct UsageTracker {
    requests: AtomicU64,
    failures: AtomicU64,
    input_tokens: AtomicI64,
    output_tokens: AtomicI64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, completion: &Completion) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(completion.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(completion.output_tokens, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn input_tokens(&self) -> i64 {
        self.input_tokens.load(Ordering::Relaxed)
    }

    pub fn output_tokens(&self) -> i64 {
        self.output_tokens.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for UsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTracker")
            .field("requests", &self.requests())
            .field("failures", &self.failures())
            .field("input_tokens", &self.input_tokens())
            .field("output_tokens", &self.output_tokens())
            .finish()
    }
}

// ============================================================================
// MOCK PROVIDER FOR TESTING
// ============================================================================

/// Scripted reply for [`MockCompletionProvider`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Text(String),
    Fail(String),
}

/// Mock completion provider.
///
/// Replies are taken from the script in order; once it is exhausted the
/// fallback reply repeats. Every prompt is recorded.
#[derive(Debug)]
pub struct MockCompletionProvider {
    script: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    delay: Option<Duration>,
    prompts: Mutex<Vec<CompletionPrompt>>,
}

impl MockCompletionProvider {
    /// Always answer with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: MockReply::Text(text.into()),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always fail with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fallback: MockReply::Fail(reason.into()),
            ..Self::replying("")
        }
    }

    pub fn with_script(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            ..self
        }
    }

    /// Sleep before answering, e.g. to trip a caller's timeout.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn prompts(&self) -> Vec<CompletionPrompt> {
        self.prompts.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.prompts.lock().await.len()
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    fn provider_name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, prompt: &CompletionPrompt) -> CallctxResult<Completion> {
        self.prompts.lock().await.push(prompt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            MockReply::Text(text) => Ok(Completion::text(text)),
            MockReply::Fail(reason) => Err(CallctxError::Llm(LlmError::RequestFailed {
                provider: "mock".to_string(),
                status: 503,
                message: reason,
            })),
        }
    }
}
