//! OpenAI completion provider

use super::client::OpenAIClient;
use super::types::{ChatRequest, ChatResponse, Message, ResponseFormat};
use crate::providers::invalid_response;
use crate::{Completion, CompletionPrompt, CompletionProvider};
use async_trait::async_trait;
use callctx_core::CallctxResult;

/// Chat-completions provider for GPT models.
pub struct OpenAICompletionProvider {
    client: OpenAIClient,
    model: String,
}

impl OpenAICompletionProvider {
    pub fn new(client: OpenAIClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Provider with the default gpt-4o-mini model at 60 requests per minute.
    pub fn with_default_model(api_key: impl Into<String>) -> Self {
        Self::new(OpenAIClient::new(api_key, 60), "gpt-4o-mini")
    }

    fn build_request(&self, prompt: &CompletionPrompt) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![Message::system(&prompt.system), Message::user(&prompt.user)],
            max_tokens: Some(prompt.max_tokens),
            temperature: Some(prompt.temperature),
            response_format: prompt.json_output.then(ResponseFormat::json_object),
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompletionProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, prompt: &CompletionPrompt) -> CallctxResult<Completion> {
        let response: ChatResponse = self
            .client
            .request("chat/completions", self.build_request(prompt))
            .await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| invalid_response("openai", "No completion in response"))?;

        let (input_tokens, output_tokens) = response
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

impl std::fmt::Debug for OpenAICompletionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAICompletionProvider")
            .field("model", &self.model)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use callctx_core::{CallctxError, LlmError};
    use serde_json::{json, Value};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    fn prompt() -> CompletionPrompt {
        CompletionPrompt::new("system", "user").with_json_output()
    }

    #[tokio::test]
    async fn test_complete_reads_first_choice_and_usage() {
        let app = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["response_format"]["type"], "json_object");
                assert_eq!(body["messages"][0]["role"], "system");
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "{\"summary\":\"ok\"}"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
                }))
            }),
        );
        let base = serve(app).await;
        let provider = OpenAICompletionProvider::new(
            OpenAIClient::new("key", 600).with_base_url(base),
            "gpt-4o-mini",
        );

        let completion = provider.complete(&prompt()).await.unwrap();
        assert_eq!(completion.text, "{\"summary\":\"ok\"}");
        assert_eq!(completion.input_tokens, 12);
        assert_eq!(completion.output_tokens, 4);
    }

    #[tokio::test]
    async fn test_too_many_requests_maps_to_rate_limited() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "2")],
                    Json(json!({"error": {"message": "slow down", "type": "rate_limit"}})),
                )
            }),
        );
        let base = serve(app).await;
        let provider = OpenAICompletionProvider::new(
            OpenAIClient::new("key", 600).with_base_url(base),
            "gpt-4o-mini",
        );

        let err = provider.complete(&prompt()).await.unwrap_err();
        assert!(matches!(
            err,
            CallctxError::Llm(LlmError::RateLimited { retry_after_ms: 2000, .. })
        ));
    }

    #[tokio::test]
    async fn test_error_body_message_is_surfaced() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": {"message": "context too long"}})),
                )
            }),
        );
        let base = serve(app).await;
        let provider = OpenAICompletionProvider::new(
            OpenAIClient::new("key", 600).with_base_url(base),
            "gpt-4o-mini",
        );

        let err = provider.complete(&prompt()).await.unwrap_err();
        assert!(matches!(
            err,
            CallctxError::Llm(LlmError::RequestFailed { status: 400, ref message, .. }) if message == "context too long"
        ));
    }
}
