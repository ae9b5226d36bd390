//! Anthropic completion provider

use super::client::AnthropicClient;
use super::types::{ContentBlock, Message, MessageRequest, MessageResponse};
use crate::providers::invalid_response;
use crate::{Completion, CompletionPrompt, CompletionProvider};
use async_trait::async_trait;
use callctx_core::CallctxResult;

/// Messages-API provider for Claude models.
pub struct AnthropicCompletionProvider {
    client: AnthropicClient,
    model: String,
}

impl AnthropicCompletionProvider {
    pub fn new(client: AnthropicClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Provider with a default Haiku model at 50 requests per minute.
    pub fn with_default_model(api_key: impl Into<String>) -> Self {
        Self::new(AnthropicClient::new(api_key, 50), "claude-3-5-haiku-latest")
    }
}

#[async_trait]
impl CompletionProvider for AnthropicCompletionProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, prompt: &CompletionPrompt) -> CallctxResult<Completion> {
        let mut system = prompt.system.clone();
        if prompt.json_output {
            system.push_str("\nRespond with a single JSON object and nothing else.");
        }
        let request = MessageRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.user.clone(),
            }],
            max_tokens: prompt.max_tokens,
            system: Some(system),
            temperature: Some(prompt.temperature),
        };

        let response: MessageResponse = self.client.request("messages", request).await?;

        let text: String = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(invalid_response("anthropic", "No text content in response"));
        }

        let (input_tokens, output_tokens) = response
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((0, 0));

        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

impl std::fmt::Debug for AnthropicCompletionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicCompletionProvider")
            .field("model", &self.model)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_complete_joins_text_blocks_and_sends_headers() {
        let app = Router::new().route(
            "/messages",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["x-api-key"], "key");
                assert_eq!(headers["anthropic-version"], "2023-06-01");
                assert!(body["system"].as_str().unwrap_or_default().contains("JSON object"));
                Json(json!({
                    "content": [{"type": "text", "text": "{\"summary\":"}, {"type": "text", "text": "\"ok\"}"}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 20, "output_tokens": 5}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let provider = AnthropicCompletionProvider::new(
            AnthropicClient::new("key", 600).with_base_url(format!("http://{}", addr)),
            "claude-test",
        );
        let completion = provider
            .complete(&CompletionPrompt::new("system", "user").with_json_output())
            .await
            .unwrap();
        assert_eq!(completion.text, "{\"summary\":\"ok\"}");
        assert_eq!(completion.input_tokens, 20);
    }
}
