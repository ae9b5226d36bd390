//! Voice-agent knowledge base client

use super::types::*;
use crate::store::ContextStore;
use async_trait::async_trait;
use callctx_core::{
    id_timestamp, owner_from_snippet_name, snippet_name, AgentId, CallId, CallctxError,
    CallctxResult, ConfigError, ContextStoreError, KnowledgeSnippet, SnippetHandle,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
const LIST_PAGE_SIZE: usize = 100;

/// Connection settings for the voice-AI provider.
#[derive(Clone)]
pub struct VoiceProviderConfig {
    pub api_key: String,
    pub base_url: String,
    /// Per-request transport timeout.
    pub request_timeout: Duration,
    /// Upper bound on pages fetched by `list`.
    pub max_list_pages: usize,
}

impl VoiceProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            max_list_pages: 50,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Load from `CALLCTX_VOICE_API_KEY` and `CALLCTX_VOICE_BASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("CALLCTX_VOICE_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "CALLCTX_VOICE_API_KEY".to_string(),
            })?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("CALLCTX_VOICE_BASE_URL") {
            config = config.with_base_url(base_url);
        }
        if let Some(secs) = std::env::var("CALLCTX_VOICE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        Ok(config)
    }
}

impl std::fmt::Debug for VoiceProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Knowledge base client implementing [`ContextStore`].
///
/// Attaching and detaching rewrite an agent's whole knowledge list, so both
/// hold a per-agent lock for the read-modify-write. Different agents proceed
/// in parallel.
pub struct HttpContextStore {
    client: Client,
    config: VoiceProviderConfig,
    agent_locks: DashMap<AgentId, Arc<Mutex<()>>>,
}

impl HttpContextStore {
    pub fn new(config: VoiceProviderConfig) -> CallctxResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                CallctxError::Config(ConfigError::InvalidValue {
                    field: "voice_provider".to_string(),
                    value: config.base_url.clone(),
                    reason: format!("failed to build HTTP client: {}", e),
                })
            })?;
        Ok(Self {
            client,
            config,
            agent_locks: DashMap::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/convai/{}", self.config.base_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("xi-api-key", &self.config.api_key)
    }

    fn agent_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.agent_locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn send(&self, operation: &str, req: RequestBuilder) -> CallctxResult<reqwest::Response> {
        let response = self
            .authed(req)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        Err(status_error(operation, status, body))
    }

    async fn send_json<Res: DeserializeOwned>(
        &self,
        operation: &str,
        req: RequestBuilder,
    ) -> CallctxResult<Res> {
        self.send(operation, req).await?.json().await.map_err(|e| {
            CallctxError::ContextStore(ContextStoreError::InvalidResponse {
                operation: operation.to_string(),
                reason: format!("Failed to parse response: {}", e),
            })
        })
    }

    async fn get_agent(&self, agent_id: &str) -> CallctxResult<AgentConfig> {
        let req = self.client.get(self.url(&format!("agents/{}", agent_id)));
        self.send_json("get_agent", req).await
    }

    async fn put_knowledge(&self, agent_id: &str, knowledge: Vec<KnowledgeRef>) -> CallctxResult<()> {
        let req = self
            .client
            .patch(self.url(&format!("agents/{}", agent_id)))
            .json(&AgentConfig::knowledge_patch(knowledge));
        self.send("patch_agent", req).await.map(|_| ())
    }

    async fn list_page(&self, cursor: Option<&str>) -> CallctxResult<ListDocumentsResponse> {
        let mut req = self
            .client
            .get(self.url("knowledge-base"))
            .query(&[("page_size", LIST_PAGE_SIZE.to_string())]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        self.send_json("list", req).await
    }
}

fn transport_error(operation: &str, e: reqwest::Error) -> CallctxError {
    if e.is_timeout() {
        return CallctxError::ContextStore(ContextStoreError::Timeout {
            operation: operation.to_string(),
            timeout_ms: 0,
        });
    }
    CallctxError::ContextStore(ContextStoreError::Transport {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

fn status_error(operation: &str, status: StatusCode, body: String) -> CallctxError {
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| match b.detail {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .unwrap_or(body);
    CallctxError::ContextStore(ContextStoreError::RequestFailed {
        operation: operation.to_string(),
        status: status.as_u16(),
        message,
    })
}

fn is_not_found(err: &CallctxError) -> bool {
    matches!(
        err,
        CallctxError::ContextStore(ContextStoreError::RequestFailed { status: 404, .. })
    )
}

fn snippet_from_summary(doc: DocumentSummary) -> KnowledgeSnippet {
    let owner = owner_from_snippet_name(&doc.name);
    let created_at = doc
        .metadata
        .created_at_unix_secs
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .or_else(|| owner.and_then(id_timestamp))
        .unwrap_or_else(Utc::now);
    let mut snippet = KnowledgeSnippet::new(doc.id, doc.name, created_at);
    snippet.attached_agent_ids = doc
        .dependent_agents
        .into_iter()
        .filter_map(|a| a.id)
        .collect();
    snippet
}

#[async_trait]
impl ContextStore for HttpContextStore {
    async fn create(&self, owner: CallId, summary_text: &str) -> CallctxResult<SnippetHandle> {
        let req = self
            .client
            .post(self.url("knowledge-base/text"))
            .json(&CreateTextDocumentRequest {
                name: snippet_name(owner),
                text: summary_text.to_string(),
            });
        let created: CreateDocumentResponse = self.send_json("create", req).await?;
        tracing::debug!(call_id = %owner, handle = %created.id, "Knowledge snippet created");
        Ok(created.id)
    }

    async fn attach(&self, handle: &str, agent_id: &str) -> CallctxResult<()> {
        let lock = self.agent_lock(agent_id);
        let _guard = lock.lock().await;

        let agent = self.get_agent(agent_id).await?;
        if agent.knowledge().iter().any(|k| k.id == handle) {
            return Ok(());
        }
        let mut knowledge = agent.knowledge().to_vec();
        knowledge.push(KnowledgeRef::text(handle, handle));
        self.put_knowledge(agent_id, knowledge).await?;
        tracing::debug!(handle = %handle, agent_id = %agent_id, "Knowledge snippet attached");
        Ok(())
    }

    async fn detach(&self, handle: &str, agent_id: &str) -> CallctxResult<()> {
        let lock = self.agent_lock(agent_id);
        let _guard = lock.lock().await;

        let agent = self.get_agent(agent_id).await?;
        let before = agent.knowledge().len();
        let knowledge: Vec<KnowledgeRef> = agent
            .knowledge()
            .iter()
            .filter(|k| k.id != handle)
            .cloned()
            .collect();
        if knowledge.len() == before {
            return Ok(());
        }
        self.put_knowledge(agent_id, knowledge).await?;
        tracing::debug!(handle = %handle, agent_id = %agent_id, "Knowledge snippet detached");
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> CallctxResult<()> {
        let req = self.client.delete(self.url(&format!("knowledge-base/{}", handle)));
        match self.send("destroy", req).await {
            Ok(_) => {
                tracing::debug!(handle = %handle, "Knowledge snippet destroyed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                tracing::debug!(handle = %handle, "Knowledge snippet already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> CallctxResult<Vec<KnowledgeSnippet>> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..self.config.max_list_pages {
            let page = self.list_page(cursor.as_deref()).await?;
            out.extend(page.documents.into_iter().map(snippet_from_summary));
            match (page.has_more, page.next_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => return Ok(out),
            }
        }
        tracing::warn!(
            pages = self.config.max_list_pages,
            "Knowledge base listing truncated at page limit"
        );
        Ok(out)
    }
}

impl std::fmt::Debug for HttpContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpContextStore")
            .field("config", &self.config)
            .field("agents_locked", &self.agent_locks.len())
            .finish()
    }
}
