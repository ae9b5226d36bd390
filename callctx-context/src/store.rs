//! Knowledge snippet lifecycle against the voice-AI provider.

use async_trait::async_trait;
use callctx_core::{
    snippet_name, AgentId, CallId, CallctxError, CallctxResult, ContextStoreError,
    KnowledgeSnippet, SnippetHandle,
};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Create, attach, detach and destroy per-call knowledge snippets.
///
/// `attach` and `detach` are no-ops when already in the requested state and
/// `destroy` treats a missing handle as success, so the coordinator and the
/// orphan sweeper may race on the same snippet.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Create a fresh snippet owned by `owner` and return its handle.
    async fn create(&self, owner: CallId, summary_text: &str) -> CallctxResult<SnippetHandle>;

    /// Make the snippet searchable by `agent_id`.
    async fn attach(&self, handle: &str, agent_id: &str) -> CallctxResult<()>;

    /// Remove the snippet from `agent_id`'s knowledge set.
    async fn detach(&self, handle: &str, agent_id: &str) -> CallctxResult<()>;

    /// Permanently delete the snippet.
    async fn destroy(&self, handle: &str) -> CallctxResult<()>;

    /// Every document the provider knows about, managed or not.
    async fn list(&self) -> CallctxResult<Vec<KnowledgeSnippet>>;
}

/// Run one context store operation under a deadline.
pub async fn with_timeout<T>(
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = CallctxResult<T>>,
) -> CallctxResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CallctxError::ContextStore(ContextStoreError::Timeout {
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        })),
    }
}

/// Detach `handle` from every agent in `agents`, then destroy it.
///
/// A failed detach stops before destroy, leaving the snippet for the orphan
/// sweeper rather than deleting a document an agent still references.
pub async fn release_snippet(
    store: &dyn ContextStore,
    handle: &str,
    agents: &[AgentId],
    op_timeout: Duration,
) -> CallctxResult<()> {
    for agent in agents {
        with_timeout("detach", op_timeout, store.detach(handle, agent)).await?;
    }
    with_timeout("destroy", op_timeout, store.destroy(handle)).await
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Clone)]
struct StoredSnippet {
    snippet: KnowledgeSnippet,
    text: String,
}

/// In-memory context store with operation counters.
///
/// Agent knowledge lists are kept apart from the documents, as the remote
/// store keeps them: destroying a document leaves any reference to it in
/// place, and attaching does not check that the document exists.
/// Effective destroys are counted per handle so tests can assert
/// exactly-once teardown.
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    snippets: Arc<RwLock<HashMap<SnippetHandle, StoredSnippet>>>,
    agent_refs: Arc<RwLock<HashMap<AgentId, Vec<SnippetHandle>>>>,
    destroy_calls: Arc<RwLock<HashMap<SnippetHandle, u64>>>,
    next_id: AtomicU64,
    creates: AtomicU64,
    attaches: AtomicU64,
    detaches: AtomicU64,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a snippet directly, e.g. a leftover from a crashed process.
    pub async fn seed(&self, snippet: KnowledgeSnippet, text: impl Into<String>) {
        {
            let mut refs = self.agent_refs.write().await;
            for agent in &snippet.attached_agent_ids {
                let list = refs.entry(agent.clone()).or_default();
                if !list.contains(&snippet.handle) {
                    list.push(snippet.handle.clone());
                }
            }
        }
        self.snippets.write().await.insert(
            snippet.handle.clone(),
            StoredSnippet {
                snippet,
                text: text.into(),
            },
        );
    }

    pub async fn contains(&self, handle: &str) -> bool {
        self.snippets.read().await.contains_key(handle)
    }

    pub async fn live_count(&self) -> usize {
        self.snippets.read().await.len()
    }

    pub async fn text_of(&self, handle: &str) -> Option<String> {
        self.snippets.read().await.get(handle).map(|s| s.text.clone())
    }

    /// Agents whose knowledge list references `handle`, destroyed or not.
    pub async fn attached_agents(&self, handle: &str) -> Vec<AgentId> {
        let refs = self.agent_refs.read().await;
        let mut agents: Vec<AgentId> = refs
            .iter()
            .filter(|(_, handles)| handles.iter().any(|h| h == handle))
            .map(|(agent, _)| agent.clone())
            .collect();
        agents.sort();
        agents
    }

    /// Number of destroy calls that actually removed `handle`.
    pub async fn destroy_count(&self, handle: &str) -> u64 {
        self.destroy_calls.read().await.get(handle).copied().unwrap_or(0)
    }

    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    pub fn attach_count(&self) -> u64 {
        self.attaches.load(Ordering::Relaxed)
    }

    pub fn detach_count(&self) -> u64 {
        self.detaches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn create(&self, owner: CallId, summary_text: &str) -> CallctxResult<SnippetHandle> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = format!("doc_{:06}", n);
        let snippet = KnowledgeSnippet::new(handle.clone(), snippet_name(owner), Utc::now());
        self.snippets.write().await.insert(
            handle.clone(),
            StoredSnippet {
                snippet,
                text: summary_text.to_string(),
            },
        );
        self.creates.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    async fn attach(&self, handle: &str, agent_id: &str) -> CallctxResult<()> {
        let mut refs = self.agent_refs.write().await;
        let list = refs.entry(agent_id.to_string()).or_default();
        if !list.iter().any(|h| h == handle) {
            list.push(handle.to_string());
            self.attaches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn detach(&self, handle: &str, agent_id: &str) -> CallctxResult<()> {
        let mut refs = self.agent_refs.write().await;
        if let Some(list) = refs.get_mut(agent_id) {
            let before = list.len();
            list.retain(|h| h != handle);
            if list.len() != before {
                self.detaches.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> CallctxResult<()> {
        let removed = self.snippets.write().await.remove(handle).is_some();
        if removed {
            *self
                .destroy_calls
                .write()
                .await
                .entry(handle.to_string())
                .or_insert(0) += 1;
        }
        Ok(())
    }

    async fn list(&self) -> CallctxResult<Vec<KnowledgeSnippet>> {
        let refs = self.agent_refs.read().await;
        let mut out: Vec<KnowledgeSnippet> = self
            .snippets
            .read()
            .await
            .values()
            .map(|s| {
                let mut snippet = s.snippet.clone();
                snippet.attached_agent_ids = refs
                    .iter()
                    .filter(|(_, handles)| handles.contains(&snippet.handle))
                    .map(|(agent, _)| agent.clone())
                    .collect();
                snippet.attached_agent_ids.sort();
                snippet
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.handle.cmp(&b.handle)));
        Ok(out)
    }
}
