//! Voice-agent knowledge base request and response types

use serde::{Deserialize, Serialize};

// ============================================================================
// DOCUMENTS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CreateTextDocumentRequest {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDocumentResponse {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListDocumentsResponse {
    #[serde(default)]
    pub documents: Vec<DocumentSummary>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub dependent_agents: Vec<DependentAgent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub created_at_unix_secs: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependentAgent {
    #[serde(default)]
    pub id: Option<String>,
}

// ============================================================================
// AGENT KNOWLEDGE LIST
// ============================================================================

/// Entry in an agent's knowledge list.
///
/// Entries this system did not create are round-tripped untouched, so unknown
/// fields are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_ref_type")]
    pub ref_type: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_ref_type() -> String {
    "text".to_string()
}

impl KnowledgeRef {
    pub fn text(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ref_type: default_ref_type(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub conversation_config: ConversationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub prompt: PromptSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptSection {
    #[serde(default)]
    pub knowledge_base: Vec<KnowledgeRef>,
}

impl AgentConfig {
    pub fn knowledge(&self) -> &[KnowledgeRef] {
        &self.conversation_config.agent.prompt.knowledge_base
    }

    /// Patch body replacing the agent's knowledge list.
    pub fn knowledge_patch(knowledge: Vec<KnowledgeRef>) -> Self {
        Self {
            conversation_config: ConversationConfig {
                agent: AgentSection {
                    prompt: PromptSection {
                        knowledge_base: knowledge,
                    },
                },
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub detail: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_keeps_foreign_fields() {
        let json = r#"{
            "conversation_config": {"agent": {"prompt": {"knowledge_base": [
                {"id": "kb_faq", "name": "Clinic FAQ", "type": "file", "usage_mode": "auto"}
            ]}}}
        }"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        let entry = &config.knowledge()[0];
        assert_eq!(entry.ref_type, "file");
        assert_eq!(entry.extra.get("usage_mode").and_then(|v| v.as_str()), Some("auto"));

        let patch = serde_json::to_value(AgentConfig::knowledge_patch(config.knowledge().to_vec())).unwrap();
        let round = &patch["conversation_config"]["agent"]["prompt"]["knowledge_base"][0];
        assert_eq!(round["usage_mode"], "auto");
        assert_eq!(round["type"], "file");
    }

    #[test]
    fn test_list_response_defaults() {
        let json = r#"{"documents":[{"id":"d1","name":"call-context-x"}]}"#;
        let resp: ListDocumentsResponse = serde_json::from_str(json).unwrap();
        assert!(!resp.has_more);
        assert!(resp.documents[0].dependent_agents.is_empty());
        assert!(resp.documents[0].metadata.created_at_unix_secs.is_none());
    }
}
