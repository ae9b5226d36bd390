//! Configuration types

use crate::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Maps a patient's preferred language to the shared agent serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRouting {
    pub default_agent: AgentId,
    /// Keyed by lowercase ISO 639-1 code.
    pub by_language: BTreeMap<String, AgentId>,
}

impl AgentRouting {
    pub fn single(default_agent: impl Into<AgentId>) -> Self {
        Self {
            default_agent: default_agent.into(),
            by_language: BTreeMap::new(),
        }
    }

    pub fn with_language(mut self, language: &str, agent: impl Into<AgentId>) -> Self {
        self.by_language
            .insert(language_key(language), agent.into());
        self
    }

    /// Agent for a language; unknown or missing languages use the default.
    ///
    /// Region subtags are ignored, so `es-MX` routes to the `es` agent.
    pub fn agent_for(&self, language: Option<&str>) -> &AgentId {
        language
            .map(language_key)
            .and_then(|key| self.by_language.get(&key))
            .unwrap_or(&self.default_agent)
    }

    /// Every agent this deployment may attach snippets to.
    pub fn all_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.by_language.values().cloned().collect();
        agents.push(self.default_agent.clone());
        agents.sort();
        agents.dedup();
        agents
    }

    /// Parse `en=agent_a,es=agent_b`.
    pub fn parse_language_map(default_agent: &str, spec: &str) -> Result<Self, ConfigError> {
        let mut routing = Self::single(default_agent);
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (lang, agent) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                field: "agent_routing".to_string(),
                value: pair.to_string(),
                reason: "expected language=agent_id".to_string(),
            })?;
            if lang.trim().is_empty() || agent.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "agent_routing".to_string(),
                    value: pair.to_string(),
                    reason: "language and agent id must be non-empty".to_string(),
                });
            }
            routing = routing.with_language(lang, agent.trim());
        }
        Ok(routing)
    }
}

fn language_key(language: &str) -> String {
    let lower = language.trim().to_lowercase();
    match lower.split(['-', '_']).next() {
        Some(primary) => primary.to_string(),
        None => lower,
    }
}

/// Tuning for the call session coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub routing: AgentRouting,
    /// Bound on each create/attach/detach/destroy call.
    pub context_op_timeout: Duration,
    /// Bound on the clinical extraction completion call.
    pub completion_timeout: Duration,
    /// Token budget for the per-call knowledge snippet.
    pub snippet_token_budget: i32,
    /// Most recent clinical note blocks included in the snippet.
    pub snippet_recent_notes: usize,
}

impl CoordinatorConfig {
    pub fn new(routing: AgentRouting) -> Self {
        Self {
            routing,
            context_op_timeout: Duration::from_secs(5),
            completion_timeout: Duration::from_secs(30),
            snippet_token_budget: 2000,
            snippet_recent_notes: 3,
        }
    }

    pub fn validate(&self) -> CallctxResult<()> {
        if self.routing.default_agent.trim().is_empty() {
            return Err(CallctxError::Config(ConfigError::MissingRequired {
                field: "default_agent".to_string(),
            }));
        }

        if self.context_op_timeout.is_zero() {
            return Err(CallctxError::Config(ConfigError::InvalidValue {
                field: "context_op_timeout".to_string(),
                value: format!("{:?}", self.context_op_timeout),
                reason: "context_op_timeout must be positive".to_string(),
            }));
        }

        if self.completion_timeout.is_zero() {
            return Err(CallctxError::Config(ConfigError::InvalidValue {
                field: "completion_timeout".to_string(),
                value: format!("{:?}", self.completion_timeout),
                reason: "completion_timeout must be positive".to_string(),
            }));
        }

        if self.snippet_token_budget <= 0 {
            return Err(CallctxError::Config(ConfigError::InvalidValue {
                field: "snippet_token_budget".to_string(),
                value: self.snippet_token_budget.to_string(),
                reason: "snippet_token_budget must be greater than 0".to_string(),
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_for_language() {
        let routing = AgentRouting::single("agent-en").with_language("es", "agent-es");
        assert_eq!(routing.agent_for(Some("es")), "agent-es");
        assert_eq!(routing.agent_for(Some("ES-mx")), "agent-es");
        assert_eq!(routing.agent_for(Some("fr")), "agent-en");
        assert_eq!(routing.agent_for(None), "agent-en");
    }

    #[test]
    fn test_parse_language_map() {
        let routing = AgentRouting::parse_language_map("agent-en", "es=agent-es, vi = agent-vi").unwrap();
        assert_eq!(routing.agent_for(Some("vi")), "agent-vi");
        assert_eq!(routing.all_agents(), vec!["agent-en", "agent-es", "agent-vi"]);

        assert!(AgentRouting::parse_language_map("agent-en", "es").is_err());
        assert!(AgentRouting::parse_language_map("agent-en", "=agent").is_err());
        assert!(AgentRouting::parse_language_map("agent-en", "").is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = CoordinatorConfig::new(AgentRouting::single("agent-en"));
        assert!(config.validate().is_ok());

        config.context_op_timeout = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(CallctxError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_validate_requires_default_agent() {
        let config = CoordinatorConfig::new(AgentRouting::single(" "));
        assert!(matches!(
            config.validate(),
            Err(CallctxError::Config(ConfigError::MissingRequired { .. }))
        ));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_rejects_invalid_token_budget(budget in i32::MIN..=0) {
            let mut config = CoordinatorConfig::new(AgentRouting::single("agent-en"));
            config.snippet_token_budget = budget;
            let result = config.validate();
            if let Err(CallctxError::Config(ConfigError::InvalidValue { field, .. })) = result {
                prop_assert_eq!(field, "snippet_token_budget");
            } else {
                prop_assert!(false, "Expected ConfigError::InvalidValue");
            }
        }
    }
}
