//! API Configuration Module
//!
//! Server, webhook, backend and coordinator settings. Everything is loaded
//! from `CALLCTX_*` environment variables with development-friendly
//! defaults; `production()` flips the defaults that must not be relaxed in a
//! real deployment.

use crate::constants::*;
use callctx_context::VoiceProviderConfig;
use callctx_core::{AgentRouting, CallctxError, CallctxResult, ConfigError, CoordinatorConfig};
use std::time::Duration;

// ============================================================================
// BACKEND SELECTION
// ============================================================================

/// Where call sessions, patients and transcripts live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl StorageBackend {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "memory" | "in-memory" => Ok(StorageBackend::Memory),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            other => Err(ConfigError::ProviderNotSupported {
                provider: other.to_string(),
            }),
        }
    }
}

/// Where knowledge snippets are created.
#[derive(Debug, Clone)]
pub enum ContextBackend {
    /// Process-local store; snippets never reach a real agent.
    Memory,
    Provider(VoiceProviderConfig),
}

/// Completion service used by the clinical note extractor.
#[derive(Clone, PartialEq, Eq)]
pub enum CompletionBackend {
    /// Transcripts are saved but never summarized.
    Disabled,
    OpenAI {
        api_key: String,
        model: Option<String>,
        requests_per_minute: u32,
    },
    Anthropic {
        api_key: String,
        model: Option<String>,
        requests_per_minute: u32,
    },
}

impl std::fmt::Debug for CompletionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionBackend::Disabled => write!(f, "Disabled"),
            CompletionBackend::OpenAI { model, .. } => f
                .debug_struct("OpenAI")
                .field("model", model)
                .field("api_key", &"[REDACTED]")
                .finish(),
            CompletionBackend::Anthropic { model, .. } => f
                .debug_struct("Anthropic")
                .field("model", model)
                .field("api_key", &"[REDACTED]")
                .finish(),
        }
    }
}

// ============================================================================
// API CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,

    /// Shared secret for transcript webhook signatures.
    /// `None` disables verification (development only).
    pub webhook_secret: Option<String>,

    /// Maximum age of a signed webhook timestamp.
    pub webhook_tolerance: Duration,

    /// Refuse to start without a webhook secret.
    pub require_webhook_secret: bool,

    pub storage: StorageBackend,
    pub context: ContextBackend,
    pub completion: CompletionBackend,
    pub coordinator: CoordinatorConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl ApiConfig {
    /// In-memory everything, unsigned webhooks, no completion provider.
    pub fn development() -> Self {
        Self {
            bind_addr: format!("{}:{}", DEFAULT_BIND_HOST, DEFAULT_PORT),
            webhook_secret: None,
            webhook_tolerance: Duration::from_secs(DEFAULT_WEBHOOK_TOLERANCE_SECS),
            require_webhook_secret: false,
            storage: StorageBackend::Memory,
            context: ContextBackend::Memory,
            completion: CompletionBackend::Disabled,
            coordinator: CoordinatorConfig::new(AgentRouting::single(DEV_DEFAULT_AGENT_ID)),
        }
    }

    /// Postgres storage and mandatory webhook signatures.
    ///
    /// The voice provider and agent routing still come from the environment.
    pub fn production() -> Self {
        Self {
            storage: StorageBackend::Postgres,
            require_webhook_secret: true,
            ..Self::development()
        }
    }

    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `CALLCTX_ENV`: "production" starts from [`ApiConfig::production`]
    /// - `CALLCTX_API_BIND` / `CALLCTX_API_PORT`: listen address
    /// - `CALLCTX_WEBHOOK_SECRET`, `CALLCTX_WEBHOOK_TOLERANCE_SECS`
    /// - `CALLCTX_STORAGE`: "memory" or "postgres"
    /// - `CALLCTX_CONTEXT_STORE`: "memory" or "provider" (reads `CALLCTX_VOICE_*`)
    /// - `CALLCTX_COMPLETION_PROVIDER`: "none", "openai" or "anthropic"
    ///   with `CALLCTX_COMPLETION_API_KEY`, `CALLCTX_COMPLETION_MODEL`, `CALLCTX_COMPLETION_RPM`
    /// - `CALLCTX_DEFAULT_AGENT_ID`, `CALLCTX_AGENT_ROUTES` (`es=agent_b,fr=agent_c`)
    /// - `CALLCTX_CONTEXT_TIMEOUT_MS`, `CALLCTX_COMPLETION_TIMEOUT_SECS`
    /// - `CALLCTX_SNIPPET_TOKEN_BUDGET`, `CALLCTX_SNIPPET_RECENT_NOTES`
    pub fn from_env() -> CallctxResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ApiConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CallctxResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = match get("CALLCTX_ENV").as_deref() {
            Some("production") | Some("prod") => Self::production(),
            _ => Self::development(),
        };

        let host = get("CALLCTX_API_BIND").unwrap_or_else(|| DEFAULT_BIND_HOST.to_string());
        let port = get("CALLCTX_API_PORT")
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        config.bind_addr = format!("{}:{}", host, port);

        config.webhook_secret = get("CALLCTX_WEBHOOK_SECRET");
        if let Some(secs) = get("CALLCTX_WEBHOOK_TOLERANCE_SECS").and_then(|s| s.parse().ok()) {
            config.webhook_tolerance = Duration::from_secs(secs);
        }

        if let Some(storage) = get("CALLCTX_STORAGE") {
            config.storage = StorageBackend::parse(&storage)?;
        }

        config.context = match get("CALLCTX_CONTEXT_STORE").as_deref().map(str::trim) {
            None | Some("memory") => ContextBackend::Memory,
            Some("provider") | Some("elevenlabs") => {
                let api_key = get("CALLCTX_VOICE_API_KEY").ok_or_else(|| {
                    ConfigError::MissingRequired {
                        field: "CALLCTX_VOICE_API_KEY".to_string(),
                    }
                })?;
                let mut provider = VoiceProviderConfig::new(api_key);
                if let Some(base_url) = get("CALLCTX_VOICE_BASE_URL") {
                    provider = provider.with_base_url(base_url);
                }
                if let Some(secs) = get("CALLCTX_VOICE_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()) {
                    provider.request_timeout = Duration::from_secs(secs.max(1));
                }
                ContextBackend::Provider(provider)
            }
            Some(other) => {
                return Err(ConfigError::ProviderNotSupported {
                    provider: other.to_string(),
                }
                .into())
            }
        };

        config.completion = parse_completion(&get)?;

        let default_agent = get("CALLCTX_DEFAULT_AGENT_ID")
            .unwrap_or_else(|| config.coordinator.routing.default_agent.clone());
        let routes = get("CALLCTX_AGENT_ROUTES").unwrap_or_default();
        config.coordinator.routing = AgentRouting::parse_language_map(&default_agent, &routes)?;

        if let Some(ms) = get("CALLCTX_CONTEXT_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            config.coordinator.context_op_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = get("CALLCTX_COMPLETION_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            config.coordinator.completion_timeout = Duration::from_secs(secs);
        }
        if let Some(budget) = get("CALLCTX_SNIPPET_TOKEN_BUDGET").and_then(|s| s.parse().ok()) {
            config.coordinator.snippet_token_budget = budget;
        }
        if let Some(notes) = get("CALLCTX_SNIPPET_RECENT_NOTES").and_then(|s| s.parse().ok()) {
            config.coordinator.snippet_recent_notes = notes;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CallctxResult<()> {
        if self.require_webhook_secret && self.webhook_secret.is_none() {
            return Err(CallctxError::Config(ConfigError::MissingRequired {
                field: "CALLCTX_WEBHOOK_SECRET".to_string(),
            }));
        }
        if self.webhook_tolerance.is_zero() {
            return Err(CallctxError::Config(ConfigError::InvalidValue {
                field: "webhook_tolerance".to_string(),
                value: "0".to_string(),
                reason: "tolerance must be positive".to_string(),
            }));
        }
        self.coordinator.validate()
    }
}

fn parse_completion(get: &impl Fn(&str) -> Option<String>) -> CallctxResult<CompletionBackend> {
    let provider = match get("CALLCTX_COMPLETION_PROVIDER") {
        None => return Ok(CompletionBackend::Disabled),
        Some(p) => p.trim().to_lowercase(),
    };
    if provider == "none" || provider == "disabled" {
        return Ok(CompletionBackend::Disabled);
    }

    let api_key = get("CALLCTX_COMPLETION_API_KEY").ok_or_else(|| ConfigError::MissingRequired {
        field: "CALLCTX_COMPLETION_API_KEY".to_string(),
    })?;
    let model = get("CALLCTX_COMPLETION_MODEL");
    let requests_per_minute = get("CALLCTX_COMPLETION_RPM")
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_COMPLETION_RPM);

    match provider.as_str() {
        "openai" => Ok(CompletionBackend::OpenAI {
            api_key,
            model,
            requests_per_minute,
        }),
        "anthropic" => Ok(CompletionBackend::Anthropic {
            api_key,
            model,
            requests_per_minute,
        }),
        other => Err(ConfigError::ProviderNotSupported {
            provider: other.to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_development_defaults() {
        let config = ApiConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(matches!(config.context, ContextBackend::Memory));
        assert_eq!(config.completion, CompletionBackend::Disabled);
        assert!(config.webhook_secret.is_none());
        assert_eq!(config.webhook_tolerance, Duration::from_secs(1800));
        assert_eq!(config.coordinator.routing.default_agent, DEV_DEFAULT_AGENT_ID);
    }

    #[test]
    fn test_production_requires_webhook_secret() {
        let err = ApiConfig::from_lookup(lookup(&[("CALLCTX_ENV", "production")])).unwrap_err();
        assert!(matches!(
            err,
            CallctxError::Config(ConfigError::MissingRequired { ref field }) if field == "CALLCTX_WEBHOOK_SECRET"
        ));

        let config = ApiConfig::from_lookup(lookup(&[
            ("CALLCTX_ENV", "production"),
            ("CALLCTX_WEBHOOK_SECRET", "whsec"),
        ]))
        .unwrap();
        assert_eq!(config.storage, StorageBackend::Postgres);
    }

    #[test]
    fn test_agent_routes_and_timeouts() {
        let config = ApiConfig::from_lookup(lookup(&[
            ("CALLCTX_DEFAULT_AGENT_ID", "agent-en"),
            ("CALLCTX_AGENT_ROUTES", "es=agent-es, fr=agent-fr"),
            ("CALLCTX_CONTEXT_TIMEOUT_MS", "1500"),
            ("CALLCTX_SNIPPET_TOKEN_BUDGET", "800"),
        ]))
        .unwrap();
        let routing = &config.coordinator.routing;
        assert_eq!(routing.agent_for(Some("es-MX")), "agent-es");
        assert_eq!(routing.agent_for(None), "agent-en");
        assert_eq!(config.coordinator.context_op_timeout, Duration::from_millis(1500));
        assert_eq!(config.coordinator.snippet_token_budget, 800);
    }

    #[test]
    fn test_completion_provider_selection() {
        let config = ApiConfig::from_lookup(lookup(&[
            ("CALLCTX_COMPLETION_PROVIDER", "Anthropic"),
            ("CALLCTX_COMPLETION_API_KEY", "sk-test"),
        ]))
        .unwrap();
        assert!(matches!(
            config.completion,
            CompletionBackend::Anthropic { requests_per_minute: 60, model: None, .. }
        ));
        assert!(!format!("{:?}", config.completion).contains("sk-test"));

        let err = ApiConfig::from_lookup(lookup(&[("CALLCTX_COMPLETION_PROVIDER", "openai")]))
            .unwrap_err();
        assert!(matches!(err, CallctxError::Config(ConfigError::MissingRequired { .. })));
    }

    #[test]
    fn test_unknown_backends_rejected() {
        let err = ApiConfig::from_lookup(lookup(&[("CALLCTX_STORAGE", "sqlite")])).unwrap_err();
        assert!(matches!(err, CallctxError::Config(ConfigError::ProviderNotSupported { .. })));

        let err = ApiConfig::from_lookup(lookup(&[("CALLCTX_CONTEXT_STORE", "s3")])).unwrap_err();
        assert!(matches!(err, CallctxError::Config(ConfigError::ProviderNotSupported { .. })));
    }

    #[test]
    fn test_provider_context_store_needs_key() {
        let err = ApiConfig::from_lookup(lookup(&[("CALLCTX_CONTEXT_STORE", "provider")]))
            .unwrap_err();
        assert!(matches!(err, CallctxError::Config(ConfigError::MissingRequired { .. })));

        let config = ApiConfig::from_lookup(lookup(&[
            ("CALLCTX_CONTEXT_STORE", "provider"),
            ("CALLCTX_VOICE_API_KEY", "xi-key"),
            ("CALLCTX_VOICE_BASE_URL", "http://localhost:9000/"),
        ]))
        .unwrap();
        match config.context {
            ContextBackend::Provider(provider) => {
                assert_eq!(provider.base_url, "http://localhost:9000");
            }
            ContextBackend::Memory => panic!("expected provider backend"),
        }
    }
}
