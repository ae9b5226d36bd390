//! callctx API Server Entry Point
//!
//! Bootstraps configuration, wires storage, the context store and the
//! completion provider into a coordinator, starts the orphan sweeper and
//! serves the Axum router until ctrl-c.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use callctx_api::{
    create_api_router, orphan_sweeper_task, ApiConfig, ApiError, ApiResult, AppState,
    CallCoordinator, CompletionBackend, ContextBackend, DbClient, DbConfig, OrphanSweeperConfig,
    StorageBackend, WebhookVerifier,
};
use callctx_api::constants::POST_CALL_DRAIN_TIMEOUT_SECS;
use callctx_api::telemetry::{init_tracer, TelemetryConfig};
use callctx_context::{ContextStore, HttpContextStore, InMemoryContextStore};
use callctx_llm::{
    AnthropicClient, AnthropicCompletionProvider, CompletionProvider, OpenAIClient,
    OpenAICompletionProvider,
};
use callctx_storage::{CallctxStore, InMemoryStore};
use tokio::sync::watch;

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-latest";

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracer(&telemetry_config)?;

    let api_config = ApiConfig::from_env()?;
    tracing::info!(config = ?api_config, "Configuration loaded");

    let store = build_store(api_config.storage).await?;
    let context = build_context_store(&api_config.context)?;
    let completion = build_completion_provider(&api_config.completion);
    if completion.is_none() {
        tracing::warn!("No completion provider configured; transcripts will not be summarized");
    }

    let coordinator = Arc::new(CallCoordinator::new(
        store,
        context,
        completion,
        api_config.coordinator.clone(),
    )?);

    let verifier = WebhookVerifier::new(
        api_config.webhook_secret.clone(),
        api_config.webhook_tolerance,
    );
    if !verifier.is_enabled() {
        tracing::warn!("Transcript webhook signatures are NOT verified");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(orphan_sweeper_task(
        Arc::clone(&coordinator),
        OrphanSweeperConfig::from_env(),
        shutdown_rx,
    ));

    let app = create_api_router(AppState::new(Arc::clone(&coordinator), verifier));

    let addr: SocketAddr = api_config.bind_addr.parse().map_err(|e| {
        ApiError::invalid_input(format!("Invalid bind address {}: {}", api_config.bind_addr, e))
    })?;
    tracing::info!(%addr, "Starting callctx API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;

    // Accepted transcripts may still be extracting or tearing down
    let drain = Duration::from_secs(POST_CALL_DRAIN_TIMEOUT_SECS);
    if coordinator.drain_post_call(drain).await {
        tracing::info!("Post-call work drained");
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "Orphan sweeper task panicked");
    }
    Ok(())
}

async fn build_store(backend: StorageBackend) -> ApiResult<Arc<dyn CallctxStore>> {
    match backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; sessions are lost on restart");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StorageBackend::Postgres => {
            let db = DbClient::from_config(&DbConfig::from_env())?;
            db.migrate().await?;
            db.health_check().await?;
            Ok(Arc::new(db))
        }
    }
}

fn build_context_store(backend: &ContextBackend) -> ApiResult<Arc<dyn ContextStore>> {
    match backend {
        ContextBackend::Memory => {
            tracing::warn!("Using in-memory context store; snippets never reach the voice agent");
            Ok(Arc::new(InMemoryContextStore::new()))
        }
        ContextBackend::Provider(config) => Ok(Arc::new(HttpContextStore::new(config.clone())?)),
    }
}

fn build_completion_provider(backend: &CompletionBackend) -> Option<Arc<dyn CompletionProvider>> {
    match backend {
        CompletionBackend::Disabled => None,
        CompletionBackend::OpenAI {
            api_key,
            model,
            requests_per_minute,
        } => {
            let client = OpenAIClient::new(api_key.clone(), *requests_per_minute);
            let model = model.clone().unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
            Some(Arc::new(OpenAICompletionProvider::new(client, model)))
        }
        CompletionBackend::Anthropic {
            api_key,
            model,
            requests_per_minute,
        } => {
            let client = AnthropicClient::new(api_key.clone(), *requests_per_minute);
            let model = model.clone().unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string());
            Some(Arc::new(AnthropicCompletionProvider::new(client, model)))
        }
    }
}
