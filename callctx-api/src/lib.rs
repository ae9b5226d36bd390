//! callctx API - HTTP service for per-call knowledge snippets
//!
//! Receives telephony and voice-agent webhooks, attaches a short-lived
//! knowledge snippet about the identified patient to the shared voice agent
//! for the length of one call, and after the call turns the transcript into
//! clinician-readable notes while tearing the snippet down.
//!
//! The orphan sweeper in [`jobs`] reclaims anything the per-call path
//! leaves behind.

pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod jobs;
pub mod macros;
pub mod routes;
pub mod services;
pub mod state;
pub mod telemetry;
pub mod webhook_signature;

// Re-export commonly used types
pub use config::{ApiConfig, CompletionBackend, ContextBackend, StorageBackend};
pub use db::{DbClient, DbConfig};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use jobs::{orphan_sweeper_task, OrphanSweeperConfig};
pub use routes::create_api_router;
pub use services::{CallCoordinator, InboundCall, TeardownSource, TranscriptEvent, TranscriptReceipt};
pub use state::AppState;
pub use webhook_signature::WebhookVerifier;
