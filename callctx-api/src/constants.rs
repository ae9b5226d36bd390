//! Constants for the callctx API
//!
//! Defaults referenced by the config structs, the webhook verifier and the
//! background jobs.

// ============================================================================
// SERVER
// ============================================================================

/// Default bind host
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default bind port
pub const DEFAULT_PORT: u16 = 3000;

/// How long shutdown waits for post-call extraction and teardown to finish
pub const POST_CALL_DRAIN_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// WEBHOOKS
// ============================================================================

/// Header carrying `t=<unix>,v0=<hex hmac>`
pub const SIGNATURE_HEADER: &str = "x-callctx-signature";

/// Maximum age of a signed webhook timestamp (30 minutes)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 1800;

// ============================================================================
// AGENTS
// ============================================================================

/// Agent id used by the development preset
pub const DEV_DEFAULT_AGENT_ID: &str = "agent-dev";

// ============================================================================
// CORRELATION
// ============================================================================

/// Fallback claim attempts when a concurrent event wins the conversation id
pub const MAX_FALLBACK_ATTEMPTS: usize = 3;

/// Candidates fetched per fallback attempt; more than one logs an ambiguity warning
pub const FALLBACK_CANDIDATE_LIMIT: usize = 5;

/// Attempts to move a session to `Failed` when its state keeps changing underneath
pub const MAX_FAIL_ATTEMPTS: usize = 3;

// ============================================================================
// COMPLETION
// ============================================================================

/// Default requests per minute for completion providers
pub const DEFAULT_COMPLETION_RPM: u32 = 60;

// ============================================================================
// ORPHAN SWEEPER
// ============================================================================

/// Default sweep interval in seconds (5 minutes)
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Default snippet and session TTL in seconds (2 hours)
pub const DEFAULT_SNIPPET_TTL_SECS: u64 = 7200;

/// Default number of sessions handled per sweep step
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 100;

// ============================================================================
// DATABASE
// ============================================================================

/// Default connection pool size
pub const DEFAULT_DB_POOL_SIZE: usize = 16;

/// Default pool acquire timeout in seconds
pub const DEFAULT_DB_TIMEOUT_SECS: u64 = 5;
