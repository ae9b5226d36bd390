//! Orphan Sweeper Background Task
//!
//! Periodically reconciles the voice-agent provider's knowledge documents
//! with our call sessions. Snippets can outlive their call when:
//!
//! - the transcript webhook never arrives (correlation miss, provider outage)
//! - a detach or destroy failed during teardown
//! - the process crashed between creating a snippet and recording its handle
//!
//! Each cycle runs three passes:
//!
//! 1. retire open sessions older than the TTL (teardown, then `Failed`)
//! 2. retry teardown for terminal sessions still `held` or `release_failed`
//! 3. list every snippet and destroy the ones [`classify`] marks as orphans
//!
//! Only snippets whose name carries our owner prefix are ever touched. A
//! snippet younger than the TTL whose call is still open is always kept.

use crate::constants::{
    DEFAULT_SNIPPET_TTL_SECS, DEFAULT_SWEEP_BATCH_SIZE, DEFAULT_SWEEP_INTERVAL_SECS,
};
use crate::services::{CallCoordinator, TeardownSource};
use crate::telemetry::metrics as prometheus_metrics;
use callctx_context::{release_snippet, ContextStore};
use callctx_core::{CallSession, ContextRelease, KnowledgeSnippet, Timestamp};
use callctx_storage::CallSessionStore;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Failure reason recorded on sessions the sweeper retires.
pub const ABANDONED_REASON: &str = "abandoned";

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrphanSweeperConfig {
    /// How often a sweep cycle runs (default: 5 minutes)
    pub interval: Duration,

    /// Age after which a snippet is destroyed and an open call retired,
    /// whatever its state (default: 2 hours)
    pub ttl: Duration,

    /// Maximum sessions handled per pass (default: 100)
    pub batch_size: usize,

    /// Whether to log each reclaimed snippet (default: true)
    pub log_actions: bool,
}

impl Default for OrphanSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            ttl: Duration::from_secs(DEFAULT_SNIPPET_TTL_SECS),
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            log_actions: true,
        }
    }
}

impl OrphanSweeperConfig {
    /// Create OrphanSweeperConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CALLCTX_SWEEP_INTERVAL_SECS`: cycle interval (default: 300)
    /// - `CALLCTX_SNIPPET_TTL_SECS`: snippet and open-call TTL (default: 7200)
    /// - `CALLCTX_SWEEP_BATCH_SIZE`: max sessions per pass (default: 100)
    /// - `CALLCTX_SWEEP_LOG_ACTIONS`: log each reclaimed snippet (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let interval = Duration::from_secs(
            lookup("CALLCTX_SWEEP_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );

        let ttl = Duration::from_secs(
            lookup("CALLCTX_SNIPPET_TTL_SECS")
                .and_then(|s| s.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(DEFAULT_SNIPPET_TTL_SECS),
        );

        let batch_size = lookup("CALLCTX_SWEEP_BATCH_SIZE")
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_SWEEP_BATCH_SIZE);

        let log_actions = lookup("CALLCTX_SWEEP_LOG_ACTIONS")
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            interval,
            ttl,
            batch_size,
            log_actions,
        }
    }

    /// Short interval and TTL for local runs.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(15),
            ttl: Duration::from_secs(600),
            batch_size: 10,
            log_actions: true,
        }
    }

    pub fn production() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            ttl: Duration::from_secs(DEFAULT_SNIPPET_TTL_SECS),
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            log_actions: true,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for the sweeper's lifetime. Mirrored into Prometheus.
#[derive(Debug, Default)]
pub struct OrphanSweeperMetrics {
    /// Snippets destroyed directly by the sweeper
    pub snippets_destroyed: AtomicU64,

    /// Open sessions retired past the TTL
    pub sessions_retired: AtomicU64,

    /// Session teardowns completed on retry
    pub releases_retried: AtomicU64,

    pub sweep_cycles: AtomicU64,

    pub sweep_errors: AtomicU64,
}

impl OrphanSweeperMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> OrphanSweeperSnapshot {
        OrphanSweeperSnapshot {
            snippets_destroyed: self.snippets_destroyed.load(Ordering::Relaxed),
            sessions_retired: self.sessions_retired.load(Ordering::Relaxed),
            releases_retried: self.releases_retried.load(Ordering::Relaxed),
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrphanSweeperSnapshot {
    pub snippets_destroyed: u64,
    pub sessions_retired: u64,
    pub releases_retried: u64,
    pub sweep_cycles: u64,
    pub sweep_errors: u64,
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// What the sweeper does with one listed snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Leave it alone.
    Keep,
    /// Tear down through the owning session's release claim.
    ReleaseViaSession,
    /// Detach from its listed agents and destroy, bypassing the session.
    DestroyDirect,
    /// Owner is still open past the TTL: fail the call, then destroy.
    RetireSession,
}

/// Decide what to do with `snippet` given its owning session, if any.
///
/// Pure. Unmanaged snippets are always kept, and a snippet within the TTL
/// whose owner is open is always kept.
pub fn classify(
    snippet: &KnowledgeSnippet,
    owner: Option<&CallSession>,
    now: Timestamp,
    ttl: Duration,
) -> SweepAction {
    if !snippet.is_managed() {
        return SweepAction::Keep;
    }

    // Future timestamps (clock skew) count as age zero
    let expired = snippet.age(now).to_std().map(|age| age > ttl).unwrap_or(false);
    let Some(session) = owner else {
        return SweepAction::DestroyDirect;
    };

    let owns_handle = session.context_handle.as_deref() == Some(snippet.handle.as_str());

    if !session.is_terminal() {
        return if expired {
            SweepAction::RetireSession
        } else {
            SweepAction::Keep
        };
    }

    if owns_handle && session.release.needs_release() {
        return SweepAction::ReleaseViaSession;
    }
    if owns_handle && session.release == ContextRelease::Claimed && !expired {
        // Another path is mid-teardown
        return SweepAction::Keep;
    }
    SweepAction::DestroyDirect
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run sweep cycles on `config.interval` until the shutdown signal.
pub async fn orphan_sweeper_task(
    coordinator: Arc<CallCoordinator>,
    config: OrphanSweeperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<OrphanSweeperMetrics> {
    let metrics = Arc::new(OrphanSweeperMetrics::new());

    let mut sweep_interval = interval(config.interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        ttl_secs = config.ttl.as_secs(),
        batch_size = config.batch_size,
        "Orphan sweeper started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Orphan sweeper shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                run_sweep_cycle(&coordinator, &config, &metrics, Utc::now()).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        snippets_destroyed = snapshot.snippets_destroyed,
        sessions_retired = snapshot.sessions_retired,
        releases_retried = snapshot.releases_retried,
        sweep_cycles = snapshot.sweep_cycles,
        sweep_errors = snapshot.sweep_errors,
        "Orphan sweeper stopped"
    );

    metrics
}

/// Perform one sweep cycle as of `now`.
pub async fn run_sweep_cycle(
    coordinator: &CallCoordinator,
    config: &OrphanSweeperConfig,
    metrics: &OrphanSweeperMetrics,
    now: Timestamp,
) -> OrphanSweeperSnapshot {
    let before = metrics.snapshot();

    retire_stale_sessions(coordinator, config, metrics, now).await;
    retry_pending_releases(coordinator, config, metrics).await;
    reclaim_snippets(coordinator, config, metrics, now).await;

    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);
    let after = metrics.snapshot();
    let delta = OrphanSweeperSnapshot {
        snippets_destroyed: after.snippets_destroyed - before.snippets_destroyed,
        sessions_retired: after.sessions_retired - before.sessions_retired,
        releases_retried: after.releases_retried - before.releases_retried,
        sweep_cycles: 1,
        sweep_errors: after.sweep_errors - before.sweep_errors,
    };

    if let Some(m) = prometheus_metrics() {
        m.record_sweeper_action("destroyed", delta.snippets_destroyed);
        m.record_sweeper_action("retired", delta.sessions_retired);
        m.record_sweeper_action("retried", delta.releases_retried);
        m.record_sweeper_action("error", delta.sweep_errors);
        m.record_sweeper_cycle();
    }

    if delta.snippets_destroyed + delta.sessions_retired + delta.releases_retried > 0 {
        tracing::info!(
            destroyed = delta.snippets_destroyed,
            retired = delta.sessions_retired,
            retried = delta.releases_retried,
            errors = delta.sweep_errors,
            "Orphan sweep cycle completed"
        );
    } else {
        tracing::trace!("Orphan sweep cycle completed with nothing to reclaim");
    }
    delta
}

async fn retire_stale_sessions(
    coordinator: &CallCoordinator,
    config: &OrphanSweeperConfig,
    metrics: &OrphanSweeperMetrics,
    now: Timestamp,
) {
    let cutoff = match chrono::Duration::from_std(config.ttl) {
        Ok(ttl) => now - ttl,
        Err(e) => {
            tracing::error!(error = %e, "Sweeper TTL out of range");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let stale = match coordinator.store().list_stale_open(cutoff, config.batch_size).await {
        Ok(stale) => stale,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list stale sessions");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    for session in stale {
        if config.log_actions {
            tracing::warn!(
                call_id = %session.call_id,
                state = %session.state,
                started_at = %session.started_at,
                "Retiring abandoned call"
            );
        }
        retire(coordinator, metrics, &session).await;
    }
}

async fn retire(coordinator: &CallCoordinator, metrics: &OrphanSweeperMetrics, session: &CallSession) {
    match coordinator.fail_call(session.call_id, ABANDONED_REASON).await {
        Ok(true) => {
            metrics.sessions_retired.fetch_add(1, Ordering::Relaxed);
        }
        Ok(false) => {
            tracing::debug!(call_id = %session.call_id, "Call already terminal, skipping");
        }
        Err(e) => {
            tracing::error!(error = %e, call_id = %session.call_id, "Failed to retire call");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn retry_pending_releases(
    coordinator: &CallCoordinator,
    config: &OrphanSweeperConfig,
    metrics: &OrphanSweeperMetrics,
) {
    let pending = match coordinator.store().list_release_pending(config.batch_size).await {
        Ok(pending) => pending,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list sessions pending release");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    for session in pending {
        release_via_session(coordinator, metrics, &session).await;
    }
}

async fn release_via_session(
    coordinator: &CallCoordinator,
    metrics: &OrphanSweeperMetrics,
    session: &CallSession,
) {
    match coordinator
        .release_context(session.call_id, TeardownSource::Sweeper)
        .await
    {
        Ok(true) => {
            metrics.releases_retried.fetch_add(1, Ordering::Relaxed);
        }
        Ok(false) => {
            tracing::debug!(call_id = %session.call_id, "Release not performed by sweeper");
        }
        Err(e) => {
            tracing::error!(error = %e, call_id = %session.call_id, "Failed to retry release");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn reclaim_snippets(
    coordinator: &CallCoordinator,
    config: &OrphanSweeperConfig,
    metrics: &OrphanSweeperMetrics,
    now: Timestamp,
) {
    let snippets = match coordinator.context_store().list().await {
        Ok(snippets) => snippets,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list knowledge snippets");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    for snippet in snippets.iter().filter(|s| s.is_managed()) {
        let owner = match snippet.owner_call_id {
            Some(call_id) => match coordinator.store().get_session(call_id).await {
                Ok(owner) => owner,
                Err(e) => {
                    // Unknown owner state: never guess with a live call
                    tracing::error!(error = %e, handle = %snippet.handle, "Failed to load snippet owner");
                    metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            },
            None => None,
        };

        match classify(snippet, owner.as_ref(), now, config.ttl) {
            SweepAction::Keep => {}
            SweepAction::ReleaseViaSession => {
                if let Some(session) = owner.as_ref() {
                    release_via_session(coordinator, metrics, session).await;
                }
            }
            SweepAction::DestroyDirect => {
                destroy_direct(coordinator, config, metrics, snippet).await;
            }
            SweepAction::RetireSession => {
                let Some(session) = owner.as_ref() else {
                    continue;
                };
                retire(coordinator, metrics, session).await;

                // Past the TTL the snippet goes regardless of how teardown fared
                let released = coordinator
                    .store()
                    .get_session(session.call_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|s| s.release == ContextRelease::Released)
                    .unwrap_or(false);
                if !released {
                    destroy_direct(coordinator, config, metrics, snippet).await;
                }
            }
        }
    }
}

async fn destroy_direct(
    coordinator: &CallCoordinator,
    config: &OrphanSweeperConfig,
    metrics: &OrphanSweeperMetrics,
    snippet: &KnowledgeSnippet,
) {
    if config.log_actions {
        tracing::warn!(
            handle = %snippet.handle,
            owner = ?snippet.owner_call_id,
            created_at = %snippet.created_at,
            "Destroying orphaned knowledge snippet"
        );
    }

    let result = release_snippet(
        coordinator.context_store().as_ref(),
        &snippet.handle,
        &snippet.attached_agent_ids,
        coordinator.config().context_op_timeout,
    )
    .await;

    match result {
        Ok(()) => {
            metrics.snippets_destroyed.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = prometheus_metrics() {
                m.record_snippet_destroyed();
            }
        }
        Err(e) => {
            tracing::error!(error = %e, handle = %snippet.handle, "Failed to destroy orphaned snippet");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = prometheus_metrics() {
                m.record_teardown_failure(TeardownSource::Sweeper.as_str());
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
