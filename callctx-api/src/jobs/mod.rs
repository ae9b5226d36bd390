//! Background Jobs for the callctx API
//!
//! - `orphan_sweeper`: reclaims knowledge snippets and call sessions that the
//!   per-call path left behind
//!
//! # Usage
//!
//! ```ignore
//! use callctx_api::jobs::{orphan_sweeper_task, OrphanSweeperConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let sweeper = Arc::clone(&coordinator);
//! tokio::spawn(orphan_sweeper_task(sweeper, OrphanSweeperConfig::from_env(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod orphan_sweeper;

pub use orphan_sweeper::{
    classify, orphan_sweeper_task, run_sweep_cycle, OrphanSweeperConfig, OrphanSweeperMetrics,
    OrphanSweeperSnapshot, SweepAction,
};
