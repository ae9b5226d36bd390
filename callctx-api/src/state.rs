//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Instant;

use callctx_storage::CallctxStore;

use crate::services::CallCoordinator;
use crate::webhook_signature::WebhookVerifier;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Session, patient and transcript persistence.
    pub store: Arc<dyn CallctxStore>,
    pub coordinator: Arc<CallCoordinator>,
    pub webhook: Arc<WebhookVerifier>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(coordinator: Arc<CallCoordinator>, webhook: WebhookVerifier) -> Self {
        Self {
            store: Arc::clone(coordinator.store()),
            coordinator,
            webhook: Arc::new(webhook),
            start_time: Instant::now(),
        }
    }
}

crate::impl_from_ref!(Arc<dyn CallctxStore>, store);
crate::impl_from_ref!(Arc<CallCoordinator>, coordinator);
crate::impl_from_ref!(Arc<WebhookVerifier>, webhook);
crate::impl_from_ref!(Instant, start_time);
