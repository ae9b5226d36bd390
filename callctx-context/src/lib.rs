//! Per-call knowledge snippets
//!
//! Assembles the private summary a voice agent sees during one call and
//! manages its lifecycle in the provider's knowledge base.

mod assembly;
mod store;

pub mod provider;

pub use assembly::*;
pub use provider::{HttpContextStore, VoiceProviderConfig};
pub use store::{release_snippet, with_timeout, ContextStore, InMemoryContextStore};
