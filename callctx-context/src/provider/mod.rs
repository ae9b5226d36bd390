//! HTTP client for the voice-AI provider's knowledge base.

pub mod client;
pub mod types;

pub use client::{HttpContextStore, VoiceProviderConfig};
