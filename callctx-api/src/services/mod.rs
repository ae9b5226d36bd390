//! Service Layer
//!
//! Business logic for the call lifecycle. Route handlers and background jobs
//! call into these services; persistence goes through the storage traits and
//! snippet operations through the context store.

mod call_coordinator;
mod clinical_merge;
mod correlation;

pub use call_coordinator::*;
pub use clinical_merge::*;
pub use correlation::*;
