//! Storage traits and in-memory implementation for callctx records.
//!
//! The traits are the seam between the services in `callctx-api` and a
//! concrete backend. `InMemoryStore` backs development and tests; the
//! Postgres implementation lives with the API server.

mod memory;
mod traits;

pub use memory::InMemoryStore;
pub use traits::*;
