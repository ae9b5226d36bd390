//! callctx Core - Entity Types
//!
//! Data structures shared by every other crate: identifiers, the call state
//! machine, the phone normalizer and the error taxonomy. No IO lives here.

mod config;
mod entities;
mod enums;
mod error;
mod identity;
pub mod phone;

pub use config::*;
pub use entities::*;
pub use enums::*;
pub use error::*;
pub use identity::*;
pub use phone::{normalize_digits, phone_variants, same_number, PhoneNumber};
