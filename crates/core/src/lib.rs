//! `stowage-core`
//!
//! Shared building blocks for the offline client.
//!
//! Pure types only: identifiers and the validation error model. No IO.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{TenantId, UserId};
