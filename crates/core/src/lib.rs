//! `taskforge-core`: identifiers and validation errors shared by every crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{OwnerId, TaskId, WorkerId};
