//! Durable task queue boundary.
//!
//! Every state change goes through one of the conditional operations on
//! [`TaskStore`]: a claim only succeeds on a claimable pending task, and
//! heartbeat/finish only succeed for the holder of the current lease. Two
//! workers can therefore never both own the same attempt, whichever backend
//! is behind the trait.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use r#trait::{LeaseState, StoreError, TaskStats, TaskStore};
