//! Task domain: records, lifecycle transitions, lane routing and per-type policy.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──claim──▶ processing ──▶ completed | failed | cancelled
//!    ▲                    │
//!    └──── retry ─────────┘   (only while attempt_count < max_retries)
//! pending ──cancel──▶ cancelled
//! ```
//!
//! Everything here is pure: stores call these methods inside their own atomic
//! update so that the rules live in exactly one place.

pub mod error;
pub mod kind;
pub mod policy;
pub mod task;

pub use error::{TaskError, TransitionError};
pub use kind::{route, Lane, LaneDepths, TaskType};
pub use policy::{Classification, PolicyTable, TaskPolicy};
pub use task::{AttemptOutcome, AttemptRecord, Lease, Task, TaskStatus, Transition};
