//! Task execution: worker pool, attempt supervision and lane fairness.
//!
//! ## Components
//!
//! - `WorkerPool`: claims tasks lane by lane and hands them to the supervisor
//! - `Supervisor`: runs one attempt under soft/hard limits, heartbeats the lease,
//!   classifies the outcome and settles it in the store
//! - `LaneSelector`: strict lane priority with bounded skips for lower lanes
//! - `TaskHandler` / `HandlerRegistry`: task bodies keyed by task type

pub mod fairness;
pub mod handler;
pub mod pool;
pub mod supervisor;

pub use fairness::{FairnessConfig, LaneSelector};
pub use handler::{AttemptContext, HandlerRegistry, StopReason, TaskHandler};
pub use pool::{PoolConfig, PoolHandle, PoolStats, WorkerPool};
pub use supervisor::{classify, AttemptEnd, AttemptReport, RawOutcome, Supervisor};
