//! Infrastructure layer: task storage, execution and periodic triggers.

pub mod maintenance;
pub mod scheduler;
pub mod service;
pub mod task_store;
pub mod workers;

pub use maintenance::TempCleanupHandler;
pub use scheduler::{FireOutcome, ScheduleEntry, ScheduleError, Scheduler, SchedulerConfig, SchedulerHandle};
pub use service::{CancelError, SubmitError, TaskService};
pub use task_store::{InMemoryTaskStore, LeaseState, PostgresTaskStore, StoreError, TaskStats, TaskStore};
pub use workers::{
    AttemptContext, FairnessConfig, HandlerRegistry, PoolConfig, PoolHandle, PoolStats, TaskHandler,
    WorkerPool,
};
