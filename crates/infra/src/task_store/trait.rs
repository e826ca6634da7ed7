use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use taskforge_core::{OwnerId, TaskId, WorkerId};
use taskforge_tasks::{Lane, LaneDepths, Lease, PolicyTable, Task, TaskStatus, Transition};

/// Task persistence abstraction.
///
/// Synchronous on purpose: workers run on plain threads. Async callers should
/// go through `spawn_blocking`.
pub trait TaskStore: Send + Sync {
    /// Persist a freshly created task.
    fn insert(&self, task: Task) -> Result<TaskId, StoreError>;

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Tasks submitted by `owner`, oldest first.
    fn list_by_owner(&self, owner: &OwnerId, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Tasks currently in `status`, oldest first.
    fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Number of claimable tasks per lane at `now`.
    fn ready_depths(&self, now: DateTime<Utc>) -> Result<LaneDepths, StoreError>;

    /// Atomically move the oldest claimable task of `lane` to processing.
    ///
    /// Returns `None` when the lane has nothing claimable.
    fn claim_next(
        &self,
        lane: Lane,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<Option<(Task, Lease)>, StoreError>;

    /// Extend the lease if it still owns the attempt.
    fn heartbeat(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        extend: Duration,
    ) -> Result<LeaseState, StoreError>;

    /// Apply the transition that ends the attempt owned by `lease`.
    ///
    /// Returns `None` (and changes nothing) when the lease no longer owns the
    /// attempt, e.g. because the task was cancelled or reclaimed meanwhile.
    fn finish(
        &self,
        lease: &Lease,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Move a pending or processing task to cancelled.
    fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, StoreError>;

    /// Settle every processing task whose lease has expired, as an
    /// infrastructure failure under its type's policy.
    fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        policies: &PolicyTable,
    ) -> Result<Vec<Task>, StoreError>;

    fn stats(&self) -> Result<TaskStats, StoreError>;
}

/// Result of a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    /// Still the owner; carries the extended lease.
    Held(Lease),
    /// Ownership is gone. `status` is the task's current status (`None` if
    /// the task no longer exists).
    Lost { status: Option<TaskStatus> },
}

/// Task store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("task {id} is already {status}")]
    AlreadyTerminal { id: TaskId, status: TaskStatus },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskStats {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Processing => self.processing += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

impl<T: TaskStore + ?Sized> TaskStore for Arc<T> {
    fn insert(&self, task: Task) -> Result<TaskId, StoreError> {
        (**self).insert(task)
    }

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        (**self).get(id)
    }

    fn list_by_owner(&self, owner: &OwnerId, limit: usize) -> Result<Vec<Task>, StoreError> {
        (**self).list_by_owner(owner, limit)
    }

    fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
        (**self).list_by_status(status, limit)
    }

    fn ready_depths(&self, now: DateTime<Utc>) -> Result<LaneDepths, StoreError> {
        (**self).ready_depths(now)
    }

    fn claim_next(
        &self,
        lane: Lane,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<Option<(Task, Lease)>, StoreError> {
        (**self).claim_next(lane, worker_id, now, lease_for)
    }

    fn heartbeat(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        extend: Duration,
    ) -> Result<LeaseState, StoreError> {
        (**self).heartbeat(lease, now, extend)
    }

    fn finish(
        &self,
        lease: &Lease,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        (**self).finish(lease, transition, now)
    }

    fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, StoreError> {
        (**self).cancel(id, now)
    }

    fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        policies: &PolicyTable,
    ) -> Result<Vec<Task>, StoreError> {
        (**self).reclaim_expired(now, policies)
    }

    fn stats(&self) -> Result<TaskStats, StoreError> {
        (**self).stats()
    }
}
