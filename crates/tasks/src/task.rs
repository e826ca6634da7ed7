//! The task record and its lifecycle transitions.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskforge_core::{DomainError, OwnerId, TaskId, WorkerId};

use crate::error::TransitionError;
use crate::kind::{route, Lane, TaskType};

/// Longest `error_detail` kept on a task (characters).
pub const MAX_ERROR_DETAIL: usize = 500;

/// Lifecycle status of a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    Completed,
    Failed,
    /// Cancelled by the owner; never retried
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown task status: {s}")))
    }
}

/// Ownership of one processing attempt.
///
/// Only the holder of a matching lease may heartbeat or settle the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    /// `attempt_count` at claim time
    pub attempt: u32,
    pub expires_at: DateTime<Utc>,
}

/// How an attempt ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
    LeaseExpired,
    Cancelled,
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub worker_id: Option<WorkerId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
}

/// The single state change that ends a processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Complete {
        result: serde_json::Value,
    },
    /// Back to pending; claimable again after `delay`.
    Retry {
        error: String,
        delay: Duration,
        outcome: AttemptOutcome,
    },
    Fail {
        error: String,
        outcome: AttemptOutcome,
    },
}

impl Transition {
    pub fn complete(result: serde_json::Value) -> Self {
        Self::Complete { result }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
            outcome: AttemptOutcome::Failed,
        }
    }
}

/// One submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub owner_id: OwnerId,
    pub input_payload: serde_json::Value,
    pub result_payload: Option<serde_json::Value>,
    pub error_detail: Option<String>,
    /// Number of retries so far (0 on the first attempt)
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant (retry backoff)
    pub available_at: DateTime<Utc>,
    /// Start of the current attempt
    pub started_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub history: Vec<AttemptRecord>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(task_type: TaskType, owner_id: OwnerId, input_payload: serde_json::Value) -> Self {
        Self::new_at(task_type, owner_id, input_payload, Utc::now())
    }

    pub fn new_at(
        task_type: TaskType,
        owner_id: OwnerId,
        input_payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            status: TaskStatus::Pending,
            owner_id,
            input_payload,
            result_payload: None,
            error_detail: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            available_at: now,
            started_at: None,
            lease: None,
            history: Vec::new(),
        }
    }

    pub fn lane(&self) -> Lane {
        route(self.task_type)
    }

    /// Pending and past its backoff gate.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.available_at <= now
    }

    /// `pending → processing`. Returns the lease that owns the new attempt.
    pub fn claim(
        &mut self,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<Lease, TransitionError> {
        if self.status != TaskStatus::Pending {
            return Err(TransitionError::NotClaimable {
                status: self.status,
            });
        }
        if self.available_at > now {
            return Err(TransitionError::BackoffPending {
                available_at: self.available_at,
            });
        }

        let lease = Lease {
            task_id: self.id,
            worker_id,
            attempt: self.attempt_count,
            expires_at: after(now, lease_for),
        };
        self.status = TaskStatus::Processing;
        self.started_at = Some(now);
        self.lease = Some(lease.clone());
        self.updated_at = now;
        Ok(lease)
    }

    /// Whether `lease` still owns the current processing attempt.
    pub fn holds(&self, lease: &Lease) -> bool {
        self.status == TaskStatus::Processing
            && self.attempt_count == lease.attempt
            && self
                .lease
                .as_ref()
                .is_some_and(|l| l.worker_id == lease.worker_id && l.attempt == lease.attempt)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && self.lease.as_ref().is_none_or(|l| l.expires_at <= now)
    }

    /// Push the lease expiry forward. Returns the refreshed lease.
    pub fn extend_lease(
        &mut self,
        lease: &Lease,
        now: DateTime<Utc>,
        extend: Duration,
    ) -> Result<Lease, TransitionError> {
        if !self.holds(lease) {
            return Err(TransitionError::NotOwner);
        }
        let refreshed = Lease {
            expires_at: after(now, extend),
            ..lease.clone()
        };
        self.lease = Some(refreshed.clone());
        self.updated_at = now;
        Ok(refreshed)
    }

    /// End the attempt owned by `lease`.
    pub fn apply(
        &mut self,
        lease: &Lease,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.holds(lease) {
            return Err(TransitionError::NotOwner);
        }
        self.settle(transition, now);
        Ok(())
    }

    /// End an attempt whose worker stopped heartbeating.
    pub fn reclaim(
        &mut self,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Processing {
            return Err(TransitionError::NotClaimable {
                status: self.status,
            });
        }
        if !self.lease_expired(now) {
            return Err(TransitionError::NotOwner);
        }
        self.settle(transition, now);
        Ok(())
    }

    /// `pending | processing → cancelled`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                status: self.status,
            });
        }
        if self.status == TaskStatus::Processing {
            self.record_attempt(AttemptOutcome::Cancelled, None, now);
        }
        self.status = TaskStatus::Cancelled;
        self.lease = None;
        self.started_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    fn settle(&mut self, transition: Transition, now: DateTime<Utc>) {
        match transition {
            Transition::Complete { result } => {
                self.record_attempt(AttemptOutcome::Succeeded, None, now);
                self.status = TaskStatus::Completed;
                self.result_payload = Some(result);
                self.error_detail = None;
                self.completed_at = Some(now);
            }
            Transition::Retry {
                error,
                delay,
                outcome,
            } => {
                self.record_attempt(outcome, Some(summarize_error(&error)), now);
                self.status = TaskStatus::Pending;
                self.attempt_count += 1;
                self.available_at = after(now, delay);
            }
            Transition::Fail { error, outcome } => {
                let detail = summarize_error(&error);
                self.record_attempt(outcome, Some(detail.clone()), now);
                self.status = TaskStatus::Failed;
                self.result_payload = None;
                self.error_detail = Some(detail);
                self.completed_at = Some(now);
            }
        }
        self.lease = None;
        self.started_at = None;
        self.updated_at = now;
    }

    fn record_attempt(&mut self, outcome: AttemptOutcome, error: Option<String>, now: DateTime<Utc>) {
        self.history.push(AttemptRecord {
            attempt: self.attempt_count + 1,
            worker_id: self.lease.as_ref().map(|l| l.worker_id),
            started_at: self.started_at.unwrap_or(now),
            finished_at: now,
            outcome,
            error,
        });
    }
}

/// Reduce an arbitrary error message to a one-line, bounded summary.
pub fn summarize_error(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown error");

    if line.chars().count() <= MAX_ERROR_DETAIL {
        return line.to_string();
    }
    let mut out: String = line.chars().take(MAX_ERROR_DETAIL - 1).collect();
    out.push('…');
    out
}

fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
