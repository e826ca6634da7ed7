//! Per-type time limits and retry policy.

use std::time::Duration;

use taskforge_core::DomainError;

use crate::kind::TaskType;
use crate::task::{AttemptOutcome, Transition};

/// Time limits and retry budget for one task type.
///
/// Only [`TaskPolicy::new`] builds one, so the soft limit is always below the
/// hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPolicy {
    hard_time_limit: Duration,
    soft_time_limit: Duration,
    max_retries: u32,
    base_retry_delay: Duration,
}

impl TaskPolicy {
    pub fn new(
        hard_time_limit: Duration,
        soft_time_limit: Duration,
        max_retries: u32,
        base_retry_delay: Duration,
    ) -> Result<Self, DomainError> {
        if soft_time_limit >= hard_time_limit {
            return Err(DomainError::validation(format!(
                "soft limit {soft_time_limit:?} must be below hard limit {hard_time_limit:?}"
            )));
        }
        Ok(Self {
            hard_time_limit,
            soft_time_limit,
            max_retries,
            base_retry_delay,
        })
    }

    /// Attempt is forcibly abandoned after this long
    pub fn hard_time_limit(&self) -> Duration {
        self.hard_time_limit
    }

    /// Body is asked to wind down after this long
    pub fn soft_time_limit(&self) -> Duration {
        self.soft_time_limit
    }

    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Linear backoff unit: n-th retry waits `base_retry_delay * n`
    pub fn base_retry_delay(&self) -> Duration {
        self.base_retry_delay
    }

    /// Delay before the given retry (1-indexed) becomes claimable.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.base_retry_delay.saturating_mul(retry)
    }

    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_retries
    }

    /// Turn a classified attempt result into the store transition to apply.
    ///
    /// `None` means the attempt was cancelled and the store already holds the
    /// terminal state.
    pub fn decide(&self, attempt_count: u32, classification: Classification) -> Option<Transition> {
        match classification {
            Classification::Succeeded(result) => Some(Transition::Complete { result }),
            Classification::Permanent { detail } => Some(Transition::Fail {
                error: detail,
                outcome: AttemptOutcome::Failed,
            }),
            Classification::Transient { detail, outcome } => {
                Some(self.retry_or_fail(attempt_count, detail, outcome))
            }
            Classification::Infrastructure { detail } => Some(self.retry_or_fail(
                attempt_count,
                detail,
                AttemptOutcome::LeaseExpired,
            )),
            Classification::Cancelled => None,
        }
    }

    fn retry_or_fail(&self, attempt_count: u32, detail: String, outcome: AttemptOutcome) -> Transition {
        if self.should_retry(attempt_count) {
            Transition::Retry {
                error: detail,
                delay: self.delay_for_retry(attempt_count + 1),
                outcome,
            }
        } else {
            Transition::Fail {
                error: format!("{} (gave up after {} attempts)", detail, attempt_count + 1),
                outcome,
            }
        }
    }
}

/// Non-exceptional category of an attempt's end.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Succeeded(serde_json::Value),
    /// Body error, panic, or time limit exceeded.
    Transient {
        detail: String,
        outcome: AttemptOutcome,
    },
    /// Body declared the failure unrecoverable.
    Permanent { detail: String },
    /// The executing worker vanished (lease expired without a heartbeat).
    Infrastructure { detail: String },
    Cancelled,
}

/// Policy for every task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    video_generation: TaskPolicy,
    audio_processing: TaskPolicy,
    document_processing: TaskPolicy,
    ai_training: TaskPolicy,
    maintenance: TaskPolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mins = |m: u64| Duration::from_secs(m * 60);
        let secs = Duration::from_secs;
        Self {
            video_generation: TaskPolicy::preset(mins(60), mins(55), 3, secs(60)),
            audio_processing: TaskPolicy::preset(mins(30), mins(27), 3, secs(30)),
            document_processing: TaskPolicy::preset(mins(15), mins(14), 3, secs(30)),
            ai_training: TaskPolicy::preset(mins(120), mins(110), 2, mins(5)),
            maintenance: TaskPolicy::preset(mins(10), mins(9), 1, secs(60)),
        }
    }
}

impl TaskPolicy {
    /// Built-in defaults. Every call site passes soft < hard.
    fn preset(hard: Duration, soft: Duration, max_retries: u32, base_retry_delay: Duration) -> Self {
        debug_assert!(soft < hard, "preset soft limit must be below hard limit");
        Self {
            hard_time_limit: hard,
            soft_time_limit: soft,
            max_retries,
            base_retry_delay,
        }
    }
}

impl PolicyTable {
    /// Same policy for every type (handy for tests and single-purpose pools).
    pub fn uniform(policy: TaskPolicy) -> Self {
        Self {
            video_generation: policy,
            audio_processing: policy,
            document_processing: policy,
            ai_training: policy,
            maintenance: policy,
        }
    }

    pub fn get(&self, task_type: TaskType) -> &TaskPolicy {
        match task_type {
            TaskType::VideoGeneration => &self.video_generation,
            TaskType::AudioProcessing => &self.audio_processing,
            TaskType::DocumentProcessing => &self.document_processing,
            TaskType::AiTraining => &self.ai_training,
            TaskType::Maintenance => &self.maintenance,
        }
    }

    pub fn with(mut self, task_type: TaskType, policy: TaskPolicy) -> Self {
        let slot = match task_type {
            TaskType::VideoGeneration => &mut self.video_generation,
            TaskType::AudioProcessing => &mut self.audio_processing,
            TaskType::DocumentProcessing => &mut self.document_processing,
            TaskType::AiTraining => &mut self.ai_training,
            TaskType::Maintenance => &mut self.maintenance,
        };
        *slot = policy;
        self
    }

    /// Longest hard limit across all types.
    pub fn max_hard_limit(&self) -> Duration {
        TaskType::ALL
            .iter()
            .map(|t| self.get(*t).hard_time_limit())
            .max()
            .unwrap_or_default()
    }
}
