//! Task bodies and the context they run under.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use taskforge_tasks::{Task, TaskError, TaskType};

/// Why an attempt was asked to stop.
///
/// Ordered by severity: a stronger reason replaces a weaker one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopReason {
    SoftLimit,
    Cancelled,
    LeaseLost,
    HardLimit,
}

impl StopReason {
    fn code(self) -> u8 {
        match self {
            StopReason::SoftLimit => 1,
            StopReason::Cancelled => 2,
            StopReason::LeaseLost => 3,
            StopReason::HardLimit => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StopReason::SoftLimit),
            2 => Some(StopReason::Cancelled),
            3 => Some(StopReason::LeaseLost),
            4 => Some(StopReason::HardLimit),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::SoftLimit => "soft time limit reached",
            StopReason::Cancelled => "task cancelled",
            StopReason::LeaseLost => "lease lost",
            StopReason::HardLimit => "hard time limit reached",
        })
    }
}

/// Stop flag shared between a supervisor and the attempt it watches.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    reason: AtomicU8,
}

impl StopSignal {
    pub(crate) fn raise(&self, reason: StopReason) {
        self.reason.fetch_max(reason.code(), Ordering::AcqRel);
    }

    pub(crate) fn reason(&self) -> Option<StopReason> {
        StopReason::from_code(self.reason.load(Ordering::Acquire))
    }
}

/// What a running task body can observe about its attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    signal: Arc<StopSignal>,
    attempt: u32,
    soft_deadline: Instant,
    hard_deadline: Instant,
}

impl AttemptContext {
    pub(crate) fn new(
        signal: Arc<StopSignal>,
        attempt: u32,
        soft_deadline: Instant,
        hard_deadline: Instant,
    ) -> Self {
        Self {
            signal,
            attempt,
            soft_deadline,
            hard_deadline,
        }
    }

    /// Context with no deadline pressure, for calling handlers directly.
    pub fn detached(attempt: u32) -> Self {
        let far = Instant::now() + std::time::Duration::from_secs(365 * 24 * 3600);
        Self::new(Arc::default(), attempt, far, far)
    }

    /// Long-running bodies should poll this and wind down when it turns true.
    pub fn should_stop(&self) -> bool {
        self.signal.reason().is_some()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.signal.reason()
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn soft_deadline(&self) -> Instant {
        self.soft_deadline
    }

    pub fn hard_deadline(&self) -> Instant {
        self.hard_deadline
    }
}

/// A task body.
///
/// `Err(TaskError::Retryable)` and panics are retried under the task
/// type's policy; `Err(TaskError::Fatal)` fails the task immediately.
pub trait TaskHandler: Send + Sync + 'static {
    fn run(&self, task: &Task, ctx: &AttemptContext) -> Result<Value, TaskError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Task, &AttemptContext) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    fn run(&self, task: &Task, ctx: &AttemptContext) -> Result<Value, TaskError> {
        self(task, ctx)
    }
}

/// Handlers by task type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: TaskHandler>(&mut self, task_type: TaskType, handler: H) {
        self.handlers.insert(task_type, Arc::new(handler));
    }

    pub fn with<H: TaskHandler>(mut self, task_type: TaskType, handler: H) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn registered(&self) -> impl Iterator<Item = TaskType> + '_ {
        self.handlers.keys().copied()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stronger_stop_reason_wins() {
        let signal = StopSignal::default();
        assert_eq!(signal.reason(), None);
        signal.raise(StopReason::Cancelled);
        signal.raise(StopReason::SoftLimit);
        assert_eq!(signal.reason(), Some(StopReason::Cancelled));
        signal.raise(StopReason::HardLimit);
        assert_eq!(signal.reason(), Some(StopReason::HardLimit));
    }

    #[test]
    fn context_observes_signal() {
        let signal = Arc::new(StopSignal::default());
        let now = Instant::now();
        let ctx = AttemptContext::new(signal.clone(), 2, now, now);
        assert!(!ctx.should_stop());
        signal.raise(StopReason::SoftLimit);
        assert!(ctx.should_stop());
        assert_eq!(ctx.stop_reason(), Some(StopReason::SoftLimit));
        assert_eq!(ctx.attempt(), 2);
    }

    #[test]
    fn closures_register_as_handlers() {
        let registry = HandlerRegistry::new()
            .with(TaskType::VideoGeneration, |_: &Task, _: &AttemptContext| {
                Ok::<_, TaskError>(json!({"frames": 24}))
            });
        assert!(registry.get(TaskType::VideoGeneration).is_some());
        assert!(registry.get(TaskType::AudioProcessing).is_none());

        let task = Task::new(TaskType::VideoGeneration, "alice".parse().unwrap(), json!({}));
        let out = registry
            .get(TaskType::VideoGeneration)
            .unwrap()
            .run(&task, &AttemptContext::detached(1))
            .unwrap();
        assert_eq!(out, json!({"frames": 24}));
    }
}
