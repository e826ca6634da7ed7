//! Runs one attempt under its time limits and settles the outcome.
//!
//! The body runs on its own thread. The supervising worker thread waits for
//! its result while it heartbeats the lease, raises the soft-limit signal, and
//! reacts to cancellation. At the hard limit the body thread is abandoned:
//! threads cannot be killed, but the attempt is settled as timed out right
//! away and anything the body does afterwards is ignored, because its lease no
//! longer owns the task.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use taskforge_core::TaskId;
use taskforge_tasks::{
    AttemptOutcome, Classification, Lease, Task, TaskError, TaskPolicy, TaskStatus, TaskType,
    Transition,
};

use super::handler::{AttemptContext, StopReason, StopSignal, TaskHandler};
use crate::task_store::{LeaseState, TaskStore};

/// What the attempt produced before any policy is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutcome {
    Returned(Result<Value, TaskError>),
    Panicked(String),
    HardLimit(Duration),
    NoHandler(TaskType),
}

/// Map a raw outcome onto the failure taxonomy.
///
/// `cancelled` wins over everything; `soft_limited` turns a retryable error
/// into a timeout.
pub fn classify(raw: RawOutcome, cancelled: bool, soft_limited: bool) -> Classification {
    if cancelled {
        return Classification::Cancelled;
    }
    match raw {
        RawOutcome::Returned(Ok(result)) => Classification::Succeeded(result),
        RawOutcome::Returned(Err(TaskError::Fatal(detail))) => Classification::Permanent { detail },
        RawOutcome::Returned(Err(TaskError::Retryable(detail))) if soft_limited => {
            Classification::Transient {
                detail: format!("soft time limit exceeded: {detail}"),
                outcome: AttemptOutcome::TimedOut,
            }
        }
        RawOutcome::Returned(Err(TaskError::Retryable(detail))) => Classification::Transient {
            detail,
            outcome: AttemptOutcome::Failed,
        },
        RawOutcome::Panicked(msg) => Classification::Transient {
            detail: format!("task panicked: {msg}"),
            outcome: AttemptOutcome::Failed,
        },
        RawOutcome::HardLimit(limit) => Classification::Transient {
            detail: format!("hard time limit of {}s exceeded", limit.as_secs_f64()),
            outcome: AttemptOutcome::TimedOut,
        },
        RawOutcome::NoHandler(task_type) => Classification::Permanent {
            detail: format!("no handler registered for task type {task_type}"),
        },
    }
}

/// How an attempt ended from the worker's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttemptEnd {
    Completed,
    Retried,
    Failed,
    Cancelled,
    /// Another party took the task over (e.g. the reaper after missed heartbeats).
    LeaseLost,
    /// The store rejected the settle; the lease will expire and the reaper retries.
    Unsettled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub task_id: TaskId,
    pub end: AttemptEnd,
    pub soft_limited: bool,
    pub hard_limited: bool,
}

/// Per-attempt supervision settings.
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    pub heartbeat_interval: Duration,
    /// Lease validity granted on each heartbeat
    pub lease_ttl: Duration,
}

enum Ending {
    Raw(RawOutcome),
    Abandoned,
}

impl Supervisor {
    pub fn run_attempt<S: TaskStore + ?Sized>(
        &self,
        store: &S,
        task: Task,
        lease: Lease,
        handler: Option<Arc<dyn TaskHandler>>,
        policy: &TaskPolicy,
    ) -> AttemptReport {
        let task_id = task.id;
        let task_type = task.task_type;
        let mut report = AttemptReport {
            task_id,
            end: AttemptEnd::Unsettled,
            soft_limited: false,
            hard_limited: false,
        };

        let mut cancelled = false;
        let raw = match handler {
            None => RawOutcome::NoHandler(task_type),
            Some(handler) => {
                let ending = self.watch(
                    store,
                    task,
                    lease.clone(),
                    handler,
                    policy,
                    &mut report,
                    &mut cancelled,
                );
                match ending {
                    Ending::Abandoned => {
                        report.end = AttemptEnd::LeaseLost;
                        return report;
                    }
                    Ending::Raw(raw) => raw,
                }
            }
        };

        // The store already holds the cancellation; nothing is settled for it.
        let classification = classify(raw, cancelled, report.soft_limited);
        let Some(transition) = policy.decide(lease.attempt, classification) else {
            report.end = AttemptEnd::Cancelled;
            return report;
        };
        report.end = self.settle(store, &lease, task_type, transition);
        report
    }

    /// Wait for the body while keeping the lease alive and enforcing limits.
    #[allow(clippy::too_many_arguments)]
    fn watch<S: TaskStore + ?Sized>(
        &self,
        store: &S,
        task: Task,
        mut lease: Lease,
        handler: Arc<dyn TaskHandler>,
        policy: &TaskPolicy,
        report: &mut AttemptReport,
        cancelled: &mut bool,
    ) -> Ending {
        let task_id = task.id;
        let started = Instant::now();
        let soft_at = started + policy.soft_time_limit();
        let hard_at = started + policy.hard_time_limit();
        let signal = Arc::new(StopSignal::default());
        let ctx = AttemptContext::new(signal.clone(), lease.attempt + 1, soft_at, hard_at);

        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("attempt-{task_id}"))
            .spawn(move || {
                let out = panic::catch_unwind(AssertUnwindSafe(|| handler.run(&task, &ctx)));
                // The supervisor may have given up on us already.
                let _ = tx.send(out.map_err(panic_message));
            });
        if let Err(e) = spawned {
            return Ending::Raw(RawOutcome::Returned(Err(TaskError::retryable(format!(
                "failed to spawn attempt thread: {e}"
            )))));
        }

        let mut next_beat = started + self.heartbeat_interval;
        loop {
            let now = Instant::now();
            if now >= hard_at {
                signal.raise(StopReason::HardLimit);
                report.hard_limited = true;
                warn!(
                    task_id = %task_id,
                    limit_secs = policy.hard_time_limit().as_secs_f64(),
                    "hard time limit reached, abandoning attempt"
                );
                return Ending::Raw(RawOutcome::HardLimit(policy.hard_time_limit()));
            }
            if now >= soft_at && !report.soft_limited {
                signal.raise(StopReason::SoftLimit);
                report.soft_limited = true;
                info!(
                    task_id = %task_id,
                    limit_secs = policy.soft_time_limit().as_secs_f64(),
                    "soft time limit reached, asking task to stop"
                );
            }
            if now >= next_beat && !*cancelled {
                match store.heartbeat(&lease, Utc::now(), self.lease_ttl) {
                    Ok(LeaseState::Held(refreshed)) => lease = refreshed,
                    Ok(LeaseState::Lost {
                        status: Some(TaskStatus::Cancelled),
                    }) => {
                        *cancelled = true;
                        signal.raise(StopReason::Cancelled);
                        info!(task_id = %task_id, "task cancelled while running");
                    }
                    Ok(LeaseState::Lost { status }) => {
                        signal.raise(StopReason::LeaseLost);
                        warn!(task_id = %task_id, ?status, "lease lost, abandoning attempt");
                        return Ending::Abandoned;
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "heartbeat failed"),
                }
                next_beat = now + self.heartbeat_interval;
            }

            let mut wake = hard_at;
            if !*cancelled {
                wake = wake.min(next_beat);
            }
            if !report.soft_limited {
                wake = wake.min(soft_at);
            }
            match rx.recv_timeout(wake.saturating_duration_since(Instant::now())) {
                Ok(Ok(result)) => return Ending::Raw(RawOutcome::Returned(result)),
                Ok(Err(msg)) => return Ending::Raw(RawOutcome::Panicked(msg)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Ending::Raw(RawOutcome::Panicked(
                        "attempt thread exited without a result".to_string(),
                    ));
                }
            }
        }
    }

    fn settle<S: TaskStore + ?Sized>(
        &self,
        store: &S,
        lease: &Lease,
        task_type: TaskType,
        transition: Transition,
    ) -> AttemptEnd {
        let task_id = lease.task_id;
        let end = match &transition {
            Transition::Complete { .. } => AttemptEnd::Completed,
            Transition::Retry { error, delay, .. } => {
                info!(
                    task_id = %task_id,
                    task_type = %task_type,
                    attempt = lease.attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "task attempt failed, will retry"
                );
                AttemptEnd::Retried
            }
            Transition::Fail { error, .. } => {
                warn!(
                    task_id = %task_id,
                    task_type = %task_type,
                    attempt = lease.attempt + 1,
                    error = %error,
                    "task failed permanently"
                );
                AttemptEnd::Failed
            }
        };

        match store.finish(lease, transition, Utc::now()) {
            Ok(Some(_)) => {
                if end == AttemptEnd::Completed {
                    debug!(task_id = %task_id, task_type = %task_type, "task completed");
                }
                end
            }
            Ok(None) => match store.get(task_id) {
                Ok(Some(t)) if t.status == TaskStatus::Cancelled => AttemptEnd::Cancelled,
                _ => {
                    debug!(task_id = %task_id, "attempt result discarded, lease no longer held");
                    AttemptEnd::LeaseLost
                }
            },
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to record attempt result");
                AttemptEnd::Unsettled
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_store::InMemoryTaskStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use taskforge_tasks::Lane;

    fn supervisor() -> Supervisor {
        Supervisor {
            heartbeat_interval: Duration::from_millis(10),
            lease_ttl: Duration::from_secs(5),
        }
    }

    fn policy(soft_ms: u64, hard_ms: u64, retries: u32) -> TaskPolicy {
        TaskPolicy::new(
            Duration::from_millis(hard_ms),
            Duration::from_millis(soft_ms),
            retries,
            Duration::from_millis(1),
        )
        .unwrap()
    }

    fn claimed(store: &InMemoryTaskStore) -> (Task, Lease) {
        let t = Task::new(TaskType::VideoGeneration, "alice".parse().unwrap(), json!({}));
        store.insert(t).unwrap();
        store
            .claim_next(Lane::High, taskforge_core::WorkerId::new(), Utc::now(), Duration::from_secs(5))
            .unwrap()
            .unwrap()
    }

    fn handler<F>(f: F) -> Option<Arc<dyn TaskHandler>>
    where
        F: Fn(&Task, &AttemptContext) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Some(Arc::new(f))
    }

    #[test]
    fn classification_table() {
        assert_eq!(
            classify(RawOutcome::Returned(Ok(json!(1))), false, false),
            Classification::Succeeded(json!(1))
        );
        assert_eq!(
            classify(RawOutcome::Returned(Err(TaskError::fatal("bad input"))), false, false),
            Classification::Permanent {
                detail: "bad input".into()
            }
        );
        assert!(matches!(
            classify(RawOutcome::Returned(Err(TaskError::retryable("x"))), false, true),
            Classification::Transient {
                outcome: AttemptOutcome::TimedOut,
                ..
            }
        ));
        assert!(matches!(
            classify(RawOutcome::Panicked("boom".into()), false, false),
            Classification::Transient {
                outcome: AttemptOutcome::Failed,
                ..
            }
        ));
        assert_eq!(
            classify(RawOutcome::Returned(Ok(json!(1))), true, false),
            Classification::Cancelled
        );
    }

    #[test]
    fn success_is_recorded() {
        let store = InMemoryTaskStore::new();
        let (task, lease) = claimed(&store);
        let report = supervisor().run_attempt(
            &store,
            task.clone(),
            lease,
            handler(|_, ctx| Ok(json!({"attempt": ctx.attempt()}))),
            &policy(500, 1000, 0),
        );
        assert_eq!(report.end, AttemptEnd::Completed);
        let stored = store.get(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result_payload, Some(json!({"attempt": 1})));
    }

    #[test]
    fn panics_are_transient() {
        let store = InMemoryTaskStore::new();
        let (task, lease) = claimed(&store);
        let report = supervisor().run_attempt(
            &store,
            task.clone(),
            lease,
            handler(|_, _| panic!("decoder exploded")),
            &policy(500, 1000, 2),
        );
        assert_eq!(report.end, AttemptEnd::Retried);
        let stored = store.get(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.history[0].error.as_deref().unwrap().contains("decoder exploded"));
    }

    #[test]
    fn missing_handler_fails_permanently() {
        let store = InMemoryTaskStore::new();
        let (task, lease) = claimed(&store);
        let report = supervisor().run_attempt(&store, task.clone(), lease, None, &policy(500, 1000, 3));
        assert_eq!(report.end, AttemptEnd::Failed);
        let stored = store.get(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.history.len(), 1);
    }

    #[test]
    fn soft_limit_is_signalled_to_cooperative_body() {
        let store = InMemoryTaskStore::new();
        let (task, lease) = claimed(&store);
        let report = supervisor().run_attempt(
            &store,
            task.clone(),
            lease,
            handler(|_, ctx| {
                while !ctx.should_stop() {
                    thread::sleep(Duration::from_millis(2));
                }
                assert_eq!(ctx.stop_reason(), Some(StopReason::SoftLimit));
                Err(TaskError::retryable("stopped early"))
            }),
            &policy(30, 2000, 0),
        );
        assert!(report.soft_limited);
        assert!(!report.hard_limited);
        assert_eq!(report.end, AttemptEnd::Failed);
        let stored = store.get(task.id).unwrap().unwrap();
        assert_eq!(stored.history[0].outcome, AttemptOutcome::TimedOut);
    }

    #[test]
    fn hard_limit_abandons_uncooperative_body() {
        let store = InMemoryTaskStore::new();
        let (task, lease) = claimed(&store);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let started = Instant::now();
        let report = supervisor().run_attempt(
            &store,
            task.clone(),
            lease,
            handler(move |_, _| {
                thread::sleep(Duration::from_millis(800));
                flag.store(true, Ordering::SeqCst);
                Ok(json!("too late"))
            }),
            &policy(20, 60, 1),
        );
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(report.hard_limited);
        assert_eq!(report.end, AttemptEnd::Retried);
        assert!(!finished.load(Ordering::SeqCst));

        let stored = store.get(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.history[0].outcome, AttemptOutcome::TimedOut);
    }

    #[test]
    fn cancelling_an_uncooperative_body_still_ends_cancelled_at_the_hard_limit() {
        let store = Arc::new(InMemoryTaskStore::new());
        let (task, lease) = claimed(&store);
        let id = task.id;
        let canceller = {
            let store = store.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                store.cancel(id, Utc::now()).unwrap();
            })
        };
        let report = Supervisor {
            heartbeat_interval: Duration::from_millis(5),
            lease_ttl: Duration::from_secs(5),
        }
        .run_attempt(
            &*store,
            task,
            lease,
            // Never looks at the stop signal
            handler(|_, _| {
                thread::sleep(Duration::from_millis(600));
                Err(TaskError::retryable("woke up"))
            }),
            &policy(100, 150, 3),
        );
        canceller.join().unwrap();

        assert!(report.hard_limited);
        assert_eq!(report.end, AttemptEnd::Cancelled);
        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.attempt_count, 0);
        assert!(stored.error_detail.is_none());
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.history[0].outcome, AttemptOutcome::Cancelled);
    }

    #[test]
    fn cancellation_reaches_running_body() {
        let store = Arc::new(InMemoryTaskStore::new());
        let (task, lease) = claimed(&store);
        let id = task.id;
        let canceller = {
            let store = store.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                store.cancel(id, Utc::now()).unwrap();
            })
        };
        let report = supervisor().run_attempt(
            &*store,
            task,
            lease,
            handler(|_, ctx| {
                while !ctx.should_stop() {
                    thread::sleep(Duration::from_millis(2));
                }
                Ok(json!("partial"))
            }),
            &policy(1500, 3000, 0),
        );
        canceller.join().unwrap();
        assert_eq!(report.end, AttemptEnd::Cancelled);
        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.result_payload, None);
    }
}
