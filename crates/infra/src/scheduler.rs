//! Periodic trigger for maintenance tasks.
//!
//! The scheduler only submits; execution goes through the normal queue and
//! worker pool. A firing is skipped while an earlier task from the same entry
//! is still pending or processing, so a restart or a slow pool never stacks up
//! duplicate cleanup runs. Each entry remembers the task it last fired; only
//! the first check after startup has to search the scheduler's own tasks.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use taskforge_core::{OwnerId, TaskId};
use taskforge_tasks::TaskType;

use crate::service::{SubmitError, TaskService};
use crate::task_store::{StoreError, TaskStore};

/// Owner recorded on scheduler-submitted tasks.
pub const SCHEDULER_OWNER: &str = "system:scheduler";

/// One recurring maintenance submission.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub name: String,
    pub interval: Duration,
    /// Task input; the entry name is added under `"schedule"`
    pub payload: Map<String, Value>,
}

impl ScheduleEntry {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    fn task_payload(&self) -> Value {
        let mut payload = self.payload.clone();
        payload.insert("schedule".to_string(), Value::String(self.name.clone()));
        Value::Object(payload)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due entries are checked
    pub tick: Duration,
    pub entries: Vec<ScheduleEntry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            entries: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_entry(mut self, entry: ScheduleEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Fired { entry: String, task_id: TaskId },
    /// An earlier task of the entry is still live
    Skipped { entry: String, live: TaskId },
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("scheduled submission failed: {0}")]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Slot {
    entry: ScheduleEntry,
    /// `None` until the first firing
    next_due: Option<DateTime<Utc>>,
    /// Task fired (or found live) by the previous check
    last: Option<TaskId>,
}

pub struct Scheduler<S: TaskStore + ?Sized> {
    service: TaskService<S>,
    owner: OwnerId,
    slots: Vec<Slot>,
    tick: Duration,
}

impl<S: TaskStore + ?Sized + 'static> Scheduler<S> {
    /// Every entry is due on the first check.
    pub fn new(service: TaskService<S>, config: SchedulerConfig) -> Result<Self, ScheduleError> {
        let owner: OwnerId = SCHEDULER_OWNER
            .parse()
            .map_err(|e| ScheduleError::Submit(SubmitError::Validation(e)))?;
        let slots = config
            .entries
            .into_iter()
            .map(|entry| Slot {
                entry,
                next_due: None,
                last: None,
            })
            .collect();
        Ok(Self {
            service,
            owner,
            slots,
            tick: config.tick,
        })
    }

    /// Submit every entry due at `now`.
    ///
    /// An entry whose submission fails stays due and is retried next check.
    pub fn fire_due(&mut self, now: DateTime<Utc>) -> Result<Vec<FireOutcome>, ScheduleError> {
        let mut outcomes = Vec::new();
        for i in 0..self.slots.len() {
            if self.slots[i].next_due.is_some_and(|due| now < due) {
                continue;
            }
            let name = self.slots[i].entry.name.clone();
            let live = match self.slots[i].last {
                Some(id) => self.still_live(id)?,
                None => self.find_live(&name)?,
            };
            let outcome = match live {
                Some(live) => {
                    info!(schedule = %name, live_task_id = %live, "earlier run still live, skipping firing");
                    FireOutcome::Skipped { entry: name, live }
                }
                None => {
                    let payload = self.slots[i].entry.task_payload();
                    let task_id =
                        self.service
                            .submit_typed(TaskType::Maintenance, self.owner.clone(), payload)?;
                    info!(schedule = %name, task_id = %task_id, "scheduled task fired");
                    FireOutcome::Fired { entry: name, task_id }
                }
            };
            let slot = &mut self.slots[i];
            slot.last = Some(match &outcome {
                FireOutcome::Fired { task_id, .. } => *task_id,
                FireOutcome::Skipped { live, .. } => *live,
            });
            slot.next_due = Some(advance(now, slot.entry.interval));
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn still_live(&self, id: TaskId) -> Result<Option<TaskId>, StoreError> {
        Ok(self
            .service
            .store()
            .get(id)?
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id))
    }

    /// Search every task the scheduler owns for a live run of `name`.
    fn find_live(&self, name: &str) -> Result<Option<TaskId>, StoreError> {
        let live = self
            .service
            .store()
            .list_by_owner(&self.owner, usize::MAX)?
            .into_iter()
            .find(|t| {
                t.task_type == TaskType::Maintenance
                    && !t.status.is_terminal()
                    && t.input_payload.get("schedule").and_then(Value::as_str) == Some(name)
            });
        Ok(live.map(|t| t.id))
    }

    /// Run `fire_due` every tick on a background thread.
    pub fn spawn(mut self) -> SchedulerHandle
    where
        S: Send + Sync,
    {
        let (tx, rx) = mpsc::channel::<()>();
        let tick = self.tick;
        let join = thread::Builder::new()
            .name("taskforge-scheduler".to_string())
            .spawn(move || {
                info!(entries = self.slots.len(), "scheduler started");
                loop {
                    if let Err(e) = self.fire_due(Utc::now()) {
                        error!(error = %e, "scheduler firing failed");
                    }
                    match rx.recv_timeout(tick) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }
                debug!("scheduler stopped");
            })
            .expect("failed to spawn scheduler thread");
        SchedulerHandle {
            shutdown: tx,
            join: Some(join),
        }
    }
}

fn advance(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_store::InMemoryTaskStore;
    use serde_json::json;
    use std::sync::Arc;
    use taskforge_tasks::{Task, TaskStatus};

    fn scheduler(entries: Vec<ScheduleEntry>) -> (Scheduler<InMemoryTaskStore>, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut config = SchedulerConfig::default();
        for e in entries {
            config = config.with_entry(e);
        }
        let s = Scheduler::new(TaskService::new(store.clone()), config).unwrap();
        (s, store)
    }

    fn fired(outcomes: &[FireOutcome]) -> usize {
        outcomes
            .iter()
            .filter(|o| matches!(o, FireOutcome::Fired { .. }))
            .count()
    }

    #[test]
    fn first_check_fires_every_entry_as_maintenance() {
        let (mut s, store) = scheduler(vec![
            ScheduleEntry::new("temp-cleanup", Duration::from_secs(3600)).with_field("max_age_secs", 60),
            ScheduleEntry::new("vacuum", Duration::from_secs(3600)),
        ]);
        let out = s.fire_due(Utc::now()).unwrap();
        assert_eq!(fired(&out), 2);

        let FireOutcome::Fired { task_id, .. } = &out[0] else {
            panic!("expected a firing, got {out:?}");
        };
        let task = store.get(*task_id).unwrap().unwrap();
        assert_eq!(task.task_type, TaskType::Maintenance);
        assert_eq!(task.owner_id.as_str(), SCHEDULER_OWNER);
        assert_eq!(task.input_payload["schedule"], "temp-cleanup");
        assert_eq!(task.input_payload["max_age_secs"], 60);
    }

    #[test]
    fn entries_wait_for_their_interval() {
        let (mut s, store) = scheduler(vec![ScheduleEntry::new("temp-cleanup", Duration::from_secs(60))]);
        let t0 = Utc::now();
        assert_eq!(fired(&s.fire_due(t0).unwrap()), 1);
        assert!(s.fire_due(t0 + chrono::Duration::seconds(30)).unwrap().is_empty());

        // Let the first run finish so the next firing is not suppressed
        let pending = store.list_by_status(TaskStatus::Pending, 10).unwrap();
        store.cancel(pending[0].id, t0).unwrap();

        assert_eq!(fired(&s.fire_due(t0 + chrono::Duration::seconds(60)).unwrap()), 1);
    }

    #[test]
    fn live_run_suppresses_duplicate_firing() {
        let (mut s, store) = scheduler(vec![ScheduleEntry::new("temp-cleanup", Duration::from_secs(1))]);
        let t0 = Utc::now();
        let first = s.fire_due(t0).unwrap();
        let FireOutcome::Fired { task_id, .. } = first[0].clone() else {
            panic!("expected a firing");
        };

        let again = s.fire_due(t0 + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(
            again,
            vec![FireOutcome::Skipped {
                entry: "temp-cleanup".to_string(),
                live: task_id
            }]
        );
        assert_eq!(store.stats().unwrap().total(), 1);
    }

    #[test]
    fn suppression_holds_behind_a_large_backlog() {
        let (mut s, store) = scheduler(vec![ScheduleEntry::new("temp-cleanup", Duration::from_secs(1))]);
        let t0 = Utc::now();
        let owner: OwnerId = "alice".parse().unwrap();
        for i in 0..1500 {
            let at = t0 - chrono::Duration::seconds(3600) + chrono::Duration::milliseconds(i);
            store
                .insert(Task::new_at(TaskType::VideoGeneration, owner.clone(), json!({}), at))
                .unwrap();
        }

        assert_eq!(fired(&s.fire_due(t0).unwrap()), 1);
        let again = s.fire_due(t0 + chrono::Duration::seconds(5)).unwrap();
        assert!(matches!(again.as_slice(), [FireOutcome::Skipped { .. }]), "{again:?}");

        let live_maintenance = store
            .list_by_status(TaskStatus::Pending, usize::MAX)
            .unwrap()
            .into_iter()
            .filter(|t| t.task_type == TaskType::Maintenance)
            .count();
        assert_eq!(live_maintenance, 1);
    }

    #[test]
    fn restarted_scheduler_finds_the_live_run_it_did_not_fire() {
        let store = Arc::new(InMemoryTaskStore::new());
        let config = SchedulerConfig::default()
            .with_entry(ScheduleEntry::new("temp-cleanup", Duration::from_secs(1)));
        let t0 = Utc::now();

        let mut before = Scheduler::new(TaskService::new(store.clone()), config.clone()).unwrap();
        let FireOutcome::Fired { task_id, .. } = before.fire_due(t0).unwrap()[0].clone() else {
            panic!("expected a firing");
        };
        drop(before);

        let mut after = Scheduler::new(TaskService::new(store.clone()), config).unwrap();
        assert_eq!(
            after.fire_due(t0 + chrono::Duration::seconds(2)).unwrap(),
            vec![FireOutcome::Skipped {
                entry: "temp-cleanup".to_string(),
                live: task_id
            }]
        );

        // Once that run is over the next check fires again
        store.cancel(task_id, t0).unwrap();
        assert_eq!(fired(&after.fire_due(t0 + chrono::Duration::seconds(4)).unwrap()), 1);
    }

    #[test]
    fn spawned_scheduler_fires_and_stops() {
        let store = Arc::new(InMemoryTaskStore::new());
        let config = SchedulerConfig::default()
            .with_tick(Duration::from_millis(10))
            .with_entry(ScheduleEntry::new("temp-cleanup", Duration::from_secs(3600)));
        let handle = Scheduler::new(TaskService::new(store.clone()), config)
            .unwrap()
            .spawn();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while store.stats().unwrap().total() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
        assert_eq!(store.stats().unwrap().total(), 1);
    }
}
