use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use taskforge_core::{OwnerId, TaskId, WorkerId};
use taskforge_tasks::{
    Classification, Lane, LaneDepths, Lease, PolicyTable, Task, TaskStatus, Transition,
    TransitionError,
};

use super::r#trait::{LeaseState, StoreError, TaskStats, TaskStore};

/// Index entry: FIFO order within a set.
type Slot = (DateTime<Utc>, TaskId);

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    by_status: HashMap<TaskStatus, BTreeSet<Slot>>,
    by_owner: HashMap<OwnerId, BTreeSet<Slot>>,
    /// Pending tasks by lane (backoff-gated ones included).
    pending: HashMap<Lane, BTreeSet<Slot>>,
}

impl Inner {
    fn index(&mut self, task: &Task) {
        let slot = (task.created_at, task.id);
        self.by_status.entry(task.status).or_default().insert(slot);
        if task.status == TaskStatus::Pending {
            self.pending.entry(task.lane()).or_default().insert(slot);
        }
    }

    fn unindex(&mut self, task: &Task) {
        let slot = (task.created_at, task.id);
        if let Some(set) = self.by_status.get_mut(&task.status) {
            set.remove(&slot);
        }
        if task.status == TaskStatus::Pending {
            if let Some(set) = self.pending.get_mut(&task.lane()) {
                set.remove(&slot);
            }
        }
    }

    /// Run `f` against a copy of one task and store the result, keeping the
    /// indexes in step. Nothing is written when `f` fails.
    fn update<R>(
        &mut self,
        id: TaskId,
        f: impl FnOnce(&mut Task) -> Result<R, TransitionError>,
    ) -> Option<Result<(R, Task), TransitionError>> {
        let mut task = self.tasks.get(&id)?.clone();
        let before = task.clone();
        let out = match f(&mut task) {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };
        self.unindex(&before);
        self.index(&task);
        self.tasks.insert(id, task.clone());
        Some(Ok((out, task)))
    }

    fn collect(&self, slots: Option<&BTreeSet<Slot>>, limit: usize) -> Vec<Task> {
        slots
            .into_iter()
            .flatten()
            .filter_map(|(_, id)| self.tasks.get(id).cloned())
            .take(limit)
            .collect()
    }
}

/// In-memory task store.
///
/// Intended for tests/dev and single-process deployments. All operations
/// take one lock, which is what makes claim and finish atomic.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: RwLock<Inner>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, task: Task) -> Result<TaskId, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        let id = task.id;
        inner
            .by_owner
            .entry(task.owner_id.clone())
            .or_default()
            .insert((task.created_at, id));
        inner.index(&task);
        inner.tasks.insert(id, task);
        Ok(id)
    }

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().unwrap().tasks.get(&id).cloned())
    }

    fn list_by_owner(&self, owner: &OwnerId, limit: usize) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.collect(inner.by_owner.get(owner), limit))
    }

    fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.collect(inner.by_status.get(&status), limit))
    }

    fn ready_depths(&self, now: DateTime<Utc>) -> Result<LaneDepths, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut depths = LaneDepths::default();
        for (lane, slots) in &inner.pending {
            for (_, id) in slots {
                if inner.tasks.get(id).is_some_and(|t| t.is_claimable(now)) {
                    depths.increment(*lane);
                }
            }
        }
        Ok(depths)
    }

    fn claim_next(
        &self,
        lane: Lane,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<Option<(Task, Lease)>, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let candidate = inner.pending.get(&lane).and_then(|slots| {
            slots
                .iter()
                .map(|(_, id)| *id)
                .find(|id| inner.tasks.get(id).is_some_and(|t| t.is_claimable(now)))
        });
        let Some(id) = candidate else {
            return Ok(None);
        };

        match inner.update(id, |t| t.claim(worker_id, now, lease_for)) {
            Some(Ok((lease, task))) => Ok(Some((task, lease))),
            Some(Err(e)) => Err(StoreError::Storage(format!("claim of {id} failed: {e}"))),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn heartbeat(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        extend: Duration,
    ) -> Result<LeaseState, StoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.update(lease.task_id, |t| t.extend_lease(lease, now, extend)) {
            Some(Ok((refreshed, _))) => Ok(LeaseState::Held(refreshed)),
            Some(Err(_)) => Ok(LeaseState::Lost {
                status: inner.tasks.get(&lease.task_id).map(|t| t.status),
            }),
            None => Ok(LeaseState::Lost { status: None }),
        }
    }

    fn finish(
        &self,
        lease: &Lease,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.update(lease.task_id, |t| t.apply(lease, transition, now)) {
            Some(Ok(((), task))) => Ok(Some(task)),
            Some(Err(_)) => Ok(None),
            None => Err(StoreError::NotFound(lease.task_id)),
        }
    }

    fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.update(id, |t| t.cancel(now)) {
            Some(Ok(((), task))) => Ok(task),
            Some(Err(TransitionError::AlreadyTerminal { status })) => {
                Err(StoreError::AlreadyTerminal { id, status })
            }
            Some(Err(e)) => Err(StoreError::Storage(format!("cancel of {id} failed: {e}"))),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        policies: &PolicyTable,
    ) -> Result<Vec<Task>, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let expired: Vec<TaskId> = inner
            .by_status
            .get(&TaskStatus::Processing)
            .into_iter()
            .flatten()
            .map(|(_, id)| *id)
            .filter(|id| inner.tasks.get(id).is_some_and(|t| t.lease_expired(now)))
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for id in expired {
            let result = inner.update(id, |t| {
                let transition = policies
                    .get(t.task_type)
                    .decide(t.attempt_count, expired_lease())
                    .ok_or(TransitionError::NotOwner)?;
                t.reclaim(transition, now)
            });
            if let Some(Ok(((), task))) = result {
                reclaimed.push(task);
            }
        }
        Ok(reclaimed)
    }

    fn stats(&self) -> Result<TaskStats, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut stats = TaskStats::default();
        for (status, slots) in &inner.by_status {
            stats.add(*status, slots.len());
        }
        Ok(stats)
    }
}

pub(crate) fn expired_lease() -> Classification {
    Classification::Infrastructure {
        detail: "worker lease expired without heartbeat".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use taskforge_tasks::{AttemptOutcome, TaskType};

    fn owner(s: &str) -> OwnerId {
        s.parse().unwrap()
    }

    fn task_at(task_type: TaskType, who: &str, now: DateTime<Utc>) -> Task {
        Task::new_at(task_type, owner(who), json!({}), now)
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[test]
    fn insert_and_get_round_trip() {
        let store = InMemoryTaskStore::new();
        let t = Task::new(TaskType::AudioProcessing, owner("alice"), json!({"k": 1}));
        let id = store.insert(t.clone()).unwrap();
        assert_eq!(store.get(id).unwrap(), Some(t.clone()));
        assert_eq!(store.insert(t), Err(StoreError::AlreadyExists(id)));
        assert_eq!(store.get(TaskId::new()).unwrap(), None);
    }

    #[test]
    fn claim_is_fifo_within_lane_and_respects_lane() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let first = task_at(TaskType::VideoGeneration, "a", now);
        let second = task_at(TaskType::AudioProcessing, "a", now + ChronoDuration::seconds(1));
        let low = task_at(TaskType::DocumentProcessing, "a", now);
        store.insert(second.clone()).unwrap();
        store.insert(first.clone()).unwrap();
        store.insert(low.clone()).unwrap();

        let later = now + ChronoDuration::seconds(5);
        let (claimed, lease) = store
            .claim_next(Lane::High, WorkerId::new(), later, LEASE)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(lease.attempt, 0);

        let (claimed, _) = store
            .claim_next(Lane::High, WorkerId::new(), later, LEASE)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(store
            .claim_next(Lane::High, WorkerId::new(), later, LEASE)
            .unwrap()
            .is_none());
        assert!(store
            .claim_next(Lane::Medium, WorkerId::new(), later, LEASE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn concurrent_claims_never_share_a_task() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        for _ in 0..200 {
            store.insert(task_at(TaskType::VideoGeneration, "a", now)).unwrap();
        }

        let claimed = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let worker = WorkerId::new();
                    while let Some((t, _)) = store.claim_next(Lane::High, worker, now, LEASE).unwrap() {
                        claimed.lock().unwrap().push(t.id);
                    }
                });
            }
        });

        let mut ids = claimed.into_inner().unwrap();
        assert_eq!(ids.len(), 200);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn backoff_gates_claims_and_depths() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let t = task_at(TaskType::VideoGeneration, "a", now);
        let id = store.insert(t).unwrap();
        let (_, lease) = store.claim_next(Lane::High, WorkerId::new(), now, LEASE).unwrap().unwrap();
        store
            .finish(
                &lease,
                Transition::Retry {
                    error: "boom".into(),
                    delay: Duration::from_secs(60),
                    outcome: AttemptOutcome::Failed,
                },
                now,
            )
            .unwrap()
            .unwrap();

        assert_eq!(store.ready_depths(now).unwrap().high, 0);
        assert!(store.claim_next(Lane::High, WorkerId::new(), now, LEASE).unwrap().is_none());

        let later = now + ChronoDuration::seconds(61);
        assert_eq!(store.ready_depths(later).unwrap().high, 1);
        let (again, lease) = store.claim_next(Lane::High, WorkerId::new(), later, LEASE).unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(lease.attempt, 1);
    }

    #[test]
    fn finish_requires_current_lease() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let id = store.insert(task_at(TaskType::AiTraining, "a", now)).unwrap();
        let (_, lease) = store.claim_next(Lane::Medium, WorkerId::new(), now, LEASE).unwrap().unwrap();

        let stranger = Lease {
            worker_id: WorkerId::new(),
            ..lease.clone()
        };
        assert_eq!(
            store.finish(&stranger, Transition::complete(json!(1)), now).unwrap(),
            None
        );

        let done = store
            .finish(&lease, Transition::complete(json!({"ok": true})), now)
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result_payload, Some(json!({"ok": true})));

        // A second settle with the same lease is rejected
        assert_eq!(store.finish(&lease, Transition::fail("late"), now).unwrap(), None);
        assert_eq!(store.get(id).unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn heartbeat_extends_and_reports_loss() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let id = store.insert(task_at(TaskType::VideoGeneration, "a", now)).unwrap();
        let (_, lease) = store
            .claim_next(Lane::High, WorkerId::new(), now, Duration::from_secs(1))
            .unwrap()
            .unwrap();

        let later = now + ChronoDuration::seconds(10);
        match store.heartbeat(&lease, later, LEASE).unwrap() {
            LeaseState::Held(l) => assert!(l.expires_at > later),
            other => panic!("expected held, got {other:?}"),
        }

        store.cancel(id, later).unwrap();
        assert_eq!(
            store.heartbeat(&lease, later, LEASE).unwrap(),
            LeaseState::Lost {
                status: Some(TaskStatus::Cancelled)
            }
        );
    }

    #[test]
    fn cancel_rules() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let pending = store.insert(task_at(TaskType::Maintenance, "a", now)).unwrap();
        let cancelled = store.cancel(pending, now).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(store.claim_next(Lane::Low, WorkerId::new(), now, LEASE).unwrap().is_none());

        assert_eq!(
            store.cancel(pending, now),
            Err(StoreError::AlreadyTerminal {
                id: pending,
                status: TaskStatus::Cancelled
            })
        );
        let missing = TaskId::new();
        assert_eq!(store.cancel(missing, now), Err(StoreError::NotFound(missing)));
    }

    #[test]
    fn reclaim_requeues_expired_leases_only() {
        let store = InMemoryTaskStore::new();
        let policies = PolicyTable::default();
        let now = Utc::now();
        let crashed = store
            .insert(task_at(TaskType::VideoGeneration, "a", now - ChronoDuration::seconds(2)))
            .unwrap();
        let alive = store
            .insert(task_at(TaskType::AudioProcessing, "a", now - ChronoDuration::seconds(1)))
            .unwrap();
        store.claim_next(Lane::High, WorkerId::new(), now, Duration::from_secs(5)).unwrap();
        store.claim_next(Lane::High, WorkerId::new(), now, Duration::from_secs(600)).unwrap();

        let later = now + ChronoDuration::seconds(10);
        let reclaimed = store.reclaim_expired(later, &policies).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, crashed);

        let t = store.get(crashed).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempt_count, 1);
        assert_eq!(t.history[0].outcome, AttemptOutcome::LeaseExpired);
        assert_eq!(store.get(alive).unwrap().unwrap().status, TaskStatus::Processing);
    }

    #[test]
    fn reclaim_fails_when_retries_are_spent() {
        let store = InMemoryTaskStore::new();
        let policies = PolicyTable::default();
        let now = Utc::now();
        // maintenance allows a single retry
        let id = store.insert(task_at(TaskType::Maintenance, "a", now)).unwrap();
        let mut clock = now;
        for _ in 0..2 {
            clock += ChronoDuration::seconds(3600);
            store.claim_next(Lane::Low, WorkerId::new(), clock, Duration::from_secs(1)).unwrap().unwrap();
            clock += ChronoDuration::seconds(3600);
            assert_eq!(store.reclaim_expired(clock, &policies).unwrap().len(), 1);
        }
        let t = store.get(id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.history.len(), 2);
        assert!(t.error_detail.unwrap().contains("lease expired"));
    }

    #[test]
    fn listings_and_stats_follow_status_changes() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        for i in 0..3 {
            store
                .insert(task_at(TaskType::VideoGeneration, "alice", now + ChronoDuration::seconds(i)))
                .unwrap();
        }
        store.insert(task_at(TaskType::VideoGeneration, "bob", now)).unwrap();

        let mine = store.list_by_owner(&owner("alice"), 10).unwrap();
        assert_eq!(mine.len(), 3);
        assert!(mine.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(store.list_by_owner(&owner("alice"), 2).unwrap().len(), 2);
        assert!(store.list_by_owner(&owner("carol"), 10).unwrap().is_empty());

        store.claim_next(Lane::High, WorkerId::new(), now + ChronoDuration::seconds(5), LEASE).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.total(), 4);
        assert_eq!(store.list_by_status(TaskStatus::Processing, 10).unwrap().len(), 1);
    }
}
