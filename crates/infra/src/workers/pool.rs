//! Worker pool: N claim/execute loops plus one lease reaper.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use taskforge_core::WorkerId;
use taskforge_tasks::{Lease, PolicyTable, Task, TaskType};

use super::fairness::{FairnessConfig, LaneSelector};
use super::handler::{HandlerRegistry, TaskHandler};
use super::supervisor::{AttemptEnd, AttemptReport, Supervisor};
use crate::task_store::{StoreError, TaskStore};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Idle wait between polls when no lane has claimable work
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Lease granted on claim and on every heartbeat
    pub lease_ttl: Duration,
    /// How often expired leases are swept
    pub reap_interval: Duration,
    /// Name for logging and thread names
    pub name: String,
    pub fairness: FairnessConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(2),
            lease_ttl: Duration::from_secs(30),
            reap_interval: Duration::from_secs(1),
            name: "taskforge-worker".to_string(),
            fairness: FairnessConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_fairness(mut self, fairness: FairnessConfig) -> Self {
        self.fairness = fairness;
        self
    }

    fn supervisor(&self) -> Supervisor {
        Supervisor {
            heartbeat_interval: self.heartbeat_interval,
            lease_ttl: self.lease_ttl,
        }
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub lease_lost: u64,
    pub unsettled: u64,
    pub timed_out: u64,
    pub reclaimed: u64,
    pub running: usize,
    pub uptime_secs: u64,
}

impl PoolStats {
    fn record(&mut self, report: &AttemptReport) {
        match report.end {
            AttemptEnd::Completed => self.completed += 1,
            AttemptEnd::Retried => self.retried += 1,
            AttemptEnd::Failed => self.failed += 1,
            AttemptEnd::Cancelled => self.cancelled += 1,
            AttemptEnd::LeaseLost => self.lease_lost += 1,
            AttemptEnd::Unsettled => self.unsettled += 1,
        }
        if report.hard_limited {
            self.timed_out += 1;
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl PoolHandle {
    /// Request graceful shutdown and wait for every thread to stop.
    ///
    /// Workers finish the attempt they are supervising first.
    pub fn shutdown(mut self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for j in self.joins.drain(..) {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Executes claimed tasks with registered handlers under per-type policy.
pub struct WorkerPool<S: TaskStore + ?Sized> {
    store: Arc<S>,
    handlers: HandlerRegistry,
    policies: PolicyTable,
}

impl<S: TaskStore + ?Sized + 'static> WorkerPool<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            handlers: HandlerRegistry::new(),
            policies: PolicyTable::default(),
        }
    }

    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Register the body for one task type.
    pub fn register_handler<H: TaskHandler>(&mut self, task_type: TaskType, handler: H) {
        self.handlers.register(task_type, handler);
    }

    pub fn handles(&self, task_type: TaskType) -> bool {
        self.handlers.get(task_type).is_some()
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Claim the next task in fair lane order.
    pub fn claim(
        &self,
        worker_id: WorkerId,
        selector: &Mutex<LaneSelector>,
        lease_ttl: Duration,
    ) -> Result<Option<(Task, Lease)>, StoreError> {
        let now = Utc::now();
        let depths = self.store.ready_depths(now)?;
        if depths.total() == 0 {
            return Ok(None);
        }
        let order = selector.lock().unwrap().order(&depths);
        for lane in order {
            if let Some(claimed) = self.store.claim_next(lane, worker_id, now, lease_ttl)? {
                selector.lock().unwrap().record(lane, &depths);
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    /// Run one claimed attempt to its end.
    pub fn execute(&self, task: Task, lease: Lease, supervisor: &Supervisor) -> AttemptReport {
        let handler = self.handlers.get(task.task_type);
        let policy = *self.policies.get(task.task_type);
        supervisor.run_attempt(&*self.store, task, lease, handler, &policy)
    }

    /// Claim and run a single task synchronously (for testing or one-shot use).
    pub fn execute_next(
        &self,
        worker_id: WorkerId,
        selector: &Mutex<LaneSelector>,
        config: &PoolConfig,
    ) -> Result<Option<AttemptReport>, StoreError> {
        Ok(self
            .claim(worker_id, selector, config.lease_ttl)?
            .map(|(task, lease)| self.execute(task, lease, &config.supervisor())))
    }

    /// Sweep expired leases once.
    pub fn reap(&self) -> Result<Vec<Task>, StoreError> {
        let reclaimed = self.store.reclaim_expired(Utc::now(), &self.policies)?;
        for task in &reclaimed {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                status = %task.status,
                attempt_count = task.attempt_count,
                "lease expired, task reclaimed"
            );
        }
        Ok(reclaimed)
    }

    /// Spawn the worker threads and the reaper.
    pub fn spawn(self, config: PoolConfig) -> PoolHandle
    where
        S: Send + Sync,
    {
        if config.lease_ttl <= config.heartbeat_interval {
            warn!(
                pool = %config.name,
                lease_ttl_ms = config.lease_ttl.as_millis() as u64,
                heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
                "lease ttl does not exceed heartbeat interval; healthy attempts may be reclaimed"
            );
        }

        let pool = Arc::new(self);
        let selector = Arc::new(Mutex::new(LaneSelector::new(config.fairness)));
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let mut shutdown = Vec::with_capacity(config.workers + 1);
        let mut joins = Vec::with_capacity(config.workers + 1);

        for i in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::channel::<()>();
            let name = format!("{}-{}", config.name, i);
            let worker = Worker {
                pool: pool.clone(),
                selector: selector.clone(),
                stats: stats.clone(),
                config: config.clone(),
                id: WorkerId::new(),
                name: name.clone(),
            };
            let join = thread::Builder::new()
                .name(name)
                .spawn(move || worker.run(rx))
                .expect("failed to spawn worker thread");
            shutdown.push(tx);
            joins.push(join);
        }

        let (tx, rx) = mpsc::channel::<()>();
        let reaper_pool = pool.clone();
        let reaper_stats = stats.clone();
        let reaper_config = config.clone();
        let join = thread::Builder::new()
            .name(format!("{}-reaper", config.name))
            .spawn(move || reaper_loop(reaper_pool, reaper_config, rx, reaper_stats))
            .expect("failed to spawn reaper thread");
        shutdown.push(tx);
        joins.push(join);

        info!(pool = %config.name, workers = config.workers, "worker pool started");

        PoolHandle {
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

struct Worker<S: TaskStore + ?Sized> {
    pool: Arc<WorkerPool<S>>,
    selector: Arc<Mutex<LaneSelector>>,
    stats: Arc<Mutex<PoolStats>>,
    config: PoolConfig,
    id: WorkerId,
    name: String,
}

impl<S: TaskStore + ?Sized + 'static> Worker<S> {
    fn run(self, shutdown_rx: mpsc::Receiver<()>) {
        info!(worker = %self.name, worker_id = %self.id, "worker started");
        let supervisor = self.config.supervisor();

        loop {
            if !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty)) {
                break;
            }

            match self.pool.claim(self.id, &self.selector, self.config.lease_ttl) {
                Ok(Some((task, lease))) => {
                    debug!(
                        worker = %self.name,
                        task_id = %task.id,
                        task_type = %task.task_type,
                        attempt = lease.attempt + 1,
                        "claimed task"
                    );
                    {
                        let mut s = self.stats.lock().unwrap();
                        s.claimed += 1;
                        s.running += 1;
                    }

                    let report = self.pool.execute(task, lease, &supervisor);

                    let mut s = self.stats.lock().unwrap();
                    s.running = s.running.saturating_sub(1);
                    s.record(&report);
                    // Look for more work right away.
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(worker = %self.name, error = %e, "failed to claim task"),
            }

            match shutdown_rx.recv_timeout(self.config.poll_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }

        info!(worker = %self.name, "worker stopped");
    }
}

fn reaper_loop<S: TaskStore + ?Sized + 'static>(
    pool: Arc<WorkerPool<S>>,
    config: PoolConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<PoolStats>>,
) {
    loop {
        match shutdown_rx.recv_timeout(config.reap_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        match pool.reap() {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                stats.lock().unwrap().reclaimed += reclaimed.len() as u64;
            }
            Ok(_) => {}
            Err(e) => error!(pool = %config.name, error = %e, "lease sweep failed"),
        }
    }
    debug!(pool = %config.name, "reaper stopped");
}
