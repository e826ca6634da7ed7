//! Submission and status operations over a [`TaskStore`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use taskforge_core::{DomainError, OwnerId, TaskId};
use taskforge_tasks::{Task, TaskStatus, TaskType};

use crate::task_store::{StoreError, TaskStats, TaskStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task {id} is already {status}")]
    AlreadyTerminal { id: TaskId, status: TaskStatus },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CancelError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CancelError::NotFound(id),
            StoreError::AlreadyTerminal { id, status } => CancelError::AlreadyTerminal { id, status },
            other => CancelError::Store(other),
        }
    }
}

/// Entry point for callers that submit and track tasks.
///
/// Validation happens here, before anything reaches the store.
pub struct TaskService<S: TaskStore + ?Sized> {
    store: Arc<S>,
}

impl<S: TaskStore + ?Sized> Clone for TaskService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: TaskStore + ?Sized> TaskService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validate and enqueue a task given its wire type name.
    pub fn submit(
        &self,
        task_type: &str,
        owner_id: OwnerId,
        input_payload: Value,
    ) -> Result<TaskId, SubmitError> {
        let task_type: TaskType = task_type.parse()?;
        self.submit_typed(task_type, owner_id, input_payload)
    }

    pub fn submit_typed(
        &self,
        task_type: TaskType,
        owner_id: OwnerId,
        input_payload: Value,
    ) -> Result<TaskId, SubmitError> {
        if !input_payload.is_object() {
            return Err(DomainError::validation("input payload must be a JSON object").into());
        }
        let task = Task::new(task_type, owner_id, input_payload);
        let lane = task.lane();
        let id = self.store.insert(task)?;
        info!(task_id = %id, task_type = %task_type, lane = %lane, "task submitted");
        Ok(id)
    }

    pub fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.store.get(id)
    }

    /// Like [`TaskService::get`], but tasks of other owners are invisible.
    pub fn get_owned(&self, id: TaskId, owner: &OwnerId) -> Result<Option<Task>, StoreError> {
        Ok(self.store.get(id)?.filter(|t| &t.owner_id == owner))
    }

    pub fn cancel(&self, id: TaskId) -> Result<Task, CancelError> {
        let task = self.store.cancel(id, Utc::now())?;
        info!(task_id = %id, "task cancelled");
        Ok(task)
    }

    /// Cancel on behalf of `owner`; other owners' tasks are reported as missing.
    pub fn cancel_owned(&self, id: TaskId, owner: &OwnerId) -> Result<Task, CancelError> {
        match self.get_owned(id, owner)? {
            Some(_) => self.cancel(id),
            None => Err(CancelError::NotFound(id)),
        }
    }

    pub fn list_for_owner(&self, owner: &OwnerId, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.store.list_by_owner(owner, limit)
    }

    pub fn stats(&self) -> Result<TaskStats, StoreError> {
        self.store.stats()
    }
}
