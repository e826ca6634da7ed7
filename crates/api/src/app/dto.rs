use serde::Deserialize;
use serde_json::Value;

use taskforge_infra::TaskStats;
use taskforge_tasks::{AttemptRecord, Task};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: String,
    /// Defaults to an empty object
    pub input: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    pub limit: Option<usize>,
}

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

impl ListTasksQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

// -------------------------
// Response mapping
// -------------------------

pub fn task_to_json(task: &Task) -> Value {
    serde_json::json!({
        "id": task.id.to_string(),
        "task_type": task.task_type.as_str(),
        "lane": task.lane().as_str(),
        "status": task.status.as_str(),
        "owner_id": task.owner_id.as_str(),
        "input": task.input_payload,
        "result": task.result_payload,
        "error": task.error_detail,
        "attempt_count": task.attempt_count,
        "created_at": task.created_at.to_rfc3339(),
        "updated_at": task.updated_at.to_rfc3339(),
        "completed_at": task.completed_at.map(|t| t.to_rfc3339()),
        "available_at": task.available_at.to_rfc3339(),
        "history": task.history.iter().map(attempt_to_json).collect::<Vec<_>>(),
    })
}

fn attempt_to_json(a: &AttemptRecord) -> Value {
    serde_json::json!({
        "attempt": a.attempt,
        "outcome": a.outcome,
        "started_at": a.started_at.to_rfc3339(),
        "finished_at": a.finished_at.to_rfc3339(),
        "error": a.error,
    })
}

pub fn stats_to_json(stats: TaskStats) -> Value {
    serde_json::json!({
        "pending": stats.pending,
        "processing": stats.processing,
        "completed": stats.completed,
        "failed": stats.failed,
        "cancelled": stats.cancelled,
        "total": stats.total(),
    })
}
