//! Maintenance task bodies.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde_json::{json, Value};
use tracing::{debug, info};

use taskforge_tasks::{Task, TaskError};

use crate::workers::{AttemptContext, TaskHandler};

/// Deletes regular files older than `max_age` from one directory.
///
/// Idempotent: files that vanish mid-sweep are simply skipped, and a missing
/// directory is an empty sweep. A task payload may narrow the age with
/// `"max_age_secs"`.
#[derive(Debug, Clone)]
pub struct TempCleanupHandler {
    dir: PathBuf,
    max_age: Duration,
}

impl TempCleanupHandler {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    fn max_age_for(&self, payload: &Value) -> Duration {
        payload
            .get("max_age_secs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.max_age)
    }

    /// One sweep. Returns `(removed, scanned)`.
    pub fn sweep(&self, max_age: Duration, ctx: &AttemptContext) -> Result<(u64, u64), TaskError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => {
                return Err(TaskError::retryable(format!(
                    "cannot read {}: {e}",
                    self.dir.display()
                )))
            }
        };

        let now = SystemTime::now();
        let (mut removed, mut scanned) = (0u64, 0u64);
        for entry in entries {
            if let Some(reason) = ctx.stop_reason() {
                return Err(TaskError::retryable(format!(
                    "cleanup interrupted after removing {removed} files: {reason}"
                )));
            }
            let Ok(entry) = entry else { continue };
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            scanned += 1;

            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    debug!(path = %entry.path().display(), "removed stale temp file");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(TaskError::retryable(format!(
                        "cannot remove {}: {e}",
                        entry.path().display()
                    )))
                }
            }
        }
        Ok((removed, scanned))
    }
}

impl TaskHandler for TempCleanupHandler {
    fn run(&self, task: &Task, ctx: &AttemptContext) -> Result<Value, TaskError> {
        let max_age = self.max_age_for(&task.input_payload);
        let (removed, scanned) = self.sweep(max_age, ctx)?;
        info!(
            task_id = %task.id,
            dir = %self.dir.display(),
            removed,
            scanned,
            "temp cleanup finished"
        );
        Ok(json!({ "removed": removed, "scanned": scanned }))
    }
}
