//! Task types, priority lanes and the queue router.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use taskforge_core::DomainError;

/// Declared type of a task. Closed set; determines lane and policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    VideoGeneration,
    AudioProcessing,
    DocumentProcessing,
    AiTraining,
    Maintenance,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::VideoGeneration,
        TaskType::AudioProcessing,
        TaskType::DocumentProcessing,
        TaskType::AiTraining,
        TaskType::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::VideoGeneration => "video_generation",
            TaskType::AudioProcessing => "audio_processing",
            TaskType::DocumentProcessing => "document_processing",
            TaskType::AiTraining => "ai_training",
            TaskType::Maintenance => "maintenance",
        }
    }
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::unknown_task_type(s))
    }
}

/// Priority partition of pending tasks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    High,
    Medium,
    Low,
}

impl Lane {
    /// All lanes, highest priority first.
    pub const ALL: [Lane; 3] = [Lane::High, Lane::Medium, Lane::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::High => "high",
            Lane::Medium => "medium",
            Lane::Low => "low",
        }
    }
}

impl core::fmt::Display for Lane {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lane::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown lane: {s}")))
    }
}

/// Queue router: maps a task type to its lane.
pub fn route(task_type: TaskType) -> Lane {
    match task_type {
        TaskType::VideoGeneration => Lane::High,
        TaskType::AudioProcessing => Lane::High,
        TaskType::AiTraining => Lane::Medium,
        TaskType::DocumentProcessing => Lane::Low,
        TaskType::Maintenance => Lane::Low,
    }
}

/// Number of claimable pending tasks per lane at some instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneDepths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl LaneDepths {
    pub fn get(&self, lane: Lane) -> usize {
        match lane {
            Lane::High => self.high,
            Lane::Medium => self.medium,
            Lane::Low => self.low,
        }
    }

    pub fn increment(&mut self, lane: Lane) {
        match lane {
            Lane::High => self.high += 1,
            Lane::Medium => self.medium += 1,
            Lane::Low => self.low += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}
