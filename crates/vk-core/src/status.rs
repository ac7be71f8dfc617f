//! Task lifecycle phases and the combined state used for change detection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle phase of a remote task.
///
/// Serialized with the task service's spelling. The hyphenated forms people
/// tend to type into frontmatter are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    #[serde(rename = "not-synced", alias = "notsynced")]
    NotSynced,
    #[serde(rename = "todo")]
    Todo,
    #[serde(rename = "inprogress", alias = "in-progress")]
    InProgress,
    #[serde(rename = "inreview", alias = "in-review")]
    InReview,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "deleted")]
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotSynced => "not-synced",
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "inprogress",
            TaskStatus::InReview => "inreview",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Deleted => "deleted",
        }
    }

    /// No further transitions are expected once a task is done, cancelled or deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Deleted
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "not-synced" | "notsynced" => Ok(TaskStatus::NotSynced),
            "todo" => Ok(TaskStatus::Todo),
            "inprogress" | "in-progress" => Ok(TaskStatus::InProgress),
            "inreview" | "in-review" => Ok(TaskStatus::InReview),
            "done" => Ok(TaskStatus::Done),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "deleted" => Ok(TaskStatus::Deleted),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Phase plus whether an execution attempt is running.
///
/// Two observations of a task are "the same" exactly when their combined
/// states are equal. A task re-entering execution without changing phase is
/// therefore still a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CombinedState {
    pub status: TaskStatus,
    pub executing: bool,
}

impl CombinedState {
    pub fn new(status: TaskStatus, executing: bool) -> Self {
        Self { status, executing }
    }
}

impl fmt::Display for CombinedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.status, self.executing)
    }
}
