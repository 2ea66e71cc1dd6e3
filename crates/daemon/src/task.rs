use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowest (most urgent) dispatch priority
pub const MIN_PRIORITY: i32 = 0;
/// Highest (least urgent) dispatch priority; retry bumps cap here
pub const MAX_PRIORITY: i32 = 5;
/// Priority assigned to newly enqueued tasks
pub const DEFAULT_PRIORITY: i32 = 2;

/// Status of a transcoding task.
///
/// Completed and Error are terminal; a task only re-enters Pending through
/// the retry re-queue edge while it still has retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of transcoding work.
///
/// The task names its source file; the uploads directory owns the bytes.
/// All mutation after creation goes through `TaskStore::transition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Task {
    /// Create a new Pending task for a source filename
    pub fn new(filename: &str, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            status: TaskStatus::Pending,
            priority: DEFAULT_PRIORITY,
            retries: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Whether another transcode attempt may be scheduled after a failure
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new("clip.mp4", 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.retries, 0);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(task.error_message.is_none());
        assert!(task.can_retry());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Task::new("a.mp4", 3);
        let b = Task::new("a.mp4", 3);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TaskStatus::Pending).unwrap(), "\"pending\"");
        assert_eq!(serde_json::to_string(&TaskStatus::Error).unwrap(), "\"error\"");
        let s: TaskStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(s, TaskStatus::Processing);
    }

    #[test]
    fn test_default_priority_within_bounds() {
        assert!(DEFAULT_PRIORITY >= MIN_PRIORITY);
        assert!(DEFAULT_PRIORITY <= MAX_PRIORITY);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
    }
}
