use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{Task, TaskStatus, MAX_PRIORITY};

/// Errors surfaced by the task store.
///
/// `Stale` is the expected outcome of losing a claim race and is not a
/// fault; `Io`/`Corrupt` are the persistence failures a caller must treat
/// as "the write did not happen".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {id} is no longer {expected} (moved by a concurrent transition)")]
    Stale { id: String, expected: TaskStatus },
    #[error("transition {from} -> {to} is not allowed for task {id}")]
    IllegalTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("queue file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    /// True for the benign outcomes of a lost claim race
    pub fn is_claim_race(&self) -> bool {
        matches!(self, StoreError::Stale { .. } | StoreError::NotFound(_))
    }
}

/// The persisted queue document: one ordered collection per status.
///
/// Every mutation rewrites the whole document, so a reload always sees the
/// last committed state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueDocument {
    pending: Vec<Task>,
    processing: Vec<Task>,
    completed: Vec<Task>,
    error: Vec<Task>,
}

impl QueueDocument {
    fn partition(&self, status: TaskStatus) -> &Vec<Task> {
        match status {
            TaskStatus::Pending => &self.pending,
            TaskStatus::Processing => &self.processing,
            TaskStatus::Completed => &self.completed,
            TaskStatus::Error => &self.error,
        }
    }

    fn partition_mut(&mut self, status: TaskStatus) -> &mut Vec<Task> {
        match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Processing => &mut self.processing,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Error => &mut self.error,
        }
    }

    fn find(&self, id: &str) -> Option<&Task> {
        [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Error,
        ]
        .iter()
        .flat_map(|s| self.partition(*s).iter())
        .find(|t| t.id == id)
    }
}

/// Durable record of all tasks, partitioned by status.
///
/// The single source of truth for queue state. Every operation re-reads the
/// document and every mutation rewrites it atomically (temp file + rename),
/// so a crash mid-write leaves either the pre- or post-transition state.
/// An internal mutex serializes in-process access; across processes the
/// compare-and-move contract of `transition` is the only safety mechanism.
pub struct TaskStore {
    queue_file: PathBuf,
    default_max_retries: u32,
    lock: Mutex<()>,
}

impl TaskStore {
    /// Open a store, creating an empty queue document if none exists
    pub fn open(queue_file: &Path, default_max_retries: u32) -> Result<Self, StoreError> {
        if let Some(parent) = queue_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self {
            queue_file: queue_file.to_path_buf(),
            default_max_retries,
            lock: Mutex::new(()),
        };
        if !queue_file.exists() {
            store.persist(&QueueDocument::default())?;
        }
        Ok(store)
    }

    /// Add a new Pending task and durably persist it.
    ///
    /// The task does not exist until this returns Ok.
    pub fn enqueue(&self, filename: &str) -> Result<Task, StoreError> {
        let _guard = self.lock_guard();
        let mut doc = self.load()?;
        let task = Task::new(filename, self.default_max_retries);
        doc.pending.push(task.clone());
        self.persist(&doc)?;
        debug!("enqueued task {} for {}", task.id, filename);
        Ok(task)
    }

    /// Look up a task by id across all partitions
    pub fn lookup(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let _guard = self.lock_guard();
        let doc = self.load()?;
        Ok(doc.find(id).cloned())
    }

    /// Compare-and-move a task between status partitions.
    ///
    /// The task must still be in `from`; otherwise the call fails with
    /// `Stale` (it exists elsewhere) or `NotFound`. The re-queue edge
    /// (Processing -> Pending) increments the retry counter and bumps the
    /// priority, capped at `MAX_PRIORITY`, and is refused once the retry
    /// budget is spent. Returns the task as persisted.
    pub fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        message: Option<&str>,
    ) -> Result<Task, StoreError> {
        let _guard = self.lock_guard();
        let mut doc = self.load()?;

        let source = doc.partition(from);
        let idx = match source.iter().position(|t| t.id == id) {
            Some(idx) => idx,
            None => {
                return Err(if doc.find(id).is_some() {
                    StoreError::Stale {
                        id: id.to_string(),
                        expected: from,
                    }
                } else {
                    StoreError::NotFound(id.to_string())
                });
            }
        };

        let legal = matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Error)
                | (TaskStatus::Processing, TaskStatus::Pending)
        );
        let retry_exhausted = from == TaskStatus::Processing
            && to == TaskStatus::Pending
            && !source[idx].can_retry();
        if !legal || retry_exhausted {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        let mut task = doc.partition_mut(from).remove(idx);
        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        match to {
            TaskStatus::Processing => {
                task.started_at = Some(now);
            }
            TaskStatus::Completed => {
                task.completed_at = Some(now);
                task.error_message = None;
            }
            TaskStatus::Error => {
                task.completed_at = Some(now);
                if let Some(msg) = message {
                    task.error_message = Some(msg.to_string());
                }
            }
            TaskStatus::Pending => {
                // retry re-queue: deprioritize without starving
                task.retries += 1;
                task.priority = (task.priority + 1).min(MAX_PRIORITY);
                task.started_at = None;
                task.completed_at = None;
                if let Some(msg) = message {
                    task.error_message = Some(msg.to_string());
                }
            }
        }

        doc.partition_mut(to).push(task.clone());
        self.persist(&doc)?;
        debug!("task {} moved {} -> {}", id, from, to);
        Ok(task)
    }

    /// Pending tasks in dispatch order: priority ascending, oldest first.
    ///
    /// Non-mutating; callers may re-poll freely.
    pub fn list_eligible(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let _guard = self.lock_guard();
        let doc = self.load()?;
        let mut eligible = doc.pending;
        eligible.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        eligible.truncate(limit);
        Ok(eligible)
    }

    /// Remove terminal tasks whose terminal timestamp is older than `max_age`.
    ///
    /// Pending and Processing tasks are never touched. Returns the number
    /// of tasks removed.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize, StoreError> {
        let _guard = self.lock_guard();
        let mut doc = self.load()?;
        let cutoff = Utc::now() - max_age;

        let mut removed = 0;
        for status in [TaskStatus::Completed, TaskStatus::Error] {
            let partition = doc.partition_mut(status);
            let before = partition.len();
            partition.retain(|t| t.completed_at.unwrap_or(t.updated_at) >= cutoff);
            removed += before - partition.len();
        }

        if removed > 0 {
            self.persist(&doc)?;
        }
        Ok(removed)
    }

    /// Read-only dump of every task in the store
    pub fn snapshot(&self) -> Result<Vec<Task>, StoreError> {
        let _guard = self.lock_guard();
        let doc = self.load()?;
        let mut all = doc.pending;
        all.extend(doc.processing);
        all.extend(doc.completed);
        all.extend(doc.error);
        Ok(all)
    }

    /// Find an existing task for a filename, if one was ever queued.
    ///
    /// Checks pending, processing and completed tasks, so callers can
    /// refuse duplicate enqueues for work that is live or already done.
    pub fn find_by_filename(&self, filename: &str) -> Result<Option<Task>, StoreError> {
        let _guard = self.lock_guard();
        let doc = self.load()?;
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
        ] {
            if let Some(task) = doc.partition(status).iter().find(|t| t.filename == filename) {
                return Ok(Some(task.clone()));
            }
        }
        Ok(None)
    }

    fn load(&self) -> Result<QueueDocument, StoreError> {
        let content = fs::read_to_string(&self.queue_file)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn persist(&self, doc: &QueueDocument) -> Result<(), StoreError> {
        let tmp = self.queue_file.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(doc)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.queue_file)?;
        Ok(())
    }

    fn lock_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DEFAULT_PRIORITY;
    use std::collections::HashSet;
    use std::sync::Arc;
    use proptest::prelude::*;

    fn open_store(dir: &tempfile::TempDir) -> TaskStore {
        TaskStore::open(&dir.path().join("tasks.json"), 3).unwrap()
    }

    fn assert_in_one_partition(store: &TaskStore, id: &str) {
        let all = store.snapshot().unwrap();
        let hits = all.iter().filter(|t| t.id == id).count();
        assert_eq!(hits, 1, "task {} appears in {} partitions", id, hits);
    }

    #[test]
    fn test_enqueue_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let task = store.enqueue("clip.mp4").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, 3);

        let found = store.lookup(&task.id).unwrap().unwrap();
        assert_eq!(found.filename, "clip.mp4");
        assert!(store.lookup("no-such-id").unwrap().is_none());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let id = {
            let store = TaskStore::open(&path, 3).unwrap();
            let task = store.enqueue("clip.mp4").unwrap();
            store
                .transition(&task.id, TaskStatus::Pending, TaskStatus::Processing, None)
                .unwrap();
            task.id
        };

        let reopened = TaskStore::open(&path, 3).unwrap();
        let task = reopened.lookup(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());
    }

    #[test]
    fn test_transition_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let task = store.enqueue("clip.mp4").unwrap();

        let claimed = store
            .transition(&task.id, TaskStatus::Pending, TaskStatus::Processing, None)
            .unwrap();
        assert!(claimed.started_at.is_some());
        assert!(claimed.completed_at.is_none());

        let done = store
            .transition(&task.id, TaskStatus::Processing, TaskStatus::Completed, None)
            .unwrap();
        assert!(done.completed_at.is_some());
        assert!(done.error_message.is_none());
        assert_in_one_partition(&store, &task.id);
    }

    #[test]
    fn test_stale_transition_after_claim() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let task = store.enqueue("clip.mp4").unwrap();

        store
            .transition(&task.id, TaskStatus::Pending, TaskStatus::Processing, None)
            .unwrap();
        let err = store
            .transition(&task.id, TaskStatus::Pending, TaskStatus::Processing, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Stale { .. }));
        assert!(err.is_claim_race());
        assert_in_one_partition(&store, &task.id);
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let err = store
            .transition("ghost", TaskStatus::Pending, TaskStatus::Processing, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_claim_exclusivity_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir));
        let task = store.enqueue("clip.mp4").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                store.transition(&id, TaskStatus::Pending, TaskStatus::Processing, None)
            }));
        }

        let mut won = 0;
        let mut lost = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => won += 1,
                Err(e) if e.is_claim_race() => lost += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(lost, 7);
        assert_in_one_partition(&store, &task.id);
    }

    #[test]
    fn test_requeue_bumps_retry_and_priority() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let task = store.enqueue("clip.mp4").unwrap();

        let mut last_priority = DEFAULT_PRIORITY;
        for attempt in 1..=3u32 {
            store
                .transition(&task.id, TaskStatus::Pending, TaskStatus::Processing, None)
                .unwrap();
            let requeued = store
                .transition(
                    &task.id,
                    TaskStatus::Processing,
                    TaskStatus::Pending,
                    Some("ffmpeg error: boom"),
                )
                .unwrap();
            assert_eq!(requeued.retries, attempt);
            assert!(requeued.priority >= last_priority);
            assert!(requeued.priority <= MAX_PRIORITY);
            assert!(requeued.started_at.is_none());
            assert_eq!(requeued.error_message.as_deref(), Some("ffmpeg error: boom"));
            last_priority = requeued.priority;
        }
    }

    #[test]
    fn test_requeue_refused_once_retries_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("tasks.json"), 1).unwrap();
        let task = store.enqueue("clip.mp4").unwrap();

        store
            .transition(&task.id, TaskStatus::Pending, TaskStatus::Processing, None)
            .unwrap();
        store
            .transition(&task.id, TaskStatus::Processing, TaskStatus::Pending, Some("fail"))
            .unwrap();
        store
            .transition(&task.id, TaskStatus::Pending, TaskStatus::Processing, None)
            .unwrap();

        // budget spent: the re-queue edge must be refused
        let err = store
            .transition(&task.id, TaskStatus::Processing, TaskStatus::Pending, Some("fail"))
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        let done = store
            .transition(
                &task.id,
                TaskStatus::Processing,
                TaskStatus::Error,
                Some("max retries exceeded"),
            )
            .unwrap();
        assert_eq!(done.status, TaskStatus::Error);

        // terminal: no edge leads back to Pending
        let err = store
            .transition(&task.id, TaskStatus::Error, TaskStatus::Pending, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn test_dispatch_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let mut a = Task::new("a.mp4", 3);
        a.priority = 1;
        let mut b = Task::new("b.mp4", 3);
        b.priority = 1;
        b.created_at = a.created_at + Duration::seconds(10);
        let mut c = Task::new("c.mp4", 3);
        c.priority = 0;
        c.created_at = a.created_at + Duration::seconds(20);

        let mut doc = store.load().unwrap();
        doc.pending = vec![a.clone(), b.clone(), c.clone()];
        store.persist(&doc).unwrap();

        let order: Vec<String> = store
            .list_eligible(3)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![c.id, a.id, b.id]);

        // bounded and restartable
        assert_eq!(store.list_eligible(1).unwrap().len(), 1);
        assert_eq!(store.list_eligible(3).unwrap().len(), 3);
    }

    #[test]
    fn test_cleanup_removes_only_old_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let old = Utc::now() - Duration::days(10);
        let mut done_old = Task::new("old.mp4", 3);
        done_old.status = TaskStatus::Completed;
        done_old.completed_at = Some(old);
        let mut failed_old = Task::new("failed.mp4", 3);
        failed_old.status = TaskStatus::Error;
        failed_old.completed_at = Some(old);
        let mut done_fresh = Task::new("fresh.mp4", 3);
        done_fresh.status = TaskStatus::Completed;
        done_fresh.completed_at = Some(Utc::now());
        let mut stuck = Task::new("stuck.mp4", 3);
        stuck.status = TaskStatus::Processing;
        stuck.updated_at = old;

        let mut doc = store.load().unwrap();
        doc.completed = vec![done_old.clone(), done_fresh.clone()];
        doc.error = vec![failed_old];
        doc.processing = vec![stuck.clone()];
        store.persist(&doc).unwrap();

        let removed = store.cleanup(Duration::days(7)).unwrap();
        assert_eq!(removed, 2);

        let remaining: HashSet<String> =
            store.snapshot().unwrap().into_iter().map(|t| t.id).collect();
        assert!(remaining.contains(&done_fresh.id));
        assert!(remaining.contains(&stuck.id));
        assert!(!remaining.contains(&done_old.id));
    }

    #[test]
    fn test_find_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let task = store.enqueue("clip.mp4").unwrap();

        let hit = store.find_by_filename("clip.mp4").unwrap().unwrap();
        assert_eq!(hit.id, task.id);
        assert!(store.find_by_filename("other.mp4").unwrap().is_none());
    }

    // Ops a worker-like caller can issue against a claimed/pending task
    #[derive(Debug, Clone, Copy)]
    enum Op {
        Claim,
        Complete,
        Requeue,
        Fail,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Claim),
            Just(Op::Complete),
            Just(Op::Requeue),
            Just(Op::Fail),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any sequence of transition attempts (legal or not) leaves every
        /// task in exactly one partition with its retry budget respected.
        #[test]
        fn prop_partition_invariant_holds(
            ops in proptest::collection::vec((0usize..3, op_strategy()), 1..40)
        ) {
            let dir = tempfile::tempdir().unwrap();
            let store = TaskStore::open(&dir.path().join("tasks.json"), 2).unwrap();
            let ids: Vec<String> = (0..3)
                .map(|i| store.enqueue(&format!("clip{}.mp4", i)).unwrap().id)
                .collect();

            for (target, op) in ops {
                let id = &ids[target];
                let result = match op {
                    Op::Claim => store.transition(id, TaskStatus::Pending, TaskStatus::Processing, None),
                    Op::Complete => store.transition(id, TaskStatus::Processing, TaskStatus::Completed, None),
                    Op::Requeue => store.transition(id, TaskStatus::Processing, TaskStatus::Pending, Some("fail")),
                    Op::Fail => store.transition(id, TaskStatus::Processing, TaskStatus::Error, Some("fail")),
                };
                // io errors would be a real failure; state errors are expected
                if let Err(e) = result {
                    prop_assert!(
                        matches!(e, StoreError::Stale { .. } | StoreError::NotFound(_) | StoreError::IllegalTransition { .. }),
                        "unexpected error variant: {:?}", e
                    );
                }

                let all = store.snapshot().unwrap();
                prop_assert_eq!(all.len(), ids.len());
                for id in &ids {
                    let task = all.iter().find(|t| &t.id == id).unwrap();
                    prop_assert!(task.retries <= task.max_retries);
                    prop_assert!(task.priority <= MAX_PRIORITY);
                }
            }
        }
    }
}
