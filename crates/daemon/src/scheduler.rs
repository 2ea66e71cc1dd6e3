use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;

use crate::config::DaemonConfig;
use crate::store::{StoreError, TaskStore};
use crate::task::{Task, TaskStatus};
use crate::transcode::Transcode;
use crate::validate::Validator;

/// Shared daemon state: the stop flag and the worker bound.
///
/// The semaphore makes the check-then-dispatch step atomic: a worker slot
/// is held as an owned permit before the claim is attempted, so concurrent
/// dispatch can never exceed `max_workers`.
pub struct SchedulerHandle {
    running: AtomicBool,
    workers: Arc<Semaphore>,
    max_workers: usize,
}

impl SchedulerHandle {
    fn new(max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        })
    }

    /// Ask the daemon loop to stop after its current iteration.
    ///
    /// In-flight transcode attempts are not cancelled; `run` waits for
    /// them to finish and record their normal transition.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.max_workers.saturating_sub(self.workers.available_permits())
    }
}

/// The queue processing daemon.
///
/// Owns the poll/claim/dispatch loop; all queue mutation funnels through
/// `TaskStore::transition`, so a lost claim race is benign and the loop
/// never dies because one task or one iteration failed.
pub struct Scheduler {
    store: Arc<TaskStore>,
    validator: Validator,
    transcoder: Arc<dyn Transcode>,
    handle: Arc<SchedulerHandle>,
    check_interval: Duration,
    transcode_timeout: Option<Duration>,
    retention: ChronoDuration,
}

impl Scheduler {
    pub fn new(cfg: &DaemonConfig, store: Arc<TaskStore>, transcoder: Arc<dyn Transcode>) -> Self {
        Self {
            store,
            validator: Validator::new(cfg),
            transcoder,
            handle: SchedulerHandle::new(cfg.max_workers),
            check_interval: Duration::from_secs(cfg.check_interval_secs),
            transcode_timeout: cfg.transcode_timeout_secs.map(Duration::from_secs),
            retention: ChronoDuration::days(cfg.retention_days),
        }
    }

    /// Handle for requesting shutdown and inspecting worker occupancy
    pub fn handle(&self) -> Arc<SchedulerHandle> {
        self.handle.clone()
    }

    /// Startup recovery: re-queue tasks orphaned in Processing by a prior
    /// crash, spending one retry each; tasks with no retry budget left go
    /// straight to terminal Error. Returns the number re-queued.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let orphaned: Vec<Task> = self
            .store
            .snapshot()?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Processing)
            .collect();

        let mut requeued = 0;
        for task in orphaned {
            if task.can_retry() {
                self.store.transition(
                    &task.id,
                    TaskStatus::Processing,
                    TaskStatus::Pending,
                    Some("interrupted by restart"),
                )?;
                info!(
                    "task {}: re-queued after restart (retry {}/{})",
                    task.id,
                    task.retries + 1,
                    task.max_retries
                );
                requeued += 1;
            } else {
                self.store.transition(
                    &task.id,
                    TaskStatus::Processing,
                    TaskStatus::Error,
                    Some("max retries exceeded"),
                )?;
                warn!("task {}: orphaned with no retry budget, marked failed", task.id);
            }
        }
        Ok(requeued)
    }

    /// Run the daemon until shutdown is requested, then drain in-flight
    /// workers before returning
    pub async fn run(self) {
        info!(
            "processor daemon started ({} workers, {}s check interval)",
            self.handle.max_workers,
            self.check_interval.as_secs()
        );

        match self.recover() {
            Ok(0) => {}
            Ok(n) => info!("startup recovery re-queued {} task(s)", n),
            Err(e) => error!("startup recovery failed: {}", e),
        }

        while self.handle.is_running() {
            self.poll_once().await;
            tokio::time::sleep(self.check_interval).await;
        }

        info!("stop requested, waiting for in-flight tasks");
        let _drain = self
            .handle
            .workers
            .acquire_many(self.handle.max_workers as u32)
            .await;
        info!("processor daemon stopped");
    }

    /// One poll iteration: claim eligible tasks up to the free worker
    /// capacity, then run retention cleanup. Every failure is absorbed.
    async fn poll_once(&self) {
        if self.handle.workers.available_permits() > 0 {
            match self.store.list_eligible(self.handle.workers.available_permits()) {
                Ok(eligible) => {
                    for task in eligible {
                        let permit = match self.handle.workers.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        match self.store.transition(
                            &task.id,
                            TaskStatus::Pending,
                            TaskStatus::Processing,
                            None,
                        ) {
                            Ok(claimed) => {
                                info!("task {}: claimed {} for processing", claimed.id, claimed.filename);
                                let store = self.store.clone();
                                let validator = self.validator.clone();
                                let transcoder = self.transcoder.clone();
                                let deadline = self.transcode_timeout;
                                tokio::spawn(async move {
                                    let _permit = permit;
                                    run_task(store, validator, transcoder, deadline, claimed).await;
                                });
                            }
                            Err(e) if e.is_claim_race() => {
                                debug!("task {}: claim lost: {}", task.id, e);
                            }
                            Err(e) => {
                                warn!("task {}: claim failed: {}", task.id, e);
                            }
                        }
                    }
                }
                Err(e) => error!("queue poll failed: {}", e),
            }
        }

        match self.store.cleanup(self.retention) {
            Ok(0) => {}
            Ok(n) => info!("retention cleanup removed {} task(s)", n),
            Err(e) => warn!("retention cleanup failed: {}", e),
        }
    }
}

/// Process one claimed task: validate, transcode, record the outcome.
///
/// Must never panic or propagate: a single task's failure is recorded in
/// the store, not raised to the daemon.
async fn run_task(
    store: Arc<TaskStore>,
    validator: Validator,
    transcoder: Arc<dyn Transcode>,
    deadline: Option<Duration>,
    task: Task,
) {
    // validation failures are not transient; no retry
    if let Err(reason) = validator.validate(&task.filename) {
        error!("task {}: validation failed: {}", task.id, reason);
        record_outcome(&store, &task.id, TaskStatus::Error, Some(&reason.to_string()));
        return;
    }

    let input = validator.source_path(&task.filename);
    let output = validator.output_path(&task.filename);
    info!("task {}: processing {}", task.id, task.filename);

    let attempt = match deadline {
        Some(deadline) => {
            match tokio::time::timeout(deadline, transcoder.transcode(&input, &output)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "transcode timed out after {}s",
                    deadline.as_secs()
                )),
            }
        }
        None => transcoder.transcode(&input, &output).await,
    };

    // an invocation error is handled exactly like a failed transcode
    let failure = match attempt {
        Ok(result) if result.success() => None,
        Ok(result) => Some(result.failure_reason()),
        Err(e) => Some(format!("{:#}", e)),
    };

    match failure {
        None => {
            info!("task {}: completed {}", task.id, task.filename);
            record_outcome(&store, &task.id, TaskStatus::Completed, None);
        }
        Some(reason) => {
            error!("task {}: transcode failed: {}", task.id, reason);
            if output.exists() {
                match std::fs::remove_file(&output) {
                    Ok(()) => debug!("task {}: removed partial output {}", task.id, output.display()),
                    Err(e) => warn!(
                        "task {}: failed to remove partial output {}: {}",
                        task.id,
                        output.display(),
                        e
                    ),
                }
            }
            if task.can_retry() {
                info!(
                    "task {}: re-queued (retry {}/{})",
                    task.id,
                    task.retries + 1,
                    task.max_retries
                );
                record_outcome(&store, &task.id, TaskStatus::Pending, Some(&reason));
            } else {
                record_outcome(&store, &task.id, TaskStatus::Error, Some("max retries exceeded"));
            }
        }
    }
}

fn record_outcome(store: &TaskStore, id: &str, to: TaskStatus, message: Option<&str>) {
    // a persistence failure leaves the task in Processing on disk;
    // startup recovery re-queues it after the next restart
    if let Err(e) = store.transition(id, TaskStatus::Processing, to, message) {
        error!("task {}: failed to record outcome {}: {}", id, to, e);
    }
}
