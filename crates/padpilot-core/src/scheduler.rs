//! Task scheduler: the single admission-control point in front of the
//! recognition pipeline.
//!
//! # Model
//!
//! - A fixed pool of `max_concurrent` workers pulls from a priority queue,
//!   so at most that many tasks are ever `Running`.
//! - `submit` takes one admission permit per task (unless the request
//!   bypasses admission). With every permit held, submission fails with
//!   `AtCapacity` or waits, depending on [`AdmissionMode`].
//! - When a task finishes, its [`HistoryRecord`] is appended to the ledger
//!   while the task table is write-locked, before the terminal state is
//!   stored, so a poller that sees a terminal state always finds the record.
//! - Cancellation is cooperative. A running task's token is cancelled and
//!   the pipeline aborts at the model call; once a task starts committing
//!   it can no longer be cancelled.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AdmissionMode, SchedulerConfig};
use crate::error::SchedulerError;
use crate::ledger::{HistoryLedger, LedgerStats};
use crate::pipeline::RecognitionPipeline;
use crate::prompt::{OptimizationOutcome, PromptOptimizer, PromptStore, SkipReason};
use crate::types::{AnalysisRequest, AnalysisResult, HistoryRecord, Outcome, TaskClass, TaskId};

type Result<T> = std::result::Result<T, SchedulerError>;

// ============================================================================
// Task state
// ============================================================================

/// Execution state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }
}

impl From<Outcome> for TaskState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => TaskState::Completed,
            Outcome::TimedOut => TaskState::TimedOut,
            Outcome::Failed => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
        }
    }
}

/// Point-in-time view of a scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub state: TaskState,
    pub task_class: TaskClass,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_slot: Option<usize>,
    /// Present once the task is terminal
    pub result: Option<AnalysisResult>,
}

struct TaskEntry {
    request: Arc<AnalysisRequest>,
    state: TaskState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    finished_instant: Option<Instant>,
    worker_slot: Option<usize>,
    cancel: CancellationToken,
    /// Result is being recorded; cancellation no longer applies
    committing: bool,
    permit: Option<OwnedSemaphorePermit>,
    result: Option<AnalysisResult>,
    state_tx: watch::Sender<TaskState>,
}

impl TaskEntry {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.request.id,
            state: self.state,
            task_class: self.request.task_class,
            priority: self.request.priority,
            submitted_at: self.request.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            worker_slot: self.worker_slot,
            result: self.result.clone(),
        }
    }

    fn set_state(&mut self, state: TaskState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

/// Queue entry: higher priority first, then submission order.
#[derive(Debug, PartialEq, Eq)]
struct QueuedJob {
    priority: i32,
    seq: u64,
    id: TaskId,
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Scheduler counters plus ledger stats over the requested window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub max_concurrent: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub queued: usize,
    pub running: usize,
    /// Highest number of simultaneously running tasks observed
    pub peak_running: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub prompt_optimizations: u64,
    /// Meta-prompt passes that left the prompt unchanged due to an error
    pub prompt_optimization_failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt_optimization_failure: Option<String>,
    pub history: LedgerStats,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Completed => &self.completed,
            Outcome::TimedOut => &self.timed_out,
            Outcome::Failed => &self.failed,
            Outcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

struct Inner {
    config: SchedulerConfig,
    pipeline: Arc<RecognitionPipeline>,
    ledger: Arc<HistoryLedger>,
    prompts: Arc<PromptStore>,
    optimizer: Option<Arc<PromptOptimizer>>,
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
    queue: StdMutex<BinaryHeap<QueuedJob>>,
    queue_notify: Notify,
    admission: Arc<Semaphore>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    next_seq: AtomicU64,
    counters: Counters,
    shutdown: CancellationToken,
}

/// Bounded-concurrency analysis scheduler.
///
/// Must be created inside a Tokio runtime; workers are spawned immediately
/// and stop on [`TaskScheduler::shutdown`] or drop.
pub struct TaskScheduler {
    inner: Arc<Inner>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        pipeline: Arc<RecognitionPipeline>,
        ledger: Arc<HistoryLedger>,
        prompts: Arc<PromptStore>,
    ) -> Self {
        let slots = config.max_concurrent.max(1);
        let inner = Arc::new(Inner {
            admission: Arc::new(Semaphore::new(slots)),
            config,
            pipeline,
            ledger,
            prompts,
            optimizer: None,
            tasks: RwLock::new(HashMap::new()),
            queue: StdMutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });
        Self::spawn(inner, slots)
    }

    /// Same as [`TaskScheduler::new`] with a prompt optimizer run after each
    /// task, inside the worker slot.
    pub fn with_optimizer(
        config: SchedulerConfig,
        pipeline: Arc<RecognitionPipeline>,
        ledger: Arc<HistoryLedger>,
        optimizer: Arc<PromptOptimizer>,
    ) -> Self {
        let slots = config.max_concurrent.max(1);
        let inner = Arc::new(Inner {
            admission: Arc::new(Semaphore::new(slots)),
            config,
            pipeline,
            ledger,
            prompts: optimizer.store().clone(),
            optimizer: Some(optimizer),
            tasks: RwLock::new(HashMap::new()),
            queue: StdMutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });
        Self::spawn(inner, slots)
    }

    fn spawn(inner: Arc<Inner>, slots: usize) -> Self {
        let workers = (0..slots)
            .map(|slot| tokio::spawn(worker_loop(inner.clone(), slot)))
            .collect();
        info!("Task scheduler started with {} workers", slots);
        Self {
            inner,
            workers: StdMutex::new(workers),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.config.max_concurrent.max(1)
    }

    pub fn ledger(&self) -> &Arc<HistoryLedger> {
        &self.inner.ledger
    }

    pub fn prompts(&self) -> &Arc<PromptStore> {
        &self.inner.prompts
    }

    /// Number of tasks currently in the `Running` state.
    pub fn running_count(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Admit and enqueue a request.
    pub async fn submit(&self, request: AnalysisRequest) -> Result<TaskId> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        inner.sweep_expired().await;

        let id = request.id;
        if inner.tasks.read().await.contains_key(&id) {
            return Err(SchedulerError::DuplicateTask(id));
        }

        let permit = if request.bypass_admission {
            debug!("Task {} bypasses admission control", id);
            None
        } else {
            Some(inner.admit().await?)
        };

        let (state_tx, _) = watch::channel(TaskState::Queued);
        let entry = TaskEntry {
            request: Arc::new(request),
            state: TaskState::Queued,
            started_at: None,
            finished_at: None,
            finished_instant: None,
            worker_slot: None,
            cancel: inner.shutdown.child_token(),
            committing: false,
            permit,
            result: None,
            state_tx,
        };
        let priority = entry.request.priority;

        {
            let mut tasks = inner.tasks.write().await;
            if tasks.contains_key(&id) {
                return Err(SchedulerError::DuplicateTask(id));
            }
            tasks.insert(id, entry);
        }

        inner.push_job(QueuedJob {
            priority,
            seq: inner.next_seq.fetch_add(1, Ordering::Relaxed),
            id,
        });
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!("Task {} queued (priority {})", id, priority);
        Ok(id)
    }

    /// Current state, with the result once terminal.
    pub async fn poll(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.inner.sweep_expired().await;
        self.inner
            .tasks
            .read()
            .await
            .get(&id)
            .map(TaskEntry::snapshot)
            .ok_or(SchedulerError::UnknownTask(id))
    }

    /// Wait until the task is terminal.
    pub async fn wait(&self, id: TaskId) -> Result<TaskSnapshot> {
        let mut rx = {
            let tasks = self.inner.tasks.read().await;
            tasks
                .get(&id)
                .ok_or(SchedulerError::UnknownTask(id))?
                .state_tx
                .subscribe()
        };
        // A closed channel means the entry is gone; poll reports that.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.poll(id).await
    }

    /// Request cancellation. Returns `false` if the task is unknown, already
    /// terminal, or committing its result.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let inner = &self.inner;
        let mut tasks = inner.tasks.write().await;
        let Some(entry) = tasks.get_mut(&id) else {
            return false;
        };
        if entry.committing || entry.state.is_terminal() {
            return false;
        }

        entry.cancel.cancel();
        if entry.state == TaskState::Queued {
            entry.committing = true;
            let result = AnalysisResult::cancelled(id, std::time::Duration::ZERO);
            inner.commit_locked(entry, result).await;
        }
        info!("Task {} cancelled", id);
        true
    }

    /// Remove a terminal task and hand back its result.
    pub async fn take_result(&self, id: TaskId) -> Result<AnalysisResult> {
        let mut tasks = self.inner.tasks.write().await;
        let entry = tasks.get(&id).ok_or(SchedulerError::UnknownTask(id))?;
        if !entry.state.is_terminal() {
            return Err(SchedulerError::NotTerminal(id));
        }
        tasks
            .remove(&id)
            .and_then(|e| e.result)
            .ok_or(SchedulerError::UnknownTask(id))
    }

    /// Most recent history records first.
    pub async fn history(&self, limit: usize) -> Vec<Arc<HistoryRecord>> {
        self.inner.ledger.snapshot(limit).await
    }

    pub async fn stats(&self, window: Option<usize>) -> SchedulerStats {
        let inner = &self.inner;
        let c = &inner.counters;
        let last_prompt_optimization_failure = match &inner.optimizer {
            Some(optimizer) => optimizer.last_failure().await,
            None => None,
        };
        SchedulerStats {
            max_concurrent: self.max_concurrent(),
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            queued: inner.queue.lock().map(|q| q.len()).unwrap_or(0),
            running: inner.running.load(Ordering::SeqCst),
            peak_running: inner.peak_running.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            prompt_optimizations: inner
                .optimizer
                .as_ref()
                .map_or(0, |o| o.optimization_count()),
            prompt_optimization_failures: inner
                .optimizer
                .as_ref()
                .map_or(0, |o| o.failure_count()),
            last_prompt_optimization_failure,
            history: inner.ledger.stats(window).await,
        }
    }

    /// Run an on-demand prompt optimization for `class`.
    ///
    /// The meta-prompt call holds an admission permit like any analysis.
    pub async fn optimize_prompts(
        &self,
        class: TaskClass,
        feedback: Option<&str>,
    ) -> Result<OptimizationOutcome> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let Some(optimizer) = &inner.optimizer else {
            return Ok(OptimizationOutcome::Unchanged(SkipReason::NoModel));
        };
        let _permit = inner.admit().await?;
        let outcome = optimizer.optimize_now(&inner.ledger, class, feedback).await;
        match &outcome {
            OptimizationOutcome::Optimized(profile) => info!(
                "Prompt for {} re-tuned on request (generation {})",
                class, profile.generation
            ),
            OptimizationOutcome::Unchanged(reason) => {
                debug!("On-demand optimization of {} skipped: {:?}", class, reason)
            }
        }
        Ok(outcome)
    }

    /// Cancel outstanding work and stop the workers.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        info!("Task scheduler shutting down");

        let ids: Vec<TaskId> = inner
            .tasks
            .read()
            .await
            .iter()
            .filter(|(_, e)| !e.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.cancel(id).await;
        }

        inner.shutdown.cancel();
        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        let limit = self.config.max_concurrent.max(1);
        let permit = match self.config.admission {
            AdmissionMode::Reject => self.admission.clone().try_acquire_owned().ok(),
            AdmissionMode::Wait => {
                tokio::time::timeout(
                    self.config.admission_timeout,
                    self.admission.clone().acquire_owned(),
                )
                .await
                .ok()
                .and_then(|r| r.ok())
            }
        };
        permit.ok_or_else(|| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Admission rejected: {} tasks in flight", limit);
            SchedulerError::AtCapacity { limit }
        })
    }

    fn push_job(&self, job: QueuedJob) {
        match self.queue.lock() {
            Ok(mut queue) => queue.push(job),
            Err(poisoned) => poisoned.into_inner().push(job),
        }
        self.queue_notify.notify_one();
    }

    fn pop_job(&self) -> Option<QueuedJob> {
        match self.queue.lock() {
            Ok(mut queue) => queue.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }
    }

    async fn next_job(&self) -> QueuedJob {
        loop {
            let notified = self.queue_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(job) = self.pop_job() {
                return job;
            }
            notified.await;
        }
    }

    async fn sweep_expired(&self) {
        let retention = self.config.task_retention;
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, e| {
            e.finished_instant
                .map_or(true, |at| at.elapsed() < retention)
        });
        let evicted = before - tasks.len();
        if evicted > 0 {
            debug!("Evicted {} expired tasks", evicted);
        }
    }

    async fn run_job(&self, slot: usize, job: QueuedJob) {
        let (request, cancel) = {
            let mut tasks = self.tasks.write().await;
            let Some(entry) = tasks.get_mut(&job.id) else {
                return;
            };
            if entry.state != TaskState::Queued || entry.committing {
                return;
            }
            entry.started_at = Some(Utc::now());
            entry.worker_slot = Some(slot);
            entry.set_state(TaskState::Running);
            (entry.request.clone(), entry.cancel.clone())
        };

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);
        debug!("Worker {} running task {} ({} running)", slot, request.id, running);

        let prompt = self.prompts.active(request.task_class).await;
        let result = self.pipeline.analyze(&request, prompt, &cancel).await;

        {
            let mut tasks = self.tasks.write().await;
            if let Some(entry) = tasks.get_mut(&job.id) {
                entry.committing = true;
                let result = if entry.cancel.is_cancelled() && !result.diagnostics.cancelled {
                    AnalysisResult::cancelled(request.id, result.latency)
                } else {
                    result
                };
                self.commit_locked(entry, result).await;
            }
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if let Some(optimizer) = &self.optimizer {
            optimizer.record_analysis(request.task_class).await;
            let outcome = optimizer
                .maybe_optimize(&self.ledger, request.task_class)
                .await;
            if outcome.is_optimized() {
                info!("Prompt for {} re-tuned after task {}", request.task_class, request.id);
            }
        }
    }

    /// Record the result and make the task terminal. Caller holds the task
    /// table write lock.
    async fn commit_locked(&self, entry: &mut TaskEntry, result: AnalysisResult) {
        let outcome = result.outcome();
        self.ledger
            .append(HistoryRecord::new(&entry.request, result.clone()))
            .await;

        entry.result = Some(result);
        entry.finished_at = Some(Utc::now());
        entry.finished_instant = Some(Instant::now());
        entry.permit.take();
        entry.set_state(TaskState::from(outcome));
        self.counters.record(outcome);
        debug!("Task {} finished: {:?}", entry.request.id, outcome);
    }
}

async fn worker_loop(inner: Arc<Inner>, slot: usize) {
    loop {
        let job = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            job = inner.next_job() => job,
        };
        inner.run_job(slot, job).await;
    }
    debug!("Worker {} stopped", slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Screenshot;
    use crate::config::PipelineConfig;
    use crate::error::RecognitionError;
    use crate::pipeline::{PartialResult, RecognitionInput, Recognizer};
    use crate::types::{BoundingBox, Element, ElementKind, Tier};
    use async_trait::async_trait;
    use image::{DynamicImage, RgbImage};
    use std::time::Duration;
    use tokio::sync::Semaphore as Gate;

    /// Matcher that blocks until the test releases a permit.
    struct GatedMatcher {
        gate: Arc<Gate>,
    }

    #[async_trait]
    impl Recognizer for GatedMatcher {
        fn tier(&self) -> Tier {
            Tier::Matcher
        }

        async fn analyze(&self, _input: &RecognitionInput) -> std::result::Result<PartialResult, RecognitionError> {
            let permit = self.gate.acquire().await.map_err(|e| RecognitionError::Matcher(e.to_string()))?;
            permit.forget();
            Ok(PartialResult {
                elements: vec![Element::new(
                    "ok",
                    ElementKind::Button,
                    BoundingBox::new(0, 0, 4, 4),
                    0.95,
                )],
                suggestions: Vec::new(),
                confidence: 0.95,
                notes: Vec::new(),
            })
        }
    }

    fn scheduler(config: SchedulerConfig) -> (TaskScheduler, Arc<Gate>) {
        let gate = Arc::new(Gate::new(0));
        let matcher = Arc::new(GatedMatcher { gate: gate.clone() });
        let pipeline = Arc::new(RecognitionPipeline::new(matcher, PipelineConfig::default(), 0.8));
        let ledger = Arc::new(HistoryLedger::new(config.history_limit));
        let scheduler = TaskScheduler::new(config, pipeline, ledger, Arc::new(PromptStore::new()));
        (scheduler, gate)
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new(Screenshot::new(
            DynamicImage::ImageRgb8(RgbImage::new(4, 4)),
            "test",
        ))
    }

    #[test]
    fn test_queue_order() {
        let mut heap = BinaryHeap::new();
        let ids: Vec<TaskId> = (0..4).map(|_| uuid::Uuid::new_v4()).collect();
        heap.push(QueuedJob { priority: 0, seq: 0, id: ids[0] });
        heap.push(QueuedJob { priority: 5, seq: 1, id: ids[1] });
        heap.push(QueuedJob { priority: 0, seq: 2, id: ids[2] });
        heap.push(QueuedJob { priority: 5, seq: 3, id: ids[3] });

        let order: Vec<TaskId> = std::iter::from_fn(|| heap.pop().map(|j| j.id)).collect();
        assert_eq!(order, vec![ids[1], ids[3], ids[0], ids[2]]);
    }

    #[tokio::test]
    async fn test_fourth_submit_rejected() {
        let (scheduler, gate) = scheduler(SchedulerConfig::default());

        for _ in 0..3 {
            scheduler.submit(request()).await.unwrap();
        }
        let err = scheduler.submit(request()).await.unwrap_err();
        assert_eq!(err, SchedulerError::AtCapacity { limit: 3 });

        gate.add_permits(3);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_bypass_admission() {
        let config = SchedulerConfig::default().with_max_concurrent(1);
        let (scheduler, gate) = scheduler(config);

        scheduler.submit(request()).await.unwrap();
        assert!(scheduler.submit(request()).await.is_err());
        let id = scheduler
            .submit(request().with_bypass_admission(true))
            .await
            .unwrap();

        gate.add_permits(2);
        let snapshot = scheduler.wait(id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(scheduler.stats(None).await.peak_running, 1);
    }

    #[tokio::test]
    async fn test_wait_mode_blocks_until_slot_frees() {
        let config = SchedulerConfig {
            max_concurrent: 1,
            admission: AdmissionMode::Wait,
            admission_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (scheduler, gate) = scheduler(config);
        let scheduler = Arc::new(scheduler);

        let first = scheduler.submit(request()).await.unwrap();
        let pending = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.submit(request()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pending.is_finished());

        gate.add_permits(1);
        scheduler.wait(first).await.unwrap();
        let second = pending.await.unwrap().unwrap();

        gate.add_permits(1);
        assert_eq!(scheduler.wait(second).await.unwrap().state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_wait_mode_times_out() {
        let config = SchedulerConfig {
            max_concurrent: 1,
            admission: AdmissionMode::Wait,
            admission_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (scheduler, gate) = scheduler(config);
        scheduler.submit(request()).await.unwrap();

        let err = scheduler.submit(request()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AtCapacity { limit: 1 }));
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_record_precedes_terminal_state() {
        let (scheduler, gate) = scheduler(SchedulerConfig::default());
        let id = scheduler.submit(request()).await.unwrap();
        gate.add_permits(1);

        let snapshot = scheduler.wait(id).await.unwrap();
        assert!(snapshot.state.is_terminal());
        assert!(scheduler.ledger().contains(id).await);

        let history = scheduler.history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].request.id, id);
        assert_eq!(history[0].outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let config = SchedulerConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let (scheduler, gate) = scheduler(config);

        let running = scheduler.submit(request()).await.unwrap();
        let queued = scheduler
            .submit(request().with_bypass_admission(true))
            .await
            .unwrap();

        // Let the worker pick up the first task
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.poll(running).await.unwrap().state, TaskState::Running);
        assert_eq!(scheduler.poll(queued).await.unwrap().state, TaskState::Queued);

        assert!(scheduler.cancel(queued).await);
        assert_eq!(scheduler.poll(queued).await.unwrap().state, TaskState::Cancelled);
        assert!(!scheduler.cancel(queued).await);

        assert!(scheduler.cancel(running).await);
        gate.add_permits(1);
        let snapshot = scheduler.wait(running).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(!scheduler.cancel(running).await);

        let stats = scheduler.stats(None).await;
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.history.cancelled, 2);
    }

    #[tokio::test]
    async fn test_take_result_consumes_task() {
        let (scheduler, gate) = scheduler(SchedulerConfig::default());
        let id = scheduler.submit(request()).await.unwrap();

        assert_eq!(
            scheduler.take_result(id).await.unwrap_err(),
            SchedulerError::NotTerminal(id)
        );

        gate.add_permits(1);
        scheduler.wait(id).await.unwrap();
        let result = scheduler.take_result(id).await.unwrap();
        assert_eq!(result.tier, Tier::Matcher);
        assert_eq!(
            scheduler.poll(id).await.unwrap_err(),
            SchedulerError::UnknownTask(id)
        );
    }

    #[tokio::test]
    async fn test_retention_evicts_finished_tasks() {
        let config = SchedulerConfig {
            task_retention: Duration::from_millis(10),
            ..Default::default()
        };
        let (scheduler, gate) = scheduler(config);
        let id = scheduler.submit(request()).await.unwrap();
        gate.add_permits(1);
        scheduler.wait(id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(scheduler.poll(id).await.is_err());
        assert_eq!(scheduler.history(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_shutdown() {
        let (scheduler, gate) = scheduler(SchedulerConfig::default());
        let req = request();
        let dup = req.clone();
        scheduler.submit(req).await.unwrap();
        assert!(matches!(
            scheduler.submit(dup).await,
            Err(SchedulerError::DuplicateTask(_))
        ));

        gate.add_permits(1);
        scheduler.shutdown().await;
        assert_eq!(
            scheduler.submit(request()).await.unwrap_err(),
            SchedulerError::ShuttingDown
        );
    }
}
