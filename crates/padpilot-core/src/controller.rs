//! Continuous controller: the unattended capture → analyze → act loop.
//!
//! # State machine
//!
//! `Idle → Running → {Stopped, Exhausted}`; [`ContinuousController::reset`]
//! brings a finished controller back to `Idle`.
//!
//! # Pacing
//!
//! Each tick starts no earlier than `previous tick start + interval`, where
//! the interval is floored at `min_interval`. A tick whose analysis outruns
//! the interval is awaited to completion, so the next tick is deferred, never
//! overlapped. Only `stop()` or an explicit `tick_timeout` cancels an
//! in-flight analysis.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::SerializedCapture;
use crate::config::ContinuousConfig;
use crate::error::{ControllerError, ExecutionError};
use crate::persist::ResultStore;
use crate::scheduler::TaskScheduler;
use crate::types::{ActionSuggestion, AnalysisRequest, AnalysisResult, Outcome, TaskId, Tier};

type Result<T> = std::result::Result<T, ControllerError>;

const EVENT_CAPACITY: usize = 64;

// ============================================================================
// State, status and events
// ============================================================================

/// Lifecycle state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    #[default]
    Idle,
    Running,
    /// Stopped on request
    Stopped,
    /// Reached its iteration limit
    Exhausted,
}

/// Counters for the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub state: ControllerState,
    /// Effective tick interval in milliseconds, after the floor
    pub interval_ms: Option<u64>,
    pub max_iterations: u32,
    pub threshold: f32,
    pub iterations: u32,
    pub successful_ticks: u32,
    pub failed_ticks: u32,
    pub capture_failures: u32,
    pub consecutive_capture_failures: u32,
    pub link_degraded: bool,
    pub auto_executions: u32,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// Why a tick produced no result.
#[derive(Debug, Clone, PartialEq)]
pub enum TickSkip {
    Capture(String),
    /// The scheduler refused the request
    Rejected(String),
    /// The analysis exceeded `tick_timeout` and was cancelled
    TimedOut,
}

/// Observable controller activity.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    TickStarted {
        iteration: u32,
        at: std::time::Instant,
    },
    TickCompleted {
        iteration: u32,
        request_id: TaskId,
        success: bool,
        tier: Tier,
        outcome: Outcome,
        latency: Duration,
    },
    /// Top suggestion surfaced without being executed
    Suggested {
        iteration: u32,
        suggestion: ActionSuggestion,
        weighted_confidence: f32,
        degraded: bool,
    },
    AutoExecuted {
        iteration: u32,
        suggestion: ActionSuggestion,
        weighted_confidence: f32,
    },
    TickSkipped {
        iteration: u32,
        reason: TickSkip,
    },
    /// Consecutive capture failures reached the configured limit
    LinkDegraded { consecutive_failures: u32 },
    LinkRestored,
}

// ============================================================================
// Execution collaborator
// ============================================================================

/// Carries out a suggested action on the device.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, suggestion: &ActionSuggestion) -> std::result::Result<(), ExecutionError>;
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct RunParams {
    interval: Duration,
    /// Hard cap on awaiting a tick's analysis; `None` waits it out
    tick_bound: Option<Duration>,
    max_iterations: u32,
    threshold: f32,
}

struct ActiveRun {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    config: ContinuousConfig,
    scheduler: Arc<TaskScheduler>,
    capture: Arc<SerializedCapture>,
    executor: Option<Arc<dyn ActionExecutor>>,
    store: Option<ResultStore>,
    state_tx: watch::Sender<ControllerState>,
    status: RwLock<ControllerStatus>,
    events: broadcast::Sender<ControllerEvent>,
}

/// Drives the scheduler at a fixed cadence.
pub struct ContinuousController {
    shared: Arc<Shared>,
    run: Mutex<Option<ActiveRun>>,
}

impl ContinuousController {
    pub fn new(
        config: ContinuousConfig,
        scheduler: Arc<TaskScheduler>,
        capture: Arc<SerializedCapture>,
    ) -> Self {
        let store = config
            .save_results
            .then(|| ResultStore::new(config.results_dir.clone()));
        let (state_tx, _) = watch::channel(ControllerState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                scheduler,
                capture,
                executor: None,
                store,
                state_tx,
                status: RwLock::new(ControllerStatus::default()),
                events,
            }),
            run: Mutex::new(None),
        }
    }

    /// Attach the collaborator used for auto-execution.
    ///
    /// Must be called before the controller is shared.
    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.executor = Some(executor);
        }
        self
    }

    pub fn config(&self) -> &ContinuousConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ControllerState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ControllerState::Running
    }

    pub async fn status(&self) -> ControllerStatus {
        self.shared.status.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.shared.events.subscribe()
    }

    pub fn state_watch(&self) -> watch::Receiver<ControllerState> {
        self.shared.state_tx.subscribe()
    }

    /// Start with the configured interval, iteration limit and threshold.
    pub async fn start_default(&self) -> Result<()> {
        let c = &self.shared.config;
        self.start(c.default_interval, c.max_iterations, c.priority_threshold)
            .await
    }

    /// Start the loop. `max_iterations = 0` runs until stopped.
    ///
    /// `interval` is raised to `min_interval` if it is smaller.
    pub async fn start(&self, interval: Duration, max_iterations: u32, threshold: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ControllerError::InvalidRun(format!(
                "auto-execute threshold {} is outside [0, 1]",
                threshold
            )));
        }

        let mut run = self.run.lock().await;
        let mut previous = ControllerState::Idle;
        let started = self.shared.state_tx.send_if_modified(|state| {
            previous = *state;
            if *state == ControllerState::Idle {
                *state = ControllerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ControllerError::AlreadyRunning(previous));
        }

        let min_interval = self.shared.config.min_interval;
        let effective = interval.max(min_interval);
        if effective > interval {
            warn!(
                "Requested interval {:?} is below the {:?} floor, using the floor",
                interval, min_interval
            );
        }
        let params = RunParams {
            interval: effective,
            tick_bound: self.shared.config.tick_timeout,
            max_iterations,
            threshold,
        };

        *self.shared.status.write().await = ControllerStatus {
            state: ControllerState::Running,
            interval_ms: Some(effective.as_millis() as u64),
            max_iterations,
            threshold,
            ..Default::default()
        };
        self.shared.emit(ControllerEvent::StateChanged {
            from: ControllerState::Idle,
            to: ControllerState::Running,
        });
        info!(
            "Continuous mode started: interval {:?}, max iterations {}, threshold {:.2}",
            effective, max_iterations, threshold
        );

        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.shared.clone(), params, stop.clone()));
        *run = Some(ActiveRun { stop, handle });
        Ok(())
    }

    /// Stop at the next safe point and wait for the loop to finish.
    ///
    /// An in-flight analysis is cancelled and awaited first. Returns the
    /// final state, which is `Exhausted` if the limit was reached first.
    pub async fn stop(&self) -> Result<ControllerState> {
        let mut run = self.run.lock().await;
        if self.state() != ControllerState::Running {
            return Err(ControllerError::NotRunning);
        }
        let active = run.take().ok_or(ControllerError::NotRunning)?;
        info!("Stopping continuous mode");
        active.stop.cancel();
        if let Err(e) = active.handle.await {
            error!("Controller loop ended abnormally: {}", e);
            self.shared.finish(ControllerState::Stopped).await;
        }
        Ok(self.state())
    }

    /// Return a stopped or exhausted controller to `Idle`.
    pub async fn reset(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        let current = self.state();
        match current {
            ControllerState::Idle => return Ok(()),
            ControllerState::Running => return Err(ControllerError::AlreadyRunning(current)),
            ControllerState::Stopped | ControllerState::Exhausted => {}
        }
        if let Some(active) = run.take() {
            let _ = active.handle.await;
        }
        self.shared.state_tx.send_replace(ControllerState::Idle);
        self.shared.status.write().await.state = ControllerState::Idle;
        self.shared.emit(ControllerEvent::StateChanged {
            from: current,
            to: ControllerState::Idle,
        });
        Ok(())
    }

    /// Resolve once the controller is no longer running.
    pub async fn wait_finished(&self) -> ControllerState {
        let mut rx = self.shared.state_tx.subscribe();
        let finished = match rx.wait_for(|state| *state != ControllerState::Running).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        finished
    }
}

impl Drop for ContinuousController {
    fn drop(&mut self) {
        if let Ok(mut run) = self.run.try_lock() {
            if let Some(active) = run.take() {
                active.stop.cancel();
            }
        }
    }
}

async fn run_loop(shared: Arc<Shared>, params: RunParams, stop: CancellationToken) {
    let mut iteration = 0u32;
    let mut next_tick: Option<Instant> = None;

    let final_state = loop {
        if params.max_iterations > 0 && iteration >= params.max_iterations {
            break ControllerState::Exhausted;
        }
        if stop.is_cancelled() {
            break ControllerState::Stopped;
        }
        if let Some(at) = next_tick {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break ControllerState::Stopped,
                _ = tokio::time::sleep_until(at) => {}
            }
        }

        iteration += 1;
        let started = Instant::now();
        next_tick = Some(started + params.interval);
        shared.tick(iteration, started, &params, &stop).await;
        if Instant::now() > started + params.interval {
            debug!("Tick {} outran the interval, next tick starts late", iteration);
        }
    };

    shared.finish(final_state).await;
}

impl Shared {
    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn finish(&self, state: ControllerState) {
        let from = self.state_tx.send_replace(state);
        self.status.write().await.state = state;
        if from != state {
            self.emit(ControllerEvent::StateChanged { from, to: state });
        }
        info!("Continuous mode finished: {:?}", state);
    }

    async fn tick(&self, iteration: u32, started: Instant, params: &RunParams, stop: &CancellationToken) {
        debug!("Tick {} starting", iteration);
        {
            let mut status = self.status.write().await;
            status.iterations = iteration;
            status.last_tick_at = Some(Utc::now());
        }
        self.emit(ControllerEvent::TickStarted {
            iteration,
            at: started.into_std(),
        });

        let screenshot = match self.capture.capture().await {
            Ok(shot) => {
                self.capture_succeeded().await;
                shot
            }
            Err(e) => {
                self.capture_failed(iteration, e.to_string()).await;
                return;
            }
        };

        let id = match self.scheduler.submit(AnalysisRequest::new(screenshot)).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Tick {} rejected by scheduler: {}", iteration, e);
                self.skip(iteration, TickSkip::Rejected(e.to_string())).await;
                return;
            }
        };

        let Some(result) = self.await_result(iteration, id, params, stop).await else {
            return;
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save(iteration, &result).await {
                warn!("Failed to save result for tick {}: {}", iteration, e);
            }
        }

        {
            let mut status = self.status.write().await;
            if result.success {
                status.successful_ticks += 1;
            } else {
                status.failed_ticks += 1;
            }
        }
        self.emit(ControllerEvent::TickCompleted {
            iteration,
            request_id: result.request_id,
            success: result.success,
            tier: result.tier,
            outcome: result.outcome(),
            latency: result.latency,
        });

        self.act(iteration, &result, params.threshold).await;
    }

    /// Wait for the tick's task. An analysis that outruns the interval
    /// defers the next tick; it is cancelled only on stop or when it
    /// exceeds an explicit `tick_timeout`. `None` when there is no result
    /// to act on.
    async fn await_result(
        &self,
        iteration: u32,
        id: TaskId,
        params: &RunParams,
        stop: &CancellationToken,
    ) -> Option<AnalysisResult> {
        let finished = async {
            match params.tick_bound {
                Some(bound) => tokio::time::timeout(bound, self.scheduler.wait(id))
                    .await
                    .is_ok(),
                None => {
                    let _ = self.scheduler.wait(id).await;
                    true
                }
            }
        };
        let finished = tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            finished = finished => finished,
        };

        let mut timed_out = false;
        if !finished {
            timed_out = !stop.is_cancelled();
            if timed_out {
                warn!(
                    "Tick {} exceeded its {:?} cap, cancelling the analysis",
                    iteration, params.tick_bound
                );
            }
            self.scheduler.cancel(id).await;
            if let Err(e) = self.scheduler.wait(id).await {
                warn!("Lost track of tick {} task: {}", iteration, e);
            }
        }

        let result = match self.scheduler.take_result(id).await {
            Ok(result) => result,
            Err(e) => {
                warn!("No result for tick {}: {}", iteration, e);
                self.status.write().await.failed_ticks += 1;
                return None;
            }
        };

        if result.diagnostics.cancelled {
            if timed_out {
                self.skip(iteration, TickSkip::TimedOut).await;
            } else {
                self.status.write().await.failed_ticks += 1;
            }
            return None;
        }
        Some(result)
    }

    async fn act(&self, iteration: u32, result: &AnalysisResult, threshold: f32) {
        let Some(top) = result.top_suggestion() else {
            return;
        };
        let weighted = top.weighted_confidence();
        let degraded = result.is_degraded();
        let eligible = self.config.auto_execute && !degraded && weighted > threshold;

        if let (true, Some(executor)) = (eligible, &self.executor) {
            match executor.execute(top).await {
                Ok(()) => {
                    info!(
                        "Tick {} auto-executed {} ({:.2})",
                        iteration, top.action, weighted
                    );
                    self.status.write().await.auto_executions += 1;
                    self.emit(ControllerEvent::AutoExecuted {
                        iteration,
                        suggestion: top.clone(),
                        weighted_confidence: weighted,
                    });
                    return;
                }
                Err(e) => warn!("Auto-execution failed on tick {}: {}", iteration, e),
            }
        }

        debug!("Tick {} suggests {} ({:.2})", iteration, top.action, weighted);
        self.emit(ControllerEvent::Suggested {
            iteration,
            suggestion: top.clone(),
            weighted_confidence: weighted,
            degraded,
        });
    }

    async fn skip(&self, iteration: u32, reason: TickSkip) {
        self.status.write().await.failed_ticks += 1;
        self.emit(ControllerEvent::TickSkipped { iteration, reason });
    }

    async fn capture_succeeded(&self) {
        let mut status = self.status.write().await;
        if status.link_degraded {
            info!(
                "Device link restored after {} failed captures",
                status.consecutive_capture_failures
            );
            status.link_degraded = false;
            self.emit(ControllerEvent::LinkRestored);
        }
        status.consecutive_capture_failures = 0;
    }

    async fn capture_failed(&self, iteration: u32, error: String) {
        let degraded_now = {
            let mut status = self.status.write().await;
            status.capture_failures += 1;
            status.consecutive_capture_failures += 1;
            let hit = !status.link_degraded
                && status.consecutive_capture_failures >= self.config.link_degraded_after;
            if hit {
                status.link_degraded = true;
            }
            hit.then_some(status.consecutive_capture_failures)
        };

        self.skip(iteration, TickSkip::Capture(error)).await;
        if let Some(consecutive_failures) = degraded_now {
            warn!(
                "Device link degraded: {} consecutive capture failures",
                consecutive_failures
            );
            self.emit(ControllerEvent::LinkDegraded {
                consecutive_failures,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CapturePort;
    use crate::config::{PipelineConfig, SchedulerConfig};
    use crate::error::CaptureError;
    use crate::ledger::HistoryLedger;
    use crate::pipeline::{PartialResult, RecognitionInput, Recognizer, RecognitionPipeline};
    use crate::prompt::PromptStore;
    use crate::error::RecognitionError;
    use image::{DynamicImage, RgbImage};

    struct StaticPort;

    impl CapturePort for StaticPort {
        fn capture(&self) -> std::result::Result<Vec<u8>, CaptureError> {
            crate::capture::encode_png(&DynamicImage::ImageRgb8(RgbImage::new(8, 8)))
        }
    }

    struct NothingMatcher;

    #[async_trait]
    impl Recognizer for NothingMatcher {
        fn tier(&self) -> Tier {
            Tier::Matcher
        }

        async fn analyze(&self, _input: &RecognitionInput) -> std::result::Result<PartialResult, RecognitionError> {
            Ok(PartialResult::empty())
        }
    }

    fn controller(config: ContinuousConfig) -> ContinuousController {
        let pipeline = Arc::new(RecognitionPipeline::new(
            Arc::new(NothingMatcher),
            PipelineConfig::default(),
            0.8,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig::default(),
            pipeline,
            Arc::new(HistoryLedger::new(10)),
            Arc::new(PromptStore::new()),
        ));
        let capture = Arc::new(SerializedCapture::new(Arc::new(StaticPort)));
        ContinuousController::new(config, scheduler, capture)
    }

    fn fast_config() -> ContinuousConfig {
        ContinuousConfig::default().with_min_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let controller = controller(fast_config());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.stop().await, Err(ControllerError::NotRunning));

        controller.start(Duration::from_millis(10), 2, 0.5).await.unwrap();
        assert_eq!(controller.wait_finished().await, ControllerState::Exhausted);
        assert_eq!(controller.status().await.iterations, 2);

        let err = controller.start(Duration::from_millis(10), 1, 0.5).await.unwrap_err();
        assert_eq!(err, ControllerError::AlreadyRunning(ControllerState::Exhausted));

        controller.reset().await.unwrap();
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn test_stop_is_not_mid_tick() {
        let controller = controller(fast_config());
        let mut events = controller.subscribe();
        controller.start(Duration::from_secs(5), 0, 0.5).await.unwrap();
        assert_eq!(
            controller.start(Duration::from_secs(5), 0, 0.5).await.unwrap_err(),
            ControllerError::AlreadyRunning(ControllerState::Running)
        );

        // First tick runs immediately; the second would wait five seconds
        loop {
            if let Ok(ControllerEvent::TickCompleted { iteration: 1, .. }) = events.recv().await {
                break;
            }
        }
        assert_eq!(controller.stop().await.unwrap(), ControllerState::Stopped);
        assert_eq!(controller.status().await.iterations, 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_threshold() {
        let controller = controller(fast_config());
        assert!(matches!(
            controller.start(Duration::from_secs(1), 0, 1.5).await,
            Err(ControllerError::InvalidRun(_))
        ));
        assert_eq!(controller.state(), ControllerState::Idle);
    }
}
