//! The assembled assistant: one entry point over scheduler, controller,
//! ledger and prompts.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use padpilot_core::{Assistant, AssistantConfig, CapturePort, CaptureError};
//!
//! struct Adb;
//!
//! impl CapturePort for Adb {
//!     fn capture(&self) -> Result<Vec<u8>, CaptureError> {
//!         Err(CaptureError::Device("not connected".into()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> padpilot_core::Result<()> {
//!     let config = AssistantConfig::load_from_file("padpilot.toml")?.apply_env_overrides();
//!     let assistant = Assistant::builder(config, Arc::new(Adb))
//!         .with_template_dir("templates")?
//!         .with_http_model()
//!         .build()?;
//!
//!     let id = assistant.capture_and_submit(Some("main menu")).await?;
//!     let task = assistant.wait(id).await?;
//!     println!("{:?}", task.result);
//!
//!     assistant.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::capture::{CapturePort, Screenshot, SerializedCapture};
use crate::config::AssistantConfig;
use crate::controller::{
    ActionExecutor, ContinuousController, ControllerEvent, ControllerState, ControllerStatus,
};
use crate::error::{ControllerError, Result};
use crate::ledger::HistoryLedger;
use crate::matcher::{Template, TemplateMatcher};
use crate::model::{ModelClient, ModelRecognizer, VisionClient};
use crate::pipeline::{RecognitionPipeline, Recognizer};
use crate::prompt::{OptimizationOutcome, PromptOptimizer, PromptProfile, PromptStore};
use crate::scheduler::{SchedulerStats, TaskScheduler, TaskSnapshot};
use crate::types::{AnalysisRequest, AnalysisResult, HistoryRecord, TaskClass, TaskId};

// ============================================================================
// Builder
// ============================================================================

/// Wires the assistant's collaborators.
pub struct AssistantBuilder {
    config: AssistantConfig,
    capture: Arc<dyn CapturePort>,
    templates: Vec<Template>,
    matcher: Option<Arc<dyn Recognizer>>,
    model_client: Option<Arc<dyn ModelClient>>,
    http_model: bool,
    executor: Option<Arc<dyn ActionExecutor>>,
}

impl AssistantBuilder {
    pub fn with_templates(mut self, templates: impl IntoIterator<Item = Template>) -> Self {
        self.templates.extend(templates);
        self
    }

    /// Load every image template (and JSON sidecar) in `dir`.
    pub fn with_template_dir(mut self, dir: impl AsRef<Path>) -> Result<Self> {
        self.templates.extend(Template::load_dir(dir)?);
        Ok(self)
    }

    /// Replace the template matcher with another fast-tier recognizer.
    pub fn with_matcher(mut self, matcher: Arc<dyn Recognizer>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_model_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.model_client = Some(client);
        self
    }

    /// Use the OpenAI-compatible HTTP client from `config.model`.
    pub fn with_http_model(mut self) -> Self {
        self.http_model = true;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Validate the configuration and start the worker pool.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<Assistant> {
        let config = self.config;
        config.validate()?;

        let matcher = match self.matcher {
            Some(matcher) => matcher,
            None => Arc::new(TemplateMatcher::new(config.matcher.clone(), self.templates)),
        };

        let client: Option<Arc<dyn ModelClient>> = match (self.model_client, self.http_model) {
            (Some(client), _) => Some(client),
            (None, true) => Some(Arc::new(VisionClient::new(config.model.clone())?)),
            (None, false) => None,
        };

        let mut pipeline = RecognitionPipeline::new(
            matcher,
            config.pipeline.clone(),
            config.matcher.acceptance_threshold,
        );
        if let Some(client) = &client {
            let recognizer = ModelRecognizer::new(client.clone(), config.model.clone());
            pipeline = pipeline.with_model(Arc::new(recognizer), config.model.timeout);
        }

        let model_tier = pipeline.has_model();
        let ledger = Arc::new(HistoryLedger::new(config.scheduler.history_limit));
        let prompts = Arc::new(PromptStore::new());
        let optimizer = Arc::new(PromptOptimizer::new(
            config.optimization.clone(),
            prompts,
            client,
        ));
        let scheduler = Arc::new(TaskScheduler::with_optimizer(
            config.scheduler.clone(),
            Arc::new(pipeline),
            ledger,
            optimizer,
        ));

        let capture = Arc::new(SerializedCapture::new(self.capture));
        let mut controller =
            ContinuousController::new(config.continuous.clone(), scheduler.clone(), capture.clone());
        if let Some(executor) = self.executor {
            controller = controller.with_executor(executor);
        }

        info!(
            "Assistant ready: ceiling {}, model tier {}",
            config.scheduler.max_concurrent,
            if model_tier { "on" } else { "off" }
        );

        Ok(Assistant {
            config,
            scheduler,
            controller,
            capture,
        })
    }
}

// ============================================================================
// Assistant
// ============================================================================

pub struct Assistant {
    config: AssistantConfig,
    scheduler: Arc<TaskScheduler>,
    controller: ContinuousController,
    capture: Arc<SerializedCapture>,
}

impl Assistant {
    pub fn builder(config: AssistantConfig, capture: Arc<dyn CapturePort>) -> AssistantBuilder {
        AssistantBuilder {
            config,
            capture,
            templates: Vec::new(),
            matcher: None,
            model_client: None,
            http_model: false,
            executor: None,
        }
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Submit encoded image bytes for analysis.
    pub async fn submit(&self, image: &[u8], context: Option<&str>) -> Result<TaskId> {
        let screenshot = Screenshot::from_bytes(image, "submitted")?;
        let mut request = AnalysisRequest::new(screenshot);
        if let Some(context) = context {
            request = request.with_context(context);
        }
        self.submit_request(request).await
    }

    pub async fn submit_request(&self, request: AnalysisRequest) -> Result<TaskId> {
        Ok(self.scheduler.submit(request).await?)
    }

    /// Capture a frame from the device and submit it.
    pub async fn capture_and_submit(&self, context: Option<&str>) -> Result<TaskId> {
        let screenshot = self.capture.capture().await?;
        let mut request = AnalysisRequest::new(screenshot);
        if let Some(context) = context {
            request = request.with_context(context);
        }
        self.submit_request(request).await
    }

    pub async fn status(&self, id: TaskId) -> Result<TaskSnapshot> {
        Ok(self.scheduler.poll(id).await?)
    }

    pub async fn wait(&self, id: TaskId) -> Result<TaskSnapshot> {
        Ok(self.scheduler.wait(id).await?)
    }

    /// Consume a finished task's result.
    pub async fn take_result(&self, id: TaskId) -> Result<AnalysisResult> {
        Ok(self.scheduler.take_result(id).await?)
    }

    pub async fn cancel(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id).await
    }

    /// Start continuous mode; `None` falls back to the configured value.
    pub async fn start_continuous(
        &self,
        interval: Option<Duration>,
        max_iterations: Option<u32>,
        threshold: Option<f32>,
    ) -> Result<()> {
        let c = &self.config.continuous;
        self.controller
            .start(
                interval.unwrap_or(c.default_interval),
                max_iterations.unwrap_or(c.max_iterations),
                threshold.unwrap_or(c.priority_threshold),
            )
            .await?;
        Ok(())
    }

    pub async fn stop_continuous(&self) -> Result<ControllerState> {
        Ok(self.controller.stop().await?)
    }

    /// Make a stopped or exhausted controller startable again.
    pub async fn reset_continuous(&self) -> Result<()> {
        Ok(self.controller.reset().await?)
    }

    pub async fn wait_continuous(&self) -> ControllerState {
        self.controller.wait_finished().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.controller.subscribe()
    }

    pub async fn controller_status(&self) -> ControllerStatus {
        self.controller.status().await
    }

    /// Most recent first.
    pub async fn history(&self, limit: usize) -> Vec<Arc<HistoryRecord>> {
        self.scheduler.history(limit).await
    }

    pub async fn stats(&self, window: Option<usize>) -> SchedulerStats {
        self.scheduler.stats(window).await
    }

    /// Active prompt profile per task class.
    pub async fn prompts(&self) -> Vec<Arc<PromptProfile>> {
        self.scheduler.prompts().snapshot().await
    }

    /// Re-tune the prompt for `class` now, optionally steered by operator
    /// feedback. Needs a model client and enough fresh history.
    pub async fn optimize_prompts(
        &self,
        class: TaskClass,
        feedback: Option<&str>,
    ) -> Result<OptimizationOutcome> {
        Ok(self.scheduler.optimize_prompts(class, feedback).await?)
    }

    pub async fn export_history(&self, path: impl AsRef<Path>) -> Result<usize> {
        Ok(self.scheduler.ledger().export_json(path).await?)
    }

    /// Stop continuous mode if it is running, then drain the scheduler.
    pub async fn shutdown(&self) {
        match self.controller.stop().await {
            Ok(state) => info!("Continuous mode ended as {:?}", state),
            Err(ControllerError::NotRunning) => {}
            Err(e) => info!("Continuous mode not stopped: {}", e),
        }
        self.scheduler.shutdown().await;
    }
}
