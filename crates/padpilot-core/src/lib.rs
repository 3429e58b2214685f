//! # PadPilot Core
//!
//! Analysis scheduling and recognition for unattended handheld-device
//! automation: capture the screen, decide what is on it, and propose or
//! perform the next action.
//!
//! # Architecture
//!
//! - `capture` - Capture port trait, decoded frames, serialized device access
//! - `matcher` - Template matcher (fast tier)
//! - `model` - Vision model client and response parsing (slow tier)
//! - `pipeline` - Confidence-gated composition of the two tiers
//! - `scheduler` - Admission control, worker pool, task lifecycle
//! - `ledger` - Bounded history of finished analyses
//! - `prompt` - Active prompt profiles and the history-driven optimizer
//! - `controller` - Continuous capture/analyze/act loop
//! - `persist` - Per-tick result files
//! - `assistant` - Facade wiring everything from one config
//! - `config`, `error`, `logging` - Ambient plumbing
//!
//! Every analysis goes through the scheduler; nothing reaches the model
//! tier except through its admission gate.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use padpilot_core::prelude::*;
//!
//! # struct Device;
//! # impl CapturePort for Device {
//! #     fn capture(&self) -> std::result::Result<Vec<u8>, CaptureError> { Ok(Vec::new()) }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     padpilot_core::logging::init("info")?;
//!
//!     let assistant = Assistant::builder(AssistantConfig::default(), Arc::new(Device))
//!         .with_http_model()
//!         .build()?;
//!
//!     let mut events = assistant.subscribe();
//!     assistant
//!         .start_continuous(Some(Duration::from_secs(45)), Some(10), None)
//!         .await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ControllerEvent::Suggested { suggestion, .. } = event {
//!             println!("suggested: {}", suggestion.description);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod assistant;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod matcher;
pub mod model;
pub mod persist;
pub mod pipeline;
pub mod prompt;
pub mod scheduler;
pub mod types;

pub use error::{Error, Result};

pub use error::{
    CaptureError, ConfigError, ControllerError, ExecutionError, ModelError, PersistError,
    RecognitionError, SchedulerError,
};

pub use types::{
    ActionKind, ActionSuggestion, ActionTarget, AnalysisRequest, AnalysisResult, BoundingBox,
    Diagnostics, Element, ElementKind, FailureKind, HistoryRecord, Outcome, RequestSummary,
    TaskClass, TaskId, Tier,
};

pub use config::{
    AdmissionMode, AssistantConfig, ContinuousConfig, ImageFormat, MatcherConfig, ModelConfig,
    OptimizationConfig, PipelineConfig, SchedulerConfig,
};

pub use capture::{CapturePort, Screenshot, SerializedCapture};
pub use matcher::{Template, TemplateAction, TemplateMatcher};
pub use model::{ModelClient, ModelRecognizer, ModelRequest, StructuredResult, VisionClient};
pub use pipeline::{PartialResult, RecognitionInput, RecognitionPipeline, Recognizer};
pub use ledger::{HistoryLedger, LedgerStats};
pub use prompt::{
    OptimizationOutcome, PromptOptimizer, PromptProfile, PromptSource, PromptStore, SkipReason,
};
pub use scheduler::{SchedulerStats, TaskScheduler, TaskSnapshot, TaskState};
pub use controller::{
    ActionExecutor, ContinuousController, ControllerEvent, ControllerState, ControllerStatus,
    TickSkip,
};
pub use persist::ResultStore;
pub use assistant::{Assistant, AssistantBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::{
        // Error handling
        Error, Result, CaptureError, ModelError, SchedulerError, ControllerError,

        // Core types
        AnalysisRequest, AnalysisResult, ActionSuggestion, ActionKind, Element, ElementKind,
        TaskClass, TaskId, Tier, Outcome,

        // Config
        AssistantConfig, AdmissionMode,

        // Collaborators
        CapturePort, ModelClient, ActionExecutor, Recognizer,

        // Components
        Assistant, TaskScheduler, TaskState, ContinuousController, ControllerEvent,
        ControllerState, HistoryLedger, PromptStore,
    };
}
