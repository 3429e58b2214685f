//! Error types for PadPilot.
//!
//! Each concern has its own enum; [`Error`] aggregates them for callers that
//! only want a single error type.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::controller::ControllerState;
use crate::types::{ActionKind, FailureKind, TaskId};

/// Result type alias using the crate-level error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl Error {
    /// Create a template error with a custom message.
    pub fn template(msg: impl Into<String>) -> Self {
        Error::Template(msg.into())
    }

    /// Check if this is an admission-control rejection.
    pub fn is_at_capacity(&self) -> bool {
        matches!(self, Error::Scheduler(SchedulerError::AtCapacity { .. }))
    }

    /// Check if this is a controller start while not idle.
    pub fn is_already_running(&self) -> bool {
        matches!(self, Error::Controller(ControllerError::AlreadyRunning(_)))
    }
}

// ============================================================================
// Capture
// ============================================================================

/// Errors raised while grabbing a frame from the device.
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    /// The device link reported a failure
    #[error("device capture failed: {0}")]
    Device(String),

    /// The device returned zero bytes
    #[error("device returned an empty frame")]
    EmptyFrame,

    /// The bytes were not a decodable image
    #[error("could not decode frame: {0}")]
    Decode(String),

    /// The blocking capture task panicked or was aborted
    #[error("capture task failed: {0}")]
    Join(String),
}

// ============================================================================
// Model
// ============================================================================

/// Errors that can occur during vision model operations.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    /// Request timed out
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP transport failed or the endpoint returned an error status
    #[error("transport error: {0}")]
    Transport(String),

    /// Endpoint asked us to back off
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Response was not the JSON we asked for
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Screenshot could not be encoded for upload
    #[error("image encoding error: {0}")]
    Image(String),

    /// Client configuration is unusable
    #[error("configuration error: {0}")]
    Config(String),
}

impl ModelError {
    /// Create a malformed-response error with a custom message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        ModelError::MalformedResponse(msg.into())
    }

    /// Classify for diagnostics. Local encoding and configuration problems
    /// count as transport failures since no usable request left the process.
    pub fn kind(&self) -> FailureKind {
        match self {
            ModelError::Timeout(_) => FailureKind::Timeout,
            ModelError::MalformedResponse(_) => FailureKind::MalformedResponse,
            ModelError::Transport(_)
            | ModelError::RateLimited(_)
            | ModelError::Image(_)
            | ModelError::Config(_) => FailureKind::Transport,
        }
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModelError::Timeout(_))
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        ModelError::Transport(err.to_string())
    }
}

/// Failure of one recognition tier as seen by the pipeline.
#[derive(Error, Debug, Clone)]
pub enum RecognitionError {
    #[error("matcher failed: {0}")]
    Matcher(String),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl RecognitionError {
    /// Failure classification, if this came from the model tier.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RecognitionError::Matcher(_) => None,
            RecognitionError::Model(e) => Some(e.kind()),
        }
    }
}

// ============================================================================
// Scheduler / Controller
// ============================================================================

/// Errors surfaced synchronously by the task scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Admission control rejected the request
    #[error("at capacity: {limit} analyses already running")]
    AtCapacity { limit: usize },

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} was already submitted")]
    DuplicateTask(TaskId),

    #[error("task {0} has not finished yet")]
    NotTerminal(TaskId),

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Errors from the continuous controller state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// `start` was called while not idle
    #[error("controller is already {0:?}")]
    AlreadyRunning(ControllerState),

    #[error("controller is not running")]
    NotRunning,

    #[error("invalid run parameters: {0}")]
    InvalidRun(String),
}

/// Errors returned by an action executor.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("action failed: {0}")]
    Failed(String),

    #[error("action {0:?} is not supported by this executor")]
    Unsupported(ActionKind),
}

// ============================================================================
// Config / Persistence
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create an invalid-value error with a custom message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// Errors writing results or ledger snapshots to disk.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
