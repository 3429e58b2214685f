//! # Configuration
//!
//! Typed configuration for every component. Each section is handed to its
//! component by value at construction time; nothing reads global state.
//!
//! Every field carries an explicit default, so a TOML file only needs to
//! mention what it changes:
//!
//! ```toml
//! [matcher]
//! acceptance_threshold = 0.85
//!
//! [continuous]
//! min_interval = 45.0
//! auto_execute = true
//! ```
//!
//! Durations are written as (fractional) seconds. Environment variables with
//! the `PADPILOT_` prefix override the model endpoint and scheduler ceiling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Root
// ============================================================================

/// Complete assistant configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default)]
    pub matcher: MatcherConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub continuous: ContinuousConfig,

    #[serde(default)]
    pub optimization: OptimizationConfig,
}

impl AssistantConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_toml_string()?).map_err(io_err)?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Apply `PADPILOT_*` environment overrides.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("PADPILOT_MODEL_ENDPOINT") {
            debug!("Model endpoint from env: {}", endpoint);
            self.model.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("PADPILOT_MODEL_NAME") {
            self.model.model_name = model;
        }
        if let Ok(key) = std::env::var("PADPILOT_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(n) = std::env::var("PADPILOT_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            debug!("Scheduler ceiling from env: {}", n);
            self.scheduler.max_concurrent = n;
        }
        self
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.matcher.validate()?;
        self.model.validate()?;
        self.scheduler.validate()?;
        self.continuous.validate()?;
        self.optimization.validate()?;
        if let Some(cap) = self.continuous.tick_timeout {
            if cap <= self.model.timeout {
                return Err(ConfigError::invalid(format!(
                    "continuous.tick_timeout ({:?}) must exceed model.timeout ({:?})",
                    cap, self.model.timeout
                )));
            }
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(format!(
            "{} must be between 0 and 1, got {}",
            name, value
        )));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Matcher
// ============================================================================

/// Template matcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Minimum best-match score that skips the model tier
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f32,

    /// Minimum score for a template hit to be reported at all
    #[serde(default = "default_min_match_score")]
    pub min_match_score: f32,

    /// Scale applied to frame and templates before searching
    #[serde(default = "default_downscale")]
    pub downscale: f32,

    /// Search step in (downscaled) pixels
    #[serde(default = "default_stride")]
    pub stride: u32,
}

fn default_acceptance_threshold() -> f32 {
    0.8
}

fn default_min_match_score() -> f32 {
    0.3
}

fn default_downscale() -> f32 {
    0.5
}

fn default_stride() -> u32 {
    2
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: default_acceptance_threshold(),
            min_match_score: default_min_match_score(),
            downscale: default_downscale(),
            stride: default_stride(),
        }
    }
}

impl MatcherConfig {
    pub fn with_acceptance_threshold(mut self, threshold: f32) -> Self {
        self.acceptance_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_unit("matcher.acceptance_threshold", self.acceptance_threshold)?;
        check_unit("matcher.min_match_score", self.min_match_score)?;
        if !(self.downscale > 0.0 && self.downscale <= 1.0) {
            return Err(ConfigError::invalid("matcher.downscale must be in (0, 1]"));
        }
        if self.stride == 0 {
            return Err(ConfigError::invalid("matcher.stride must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Model
// ============================================================================

/// Image format for encoding screenshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    #[default]
    Jpeg,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }
}

/// Vision model endpoint (OpenAI-compatible chat completions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Optional API key for authenticated endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-inference bound
    #[serde(default = "default_model_timeout", with = "duration_secs")]
    pub timeout: Duration,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub image_format: ImageFormat,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Frames larger than this are scaled down before upload
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,
}

fn default_endpoint() -> String {
    "http://localhost:11434/v1/chat/completions".to_string()
}

fn default_model_name() -> String {
    "llava".to_string()
}

fn default_model_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.1
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_max_image_dimension() -> u32 {
    1280
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model_name: default_model_name(),
            api_key: None,
            timeout: default_model_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            image_format: ImageFormat::default(),
            jpeg_quality: default_jpeg_quality(),
            max_image_dimension: default_max_image_dimension(),
        }
    }
}

impl ModelConfig {
    pub fn new(endpoint: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::invalid("model.endpoint cannot be empty"));
        }
        if self.model_name.is_empty() {
            return Err(ConfigError::invalid("model.model_name cannot be empty"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("model.timeout must be positive"));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::invalid("model.max_tokens must be greater than 0"));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::invalid(
                "model.jpeg_quality must be between 1 and 100",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Recognition policy switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Consult the model when the matcher is not confident enough
    #[serde(default = "default_true")]
    pub model_fallback: bool,

    /// Return the best matcher result, flagged degraded, when the model fails
    #[serde(default = "default_true")]
    pub fallback_to_matcher: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_fallback: true,
            fallback_to_matcher: true,
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// What `submit` does when every slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// Fail immediately with `AtCapacity`
    #[default]
    Reject,
    /// Wait up to `admission_timeout` for a slot
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool size and admission ceiling
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// History ledger capacity
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub admission: AdmissionMode,

    #[serde(default = "default_admission_timeout", with = "duration_secs")]
    pub admission_timeout: Duration,

    /// How long unconsumed terminal tasks are kept
    #[serde(default = "default_task_retention", with = "duration_secs")]
    pub task_retention: Duration,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_history_limit() -> usize {
    100
}

fn default_admission_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_task_retention() -> Duration {
    Duration::from_secs(300)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            history_limit: default_history_limit(),
            admission: AdmissionMode::default(),
            admission_timeout: default_admission_timeout(),
            task_retention: default_task_retention(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_admission(mut self, mode: AdmissionMode) -> Self {
        self.admission = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("scheduler.max_concurrent must be at least 1"));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::invalid("scheduler.history_limit must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Continuous mode
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousConfig {
    /// Interval used when the caller does not give one
    #[serde(default = "default_interval", with = "duration_secs")]
    pub default_interval: Duration,

    /// Ticks are never closer together than this
    #[serde(default = "default_min_interval", with = "duration_secs")]
    pub min_interval: Duration,

    /// 0 = unbounded
    #[serde(default)]
    pub max_iterations: u32,

    #[serde(default)]
    pub auto_execute: bool,

    /// Default auto-execute threshold on priority-weighted confidence
    #[serde(default = "default_priority_threshold")]
    pub priority_threshold: f32,

    /// Hard cap on a tick's analysis (cancels it). Must exceed `model.timeout`
    /// so a model timeout can still degrade to the matcher result.
    #[serde(
        default,
        with = "option_duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub tick_timeout: Option<Duration>,

    /// Consecutive capture failures before the link is reported degraded
    #[serde(default = "default_link_degraded_after")]
    pub link_degraded_after: u32,

    #[serde(default)]
    pub save_results: bool,

    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_min_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_priority_threshold() -> f32 {
    0.7
}

fn default_link_degraded_after() -> u32 {
    3
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            default_interval: default_interval(),
            min_interval: default_min_interval(),
            max_iterations: 0,
            auto_execute: false,
            priority_threshold: default_priority_threshold(),
            tick_timeout: None,
            link_degraded_after: default_link_degraded_after(),
            save_results: false,
            results_dir: default_results_dir(),
        }
    }
}

impl ContinuousConfig {
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_auto_execute(mut self, enabled: bool) -> Self {
        self.auto_execute = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_interval.is_zero() {
            return Err(ConfigError::invalid("continuous.min_interval must be positive"));
        }
        check_unit("continuous.priority_threshold", self.priority_threshold)?;
        if self.tick_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid("continuous.tick_timeout must be positive"));
        }
        if self.link_degraded_after == 0 {
            return Err(ConfigError::invalid(
                "continuous.link_degraded_after must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Prompt optimization
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Records needed since the last optimization
    #[serde(default = "default_min_history_count")]
    pub min_history_count: usize,

    /// Analyses between optimization attempts
    #[serde(default = "default_optimization_interval")]
    pub optimization_interval: u64,

    /// Most recent records summarised into the meta-prompt
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,

    #[serde(default = "default_optimization_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_min_history_count() -> usize {
    5
}

fn default_optimization_interval() -> u64 {
    10
}

fn default_history_window() -> usize {
    20
}

fn default_max_prompt_length() -> usize {
    4000
}

fn default_optimization_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_history_count: default_min_history_count(),
            optimization_interval: default_optimization_interval(),
            history_window: default_history_window(),
            max_prompt_length: default_max_prompt_length(),
            timeout: default_optimization_timeout(),
        }
    }
}

impl OptimizationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_window == 0 {
            return Err(ConfigError::invalid("optimization.history_window must be at least 1"));
        }
        if self.max_prompt_length == 0 {
            return Err(ConfigError::invalid(
                "optimization.max_prompt_length must be at least 1",
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("optimization.timeout must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Duration serde helpers
// ============================================================================

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
