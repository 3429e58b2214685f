//! Core data model shared by the pipeline, scheduler and controller.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capture::Screenshot;

/// Identifier of a request and of the scheduled task that runs it.
pub type TaskId = Uuid;

/// Upper end of the priority scale used for priority-weighted confidence.
pub const PRIORITY_SCALE: i32 = 10;

// ============================================================================
// Requests
// ============================================================================

/// What kind of analysis a request asks for. Each class has its own prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    #[default]
    ScreenAnalysis,
    UiElements,
    ActionSuggestion,
}

impl TaskClass {
    pub const ALL: [TaskClass; 3] = [
        TaskClass::ScreenAnalysis,
        TaskClass::UiElements,
        TaskClass::ActionSuggestion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskClass::ScreenAnalysis => "screen_analysis",
            TaskClass::UiElements => "ui_elements",
            TaskClass::ActionSuggestion => "action_suggestion",
        }
    }
}

impl fmt::Display for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to analyze one captured frame.
///
/// Built with the `with_*` methods and then handed to the scheduler, which
/// keeps it behind an `Arc`; it is never modified after submission.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub id: TaskId,
    pub screenshot: Arc<Screenshot>,
    pub context: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Higher runs first when work is queued
    pub priority: i32,
    pub task_class: TaskClass,
    /// Skip the matcher fast path and always consult the model
    pub force_model: bool,
    /// Admit even when every slot is busy
    pub bypass_admission: bool,
}

impl AnalysisRequest {
    pub fn new(screenshot: impl Into<Arc<Screenshot>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            screenshot: screenshot.into(),
            context: None,
            submitted_at: Utc::now(),
            priority: 0,
            task_class: TaskClass::default(),
            force_model: false,
            bypass_admission: false,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_task_class(mut self, task_class: TaskClass) -> Self {
        self.task_class = task_class;
        self
    }

    pub fn with_force_model(mut self, force: bool) -> Self {
        self.force_model = force;
        self
    }

    pub fn with_bypass_admission(mut self, bypass: bool) -> Self {
        self.bypass_admission = bypass;
        self
    }

    /// Serializable summary stored alongside history records.
    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            id: self.id,
            context: self.context.clone(),
            submitted_at: self.submitted_at,
            priority: self.priority,
            task_class: self.task_class,
            force_model: self.force_model,
            frame_width: self.screenshot.width(),
            frame_height: self.screenshot.height(),
        }
    }
}

/// The parts of a request worth keeping once the frame itself is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub id: TaskId,
    pub context: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub priority: i32,
    pub task_class: TaskClass,
    pub force_model: bool,
    pub frame_width: u32,
    pub frame_height: u32,
}

// ============================================================================
// Elements
// ============================================================================

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }

    pub fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x
            && px < self.x + self.width as i32
            && py >= self.y
            && py < self.y + self.height as i32
    }
}

/// Kind of on-screen element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Button,
    Text,
    Icon,
    Menu,
    #[default]
    Unknown,
}

impl ElementKind {
    /// Lenient parse of a model-supplied kind string.
    ///
    /// Accepts combined labels such as `button/icon` (first recognised part
    /// wins) and a handful of common aliases.
    pub fn parse_lenient(raw: &str) -> ElementKind {
        raw.split(['/', '|', ','])
            .map(|part| part.trim().to_ascii_lowercase())
            .find_map(|part| match part.as_str() {
                "button" | "btn" | "interactive" => Some(ElementKind::Button),
                "text" | "txt" | "label" => Some(ElementKind::Text),
                "icon" | "image" | "img" => Some(ElementKind::Icon),
                "menu" | "tab" | "list" => Some(ElementKind::Menu),
                _ => None,
            })
            .unwrap_or(ElementKind::Unknown)
    }
}

/// A recognised on-screen element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    pub bounds: BoundingBox,
    pub kind: ElementKind,
    /// In [0, 1]
    pub confidence: f32,
}

impl Element {
    pub fn new(name: impl Into<String>, kind: ElementKind, bounds: BoundingBox, confidence: f32) -> Self {
        Self {
            name: name.into(),
            bounds,
            kind,
            confidence: clamp_unit(confidence),
        }
    }

    pub fn center(&self) -> (i32, i32) {
        self.bounds.center()
    }
}

// ============================================================================
// Suggestions
// ============================================================================

/// Touch action kinds the executor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[serde(alias = "click", alias = "press")]
    Tap,
    #[serde(alias = "scroll", alias = "drag")]
    Swipe,
    Wait,
    #[serde(alias = "longpress", alias = "long-press", alias = "hold")]
    LongPress,
}

impl ActionKind {
    /// Lenient parse of a model-supplied action string.
    pub fn parse_lenient(raw: &str) -> Option<ActionKind> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tap" | "click" | "press" => Some(ActionKind::Tap),
            "swipe" | "scroll" | "drag" => Some(ActionKind::Swipe),
            "wait" | "sleep" => Some(ActionKind::Wait),
            "long_press" | "longpress" | "long-press" | "hold" => Some(ActionKind::LongPress),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Tap => "tap",
            ActionKind::Swipe => "swipe",
            ActionKind::Wait => "wait",
            ActionKind::LongPress => "long_press",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an action lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionTarget {
    Element(Element),
    Point { x: i32, y: i32 },
}

impl ActionTarget {
    /// The pixel the executor should touch.
    pub fn point(&self) -> (i32, i32) {
        match self {
            ActionTarget::Element(e) => e.center(),
            ActionTarget::Point { x, y } => (*x, *y),
        }
    }
}

/// A proposed action. Never mutated after it is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSuggestion {
    pub action: ActionKind,
    pub target: ActionTarget,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Higher is more urgent
    pub priority: i32,
    pub confidence: f32,
    pub description: String,
}

impl ActionSuggestion {
    pub fn new(action: ActionKind, target: ActionTarget, priority: i32, confidence: f32) -> Self {
        Self {
            action,
            target,
            parameters: BTreeMap::new(),
            priority,
            confidence: clamp_unit(confidence),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// `confidence * clamp(priority, 0, PRIORITY_SCALE) / PRIORITY_SCALE`, in [0, 1].
    pub fn weighted_confidence(&self) -> f32 {
        let weight = self.priority.clamp(0, PRIORITY_SCALE) as f32 / PRIORITY_SCALE as f32;
        self.confidence * weight
    }

    /// Ordering used inside a result: priority desc, then confidence desc.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.confidence.total_cmp(&self.confidence))
    }
}

// ============================================================================
// Results
// ============================================================================

/// Which recognition stage produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Matcher,
    Model,
    None,
}

/// Classification of a model tier failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Transport,
    MalformedResponse,
}

/// Everything the pipeline wants to say about how a result came about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Result is a below-threshold matcher fallback
    pub degraded: bool,
    pub cancelled: bool,
    pub model_attempted: bool,
    pub model_failure: Option<FailureKind>,
    pub matcher_confidence: Option<f32>,
    pub prompt_generation: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Final verdict for one analysis. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub request_id: TaskId,
    pub success: bool,
    pub confidence: f32,
    pub elements: Vec<Element>,
    pub suggestions: Vec<ActionSuggestion>,
    pub diagnostics: Diagnostics,
    pub tier: Tier,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

impl AnalysisResult {
    /// Successful result; suggestions are put into rank order.
    pub fn new(
        request_id: TaskId,
        tier: Tier,
        confidence: f32,
        elements: Vec<Element>,
        mut suggestions: Vec<ActionSuggestion>,
        diagnostics: Diagnostics,
        latency: Duration,
    ) -> Self {
        suggestions.sort_by(ActionSuggestion::rank_cmp);
        Self {
            request_id,
            success: true,
            confidence: clamp_unit(confidence),
            elements,
            suggestions,
            diagnostics,
            tier,
            latency,
        }
    }

    /// Nothing usable from either tier.
    pub fn failed(request_id: TaskId, diagnostics: Diagnostics, latency: Duration) -> Self {
        Self {
            request_id,
            success: false,
            confidence: 0.0,
            elements: Vec::new(),
            suggestions: Vec::new(),
            diagnostics,
            tier: Tier::None,
            latency,
        }
    }

    pub fn cancelled(request_id: TaskId, latency: Duration) -> Self {
        let diagnostics = Diagnostics {
            cancelled: true,
            ..Default::default()
        };
        Self::failed(request_id, diagnostics, latency)
    }

    pub fn top_suggestion(&self) -> Option<&ActionSuggestion> {
        self.suggestions.first()
    }

    pub fn is_degraded(&self) -> bool {
        self.diagnostics.degraded
    }

    /// Outcome tag recorded in history.
    ///
    /// A model timeout is reported as `TimedOut` even when a degraded matcher
    /// result was returned in its place.
    pub fn outcome(&self) -> Outcome {
        if self.diagnostics.cancelled {
            Outcome::Cancelled
        } else if self.diagnostics.model_failure == Some(FailureKind::Timeout) {
            Outcome::TimedOut
        } else if !self.success {
            Outcome::Failed
        } else {
            Outcome::Completed
        }
    }
}

/// How an analysis ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Assigned by the ledger on append, strictly increasing
    pub sequence: u64,
    pub request: RequestSummary,
    pub result: AnalysisResult,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub outcome: Outcome,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(request: &AnalysisRequest, result: AnalysisResult) -> Self {
        Self {
            sequence: 0,
            request: request.summary(),
            latency: result.latency,
            outcome: result.outcome(),
            result,
            recorded_at: Utc::now(),
        }
    }
}

pub(crate) fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Durations as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
