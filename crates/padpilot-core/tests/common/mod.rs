//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};

use padpilot_core::capture::encode_png;
use padpilot_core::{
    ActionExecutor, ActionKind, ActionSuggestion, ActionTarget, BoundingBox, CaptureError,
    CapturePort, Element, ElementKind, ExecutionError, ModelClient, ModelError, ModelRequest,
    PartialResult, RecognitionError, RecognitionInput, Recognizer, Screenshot, StructuredResult,
    Tier,
};

pub fn frame() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 24, Rgb([40, 80, 120])))
}

pub fn screenshot() -> Screenshot {
    Screenshot::new(frame(), "test")
}

pub fn png_bytes() -> Vec<u8> {
    encode_png(&frame()).expect("encode test frame")
}

// ============================================================================
// Capture
// ============================================================================

/// Capture port that can be switched into a failing state.
#[derive(Default)]
pub struct FakePort {
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
}

impl FakePort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let port = Self::default();
        port.failing.store(true, Ordering::SeqCst);
        Arc::new(port)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CapturePort for FakePort {
    fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CaptureError::Device("link down".to_string()));
        }
        encode_png(&frame())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// ============================================================================
// Matcher tier
// ============================================================================

/// Fast-tier recognizer with a fixed answer, optional delay, and
/// bookkeeping of how many calls overlap.
pub struct ScriptedMatcher {
    pub confidence: f32,
    pub priority: i32,
    pub delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedMatcher {
    pub fn new(confidence: f32) -> Self {
        Self {
            confidence,
            priority: 5,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recognizer for ScriptedMatcher {
    fn tier(&self) -> Tier {
        Tier::Matcher
    }

    async fn analyze(&self, _input: &RecognitionInput) -> Result<PartialResult, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let element = Element::new(
            "collect",
            ElementKind::Button,
            BoundingBox::new(4, 4, 8, 8),
            self.confidence,
        );
        let suggestion = ActionSuggestion::new(
            ActionKind::Tap,
            ActionTarget::Element(element.clone()),
            self.priority,
            self.confidence,
        )
        .with_description("tap collect");

        Ok(PartialResult {
            elements: vec![element],
            suggestions: vec![suggestion],
            confidence: self.confidence,
            notes: Vec::new(),
        })
    }
}

// ============================================================================
// Model tier
// ============================================================================

#[derive(Clone)]
pub enum ModelBehavior {
    /// Answer with this raw model text after an optional delay
    Answer(String, Duration),
    Fail(ModelError),
    /// Never answer
    Hang,
}

pub struct FakeModel {
    pub behavior: Mutex<ModelBehavior>,
    pub calls: AtomicUsize,
    pub completions: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub completion: Mutex<Result<String, ModelError>>,
}

impl FakeModel {
    pub fn new(behavior: ModelBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            completion: Mutex::new(Ok("Describe the screen and list every tappable element.".to_string())),
        })
    }

    /// A well-formed answer with one high-priority tap.
    pub fn answering() -> Arc<Self> {
        Self::new(ModelBehavior::Answer(valid_answer(), Duration::ZERO))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().ok().and_then(|p| p.last().cloned())
    }
}

pub fn valid_answer() -> String {
    r#"Here you go:
```json
{
  "description": "base screen",
  "confidence": 0.9,
  "elements": [{"name": "upgrade", "type": "btn", "x": 10, "y": 10, "width": 6, "height": 6, "confidence": 0.9}],
  "suggestions": [{"action": "click", "target": "upgrade", "priority": 8, "confidence": 0.9, "description": "upgrade"}]
}
```"#
        .to_string()
}

#[async_trait]
impl ModelClient for FakeModel {
    fn model_id(&self) -> &str {
        "fake-vision"
    }

    async fn infer(&self, request: ModelRequest) -> Result<StructuredResult, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        let behavior = self
            .behavior
            .lock()
            .map(|b| b.clone())
            .unwrap_or(ModelBehavior::Hang);
        match behavior {
            ModelBehavior::Answer(text, delay) => {
                tokio::time::sleep(delay).await;
                StructuredResult::parse(&text)
            }
            ModelBehavior::Fail(e) => Err(e),
            ModelBehavior::Hang => std::future::pending().await,
        }
    }

    async fn complete(&self, _prompt: &str, _timeout: Duration) -> Result<String, ModelError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.completion
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|_| Err(ModelError::Transport("poisoned".to_string())))
    }
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Default)]
pub struct RecordingExecutor {
    pub executed: Mutex<Vec<ActionSuggestion>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.executed.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, suggestion: &ActionSuggestion) -> Result<(), ExecutionError> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(suggestion.clone());
        }
        Ok(())
    }
}
