//! Recognition pipeline: confidence-gated matcher first, model second.
//!
//! Policy for one request:
//!
//! 1. Run the matcher. If its best confidence reaches the acceptance
//!    threshold and the request did not force the model, return it. The
//!    model is not touched on this path.
//! 2. Otherwise, if the model tier is enabled, call it with the active
//!    prompt under a timeout. A usable answer is returned as a model result.
//! 3. If the model failed, timed out or said nothing useful, and
//!    `fallback_to_matcher` is set, return the matcher's best effort flagged
//!    `degraded`, confidence untouched.
//! 4. Otherwise return an unsuccessful result with tier `none`.
//!
//! Model errors never escape: they are classified into the diagnostics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::Screenshot;
use crate::config::PipelineConfig;
use crate::error::RecognitionError;
use crate::prompt::PromptProfile;
use crate::types::{
    ActionSuggestion, AnalysisRequest, AnalysisResult, Diagnostics, Element, FailureKind, Tier,
};

// ============================================================================
// Recognizer capability
// ============================================================================

/// What a recognizer sees.
#[derive(Debug, Clone)]
pub struct RecognitionInput {
    pub screenshot: Arc<Screenshot>,
    pub context: Option<String>,
    pub prompt: Arc<PromptProfile>,
}

/// One tier's answer before the pipeline tags it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialResult {
    pub elements: Vec<Element>,
    pub suggestions: Vec<ActionSuggestion>,
    /// Best confidence this tier can vouch for, in [0, 1]
    pub confidence: f32,
    pub notes: Vec<String>,
}

impl PartialResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Something a caller could act on.
    pub fn is_usable(&self) -> bool {
        !self.elements.is_empty() || !self.suggestions.is_empty()
    }
}

/// A recognition tier. The template matcher and the vision model both
/// implement this; the pipeline depends on nothing else.
#[async_trait]
pub trait Recognizer: Send + Sync {
    fn tier(&self) -> Tier;

    async fn analyze(&self, input: &RecognitionInput) -> Result<PartialResult, RecognitionError>;
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct RecognitionPipeline {
    matcher: Arc<dyn Recognizer>,
    model: Option<Arc<dyn Recognizer>>,
    config: PipelineConfig,
    acceptance_threshold: f32,
    model_timeout: Duration,
}

impl RecognitionPipeline {
    pub fn new(matcher: Arc<dyn Recognizer>, config: PipelineConfig, acceptance_threshold: f32) -> Self {
        Self {
            matcher,
            model: None,
            config,
            acceptance_threshold,
            model_timeout: Duration::from_secs(30),
        }
    }

    /// Attach the slow tier.
    pub fn with_model(mut self, model: Arc<dyn Recognizer>, timeout: Duration) -> Self {
        self.model = Some(model);
        self.model_timeout = timeout;
        self
    }

    pub fn acceptance_threshold(&self) -> f32 {
        self.acceptance_threshold
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some() && self.config.model_fallback
    }

    /// Analyze one request with the given active prompt.
    ///
    /// `cancel` aborts the model call; the matcher stage always runs to
    /// completion.
    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
        prompt: Arc<PromptProfile>,
        cancel: &CancellationToken,
    ) -> AnalysisResult {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return AnalysisResult::cancelled(request.id, started.elapsed());
        }

        let mut diagnostics = Diagnostics {
            prompt_generation: Some(prompt.generation),
            ..Default::default()
        };
        let input = RecognitionInput {
            screenshot: request.screenshot.clone(),
            context: request.context.clone(),
            prompt,
        };

        let matched = match self.matcher.analyze(&input).await {
            Ok(partial) => partial,
            Err(e) => {
                warn!("Matcher failed for {}: {}", request.id, e);
                diagnostics.notes.push(e.to_string());
                PartialResult::empty()
            }
        };
        diagnostics.matcher_confidence = Some(matched.confidence);

        if matched.is_usable()
            && matched.confidence >= self.acceptance_threshold
            && !request.force_model
        {
            debug!(
                "Request {} accepted on matcher fast path ({:.3})",
                request.id, matched.confidence
            );
            return Self::finish(request, Tier::Matcher, matched, diagnostics, started);
        }

        if cancel.is_cancelled() {
            return AnalysisResult::cancelled(request.id, started.elapsed());
        }

        match self.model.as_ref().filter(|_| self.config.model_fallback) {
            Some(model) => {
                diagnostics.model_attempted = true;
                let call = tokio::time::timeout(self.model_timeout, model.analyze(&input));
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("Request {} cancelled during model call", request.id);
                        return AnalysisResult::cancelled(request.id, started.elapsed());
                    }
                    outcome = call => outcome,
                };

                match outcome {
                    Ok(Ok(partial)) if partial.is_usable() => {
                        debug!("Request {} answered by model", request.id);
                        return Self::finish(request, Tier::Model, partial, diagnostics, started);
                    }
                    Ok(Ok(partial)) => {
                        diagnostics.notes.extend(partial.notes);
                        diagnostics
                            .notes
                            .push("model returned no elements or suggestions".to_string());
                    }
                    Ok(Err(e)) => {
                        warn!("Model tier failed for {}: {}", request.id, e);
                        diagnostics.model_failure = e.failure_kind();
                        diagnostics.notes.push(e.to_string());
                    }
                    Err(_) => {
                        warn!(
                            "Model tier timed out for {} after {:?}",
                            request.id, self.model_timeout
                        );
                        diagnostics.model_failure = Some(FailureKind::Timeout);
                        diagnostics
                            .notes
                            .push(format!("model timed out after {:?}", self.model_timeout));
                    }
                }
            }
            None => diagnostics.notes.push("model tier unavailable".to_string()),
        }

        if self.config.fallback_to_matcher && matched.is_usable() {
            diagnostics.degraded = true;
            debug!(
                "Request {} degraded to matcher result ({:.3})",
                request.id, matched.confidence
            );
            return Self::finish(request, Tier::Matcher, matched, diagnostics, started);
        }

        AnalysisResult::failed(request.id, diagnostics, started.elapsed())
    }

    fn finish(
        request: &AnalysisRequest,
        tier: Tier,
        partial: PartialResult,
        mut diagnostics: Diagnostics,
        started: Instant,
    ) -> AnalysisResult {
        diagnostics.notes.extend(partial.notes);
        AnalysisResult::new(
            request.id,
            tier,
            partial.confidence,
            partial.elements,
            partial.suggestions,
            diagnostics,
            started.elapsed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::prompt::PromptProfile;
    use crate::types::{ActionKind, ActionTarget, BoundingBox, ElementKind, TaskClass};
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Answer(f32),
        Empty,
        Fail(ModelError),
        Hang,
    }

    struct FakeTier {
        tier: Tier,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeTier {
        fn new(tier: Tier, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                tier,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn partial(confidence: f32) -> PartialResult {
        let element = Element::new(
            "target",
            ElementKind::Button,
            BoundingBox::new(10, 10, 20, 20),
            confidence,
        );
        PartialResult {
            suggestions: vec![ActionSuggestion::new(
                ActionKind::Tap,
                ActionTarget::Element(element.clone()),
                3,
                confidence,
            )],
            elements: vec![element],
            confidence,
            notes: Vec::new(),
        }
    }

    #[async_trait]
    impl Recognizer for FakeTier {
        fn tier(&self) -> Tier {
            self.tier
        }

        async fn analyze(&self, _input: &RecognitionInput) -> Result<PartialResult, RecognitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Answer(c) => Ok(partial(*c)),
                Behavior::Empty => Ok(PartialResult::empty()),
                Behavior::Fail(e) => Err(e.clone().into()),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(PartialResult::empty())
                }
            }
        }
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new(Screenshot::new(
            DynamicImage::ImageRgb8(RgbImage::new(4, 4)),
            "test",
        ))
    }

    fn prompt() -> Arc<PromptProfile> {
        Arc::new(PromptProfile::builtin(TaskClass::ScreenAnalysis))
    }

    fn pipeline(matcher: Arc<FakeTier>, model: Arc<FakeTier>, fallback: bool) -> RecognitionPipeline {
        let config = PipelineConfig {
            model_fallback: true,
            fallback_to_matcher: fallback,
        };
        RecognitionPipeline::new(matcher, config, 0.8)
            .with_model(model, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_confident_matcher_skips_model() {
        let matcher = FakeTier::new(Tier::Matcher, Behavior::Answer(0.9));
        let model = FakeTier::new(Tier::Model, Behavior::Answer(0.95));
        let p = pipeline(matcher.clone(), model.clone(), true);

        let result = p.analyze(&request(), prompt(), &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.tier, Tier::Matcher);
        assert!(!result.diagnostics.degraded);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_force_model_bypasses_fast_path() {
        let matcher = FakeTier::new(Tier::Matcher, Behavior::Answer(0.9));
        let model = FakeTier::new(Tier::Model, Behavior::Answer(0.6));
        let p = pipeline(matcher, model.clone(), true);

        let result = p
            .analyze(&request().with_force_model(true), prompt(), &CancellationToken::new())
            .await;

        assert_eq!(result.tier, Tier::Model);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_low_matcher_uses_model() {
        let matcher = FakeTier::new(Tier::Matcher, Behavior::Answer(0.4));
        let model = FakeTier::new(Tier::Model, Behavior::Answer(0.7));
        let p = pipeline(matcher, model.clone(), true);

        let result = p.analyze(&request(), prompt(), &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.tier, Tier::Model);
        assert_eq!(result.confidence, 0.7);
        assert!(result.diagnostics.model_attempted);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_timeout_degrades_to_matcher() {
        let matcher = FakeTier::new(Tier::Matcher, Behavior::Answer(0.4));
        let model = FakeTier::new(Tier::Model, Behavior::Hang);
        let p = pipeline(matcher, model, true);

        let result = p.analyze(&request(), prompt(), &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.tier, Tier::Matcher);
        assert!(result.diagnostics.degraded);
        assert_eq!(result.confidence, 0.4);
        assert_eq!(result.diagnostics.model_failure, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_model_failure_without_fallback_fails() {
        let matcher = FakeTier::new(Tier::Matcher, Behavior::Answer(0.4));
        let model = FakeTier::new(
            Tier::Model,
            Behavior::Fail(ModelError::malformed("no json")),
        );
        let p = pipeline(matcher, model, false);

        let result = p.analyze(&request(), prompt(), &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.tier, Tier::None);
        assert!(result.elements.is_empty() && result.suggestions.is_empty());
        assert_eq!(
            result.diagnostics.model_failure,
            Some(FailureKind::MalformedResponse)
        );
    }

    #[tokio::test]
    async fn test_nothing_usable_anywhere() {
        let matcher = FakeTier::new(Tier::Matcher, Behavior::Empty);
        let model = FakeTier::new(Tier::Model, Behavior::Empty);
        let p = pipeline(matcher, model, true);

        let result = p.analyze(&request(), prompt(), &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.tier, Tier::None);
        assert!(result.diagnostics.model_failure.is_none());
    }

    #[tokio::test]
    async fn test_cancel_aborts_model_call() {
        let matcher = FakeTier::new(Tier::Matcher, Behavior::Answer(0.2));
        let model = FakeTier::new(Tier::Model, Behavior::Hang);
        let p = RecognitionPipeline::new(matcher, PipelineConfig::default(), 0.8)
            .with_model(model, Duration::from_secs(3600));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            p.analyze(&request(), prompt(), &cancel),
        )
        .await
        .expect("cancellation should end the call promptly");

        assert!(result.diagnostics.cancelled);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_disabled_model_falls_back() {
        let matcher = FakeTier::new(Tier::Matcher, Behavior::Answer(0.5));
        let p = RecognitionPipeline::new(matcher, PipelineConfig::default(), 0.8);
        assert!(!p.has_model());

        let result = p.analyze(&request(), prompt(), &CancellationToken::new()).await;
        assert_eq!(result.tier, Tier::Matcher);
        assert!(result.diagnostics.degraded);
        assert!(!result.diagnostics.model_attempted);
    }
}
