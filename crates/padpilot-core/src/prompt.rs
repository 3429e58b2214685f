//! Prompt profiles and the history-driven prompt optimizer.
//!
//! The store holds one `Arc<PromptProfile>` per task class. Replacing a
//! profile swaps the `Arc` under a write lock, so readers either see the old
//! profile or the new one, and generations only ever go up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::OptimizationConfig;
use crate::ledger::HistoryLedger;
use crate::model::ModelClient;
use crate::types::{HistoryRecord, Outcome, TaskClass, Tier};

/// Output contract appended to every vision prompt, whatever the active
/// profile says.
pub const RESPONSE_FORMAT: &str = r#"Respond with ONLY a JSON object of this shape:
{
  "description": "one sentence about the current screen",
  "confidence": 0.0 to 1.0,
  "elements": [
    {"name": "...", "type": "button|text|icon|menu", "x": 0, "y": 0, "width": 0, "height": 0, "confidence": 0.0}
  ],
  "suggestions": [
    {"action": "tap|swipe|wait|long_press", "target": "element name", "description": "...", "priority": 1, "confidence": 0.0, "parameters": {}}
  ]
}
Coordinates are pixels from the top-left corner. Higher priority means more urgent."#;

fn builtin_text(class: TaskClass) -> &'static str {
    match class {
        TaskClass::ScreenAnalysis => {
            "You are looking at a screenshot from a handheld device running a game. \
             Describe the current screen, identify the interactive elements that matter \
             for making progress, and propose the most useful next actions."
        }
        TaskClass::UiElements => {
            "List every user interface element visible in this screenshot: buttons, \
             labels, icons and menus. Give each one a short descriptive name and a tight \
             bounding box."
        }
        TaskClass::ActionSuggestion => {
            "Decide what should be done next on this screen. Prefer collecting rewards, \
             closing pop-ups and continuing in-progress tasks. Rank actions by urgency."
        }
    }
}

// ============================================================================
// Profiles
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    BuiltIn,
    Optimized,
}

/// An immutable prompt version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptProfile {
    pub task_class: TaskClass,
    pub text: String,
    /// Strictly increasing per task class
    pub generation: u64,
    pub source: PromptSource,
    pub last_optimized_at: Option<DateTime<Utc>>,
    /// Ledger sequence number this profile was derived from
    pub history_mark: u64,
}

impl PromptProfile {
    pub fn builtin(task_class: TaskClass) -> Self {
        Self {
            task_class,
            text: builtin_text(task_class).to_string(),
            generation: 0,
            source: PromptSource::BuiltIn,
            last_optimized_at: None,
            history_mark: 0,
        }
    }
}

/// Active profile per task class.
pub struct PromptStore {
    profiles: RwLock<HashMap<TaskClass, Arc<PromptProfile>>>,
}

impl Default for PromptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptStore {
    pub fn new() -> Self {
        let profiles = TaskClass::ALL
            .into_iter()
            .map(|class| (class, Arc::new(PromptProfile::builtin(class))))
            .collect();
        Self {
            profiles: RwLock::new(profiles),
        }
    }

    pub async fn active(&self, class: TaskClass) -> Arc<PromptProfile> {
        if let Some(profile) = self.profiles.read().await.get(&class) {
            return profile.clone();
        }
        Arc::new(PromptProfile::builtin(class))
    }

    /// Install optimized text as the next generation for `class`.
    pub async fn install(&self, class: TaskClass, text: String, history_mark: u64) -> Arc<PromptProfile> {
        let mut profiles = self.profiles.write().await;
        let generation = profiles.get(&class).map_or(0, |p| p.generation) + 1;
        let profile = Arc::new(PromptProfile {
            task_class: class,
            text,
            generation,
            source: PromptSource::Optimized,
            last_optimized_at: Some(Utc::now()),
            history_mark,
        });
        profiles.insert(class, profile.clone());
        info!("Installed prompt generation {} for {}", generation, class);
        profile
    }

    pub async fn snapshot(&self) -> Vec<Arc<PromptProfile>> {
        let profiles = self.profiles.read().await;
        let mut all: Vec<_> = profiles.values().cloned().collect();
        all.sort_by_key(|p| p.task_class);
        all
    }
}

// ============================================================================
// Optimizer
// ============================================================================

/// Why an optimization pass left the profile alone.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Disabled,
    NoModel,
    /// Another pass is running
    Busy,
    InsufficientHistory { available: usize, required: usize },
    IntervalNotReached { analyses: u64, required: u64 },
    /// Meta-prompt call or its answer was unusable
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationOutcome {
    Optimized(Arc<PromptProfile>),
    Unchanged(SkipReason),
}

impl OptimizationOutcome {
    pub fn is_optimized(&self) -> bool {
        matches!(self, OptimizationOutcome::Optimized(_))
    }
}

/// Derives improved prompts from ledger statistics.
pub struct PromptOptimizer {
    config: OptimizationConfig,
    store: Arc<PromptStore>,
    client: Option<Arc<dyn ModelClient>>,
    since_attempt: Mutex<HashMap<TaskClass, u64>>,
    running: Mutex<()>,
    optimizations: std::sync::atomic::AtomicU64,
    failures: std::sync::atomic::AtomicU64,
    last_failure: RwLock<Option<String>>,
}

/// What asked for an optimization pass.
#[derive(Clone, Copy)]
enum Trigger<'a> {
    /// After a finished analysis; all gates apply
    Scheduled,
    /// Explicit caller request; only the history gate applies
    OnDemand { feedback: Option<&'a str> },
}

impl PromptOptimizer {
    pub fn new(
        config: OptimizationConfig,
        store: Arc<PromptStore>,
        client: Option<Arc<dyn ModelClient>>,
    ) -> Self {
        Self {
            config,
            store,
            client,
            since_attempt: Mutex::new(HashMap::new()),
            running: Mutex::new(()),
            optimizations: Default::default(),
            failures: Default::default(),
            last_failure: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<PromptStore> {
        &self.store
    }

    /// Count one finished analysis toward the interval.
    pub async fn record_analysis(&self, class: TaskClass) {
        *self.since_attempt.lock().await.entry(class).or_insert(0) += 1;
    }

    pub fn optimization_count(&self) -> u64 {
        self.optimizations.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Reason the most recent pass failed, cleared by the next success.
    pub async fn last_failure(&self) -> Option<String> {
        self.last_failure.read().await.clone()
    }

    /// Run one optimization pass for `class` if the trigger policy allows.
    pub async fn maybe_optimize(&self, ledger: &HistoryLedger, class: TaskClass) -> OptimizationOutcome {
        if !self.config.enabled {
            return OptimizationOutcome::Unchanged(SkipReason::Disabled);
        }
        self.run(ledger, class, Trigger::Scheduled).await
    }

    /// Optimize `class` now, folding optional operator feedback into the
    /// meta-prompt.
    ///
    /// Ignores `enabled` and the analysis interval; the history gate still
    /// applies.
    pub async fn optimize_now(
        &self,
        ledger: &HistoryLedger,
        class: TaskClass,
        feedback: Option<&str>,
    ) -> OptimizationOutcome {
        let feedback = feedback.map(str::trim).filter(|f| !f.is_empty());
        self.run(ledger, class, Trigger::OnDemand { feedback }).await
    }

    async fn run(&self, ledger: &HistoryLedger, class: TaskClass, trigger: Trigger<'_>) -> OptimizationOutcome {
        let Some(client) = self.client.clone() else {
            return OptimizationOutcome::Unchanged(SkipReason::NoModel);
        };
        let Ok(_running) = self.running.try_lock() else {
            return OptimizationOutcome::Unchanged(SkipReason::Busy);
        };

        let active = self.store.active(class).await;
        let fresh: Vec<Arc<HistoryRecord>> = ledger
            .since(active.history_mark)
            .await
            .into_iter()
            .filter(|r| r.request.task_class == class)
            .collect();
        if fresh.len() < self.config.min_history_count {
            return OptimizationOutcome::Unchanged(SkipReason::InsufficientHistory {
                available: fresh.len(),
                required: self.config.min_history_count,
            });
        }

        {
            let mut counts = self.since_attempt.lock().await;
            let analyses = counts.get(&class).copied().unwrap_or(0);
            if matches!(trigger, Trigger::Scheduled) && analyses < self.config.optimization_interval {
                return OptimizationOutcome::Unchanged(SkipReason::IntervalNotReached {
                    analyses,
                    required: self.config.optimization_interval,
                });
            }
            counts.insert(class, 0);
        }

        let window: Vec<_> = fresh.into_iter().take(self.config.history_window).collect();
        let mark = window.first().map_or(active.history_mark, |r| r.sequence);
        let summary = HistorySummary::from_records(&window);
        let feedback = match trigger {
            Trigger::Scheduled => None,
            Trigger::OnDemand { feedback } => feedback,
        };
        let meta_prompt = build_meta_prompt(&active, &summary, feedback);

        debug!("Requesting prompt optimization for {} over {} records", class, window.len());
        let outcome = match client.complete(&meta_prompt, self.config.timeout).await {
            Ok(response) => self.accept(&active, &response),
            Err(e) => Err(format!("meta-prompt call failed: {}", e)),
        };

        match outcome {
            Ok(text) => {
                let profile = self.store.install(class, text, mark).await;
                self.optimizations
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                *self.last_failure.write().await = None;
                OptimizationOutcome::Optimized(profile)
            }
            Err(reason) => {
                warn!("Prompt optimization for {} failed: {}", class, reason);
                self.failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                *self.last_failure.write().await = Some(reason.clone());
                OptimizationOutcome::Unchanged(SkipReason::Failed(reason))
            }
        }
    }

    fn accept(&self, active: &PromptProfile, response: &str) -> Result<String, String> {
        let text = clean_prompt_text(response);
        if text.is_empty() {
            return Err("model returned an empty prompt".to_string());
        }
        if text.len() > self.config.max_prompt_length {
            return Err(format!(
                "prompt of {} bytes exceeds limit of {}",
                text.len(),
                self.config.max_prompt_length
            ));
        }
        if text == active.text.trim() {
            return Err("model returned the current prompt unchanged".to_string());
        }
        Ok(text)
    }
}

/// Strip code fences and wrapping quotes from a model's prompt rewrite.
fn clean_prompt_text(response: &str) -> String {
    let mut text = response.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.split_once('\n').map_or("", |(_, body)| body);
        text = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        text = &text[1..text.len() - 1];
    }
    text.trim().to_string()
}

/// Aggregate of the records fed to the meta-prompt.
#[derive(Debug, Clone, Default, PartialEq)]
struct HistorySummary {
    total: usize,
    successes: usize,
    degraded: usize,
    mean_latency: Duration,
    mean_confidence: f32,
    by_tier: BTreeMap<&'static str, usize>,
    by_outcome: BTreeMap<&'static str, usize>,
    top_elements: Vec<(String, usize)>,
    top_actions: Vec<(String, usize)>,
}

impl HistorySummary {
    fn from_records(records: &[Arc<HistoryRecord>]) -> Self {
        let total = records.len();
        if total == 0 {
            return Self::default();
        }

        let mut summary = Self {
            total,
            ..Default::default()
        };
        let mut latency = Duration::ZERO;
        let mut confidence = 0.0;
        let mut elements: HashMap<String, usize> = HashMap::new();
        let mut actions: HashMap<String, usize> = HashMap::new();

        for record in records {
            let result = &record.result;
            if result.success {
                summary.successes += 1;
            }
            if result.diagnostics.degraded {
                summary.degraded += 1;
            }
            latency += record.latency;
            confidence += result.confidence;

            let tier = match result.tier {
                Tier::Matcher => "matcher",
                Tier::Model => "model",
                Tier::None => "none",
            };
            *summary.by_tier.entry(tier).or_default() += 1;

            let outcome = match record.outcome {
                Outcome::Completed => "completed",
                Outcome::TimedOut => "timed_out",
                Outcome::Failed => "failed",
                Outcome::Cancelled => "cancelled",
            };
            *summary.by_outcome.entry(outcome).or_default() += 1;

            for e in &result.elements {
                *elements.entry(e.name.clone()).or_default() += 1;
            }
            for s in &result.suggestions {
                *actions.entry(s.action.to_string()).or_default() += 1;
            }
        }

        summary.mean_latency = latency / total as u32;
        summary.mean_confidence = confidence / total as f32;
        summary.top_elements = top_n(elements, 5);
        summary.top_actions = top_n(actions, 5);
        summary
    }

    fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

fn top_n(counts: HashMap<String, usize>, n: usize) -> Vec<(String, usize)> {
    let mut v: Vec<_> = counts.into_iter().collect();
    v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    v.truncate(n);
    v
}

fn format_counts<K: std::fmt::Display, V: std::fmt::Display>(pairs: impl IntoIterator<Item = (K, V)>) -> String {
    let joined: Vec<String> = pairs
        .into_iter()
        .map(|(k, v)| format!("{} ({})", k, v))
        .collect();
    if joined.is_empty() {
        "none".to_string()
    } else {
        joined.join(", ")
    }
}

fn build_meta_prompt(active: &PromptProfile, summary: &HistorySummary, feedback: Option<&str>) -> String {
    let mut prompt = format!(
        "You maintain the instruction prompt for a vision model that analyzes \
         screenshots from a handheld device.\n\n\
         Current prompt (generation {generation}):\n\"\"\"\n{text}\n\"\"\"\n\n\
         Recent results over {total} analyses:\n\
         - success rate: {rate:.0}%\n\
         - degraded fallbacks: {degraded}\n\
         - mean latency: {latency} ms\n\
         - mean confidence: {confidence:.2}\n\
         - produced by: {tiers}\n\
         - outcomes: {outcomes}\n\
         - most frequent elements: {elements}\n\
         - most frequent actions: {actions}\n\n",
        generation = active.generation,
        text = active.text,
        total = summary.total,
        rate = summary.success_rate() * 100.0,
        degraded = summary.degraded,
        latency = summary.mean_latency.as_millis(),
        confidence = summary.mean_confidence,
        tiers = format_counts(summary.by_tier.iter()),
        outcomes = format_counts(summary.by_outcome.iter()),
        elements = format_counts(summary.top_elements.iter().map(|(k, v)| (k, v))),
        actions = format_counts(summary.top_actions.iter().map(|(k, v)| (k, v))),
    );
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "Operator feedback on recent results:\n\"\"\"\n{}\n\"\"\"\n\n",
            feedback
        ));
    }
    prompt.push_str(
        "Rewrite the prompt so the model finds the relevant elements more reliably \
         and proposes better-ranked actions. Do not describe the JSON output format; \
         it is appended separately. Reply with the new prompt text only.",
    );
    prompt
}
