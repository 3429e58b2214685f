//! Vision model integration.
//!
//! [`ModelClient`] is the seam to the external vision-language model.
//! [`VisionClient`] implements it against any OpenAI-compatible chat
//! completions endpoint (Ollama, LM Studio and similar local servers).
//! [`ModelRecognizer`] adapts a client into the pipeline's slow tier.
//!
//! Model output is parsed leniently: JSON may be wrapped in prose, optional
//! fields may be missing, and unrecognised kinds or actions are mapped or
//! dropped rather than failing the whole response.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::ModelConfig;
use crate::error::{ModelError, RecognitionError};
use crate::pipeline::{PartialResult, RecognitionInput, Recognizer};
use crate::prompt::RESPONSE_FORMAT;
use crate::types::{
    clamp_unit, ActionKind, ActionSuggestion, ActionTarget, BoundingBox, Element, ElementKind,
    Tier,
};

const DEFAULT_ELEMENT_SIZE: u32 = 50;
const DEFAULT_CONFIDENCE: f32 = 0.8;
const DEFAULT_PRIORITY: i32 = 1;

// ============================================================================
// Client interface
// ============================================================================

/// One inference call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Base64-encoded frame
    pub image: String,
    pub mime_type: &'static str,
    pub prompt: String,
    pub model: String,
    pub timeout: Duration,
}

/// External vision model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier used in requests.
    fn model_id(&self) -> &str;

    /// Analyze a frame and return its structured answer.
    async fn infer(&self, request: ModelRequest) -> Result<StructuredResult, ModelError>;

    /// Text-only completion, used for meta-prompting.
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, ModelError>;
}

// ============================================================================
// Structured output
// ============================================================================

/// Element as reported by the model, before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawElement {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub confidence: Option<f64>,
}

/// Suggestion as reported by the model, before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSuggestion {
    pub action: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub confidence: Option<f64>,
    /// Name of the element the action applies to
    pub target: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub parameters: BTreeMap<String, Value>,
}

/// Parsed model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub description: Option<String>,
    pub confidence: Option<f64>,
    pub elements: Vec<RawElement>,
    pub suggestions: Vec<RawSuggestion>,
}

fn str_field(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn num_field(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl StructuredResult {
    /// Parse raw model text. Fails only if no JSON object can be found.
    pub fn parse(response: &str) -> Result<Self, ModelError> {
        let json = extract_json(response)?;
        let parsed: Value = serde_json::from_str(&json)
            .map_err(|e| ModelError::malformed(format!("JSON parse error: {}", e)))?;
        if !parsed.is_object() {
            return Err(ModelError::malformed("expected a JSON object"));
        }

        let elements = parsed["elements"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|e| e.is_object())
                    .map(|e| RawElement {
                        name: str_field(e, &["name", "label"]),
                        kind: str_field(e, &["type", "kind"]),
                        x: num_field(e, "x"),
                        y: num_field(e, "y"),
                        width: num_field(e, "width"),
                        height: num_field(e, "height"),
                        confidence: num_field(e, "confidence"),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let suggestions = parsed["suggestions"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|s| s.is_object())
                    .map(|s| RawSuggestion {
                        action: str_field(s, &["action", "type"]),
                        description: str_field(s, &["description", "reason"]),
                        priority: num_field(s, "priority").map(|p| p.round() as i64),
                        confidence: num_field(s, "confidence"),
                        target: str_field(s, &["target"]),
                        x: num_field(s, "x"),
                        y: num_field(s, "y"),
                        parameters: s["parameters"]
                            .as_object()
                            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            description: str_field(&parsed, &["description", "scene"]),
            confidence: num_field(&parsed, "confidence"),
            elements,
            suggestions,
        })
    }

    /// Apply defaults and resolve targets against a frame of `frame` size.
    ///
    /// Elements without coordinates and suggestions with unknown actions are
    /// dropped and noted.
    pub fn into_partial(self, frame: (u32, u32)) -> PartialResult {
        let mut notes = Vec::new();

        let elements: Vec<Element> = self
            .elements
            .into_iter()
            .filter_map(|raw| {
                let (Some(x), Some(y)) = (raw.x, raw.y) else {
                    notes.push(format!(
                        "dropped element '{}' without coordinates",
                        raw.name.as_deref().unwrap_or("unknown")
                    ));
                    return None;
                };
                let size = |v: Option<f64>| {
                    v.filter(|v| *v > 0.0)
                        .map(|v| v.round() as u32)
                        .unwrap_or(DEFAULT_ELEMENT_SIZE)
                };
                Some(Element::new(
                    raw.name.unwrap_or_else(|| "unknown".to_string()),
                    raw.kind
                        .as_deref()
                        .map(ElementKind::parse_lenient)
                        .unwrap_or_default(),
                    BoundingBox::new(x.round() as i32, y.round() as i32, size(raw.width), size(raw.height)),
                    raw.confidence.map_or(DEFAULT_CONFIDENCE, |c| c as f32),
                ))
            })
            .collect();

        let center = ActionTarget::Point {
            x: (frame.0 / 2) as i32,
            y: (frame.1 / 2) as i32,
        };
        let suggestions = self
            .suggestions
            .into_iter()
            .filter_map(|raw| {
                let Some(action) = raw.action.as_deref().and_then(ActionKind::parse_lenient) else {
                    notes.push(format!(
                        "dropped suggestion with unknown action {:?}",
                        raw.action
                    ));
                    return None;
                };

                let named = raw.target.as_deref().and_then(|name| {
                    elements
                        .iter()
                        .find(|e| e.name.eq_ignore_ascii_case(name))
                        .cloned()
                });
                let target = match (named, raw.x, raw.y) {
                    (Some(element), _, _) => ActionTarget::Element(element),
                    (None, Some(x), Some(y)) => ActionTarget::Point {
                        x: x.round() as i32,
                        y: y.round() as i32,
                    },
                    _ => elements
                        .first()
                        .cloned()
                        .map(ActionTarget::Element)
                        .unwrap_or_else(|| center.clone()),
                };

                let priority = raw
                    .priority
                    .map(|p| p.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
                    .unwrap_or(DEFAULT_PRIORITY);
                let mut suggestion = ActionSuggestion::new(
                    action,
                    target,
                    priority,
                    raw.confidence.map_or(DEFAULT_CONFIDENCE, |c| c as f32),
                )
                .with_description(raw.description.unwrap_or_else(|| action.to_string()));
                suggestion.parameters = raw.parameters;
                Some(suggestion)
            })
            .collect();

        let confidence = match self.confidence {
            Some(c) => clamp_unit(c as f32),
            None if !elements.is_empty() => {
                elements.iter().map(|e| e.confidence).sum::<f32>() / elements.len() as f32
            }
            None => 0.5,
        };

        if let Some(description) = self.description {
            notes.push(format!("scene: {}", description));
        }

        PartialResult {
            elements,
            suggestions,
            confidence,
            notes,
        }
    }
}

/// Extract JSON from a response that might contain extra text.
pub fn extract_json(response: &str) -> Result<String, ModelError> {
    let trimmed = response.trim();

    // Balanced object starting at the first brace, skipping braces in strings
    if let Some(start) = trimmed.find('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, c) in trimmed[start..].char_indices() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(trimmed[start..=start + i].to_string());
                    }
                }
                _ => {}
            }
        }

        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return Ok(trimmed[start..=end].to_string());
            }
        }
    }

    Err(ModelError::malformed("no JSON object found in response"))
}

// ============================================================================
// OpenAI-Compatible API Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum MessageContent {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
struct ImageUrl {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<MessageContent>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiError {
    message: String,
}

// ============================================================================
// Vision Client
// ============================================================================

/// HTTP client for an OpenAI-compatible vision endpoint.
pub struct VisionClient {
    client: reqwest::Client,
    config: ModelConfig,
}

impl VisionClient {
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        config
            .validate()
            .map_err(|e| ModelError::Config(e.to_string()))?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ModelError::Config(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    async fn call_api(&self, messages: Vec<ChatMessage>, timeout: Duration) -> Result<String, ModelError> {
        let request = ChatCompletionRequest {
            model: self.config.model_name.clone(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        debug!("Sending request to {}", self.config.endpoint);

        let mut req = self
            .client
            .post(&self.config.endpoint)
            .timeout(timeout)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req.json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(timeout)
            } else {
                ModelError::from(e)
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelError::RateLimited("rate limit exceeded".to_string()));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(timeout)
            } else {
                ModelError::from(e)
            }
        })?;

        if !status.is_success() {
            error!("API error ({}): {}", status, body);
            return Err(ModelError::Transport(format!("HTTP {}: {}", status, body)));
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            warn!("Failed to parse response: {}", body);
            ModelError::malformed(format!("JSON parse error: {}", e))
        })?;

        if let Some(error) = completion.error {
            return Err(ModelError::Transport(error.message));
        }

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ModelError::malformed("no choices in response"))
    }
}

#[async_trait]
impl ModelClient for VisionClient {
    fn model_id(&self) -> &str {
        &self.config.model_name
    }

    async fn infer(&self, request: ModelRequest) -> Result<StructuredResult, ModelError> {
        let message = ChatMessage {
            role: "user".to_string(),
            content: vec![
                MessageContent::Text {
                    text: request.prompt,
                },
                MessageContent::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", request.mime_type, request.image),
                        detail: Some("high".to_string()),
                    },
                },
            ],
        };

        let response = self.call_api(vec![message], request.timeout).await?;
        StructuredResult::parse(&response)
    }

    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, ModelError> {
        let message = ChatMessage {
            role: "user".to_string(),
            content: vec![MessageContent::Text {
                text: prompt.to_string(),
            }],
        };
        self.call_api(vec![message], timeout).await
    }
}

// ============================================================================
// Recognizer adapter
// ============================================================================

/// The model tier of the recognition pipeline.
pub struct ModelRecognizer {
    client: Arc<dyn ModelClient>,
    config: ModelConfig,
}

impl ModelRecognizer {
    pub fn new(client: Arc<dyn ModelClient>, config: ModelConfig) -> Self {
        Self { client, config }
    }

    /// Full prompt text: active profile, optional context, output contract.
    pub fn build_prompt(input: &RecognitionInput) -> String {
        let mut prompt = input.prompt.text.trim().to_string();
        if let Some(context) = input.context.as_deref().filter(|c| !c.trim().is_empty()) {
            prompt.push_str("\n\nContext: ");
            prompt.push_str(context.trim());
        }
        prompt.push_str("\n\n");
        prompt.push_str(RESPONSE_FORMAT);
        prompt
    }
}

#[async_trait]
impl Recognizer for ModelRecognizer {
    fn tier(&self) -> Tier {
        Tier::Model
    }

    async fn analyze(&self, input: &RecognitionInput) -> Result<PartialResult, RecognitionError> {
        let screenshot = input.screenshot.clone();
        let config = self.config.clone();
        let image = tokio::task::spawn_blocking(move || screenshot.to_base64(&config))
            .await
            .map_err(|e| ModelError::Image(e.to_string()))??;

        let request = ModelRequest {
            image,
            mime_type: self.config.image_format.mime_type(),
            prompt: Self::build_prompt(input),
            model: self.client.model_id().to_string(),
            timeout: self.config.timeout,
        };

        let structured = self.client.infer(request).await?;
        let frame = (input.screenshot.width(), input.screenshot.height());
        Ok(structured.into_partial(frame))
    }
}
