//! Template matcher: the fast, deterministic recognition tier.
//!
//! Each template is searched over a downscaled grayscale copy of the frame
//! with zero-mean normalized cross-correlation. Window sums come from
//! integral images, so only the template dot product is computed per
//! position.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, GrayImage};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::capture::Screenshot;
use crate::config::MatcherConfig;
use crate::error::{Error, RecognitionError};
use crate::pipeline::{PartialResult, RecognitionInput, Recognizer};
use crate::types::{
    ActionKind, ActionSuggestion, ActionTarget, BoundingBox, Element, ElementKind, Tier,
};

// ============================================================================
// Templates
// ============================================================================

/// Action to propose whenever a template is found.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TemplateAction {
    pub action: ActionKind,
    #[serde(default = "default_action_priority")]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

fn default_action_priority() -> i32 {
    1
}

impl TemplateAction {
    pub fn new(action: ActionKind, priority: i32) -> Self {
        Self {
            action,
            priority,
            description: None,
            parameters: BTreeMap::new(),
        }
    }
}

/// Optional `<stem>.json` next to a template image.
#[derive(Debug, Default, Deserialize)]
struct TemplateSidecar {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    action: Option<TemplateAction>,
}

/// A reference image to look for.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub kind: ElementKind,
    pub image: GrayImage,
    pub action: Option<TemplateAction>,
}

impl Template {
    pub fn new(name: impl Into<String>, kind: ElementKind, image: &DynamicImage) -> Self {
        Self {
            name: name.into(),
            kind,
            image: image.to_luma8(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: TemplateAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Load every PNG/JPEG in `dir` as a template named after its file stem.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Template>, Error> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::template(format!("cannot read {:?}: {}", dir, e)))?;

        let mut templates = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| Error::template(e.to_string()))?
                .path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
                .unwrap_or(false);
            if !is_image {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let image = image::open(&path)
                .map_err(|e| Error::template(format!("{:?}: {}", path, e)))?;

            let sidecar_path = path.with_extension("json");
            let sidecar: TemplateSidecar = if sidecar_path.exists() {
                let raw = std::fs::read_to_string(&sidecar_path)
                    .map_err(|e| Error::template(format!("{:?}: {}", sidecar_path, e)))?;
                serde_json::from_str(&raw)
                    .map_err(|e| Error::template(format!("{:?}: {}", sidecar_path, e)))?
            } else {
                TemplateSidecar::default()
            };

            let kind = sidecar
                .kind
                .as_deref()
                .map(ElementKind::parse_lenient)
                .unwrap_or(ElementKind::Icon);
            let mut template = Template::new(name, kind, &image);
            template.action = sidecar.action;
            templates.push(template);
        }

        templates.sort_by(|a, b| a.name.cmp(&b.name));
        info!("Loaded {} templates from {:?}", templates.len(), dir);
        Ok(templates)
    }
}

/// Template resampled to the search scale with its mean removed.
#[derive(Debug)]
struct PreparedTemplate {
    name: String,
    kind: ElementKind,
    action: Option<TemplateAction>,
    original_size: (u32, u32),
    width: u32,
    height: u32,
    zero_mean: Vec<f64>,
    energy: f64,
}

impl PreparedTemplate {
    fn prepare(template: Template, scale: f32) -> Option<Self> {
        let (ow, oh) = template.image.dimensions();
        let width = ((ow as f32 * scale).round() as u32).max(1);
        let height = ((oh as f32 * scale).round() as u32).max(1);
        let scaled = if (width, height) == (ow, oh) {
            template.image
        } else {
            image::imageops::resize(&template.image, width, height, FilterType::Triangle)
        };

        let pixels: Vec<f64> = scaled.as_raw().iter().map(|&p| p as f64).collect();
        let mean = pixels.iter().sum::<f64>() / pixels.len() as f64;
        let zero_mean: Vec<f64> = pixels.iter().map(|p| p - mean).collect();
        let energy: f64 = zero_mean.iter().map(|v| v * v).sum();

        // A flat template correlates with nothing
        if energy <= f64::EPSILON {
            warn!("Skipping template '{}': no contrast", template.name);
            return None;
        }

        Some(Self {
            name: template.name,
            kind: template.kind,
            action: template.action,
            original_size: (ow, oh),
            width,
            height,
            zero_mean,
            energy,
        })
    }
}

// ============================================================================
// Correlation
// ============================================================================

/// Summed-area tables of pixel values and squared values.
struct IntegralImage {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq = vec![0.0; stride * (h + 1)];
        let raw = image.as_raw();

        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = raw[y * w + x] as f64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.stride;
        let at = |t: &[f64], xx: usize, yy: usize| t[yy * s + xx];
        let total = |t: &[f64]| at(t, x + w, y + h) - at(t, x, y + h) - at(t, x + w, y) + at(t, x, y);
        (total(&self.sum), total(&self.sq))
    }
}

/// Best (x, y, score) for one template, score in [0, 1].
fn best_match(
    haystack: &GrayImage,
    integral: &IntegralImage,
    template: &PreparedTemplate,
    stride: u32,
) -> Option<(u32, u32, f32)> {
    let (hw, hh) = haystack.dimensions();
    if template.width > hw || template.height > hh {
        return None;
    }

    let raw = haystack.as_raw();
    let (tw, th) = (template.width as usize, template.height as usize);
    let n = (tw * th) as f64;
    let mut best: Option<(u32, u32, f32)> = None;

    for y in (0..=hh - template.height).step_by(stride as usize) {
        for x in (0..=hw - template.width).step_by(stride as usize) {
            let (s, q) = integral.window(x as usize, y as usize, tw, th);
            let variance = q - s * s / n;
            if variance <= 1e-6 {
                continue;
            }

            let mut cross = 0.0;
            for j in 0..th {
                let row = (y as usize + j) * hw as usize + x as usize;
                let trow = &template.zero_mean[j * tw..(j + 1) * tw];
                for (i, t) in trow.iter().enumerate() {
                    cross += t * raw[row + i] as f64;
                }
            }

            let score = (cross / (template.energy * variance).sqrt()).clamp(0.0, 1.0) as f32;
            if best.map_or(true, |(_, _, b)| score > b) {
                best = Some((x, y, score));
            }
        }
    }
    best
}

// ============================================================================
// Matcher
// ============================================================================

/// Fast recognition tier over a fixed template set.
#[derive(Clone)]
pub struct TemplateMatcher {
    config: MatcherConfig,
    templates: Arc<Vec<PreparedTemplate>>,
}

impl TemplateMatcher {
    pub fn new(config: MatcherConfig, templates: Vec<Template>) -> Self {
        let prepared: Vec<_> = templates
            .into_iter()
            .filter_map(|t| PreparedTemplate::prepare(t, config.downscale))
            .collect();
        debug!("Template matcher ready with {} templates", prepared.len());
        Self {
            config,
            templates: Arc::new(prepared),
        }
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    /// Synchronous search; callers on the runtime go through [`Recognizer`].
    pub fn match_screenshot(&self, screenshot: &Screenshot) -> PartialResult {
        if self.templates.is_empty() {
            return PartialResult::empty();
        }

        let scale = self.config.downscale;
        let gray = screenshot.to_gray();
        let haystack = if scale < 1.0 {
            let w = ((gray.width() as f32 * scale).round() as u32).max(1);
            let h = ((gray.height() as f32 * scale).round() as u32).max(1);
            image::imageops::resize(&gray, w, h, FilterType::Triangle)
        } else {
            gray
        };
        let integral = IntegralImage::new(&haystack);

        let mut elements = Vec::new();
        let mut suggestions = Vec::new();
        for template in self.templates.iter() {
            let Some((x, y, score)) = best_match(&haystack, &integral, template, self.config.stride.max(1))
            else {
                continue;
            };
            if score < self.config.min_match_score {
                continue;
            }

            let bounds = BoundingBox::new(
                (x as f32 / scale).round() as i32,
                (y as f32 / scale).round() as i32,
                template.original_size.0,
                template.original_size.1,
            );
            let element = Element::new(template.name.clone(), template.kind, bounds, score);

            if let Some(hint) = &template.action {
                let description = hint
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("{} {}", hint.action, template.name));
                let mut suggestion = ActionSuggestion::new(
                    hint.action,
                    ActionTarget::Element(element.clone()),
                    hint.priority,
                    score,
                )
                .with_description(description);
                suggestion.parameters = hint.parameters.clone();
                suggestions.push(suggestion);
            }
            elements.push(element);
        }

        elements.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let confidence = elements.first().map_or(0.0, |e| e.confidence);
        debug!(
            "Matcher found {} elements, best confidence {:.3}",
            elements.len(),
            confidence
        );

        PartialResult {
            elements,
            suggestions,
            confidence,
            notes: Vec::new(),
        }
    }
}

#[async_trait]
impl Recognizer for TemplateMatcher {
    fn tier(&self) -> Tier {
        Tier::Matcher
    }

    async fn analyze(&self, input: &RecognitionInput) -> Result<PartialResult, RecognitionError> {
        let matcher = self.clone();
        let screenshot = input.screenshot.clone();
        tokio::task::spawn_blocking(move || matcher.match_screenshot(&screenshot))
            .await
            .map_err(|e| RecognitionError::Matcher(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Smooth gradient background with a high-contrast patch pasted at (x, y).
    fn scene_with_patch(x: u32, y: u32) -> (DynamicImage, DynamicImage) {
        let patch = GrayImage::from_fn(12, 10, |px, py| {
            Luma([if (px / 3 + py / 2) % 2 == 0 { 240 } else { 15 }])
        });
        let mut scene = GrayImage::from_fn(80, 60, |px, _| Luma([(px * 2) as u8]));
        image::imageops::replace(&mut scene, &patch, x as i64, y as i64);
        (
            DynamicImage::ImageLuma8(scene),
            DynamicImage::ImageLuma8(patch),
        )
    }

    fn exact_config() -> MatcherConfig {
        MatcherConfig {
            downscale: 1.0,
            stride: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_finds_pasted_template() {
        let (scene, patch) = scene_with_patch(30, 20);
        let template = Template::new("start_button", ElementKind::Button, &patch)
            .with_action(TemplateAction::new(ActionKind::Tap, 5));
        let matcher = TemplateMatcher::new(exact_config(), vec![template]);

        let result = matcher.match_screenshot(&Screenshot::new(scene, "test"));

        assert!(result.confidence > 0.99, "confidence {}", result.confidence);
        assert_eq!(result.elements.len(), 1);
        let element = &result.elements[0];
        assert_eq!(element.name, "start_button");
        assert_eq!(element.bounds, BoundingBox::new(30, 20, 12, 10));

        assert_eq!(result.suggestions.len(), 1);
        assert_eq!(result.suggestions[0].action, ActionKind::Tap);
        assert_eq!(result.suggestions[0].priority, 5);
        assert_eq!(result.suggestions[0].target.point(), (36, 25));
    }

    #[test]
    fn test_flat_template_is_skipped() {
        let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(5, 5, Luma([128])));
        let matcher = TemplateMatcher::new(
            exact_config(),
            vec![Template::new("flat", ElementKind::Icon, &flat)],
        );
        assert_eq!(matcher.template_count(), 0);
    }

    #[test]
    fn test_no_templates_yields_empty_result() {
        let (scene, _) = scene_with_patch(0, 0);
        let matcher = TemplateMatcher::new(exact_config(), Vec::new());
        let result = matcher.match_screenshot(&Screenshot::new(scene, "test"));
        assert!(!result.is_usable());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_template_larger_than_frame() {
        let (_, patch) = scene_with_patch(0, 0);
        let tiny = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([9])));
        let matcher = TemplateMatcher::new(
            exact_config(),
            vec![Template::new("big", ElementKind::Icon, &patch)],
        );
        let result = matcher.match_screenshot(&Screenshot::new(tiny, "test"));
        assert!(result.elements.is_empty());
    }

    #[test]
    fn test_load_dir_reads_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let (_, patch) = scene_with_patch(0, 0);
        patch.save(dir.path().join("collect.png")).unwrap();
        std::fs::write(
            dir.path().join("collect.json"),
            r#"{"kind": "button", "action": {"action": "click", "priority": 7}}"#,
        )
        .unwrap();
        patch.save(dir.path().join("badge.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let templates = Template::load_dir(dir.path()).unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].name, "badge");
        assert_eq!(templates[0].kind, ElementKind::Icon);
        assert!(templates[0].action.is_none());
        assert_eq!(templates[1].kind, ElementKind::Button);
        let action = templates[1].action.as_ref().unwrap();
        assert_eq!(action.action, ActionKind::Tap);
        assert_eq!(action.priority, 7);
    }
}
