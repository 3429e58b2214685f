//! Screen capture port and the decoded frame type.
//!
//! The device link supports one in-flight capture at a time, so every
//! capture in the process goes through a [`SerializedCapture`].

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ImageFormat, ModelConfig};
use crate::error::{CaptureError, ModelError};

// ============================================================================
// Capture Port
// ============================================================================

/// Source of raw frames (PNG/JPEG bytes) from the device.
///
/// Implementations block; callers run them on the blocking pool.
pub trait CapturePort: Send + Sync {
    fn capture(&self) -> Result<Vec<u8>, CaptureError>;

    /// Short label used in logs and on screenshots.
    fn name(&self) -> &str {
        "device"
    }
}

// ============================================================================
// Screenshot
// ============================================================================

/// A decoded frame.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub image: DynamicImage,
    pub captured_at: DateTime<Utc>,
    pub source: String,
}

impl Screenshot {
    pub fn new(image: DynamicImage, source: impl Into<String>) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
            source: source.into(),
        }
    }

    /// Decode raw capture bytes.
    pub fn from_bytes(bytes: &[u8], source: impl Into<String>) -> Result<Self, CaptureError> {
        if bytes.is_empty() {
            return Err(CaptureError::EmptyFrame);
        }
        let image =
            image::load_from_memory(bytes).map_err(|e| CaptureError::Decode(e.to_string()))?;
        Ok(Self::new(image, source))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.width() / 2) as i32, (self.height() / 2) as i32)
    }

    pub fn to_gray(&self) -> GrayImage {
        self.image.to_luma8()
    }

    /// Encode for upload to the model, scaling down to `max_image_dimension`.
    pub fn to_base64(&self, config: &ModelConfig) -> Result<String, ModelError> {
        let mut buffer = Cursor::new(Vec::new());

        let image = if self.width() > config.max_image_dimension
            || self.height() > config.max_image_dimension
        {
            let scale =
                config.max_image_dimension as f64 / self.width().max(self.height()) as f64;
            let new_width = ((self.width() as f64 * scale) as u32).max(1);
            let new_height = ((self.height() as f64 * scale) as u32).max(1);
            self.image
                .resize(new_width, new_height, image::imageops::FilterType::Lanczos3)
        } else {
            self.image.clone()
        };

        match config.image_format {
            ImageFormat::Png => {
                image
                    .write_to(&mut buffer, image::ImageFormat::Png)
                    .map_err(|e| ModelError::Image(e.to_string()))?;
            }
            ImageFormat::Jpeg => {
                // JPEG has no alpha channel
                let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                    &mut buffer,
                    config.jpeg_quality,
                );
                rgb.write_with_encoder(encoder)
                    .map_err(|e| ModelError::Image(e.to_string()))?;
            }
        }

        Ok(STANDARD.encode(buffer.into_inner()))
    }
}

// ============================================================================
// Serialized capture
// ============================================================================

/// Wraps a [`CapturePort`] so at most one capture is in flight.
///
/// The lock guard moves into the blocking task, so a caller that stops
/// waiting does not release the device early.
pub struct SerializedCapture {
    port: Arc<dyn CapturePort>,
    gate: Arc<Mutex<()>>,
    captures: AtomicU64,
    failures: AtomicU64,
}

impl SerializedCapture {
    pub fn new(port: Arc<dyn CapturePort>) -> Self {
        Self {
            port,
            gate: Arc::new(Mutex::new(())),
            captures: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Capture and decode one frame.
    pub async fn capture(&self) -> Result<Screenshot, CaptureError> {
        let guard = self.gate.clone().lock_owned().await;
        let port = self.port.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let bytes = port.capture()?;
            Screenshot::from_bytes(&bytes, port.name())
        })
        .await
        .map_err(|e| CaptureError::Join(e.to_string()))
        .and_then(|r| r);

        match &outcome {
            Ok(shot) => {
                self.captures.fetch_add(1, Ordering::Relaxed);
                debug!("Captured {}x{} frame", shot.width(), shot.height());
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Capture failed: {}", e);
            }
        }
        outcome
    }

    pub fn capture_count(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Encode an image as PNG bytes, the format capture ports hand back.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CaptureError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Png)
        .map_err(|e| CaptureError::Decode(e.to_string()))?;
    Ok(buffer.into_inner())
}
