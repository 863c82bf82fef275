//! Detector adapter.
//!
//! Backends return loosely-shaped `RawDetection`s straight from the model.
//! All coercion into the fixed `Detection` shape (class lookup, box layout,
//! clamping, threshold, cap) happens here and nowhere downstream.

pub mod nms;
pub mod stub;
#[cfg(feature = "backend-tract")]
pub mod tract;

use std::sync::Arc;

use image::RgbImage;
use roadwatch_common::config::DetectorConfig;
use roadwatch_common::detection::{BoundingBox, Detection};
use tracing::{debug, info, warn};

use crate::error::PipelineError;

/// How the four box numbers of a `RawDetection` are to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxLayout {
    /// x1, y1, x2, y2 in source pixels.
    CornersPixels,
    /// x1, y1, x2, y2 as fractions of width/height.
    CornersNormalized,
    /// centre x, centre y, width, height in source pixels.
    CenterPixels,
}

/// Model output before coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: f64,
    pub confidence: f64,
    pub coords: [f64; 4],
    pub layout: BoxLayout,
}

/// Detector backend trait.
///
/// Implementations must be deterministic for identical weights and input and
/// must return an empty list, not an error, when nothing clears the threshold.
pub trait DetectorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<RawDetection>, PipelineError>;
}

pub struct DetectorAdapter {
    backend: Option<Arc<dyn DetectorBackend>>,
    class_names: Vec<String>,
    unavailable_reason: String,
}

impl DetectorAdapter {
    pub fn new(backend: Arc<dyn DetectorBackend>, class_names: Vec<String>) -> Self {
        Self {
            backend: Some(backend),
            class_names,
            unavailable_reason: String::new(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            backend: None,
            class_names: Vec::new(),
            unavailable_reason: reason.into(),
        }
    }

    /// Build the backend named in the config. Load failures leave the
    /// adapter unavailable rather than aborting startup.
    pub fn from_config(config: &DetectorConfig) -> Self {
        let backend: Result<Arc<dyn DetectorBackend>, String> = match config.backend.as_str() {
            "stub" => Ok(Arc::new(stub::StubBackend::demo())),
            "onnx" => load_onnx(config),
            "none" => Err("detector disabled by configuration".into()),
            other => Err(format!("unknown detector backend '{other}'")),
        };

        match backend {
            Ok(backend) => {
                let warm = image::RgbImage::new(config.input_size, config.input_size);
                if let Err(e) = backend.detect(&warm, config.confidence) {
                    warn!(error = %e, backend = backend.name(), "detector warm-up inference failed");
                }
                info!(backend = backend.name(), classes = config.class_names.len(), "detector ready");
                Self::new(backend, config.class_names.clone())
            }
            Err(reason) => {
                warn!(reason, "detector unavailable");
                Self::unavailable(reason)
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_some()
    }

    /// Fail fast with `ModelUnavailable` when no backend is loaded.
    pub fn ensure_ready(&self) -> Result<(), PipelineError> {
        match self.backend {
            Some(_) => Ok(()),
            None => Err(self.unavailable_error()),
        }
    }

    fn unavailable_error(&self) -> PipelineError {
        PipelineError::ModelUnavailable(self.unavailable_reason.clone())
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    pub fn class_name(&self, class_id: u32) -> String {
        self.class_names
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    /// Run detection on one image.
    ///
    /// Returned detections are in source-pixel coordinates, clamped to the
    /// image, sorted by descending confidence and capped at `max_detections`.
    pub fn detect(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
        max_detections: Option<usize>,
    ) -> Result<Vec<Detection>, PipelineError> {
        let Some(backend) = self.backend.as_ref() else {
            return Err(self.unavailable_error());
        };

        if !(confidence_threshold > 0.0 && confidence_threshold <= 1.0) {
            return Err(PipelineError::InvalidArgument(format!(
                "confidence threshold must be within (0, 1], got {confidence_threshold}"
            )));
        }

        let raw = backend.detect(image, confidence_threshold)?;
        let raw_count = raw.len();
        let (width, height) = image.dimensions();

        let mut detections: Vec<Detection> = raw
            .into_iter()
            .filter_map(|r| self.coerce(r, width, height))
            .filter(|d| d.confidence >= confidence_threshold)
            .collect();
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        if let Some(cap) = max_detections {
            detections.truncate(cap);
        }

        debug!(
            backend = backend.name(),
            raw = raw_count,
            kept = detections.len(),
            "detection complete"
        );
        Ok(detections)
    }

    fn coerce(&self, raw: RawDetection, width: u32, height: u32) -> Option<Detection> {
        if !raw.confidence.is_finite() || !raw.class_id.is_finite() || raw.class_id < 0.0 {
            debug!(?raw, "dropping malformed raw detection");
            return None;
        }
        if raw.coords.iter().any(|c| !c.is_finite()) {
            debug!(?raw, "dropping raw detection with non-finite box");
            return None;
        }

        let [a, b, c, d] = raw.coords;
        let (x1, y1, x2, y2) = match raw.layout {
            BoxLayout::CornersPixels => (a, b, c, d),
            BoxLayout::CornersNormalized => (
                a * width as f64,
                b * height as f64,
                c * width as f64,
                d * height as f64,
            ),
            BoxLayout::CenterPixels => (a - c / 2.0, b - d / 2.0, a + c / 2.0, b + d / 2.0),
        };
        let bbox =
            BoundingBox::new(x1 as f32, y1 as f32, x2 as f32, y2 as f32).clamped(width, height);
        if bbox.area() <= 0.0 {
            return None;
        }

        let class_id = raw.class_id.round() as u32;
        Some(Detection {
            class_id,
            class_name: self.class_name(class_id),
            confidence: raw.confidence.clamp(0.0, 1.0) as f32,
            bbox,
        })
    }
}

#[cfg(feature = "backend-tract")]
fn load_onnx(config: &DetectorConfig) -> Result<Arc<dyn DetectorBackend>, String> {
    tract::TractBackend::load(&config.model_path, config.input_size, config.iou_threshold)
        .map(|b| Arc::new(b) as Arc<dyn DetectorBackend>)
        .map_err(|e| e.to_string())
}

#[cfg(not(feature = "backend-tract"))]
fn load_onnx(_config: &DetectorConfig) -> Result<Arc<dyn DetectorBackend>, String> {
    Err("onnx backend requires the backend-tract feature".into())
}
