use std::sync::atomic::{AtomicUsize, Ordering};

use image::RgbImage;

use super::{BoxLayout, DetectorBackend, RawDetection};
use crate::error::PipelineError;

/// Backend that replays a fixed script of raw detections on every call.
///
/// Used for tests and for running the service without model weights.
#[derive(Debug, Default)]
pub struct StubBackend {
    script: Vec<RawDetection>,
    calls: AtomicUsize,
}

impl StubBackend {
    pub fn scripted(script: Vec<RawDetection>) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    /// One pothole in the lower middle of the frame.
    pub fn demo() -> Self {
        Self::scripted(vec![RawDetection {
            class_id: 4.0,
            confidence: 0.82,
            coords: [0.35, 0.55, 0.65, 0.8],
            layout: BoxLayout::CornersNormalized,
        }])
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &self,
        _image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<RawDetection>, PipelineError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .script
            .iter()
            .filter(|r| r.confidence >= confidence_threshold as f64)
            .cloned()
            .collect())
    }
}

/// Backend that always fails inference. Test helper for error paths.
#[derive(Debug, Default)]
pub struct FailingBackend;

impl DetectorBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn detect(&self, _image: &RgbImage, _threshold: f32) -> Result<Vec<RawDetection>, PipelineError> {
        Err(PipelineError::Inference("backend rejected input".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_calls_and_filters_by_threshold() {
        let backend = StubBackend::demo();
        let img = RgbImage::new(8, 8);
        assert_eq!(backend.detect(&img, 0.5).unwrap().len(), 1);
        assert!(backend.detect(&img, 0.9).unwrap().is_empty());
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn failing_backend_reports_inference_error() {
        let err = FailingBackend.detect(&RgbImage::new(2, 2), 0.5).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }
}
