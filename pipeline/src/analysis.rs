use std::time::{Duration, Instant};

use roadwatch_common::config::DetectorConfig;
use roadwatch_common::detection::Detection;
use roadwatch_common::position::{Position, PositionFix};
use serde::Serialize;
use tracing::debug;

use crate::annotate::confidence_hex;
use crate::detector::DetectorAdapter;
use crate::encode::decode_image;
use crate::error::PipelineError;
use crate::position::PositionResolver;
use crate::severity::{self, SeverityResult};

#[derive(Debug, Clone, Copy)]
pub struct AnalysisSettings {
    pub confidence: f32,
    pub max_detections: usize,
}

impl From<&DetectorConfig> for AnalysisSettings {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            confidence: config.confidence,
            max_detections: config.max_detections,
        }
    }
}

/// A detection plus its display colour.
#[derive(Debug, Clone, Serialize)]
pub struct ReportedDetection {
    #[serde(flatten)]
    pub detection: Detection,
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub detections: Vec<ReportedDetection>,
    #[serde(flatten)]
    pub severity: SeverityResult,
    pub inference_time_ms: f64,
    pub position: Option<PositionFix>,
    pub image_dimensions: ImageDimensions,
    #[serde(skip)]
    pub inference_time: Duration,
}

/// Analyse one uploaded still image end to end.
pub fn analyze_image(
    bytes: &[u8],
    hint: Option<Position>,
    detector: &DetectorAdapter,
    resolver: &PositionResolver,
    settings: AnalysisSettings,
) -> Result<AnalysisReport, PipelineError> {
    detector.ensure_ready()?;

    let image = decode_image(bytes)?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidDimensions { width, height });
    }

    let started = Instant::now();
    let detections = detector.detect(&image, settings.confidence, Some(settings.max_detections))?;
    let inference_time = started.elapsed();

    let severity = severity::score(&detections, width, height)?;
    let position = resolver.resolve_image(bytes, hint);
    debug!(
        width,
        height,
        detections = detections.len(),
        score = severity.score,
        positioned = position.is_some(),
        "image analysed"
    );

    Ok(AnalysisReport {
        detections: detections
            .into_iter()
            .map(|d| ReportedDetection {
                color: confidence_hex(d.confidence),
                detection: d,
            })
            .collect(),
        severity,
        inference_time_ms: inference_time.as_secs_f64() * 1000.0,
        position,
        image_dimensions: ImageDimensions { width, height },
        inference_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::stub::StubBackend;
    use crate::encode::encode_jpeg;
    use crate::severity::SeverityLevel;
    use image::RgbImage;
    use roadwatch_common::config::PositionConfig;
    use roadwatch_common::position::PositionSource;
    use std::sync::Arc;

    fn settings() -> AnalysisSettings {
        AnalysisSettings::from(&DetectorConfig::default())
    }

    fn resolver() -> PositionResolver {
        PositionResolver::new(&PositionConfig::default())
    }

    fn jpeg(w: u32, h: u32) -> Vec<u8> {
        encode_jpeg(&RgbImage::new(w, h), 90).unwrap().bytes.to_vec()
    }

    #[test]
    fn reports_detections_severity_and_hint_position() {
        let detector = DetectorAdapter::new(
            Arc::new(StubBackend::demo()),
            DetectorConfig::default().class_names,
        );
        let hint = Position::new(48.8566, 2.3522);
        let report = analyze_image(&jpeg(100, 100), Some(hint), &detector, &resolver(), settings())
            .unwrap();

        assert_eq!(report.detections.len(), 1);
        assert_eq!(report.detections[0].detection.class_name, "Pothole");
        assert_eq!(report.detections[0].color, "#00FF00");
        assert_eq!(report.severity.crack_count, 1);
        // 30x25 box on a 100x100 image.
        assert!((report.severity.score - 7.5).abs() < 0.5);
        assert_eq!(report.severity.level, SeverityLevel::Low);
        assert_eq!(report.image_dimensions, ImageDimensions { width: 100, height: 100 });
        let fix = report.position.unwrap();
        assert_eq!(fix.source, PositionSource::Hint);
        assert_eq!(fix.position(), hint);
    }

    #[test]
    fn no_hint_no_geotag_means_no_position() {
        let detector = DetectorAdapter::new(Arc::new(StubBackend::scripted(vec![])), vec![]);
        let report = analyze_image(&jpeg(20, 20), None, &detector, &resolver(), settings()).unwrap();
        assert!(report.position.is_none());
        assert_eq!(report.severity.score, 0.0);
        assert_eq!(report.severity.avg_confidence, 0.0);
    }

    #[test]
    fn unavailable_detector_short_circuits() {
        let detector = DetectorAdapter::unavailable("weights missing");
        let err = analyze_image(b"not even an image", None, &detector, &resolver(), settings())
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelUnavailable(_)));
    }

    #[test]
    fn undecodable_upload_is_decode_failure() {
        let detector = DetectorAdapter::new(Arc::new(StubBackend::demo()), vec![]);
        let err = analyze_image(b"garbage", None, &detector, &resolver(), settings()).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn report_serializes_flat() {
        let detector = DetectorAdapter::new(Arc::new(StubBackend::demo()), vec![]);
        let report = analyze_image(&jpeg(40, 40), None, &detector, &resolver(), settings()).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["crack_count"], 1);
        assert_eq!(json["severity_level"], "Low");
        assert!(json["severity_score"].is_number());
        assert!(json["detections"][0]["box"].is_object());
        assert!(json["detections"][0]["color"].is_string());
        assert!(json["position"].is_null());
    }
}
