use roadwatch_common::detection::Detection;
use serde::Serialize;

use crate::error::PipelineError;

pub const MODERATE_THRESHOLD: f64 = 30.0;
pub const SEVERE_THRESHOLD: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeverityLevel {
    Low,
    Moderate,
    Severe,
}

impl SeverityLevel {
    pub fn from_score(score: f64) -> Self {
        if score < MODERATE_THRESHOLD {
            SeverityLevel::Low
        } else if score < SEVERE_THRESHOLD {
            SeverityLevel::Moderate
        } else {
            SeverityLevel::Severe
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLevel::Low => "Low",
            SeverityLevel::Moderate => "Moderate",
            SeverityLevel::Severe => "Severe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeverityResult {
    /// Percentage of the image covered by detection boxes, capped at 100.
    #[serde(rename = "severity_score")]
    pub score: f64,
    #[serde(rename = "severity_level")]
    pub level: SeverityLevel,
    pub crack_count: usize,
    /// Mean detection confidence; 0 when `crack_count == 0`.
    pub avg_confidence: f32,
}

/// Score a set of detections against the image they came from.
///
/// Box areas are summed without de-overlapping, so heavily overlapping boxes
/// can saturate the score at 100.
pub fn score(
    detections: &[Detection],
    image_width: u32,
    image_height: u32,
) -> Result<SeverityResult, PipelineError> {
    let image_area = image_width as f64 * image_height as f64;
    if image_area <= 0.0 {
        return Err(PipelineError::InvalidDimensions {
            width: image_width,
            height: image_height,
        });
    }

    let total_box_area: f64 = detections.iter().map(|d| d.bbox.area()).sum();
    let score = (100.0 * total_box_area / image_area).min(100.0);
    let crack_count = detections.len();
    let avg_confidence = if crack_count > 0 {
        detections.iter().map(|d| d.confidence).sum::<f32>() / crack_count as f32
    } else {
        0.0
    };

    Ok(SeverityResult {
        score,
        level: SeverityLevel::from_score(score),
        crack_count,
        avg_confidence,
    })
}
