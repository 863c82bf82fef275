#![cfg(feature = "backend-tract")]

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;
use roadwatch_common::detection::BoundingBox;
use tract_onnx::prelude::*;
use tracing::info;

use super::nms::{self, Candidate};
use super::{BoxLayout, DetectorBackend, RawDetection};
use crate::error::PipelineError;

/// YOLOv8-style ONNX detector run through tract.
///
/// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + classes, N]`
/// output of centre/size boxes followed by per-class scores.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    iou_threshold: f32,
}

impl TractBackend {
    pub fn load(model_path: &Path, input_size: u32, iou_threshold: f32) -> Result<Self, PipelineError> {
        if !model_path.exists() {
            return Err(PipelineError::ModelUnavailable(format!(
                "model file {} not found",
                model_path.display()
            )));
        }
        let unavailable =
            |e: TractError| PipelineError::ModelUnavailable(format!("{}: {e}", model_path.display()));

        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(unavailable)?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .map_err(unavailable)?
            .into_optimized()
            .map_err(unavailable)?
            .into_runnable()
            .map_err(unavailable)?;

        info!(path = %model_path.display(), input_size, "ONNX model loaded");
        Ok(Self {
            model,
            input_size,
            iou_threshold,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = image::imageops::resize(image, side, side, FilterType::Triangle);
        let side = side as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        })
        .into_tensor()
    }

    fn decode(
        &self,
        output: &Tensor,
        width: u32,
        height: u32,
        threshold: f32,
    ) -> Result<Vec<Candidate>, PipelineError> {
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| PipelineError::Inference(format!("output tensor is not f32: {e}")))?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(PipelineError::Inference(format!(
                "unexpected output shape {shape:?}"
            )));
        }
        let classes = shape[1] - 4;
        let anchors = shape[2];
        let sx = width as f32 / self.input_size as f32;
        let sy = height as f32 / self.input_size as f32;

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let (class_id, confidence) = (0..classes)
                .map(|c| (c, view[[0, 4 + c, i]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if confidence < threshold {
                continue;
            }
            let (cx, cy, w, h) = (view[[0, 0, i]], view[[0, 1, i]], view[[0, 2, i]], view[[0, 3, i]]);
            candidates.push(Candidate {
                class_id,
                confidence,
                bbox: BoundingBox::new(
                    (cx - w / 2.0) * sx,
                    (cy - h / 2.0) * sy,
                    (cx + w / 2.0) * sx,
                    (cy + h / 2.0) * sy,
                ),
            });
        }
        Ok(candidates)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<RawDetection>, PipelineError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidDimensions { width, height });
        }

        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| PipelineError::Inference(e.to_string()))?;
        let output = outputs
            .first()
            .ok_or_else(|| PipelineError::Inference("model produced no outputs".into()))?;

        let candidates = self.decode(output, width, height, confidence_threshold)?;
        Ok(nms::suppress(candidates, self.iou_threshold)
            .into_iter()
            .map(|c| RawDetection {
                class_id: c.class_id as f64,
                confidence: c.confidence as f64,
                coords: [
                    c.bbox.x1 as f64,
                    c.bbox.y1 as f64,
                    c.bbox.x2 as f64,
                    c.bbox.y2 as f64,
                ],
                layout: BoxLayout::CornersPixels,
            })
            .collect())
    }
}
