use serde::{Deserialize, Serialize};

/// Axis-aligned box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() as f64 * self.height() as f64
    }

    /// Clamp to an image of the given size.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let w = width as f32;
        let h = height as f32;
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() as f32 + other.area() as f32 - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detected instance. Produced only by the detector adapter and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

impl Detection {
    /// Label drawn next to the box, e.g. `Pothole 0.87`.
    pub fn label(&self) -> String {
        format!("{} {:.2}", self.class_name, self.confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_box_has_zero_area() {
        let b = BoundingBox::new(10.0, 10.0, 5.0, 20.0);
        assert_eq!(b.area(), 0.0);
    }

    #[test]
    fn clamp_to_image() {
        let b = BoundingBox::new(-5.0, 2.0, 120.0, 90.0).clamped(100, 80);
        assert_eq!(b, BoundingBox::new(0.0, 2.0, 100.0, 80.0));
    }

    #[test]
    fn iou_identical_and_disjoint() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn label_uses_two_decimals() {
        let d = Detection {
            class_id: 4,
            class_name: "Pothole".into(),
            confidence: 0.8765,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
        };
        assert_eq!(d.label(), "Pothole 0.88");
    }
}
