use bytes::Bytes;
use image::RgbImage;

/// A decoded raster frame pulled from a source.
///
/// Owned by exactly one engine iteration; it is consumed by value when the
/// iteration finishes and never handed to the next one.
#[derive(Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at_ms: i64) -> Self {
        Self {
            image,
            captured_at_ms,
        }
    }

    /// Stamp a freshly decoded image with the current wall-clock time.
    pub fn now(image: RgbImage) -> Self {
        Self::new(image, chrono::Utc::now().timestamp_millis())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

/// A compressed JPEG ready for transport framing.
///
/// Cloning is cheap (reference-counted buffer), which is what lets the
/// engine hand out the same cached bytes for every passthrough frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub bytes: Bytes,
    pub quality: u8,
}

impl EncodedFrame {
    pub fn new(bytes: impl Into<Bytes>, quality: u8) -> Self {
        Self {
            bytes: bytes.into(),
            quality,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True when both frames share the same underlying allocation.
    pub fn shares_buffer_with(&self, other: &EncodedFrame) -> bool {
        self.bytes.as_ptr() == other.bytes.as_ptr() && self.bytes.len() == other.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_dimensions() {
        let frame = Frame::new(RgbImage::new(64, 48), 1_708_300_000_000);
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
        assert_eq!(frame.area(), 64 * 48);
    }

    #[test]
    fn clones_share_buffer() {
        let encoded = EncodedFrame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 75);
        let copy = encoded.clone();
        assert!(copy.shares_buffer_with(&encoded));

        let other = EncodedFrame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 75);
        assert_eq!(other, encoded);
        assert!(!other.shares_buffer_with(&encoded));
    }
}
