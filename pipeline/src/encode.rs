use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use roadwatch_common::frame::EncodedFrame;

use crate::error::PipelineError;

/// JPEG-encode a raster at the given quality (1..=100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<EncodedFrame, PipelineError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidDimensions { width, height });
    }
    let quality = quality.clamp(1, 100);
    let mut buf = Vec::with_capacity((width * height / 8) as usize);
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(image)
        .map_err(|e| PipelineError::Encode(e.to_string()))?;
    Ok(EncodedFrame::new(buf, quality))
}

/// Decode an uploaded still into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    let img = image::load_from_memory(bytes).map_err(|e| PipelineError::Decode(e.to_string()))?;
    Ok(img.to_rgb8())
}

/// Single-slot cache holding the most recent annotated encoding.
///
/// Passthrough frames are served from here so they cost no inference and no
/// encode. The slot is owned by one engine and never shared across streams.
#[derive(Debug, Default)]
pub struct EncodeCache {
    slot: Option<EncodedFrame>,
}

impl EncodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<EncodedFrame> {
        self.slot.clone()
    }

    pub fn store(&mut self, frame: EncodedFrame) {
        self.slot = Some(frame);
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn encodes_valid_jpeg() {
        let img = RgbImage::from_pixel(16, 16, Rgb([200, 10, 10]));
        let frame = encode_jpeg(&img, 75).unwrap();
        assert_eq!(&frame.bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&frame.bytes[frame.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(frame.quality, 75);

        let back = decode_image(&frame.bytes).unwrap();
        assert_eq!(back.dimensions(), (16, 16));
    }

    #[test]
    fn empty_raster_rejected() {
        let err = encode_jpeg(&RgbImage::new(0, 4), 75).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDimensions { .. }));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = decode_image(b"definitely not a jpeg").unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn cache_hands_out_same_buffer() {
        let mut cache = EncodeCache::new();
        assert!(cache.get().is_none());
        let frame = encode_jpeg(&RgbImage::new(8, 8), 50).unwrap();
        cache.store(frame.clone());
        let a = cache.get().unwrap();
        let b = cache.get().unwrap();
        assert!(a.shares_buffer_with(&b));
        assert!(a.shares_buffer_with(&frame));
        cache.clear();
        assert!(cache.get().is_none());
    }
}
