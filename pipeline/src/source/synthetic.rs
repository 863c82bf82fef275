use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use roadwatch_common::frame::Frame;

use super::FrameSource;
use crate::error::PipelineError;

/// Deterministic in-memory source: a fixed number of gradient frames.
///
/// Optionally fails with a read error after a given number of frames.
#[derive(Debug)]
pub struct SyntheticSource {
    width: u32,
    height: u32,
    total: u64,
    produced: u64,
    fail_after: Option<u64>,
    closed: Arc<AtomicBool>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, total: u64) -> Self {
        Self {
            width,
            height,
            total,
            produced: 0,
            fail_after: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Flag that flips to true once the source has been closed.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    fn render(&self, index: u64) -> RgbImage {
        let shift = (index * 7 % 256) as u32;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                (index % 256) as u8,
            ])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        if self.fail_after == Some(self.produced) {
            return Err(PipelineError::SourceIo(format!(
                "synthetic read failure after {} frames",
                self.produced
            )));
        }
        if self.produced >= self.total {
            return Ok(None);
        }
        let image = self.render(self.produced);
        let frame = Frame::new(image, self.produced as i64 * 33);
        self.produced += 1;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_exact_count_then_ends() {
        let mut src = SyntheticSource::new(8, 6, 3);
        let mut n = 0;
        while let Some(frame) = src.next_frame().unwrap() {
            assert_eq!(frame.image.dimensions(), (8, 6));
            n += 1;
        }
        assert_eq!(n, 3);
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn fails_at_configured_point() {
        let mut src = SyntheticSource::new(4, 4, 10).failing_after(2);
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_some());
        assert!(matches!(src.next_frame(), Err(PipelineError::SourceIo(_))));
    }

    #[test]
    fn close_is_idempotent_and_observable() {
        let mut src = SyntheticSource::new(4, 4, 10);
        let flag = src.closed_flag();
        src.close();
        src.close();
        assert!(flag.load(Ordering::Acquire));
        assert!(src.next_frame().unwrap().is_none());
    }
}
