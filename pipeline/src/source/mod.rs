//! Frame sources feeding the stream engine.

pub mod ffmpeg;
pub mod mjpeg;
pub mod synthetic;

use std::path::PathBuf;

use roadwatch_common::config::StreamConfig;
use roadwatch_common::frame::Frame;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub use ffmpeg::FfmpegSource;
pub use synthetic::SyntheticSource;

/// Pull-based producer of decoded frames.
pub trait FrameSource: Send {
    /// Next frame, `Ok(None)` on clean end of input.
    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError>;

    /// Release the underlying handle. Must be idempotent.
    fn close(&mut self);
}

/// What a stream reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSpec {
    /// Recorded video file, paced and finite.
    File(PathBuf),
    /// Capture device index, e.g. 0 for `/dev/video0`.
    Device(u32),
}

impl SourceSpec {
    pub fn is_live(&self) -> bool {
        matches!(self, SourceSpec::Device(_))
    }

    pub fn describe(&self) -> String {
        match self {
            SourceSpec::File(path) => path.display().to_string(),
            SourceSpec::Device(index) => format!("device:{index}"),
        }
    }

    /// Open the source through ffmpeg. Blocks until the first frame is decoded
    /// or the source is known to be unusable.
    pub fn open(&self, config: &StreamConfig) -> Result<Box<dyn FrameSource>, PipelineError> {
        let source = FfmpegSource::open(self, &config.ffmpeg_path, config.capture_quality)?;
        Ok(Box::new(source))
    }
}
