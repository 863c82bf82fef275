pub mod analysis;
pub mod annotate;
pub mod detector;
pub mod encode;
pub mod engine;
pub mod error;
pub mod hub;
pub mod position;
pub mod severity;
pub mod snapshot;
pub mod source;

pub use error::{ErrorKind, FailureReport, PipelineError};
