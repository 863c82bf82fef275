use serde::Serialize;

/// Machine-checkable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelUnavailable,
    SourceUnopenable,
    SourceIo,
    InvalidDimensions,
    InvalidArgument,
    GeotagUnparseable,
    EncodeFailure,
    DecodeFailure,
    InferenceFailure,
    SnapshotFailure,
    SubscriberDeliveryFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::SourceUnopenable => "source_unopenable",
            ErrorKind::SourceIo => "source_io",
            ErrorKind::InvalidDimensions => "invalid_dimensions",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::GeotagUnparseable => "geotag_unparseable",
            ErrorKind::EncodeFailure => "encode_failure",
            ErrorKind::DecodeFailure => "decode_failure",
            ErrorKind::InferenceFailure => "inference_failure",
            ErrorKind::SnapshotFailure => "snapshot_failure",
            ErrorKind::SubscriberDeliveryFailure => "subscriber_delivery_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("detector model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("cannot open source {source_ref}: {reason}")]
    SourceUnopenable {
        source_ref: String,
        reason: String,
        missing: bool,
    },
    #[error("source read failed: {0}")]
    SourceIo(String),
    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("geotag unparseable: {0}")]
    GeotagUnparseable(String),
    #[error("JPEG encode failed: {0}")]
    Encode(String),
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("failed to write snapshot {path}: {source}")]
    Snapshot {
        path: String,
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            PipelineError::SourceUnopenable { .. } => ErrorKind::SourceUnopenable,
            PipelineError::SourceIo(_) => ErrorKind::SourceIo,
            PipelineError::InvalidDimensions { .. } => ErrorKind::InvalidDimensions,
            PipelineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PipelineError::GeotagUnparseable(_) => ErrorKind::GeotagUnparseable,
            PipelineError::Encode(_) => ErrorKind::EncodeFailure,
            PipelineError::Decode(_) => ErrorKind::DecodeFailure,
            PipelineError::Inference(_) => ErrorKind::InferenceFailure,
            PipelineError::Snapshot { .. } => ErrorKind::SnapshotFailure,
        }
    }

    pub(crate) fn unopenable(source_ref: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::SourceUnopenable {
            source_ref: source_ref.into(),
            reason: reason.into(),
            missing: false,
        }
    }
}

/// Failure recorded on a stream that ended in the `Failed` phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for FailureReport {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
