use thiserror::Error;

/// Failure taxonomy of the streaming pipeline.
///
/// `EndOfStream` is not an error: sources report it as `Ok(None)`. A client
/// disconnect is not one either; the session reports it as its end reason.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The device or file behind an origin could not be opened.
    #[error("source unavailable: {origin}: {reason}")]
    SourceUnavailable { origin: String, reason: String },

    /// The file exists but no enabled decoder can read its format.
    #[error("unsupported format: {origin}: {reason}")]
    UnsupportedFormat { origin: String, reason: String },

    /// A frame was open but could not be read.
    #[error("frame read failed: {0}")]
    Read(String),

    /// A frame could not be serialized to JPEG.
    #[error("frame encode failed: {0}")]
    EncodeFailure(String),

    /// The detector rejected a frame or could not be constructed.
    #[error("detector failed: {0}")]
    Detector(String),

    /// A closed session was asked to stream again.
    #[error("session {0} is closed")]
    SessionClosed(u64),
}

impl StreamError {
    pub fn source_unavailable(origin: impl Into<String>, reason: impl ToString) -> Self {
        StreamError::SourceUnavailable {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_source_unavailable(&self) -> bool {
        matches!(self, StreamError::SourceUnavailable { .. })
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
