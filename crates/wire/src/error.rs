//! Frame parsing errors.

use thiserror::Error;

/// Reasons a single frame could not be turned into an [`Event`](crate::Event).
///
/// A parse error only ever costs the frame it occurred in; the decoder keeps
/// going with the next one.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The frame bytes were not valid UTF-8.
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// The payload was not a JSON object of the expected shape.
    #[error("malformed frame payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The `type` discriminator named an event kind we don't know, and the
    /// frame had no content to fall back on.
    #[error("unknown event type: {0}")]
    UnknownKind(String),

    /// No `type`, and nothing else in the payload implied one.
    #[error("frame has no type and no content")]
    MissingKind,
}

pub type Result<T> = std::result::Result<T, ParseError>;
