use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The server rejected our credentials. Fatal to the session until
    /// re-authentication.
    #[error("not authorized; log in again")]
    Auth,

    #[error(transparent)]
    Transport(TransportError),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("session has shut down")]
    SessionClosed,

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized => Self::Auth,
            other => Self::Transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
