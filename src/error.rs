//! Error types for session and inference operations.

use thiserror::Error;

/// Every failure a session operation can surface to a caller.
///
/// All variants are recoverable at the request boundary. Lock races
/// (double release, cancelling a finished stream) never produce one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The inference server could not be reached.
    #[error("cannot reach inference server at {url}: {message}")]
    Connection { url: String, message: String },

    /// Generation was requested before a model was chosen.
    #[error("no model selected for session '{0}'")]
    ModelNotSelected(String),

    /// The model key is not known to the inference server.
    #[error("model '{0}' not found")]
    ModelNotFound(String),

    /// Another generation holds the session lock and is not stale.
    #[error("session '{0}' is already generating")]
    SessionBusy(String),

    /// Lookup-only path hit an unknown session id.
    #[error("session '{0}' does not exist")]
    SessionNotFound(String),

    /// `load_chat` was given an unknown chat key.
    #[error("chat '{0}' not found")]
    ChatNotFound(String),

    /// The inference stream failed after it was opened.
    #[error("inference stream failed: {0}")]
    Stream(String),

    /// The generation was cancelled or superseded by a stale-lock steal.
    #[error("generation for session '{0}' was cancelled")]
    Cancelled(String),

    /// Endpoint descriptor failed validation.
    #[error("invalid connection info: {0}")]
    InvalidConnection(String),
}

impl SessionError {
    pub fn connection(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Stable variant name used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::ModelNotSelected(_) => "model_not_selected",
            Self::ModelNotFound(_) => "model_not_found",
            Self::SessionBusy(_) => "session_busy",
            Self::SessionNotFound(_) => "session_not_found",
            Self::ChatNotFound(_) => "chat_not_found",
            Self::Stream(_) => "stream",
            Self::Cancelled(_) => "cancelled",
            Self::InvalidConnection(_) => "invalid_connection",
        }
    }

    /// HTTP status the router answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Connection { .. } | Self::Stream(_) => 502,
            Self::ModelNotSelected(_) | Self::InvalidConnection(_) => 400,
            Self::ModelNotFound(_) | Self::SessionNotFound(_) | Self::ChatNotFound(_) => 404,
            Self::SessionBusy(_) | Self::Cancelled(_) => 409,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
