use std::time::Duration;

use beach_feed_core::{MalformedFrameError, StatusMessage};
use thiserror::Error;

/// Transport failure local to one connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("read interrupted")]
    Interrupted,
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Benign interruptions are retried by the reader rather than tearing the
    /// connection down.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ConnectionError::Interrupted)
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("event loop is no longer accepting connections")]
    LoopStopped,
}

/// Failure of an external store, catalog or recommendation call.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("recommender returned status {0}")]
    Status(u16),
    #[error("failed to decode stored payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0} unavailable")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token missing")]
    Missing,
    #[error("token verification failed: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token carries no user identity")]
    MissingIdentity,
}

impl AuthError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Invalid(_) => "invalid",
            AuthError::MissingIdentity => "missing_identity",
        }
    }
}

/// Action that the session cannot apply in its current state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("an open action is required first")]
    OpenRequired,
}

impl From<StateError> for StatusMessage {
    fn from(err: StateError) -> Self {
        StatusMessage::bad_request(err.to_string())
    }
}

/// Returned by a frame handler; always fatal for the connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] MalformedFrameError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandlerError::Protocol(_) => "protocol",
            HandlerError::Connection(_) => "connection",
            HandlerError::TimedOut(_) => "timeout",
        }
    }
}
