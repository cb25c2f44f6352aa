use std::time::Duration;

use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

/// A message that cannot be admitted to the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message sender is missing")]
    MissingSender,
    #[error("message text is empty")]
    EmptyText,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryLoadError {
    #[error("history request failed: {0}")]
    Transport(String),
    #[error("history request returned status {status}")]
    Status { status: u16 },
    #[error("history response was malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("send request failed: {0}")]
    Transport(String),
    #[error("send request returned status {status}")]
    Status { status: u16 },
    #[error("server did not acknowledge the message: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("live channel connect failed: {0}")]
    Connect(String),
    #[error("live channel transport failed: {0}")]
    Transport(String),
    #[error("live channel closed by peer: {0}")]
    ClosedByPeer(String),
    #[error("live channel disconnected: {0}")]
    Disconnected(String),
    #[error("live channel handshake not acknowledged within {0:?}")]
    AckTimeout(Duration),
    #[error("live channel protocol violation: {0}")]
    Protocol(String),
    #[error("live channel server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },
}

impl From<ApiError> for ChannelError {
    fn from(value: ApiError) -> Self {
        Self::Server {
            code: value.code,
            message: value.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidServerUrl { url: String, reason: String },
    #[error("server url must use http:// or https://, got '{0}'")]
    UnsupportedScheme(String),
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// Errors returned by [`crate::SyncEngine`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("not authenticated: session carries no user identity")]
    NotAuthenticated,
    #[error("sync engine has not been started")]
    NotStarted,
    #[error("operation overtaken by stop or restart")]
    Cancelled,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    HistoryLoad(#[from] HistoryLoadError),
    #[error("history refresh failed: {0}")]
    Refresh(HistoryLoadError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
