//! Error types for requests made through a [`Transport`](crate::Transport).

use thiserror::Error;

/// A request that never produced a usable payload. Cloneable, so that one
/// failed batch can hand the same error to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request didn't get a response at all
    #[error("request to {path} failed: {message}")]
    Network { path: String, message: String },

    /// The server answered with a failure status
    #[error("request to {path} failed with status {status}: {message}")]
    Status {
        path: String,
        status: u16,
        message: String,
    },
}

impl TransportError {
    pub fn network(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn status(path: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            path: path.into(),
            status,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the typed API wrappers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The payload didn't have the expected shape
    #[error("unexpected response from {endpoint}: {message}")]
    Decode { endpoint: &'static str, message: String },
}

impl ApiError {
    pub(crate) fn decode(endpoint: &'static str, err: serde_json::Error) -> Self {
        Self::Decode {
            endpoint,
            message: err.to_string(),
        }
    }
}
