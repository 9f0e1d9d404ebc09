//! Error types for the transport layer.

use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while exchanging a request with a service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Network failure before a response was received.
    #[error("network error: {message}")]
    Network {
        /// What went wrong on the wire.
        message: String,
        /// A repeat of the same request may succeed.
        retryable: bool,
    },

    /// The service answered with a non-2xx status.
    #[error("http status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body as returned by the service.
        body: String,
    },

    /// The request did not complete within the endpoint timeout.
    #[error("request timed out")]
    Timeout,

    /// A scripted transport was called more often than it has replies.
    #[error("transport exhausted: no reply programmed for call #{calls}")]
    Exhausted {
        /// One-based number of the call that found the script empty.
        calls: usize,
    },

    /// The adapter is disabled.
    #[error("transport adapter is disabled")]
    Disabled,

    /// The adapter was disabled while this call was still pending.
    #[error("transport adapter was disabled while a call was pending")]
    DisabledWhilePending,

    /// The request could not be built or the response could not be read.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a status error carrying the response body.
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    /// Returns the HTTP status, if the service answered at all.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the response body of a status error.
    pub fn body(&self) -> Option<&str> {
        match self {
            TransportError::Status { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Returns true if a caller may reasonably retry the request.
    ///
    /// The runtime itself never retries; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network { retryable, .. } => *retryable,
            TransportError::Timeout => true,
            TransportError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
