//! Error taxonomy for the telemetry client
//!
//! Fallback and backoff are handled internally; only
//! [`ConnectError::AuthenticationRejected`] and [`ReconnectError::Exhausted`]
//! are meant to reach an operator as hard failures.

use crate::context::ConnectionState;
use crate::transport::{SendError, TransportKind};
use thiserror::Error;

/// Failure of a single `TransportSelector::connect` call
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The broker explicitly refused the identity handshake.
    #[error("authentication rejected on {transport} transport (code {code})")]
    AuthenticationRejected { transport: TransportKind, code: u8 },

    /// Neither transport produced a session within its timeout.
    #[error("transport unavailable: primary: {primary}; secondary: {secondary}")]
    TransportUnavailable { primary: String, secondary: String },
}

impl ConnectError {
    /// Whether retrying the same identity can ever succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::TransportUnavailable { .. })
    }
}

/// Failure of a single publish on an established (or missing) session
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("send failed on {transport} transport")]
    SendFailure {
        transport: TransportKind,
        #[source]
        source: SendError,
    },
}

/// Terminal outcomes of the reconnection controller
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("reconnection exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("reconnection aborted: {0}")]
    Rejected(#[source] ConnectError),

    #[error("reconnection cancelled by shutdown")]
    Cancelled,
}

/// Resumption store I/O failure. Callers degrade to a full handshake.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resumption store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("refusing to store an empty resumption token")]
    EmptyToken,
}

/// Umbrella error for the binary and for callers that do not care which
/// component failed
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("reconnect error: {0}")]
    Reconnect(#[from] ReconnectError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("transport setup error: {message}")]
    TransportSetup { message: String },
}

impl ClientError {
    /// Create transport setup error
    pub fn transport_setup<S: Into<String>>(message: S) -> Self {
        Self::TransportSetup {
            message: message.into(),
        }
    }

    /// Whether this error requires operator intervention
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Connect(e) => !e.is_retryable(),
            ClientError::Reconnect(ReconnectError::Cancelled) => false,
            ClientError::Reconnect(_) => true,
            ClientError::Publish(_) => false,
            ClientError::Config(_) | ClientError::TransportSetup { .. } => true,
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_not_retryable() {
        let rejected = ConnectError::AuthenticationRejected {
            transport: TransportKind::Primary,
            code: 5,
        };
        assert!(!rejected.is_retryable());

        let unavailable = ConnectError::TransportUnavailable {
            primary: "timeout".to_string(),
            secondary: "refused".to_string(),
        };
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn test_error_display_carries_context() {
        let rejected = ConnectError::AuthenticationRejected {
            transport: TransportKind::Secondary,
            code: 4,
        };
        let text = rejected.to_string();
        assert!(text.contains("secondary"));
        assert!(text.contains("code 4"));

        let exhausted = ReconnectError::Exhausted { attempts: 10 };
        assert!(exhausted.to_string().contains("10 attempts"));

        let not_connected = PublishError::NotConnected {
            state: ConnectionState::Reconnecting,
        };
        assert!(not_connected.to_string().contains("reconnecting"));
    }

    #[test]
    fn test_fatal_classification() {
        let fatal: ClientError = ReconnectError::Exhausted { attempts: 3 }.into();
        assert!(fatal.is_fatal());

        let cancelled: ClientError = ReconnectError::Cancelled.into();
        assert!(!cancelled.is_fatal());

        let publish: ClientError = PublishError::NotConnected {
            state: ConnectionState::Disconnected,
        }
        .into();
        assert!(!publish.is_fatal());

        let rejected: ClientError = ConnectError::AuthenticationRejected {
            transport: TransportKind::Primary,
            code: 5,
        }
        .into();
        assert!(rejected.is_fatal());
    }
}
