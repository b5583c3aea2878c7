//! Structured error types for the streaming server
//!
//! Every variant except `Transport` and `Handshake` is surfaced to the
//! client as an `Error` text message and leaves the session usable; the
//! client may `EndSession` and retry. Transport and handshake failures have
//! no channel to report on and terminate the connection instead.

use thiserror::Error;

use crate::engine::EngineError;

/// Error taxonomy for a single connection.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed JSON, unknown message type, or an invalid binary header.
    #[error("{0}")]
    Protocol(String),

    /// A message arrived in a session state that cannot accept it.
    #[error("{0}")]
    SessionState(String),

    /// StartSession hints do not match the server configuration.
    #[error("{0}")]
    Validation(String),

    /// Audio regressed behind the accumulator, or the gap exceeds 10 s.
    #[error("{0}")]
    AudioOrder(String),

    /// Pool exhausted, or the pending-frame cap was reached.
    #[error("{0}")]
    Capacity(String),

    /// Failure from the inference engine, prefixed with the operation that
    /// hit it.
    #[error("{context}: {source}")]
    Engine {
        context: String,
        #[source]
        source: EngineError,
    },

    /// Socket-level failure; terminates the connection.
    #[error(transparent)]
    Transport(#[from] std::io::Error),

    /// Malformed or non-WebSocket upgrade request.
    #[error("{0}")]
    Handshake(String),
}

impl ServerError {
    /// Wrap an engine failure with the operation that hit it.
    pub fn engine(context: impl Into<String>, source: EngineError) -> Self {
        ServerError::Engine {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_carry_operation_prefix() {
        let err = ServerError::engine("Execute() failed", EngineError::new("device fault"));
        assert_eq!(err.to_string(), "Execute() failed: device fault");
    }

    #[test]
    fn test_io_errors_convert_to_transport() {
        let err: ServerError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, ServerError::Transport(_)));
    }
}
