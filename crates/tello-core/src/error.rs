//! Error types for the tello client.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Socket failures, protocol rejections,
//! telemetry parse failures, and session-level conditions are all captured
//! here.

/// The error type for all tello client operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A socket-level failure (network unreachable, socket closed under us).
    ///
    /// Fatal for the affected channel; the session moves to
    /// `SessionState::Error(ErrorKind::Transport)`.
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply arrived within the retry budget, or a receive deadline passed.
    #[error("timeout waiting for response")]
    Timeout,

    /// The device (or the client, on its behalf) refused a command.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// A telemetry or video datagram could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Telemetry has been stale for longer than the configured threshold.
    #[error("link lost")]
    LinkLost,

    /// An invalid argument was passed to a command constructor or builder.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The operation is not allowed in the session's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No session has been established.
    #[error("not connected")]
    NotConnected,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
