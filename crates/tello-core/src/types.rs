//! Core types shared by every crate in the workspace.

use std::fmt;

use crate::error::{Error, Result};

/// Reason string for a submission made while another command is outstanding
/// under `QueuePolicy::RejectWhenBusy`.
pub const REASON_BUSY: &str = "busy";
/// Reason string for a submission that overflowed the bounded command queue.
pub const REASON_QUEUE_FULL: &str = "queue-full";
/// Reason string for commands cancelled by `disconnect()`.
pub const REASON_CANCELLED: &str = "cancelled";
/// Reason string for commands refused by the session state machine.
pub const REASON_INVALID_STATE: &str = "invalid state";
/// Reason string for commands submitted with no session established.
pub const REASON_NOT_CONNECTED: &str = "not connected";
/// Reason string for commands refused after telemetry went stale.
pub const REASON_LINK_LOST: &str = "link lost";

/// One of the three UDP channels multiplexed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Bidirectional text command channel.
    Command,
    /// Receive-only telemetry push channel.
    Telemetry,
    /// Receive-only H.264 video channel.
    Video,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Command => write!(f, "command"),
            Channel::Telemetry => write!(f, "telemetry"),
            Channel::Video => write!(f, "video"),
        }
    }
}

/// The class of a command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Changes what the aircraft is doing (takeoff, move, flip).
    Control,
    /// Queries a value; the reply is the bare value.
    Read,
    /// Changes a device setting (speed, Wi-Fi, mission pads).
    Set,
}

/// Why the session entered [`SessionState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A socket failed on one of the channels.
    Transport,
    /// The mandatory `command` handshake was rejected or timed out.
    HandshakeFailed,
    /// Telemetry went stale for longer than the configured threshold.
    LinkLost,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::HandshakeFailed => write!(f, "handshake failed"),
            ErrorKind::LinkLost => write!(f, "link lost"),
        }
    }
}

/// Lifecycle state of a device session.
///
/// `Disconnected -> Connecting -> Connected -> Flying -> Connected -> Disconnected`,
/// with `Error(kind)` reachable from any state. Leaving `Error` requires an
/// explicit `disconnect()` followed by `connect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Flying,
    Error(ErrorKind),
}

impl SessionState {
    /// Whether commands may be submitted in this state.
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Flying)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Flying => write!(f, "flying"),
            SessionState::Error(kind) => write!(f, "error ({kind})"),
        }
    }
}

/// The resolution of one submitted command. Produced exactly once per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The device acknowledged. Empty for `ok`, the raw value for reads.
    Ok(String),
    /// No reply within the retry budget.
    TimedOut,
    /// The device returned an error, or the client refused the command.
    Rejected(String),
    /// The command socket failed while the command was outstanding.
    TransportError(String),
}

impl CommandOutcome {
    pub fn busy() -> Self {
        CommandOutcome::Rejected(REASON_BUSY.into())
    }

    pub fn queue_full() -> Self {
        CommandOutcome::Rejected(REASON_QUEUE_FULL.into())
    }

    pub fn cancelled() -> Self {
        CommandOutcome::Rejected(REASON_CANCELLED.into())
    }

    pub fn invalid_state() -> Self {
        CommandOutcome::Rejected(REASON_INVALID_STATE.into())
    }

    pub fn not_connected() -> Self {
        CommandOutcome::Rejected(REASON_NOT_CONNECTED.into())
    }

    pub fn link_lost() -> Self {
        CommandOutcome::Rejected(REASON_LINK_LOST.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CommandOutcome::Ok(_))
    }

    /// Convert into a `Result`, mapping each failure to its [`Error`] variant.
    pub fn into_result(self) -> Result<String> {
        match self {
            CommandOutcome::Ok(value) => Ok(value),
            CommandOutcome::TimedOut => Err(Error::Timeout),
            CommandOutcome::Rejected(reason) if reason == REASON_LINK_LOST => Err(Error::LinkLost),
            CommandOutcome::Rejected(reason) => Err(Error::Rejected(reason)),
            CommandOutcome::TransportError(reason) => Err(Error::Transport(reason)),
        }
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Ok(value) if value.is_empty() => write!(f, "ok"),
            CommandOutcome::Ok(value) => write!(f, "ok ({value})"),
            CommandOutcome::TimedOut => write!(f, "timed out"),
            CommandOutcome::Rejected(reason) => write!(f, "rejected: {reason}"),
            CommandOutcome::TransportError(reason) => write!(f, "transport error: {reason}"),
        }
    }
}

/// Device SDK generation. Selects the telemetry field schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SdkVersion {
    V1_3,
    V2_0,
}

impl SdkVersion {
    /// Interpret the reply to an `sdk?` query (`"20"` on SDK 2.0 firmware).
    ///
    /// Anything that is not a number of at least 20 is treated as 1.3, which
    /// has no `sdk?` command at all.
    pub fn from_sdk_reply(reply: &str) -> Self {
        match reply.trim().parse::<u32>() {
            Ok(n) if n >= 20 => SdkVersion::V2_0,
            _ => SdkVersion::V1_3,
        }
    }
}

impl fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdkVersion::V1_3 => write!(f, "1.3"),
            SdkVersion::V2_0 => write!(f, "2.0"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_default_is_disconnected() {
        assert_eq!(SessionState::default(), SessionState::Disconnected);
    }

    #[test]
    fn session_state_established() {
        assert!(SessionState::Connected.is_established());
        assert!(SessionState::Flying.is_established());
        assert!(!SessionState::Connecting.is_established());
        assert!(!SessionState::Disconnected.is_established());
        assert!(!SessionState::Error(ErrorKind::LinkLost).is_established());
    }

    #[test]
    fn session_state_display() {
        assert_eq!(SessionState::Flying.to_string(), "flying");
        assert_eq!(
            SessionState::Error(ErrorKind::LinkLost).to_string(),
            "error (link lost)"
        );
    }

    #[test]
    fn outcome_reason_helpers() {
        assert_eq!(CommandOutcome::busy(), CommandOutcome::Rejected("busy".into()));
        assert_eq!(
            CommandOutcome::queue_full(),
            CommandOutcome::Rejected("queue-full".into())
        );
        assert_eq!(
            CommandOutcome::cancelled(),
            CommandOutcome::Rejected("cancelled".into())
        );
        assert_eq!(
            CommandOutcome::invalid_state(),
            CommandOutcome::Rejected("invalid state".into())
        );
    }

    #[test]
    fn outcome_into_result() {
        assert_eq!(CommandOutcome::Ok("87".into()).into_result().unwrap(), "87");
        assert!(matches!(
            CommandOutcome::TimedOut.into_result(),
            Err(Error::Timeout)
        ));
        assert!(matches!(
            CommandOutcome::Rejected("Motor stop".into()).into_result(),
            Err(Error::Rejected(r)) if r == "Motor stop"
        ));
        assert!(matches!(
            CommandOutcome::TransportError("down".into()).into_result(),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn link_lost_refusal_maps_to_link_lost() {
        assert_eq!(
            CommandOutcome::link_lost(),
            CommandOutcome::Rejected("link lost".into())
        );
        assert!(matches!(
            CommandOutcome::link_lost().into_result(),
            Err(Error::LinkLost)
        ));
    }

    #[test]
    fn outcome_display() {
        assert_eq!(CommandOutcome::Ok(String::new()).to_string(), "ok");
        assert_eq!(CommandOutcome::Ok("87".into()).to_string(), "ok (87)");
        assert_eq!(CommandOutcome::TimedOut.to_string(), "timed out");
    }

    #[test]
    fn sdk_version_from_reply() {
        assert_eq!(SdkVersion::from_sdk_reply("20"), SdkVersion::V2_0);
        assert_eq!(SdkVersion::from_sdk_reply(" 30\r\n"), SdkVersion::V2_0);
        assert_eq!(SdkVersion::from_sdk_reply("13"), SdkVersion::V1_3);
        assert_eq!(SdkVersion::from_sdk_reply("unknown command"), SdkVersion::V1_3);
    }
}
