//! Reply decoding for the text command channel.
//!
//! The device answers every command with one datagram:
//!
//! - `ok` on success
//! - `error`, `error <reason>`, `error: <reason>`, `unknown command: ...` or
//!   `out of range` on rejection
//! - a bare value (`87`, `100.0`, `20`) for read queries
//!
//! Matching is case-insensitive. Some firmware appends stray non-UTF-8 bytes
//! or NULs to replies, so decoding is lossy and trims both.

use tello_core::{CommandKind, CommandOutcome};

/// One decoded command-channel reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `ok`.
    Ok,
    /// A rejection, with the device's reason.
    Error(String),
    /// Anything else: the trimmed raw value.
    Value(String),
}

fn is_padding(c: char) -> bool {
    c.is_whitespace() || c == '\0' || c == char::REPLACEMENT_CHARACTER
}

/// Decode one reply datagram.
pub fn decode_reply(datagram: &[u8]) -> Reply {
    let text = String::from_utf8_lossy(datagram);
    let text = text.trim_matches(is_padding);
    let lower = text.to_ascii_lowercase();

    if lower == "ok" {
        return Reply::Ok;
    }

    if let Some(rest) = lower.strip_prefix("error") {
        // Preserve the device's casing for the reason.
        let reason = text[text.len() - rest.len()..]
            .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
            .trim_end();
        return if reason.is_empty() {
            Reply::Error("error".into())
        } else {
            Reply::Error(reason.to_string())
        };
    }

    if lower.starts_with("unknown command") || lower.starts_with("out of range") {
        return Reply::Error(text.to_string());
    }

    Reply::Value(text.to_string())
}

/// Resolve a decoded reply into the outcome for a command of `kind`.
///
/// A bare value only answers a read; for control and set commands anything
/// other than `ok` is a rejection.
pub fn outcome_for(kind: CommandKind, reply: Reply) -> CommandOutcome {
    match reply {
        Reply::Ok => CommandOutcome::Ok(String::new()),
        Reply::Error(reason) => CommandOutcome::Rejected(reason),
        Reply::Value(value) if value.is_empty() => CommandOutcome::Rejected("empty reply".into()),
        Reply::Value(value) => match kind {
            CommandKind::Read => CommandOutcome::Ok(value),
            CommandKind::Control | CommandKind::Set => CommandOutcome::Rejected(value),
        },
    }
}

/// Render a datagram for logs.
pub(crate) fn printable(datagram: &[u8]) -> String {
    String::from_utf8_lossy(datagram)
        .trim_matches(is_padding)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ok_any_case() {
        assert_eq!(decode_reply(b"ok"), Reply::Ok);
        assert_eq!(decode_reply(b"OK\r\n"), Reply::Ok);
        assert_eq!(decode_reply(b"ok\0\0"), Reply::Ok);
    }

    #[test]
    fn decode_error_forms() {
        assert_eq!(decode_reply(b"error"), Reply::Error("error".into()));
        assert_eq!(
            decode_reply(b"error Motor stop"),
            Reply::Error("Motor stop".into())
        );
        assert_eq!(
            decode_reply(b"error: No valid imu"),
            Reply::Error("No valid imu".into())
        );
        assert_eq!(
            decode_reply(b"unknown command: foo"),
            Reply::Error("unknown command: foo".into())
        );
        assert_eq!(
            decode_reply(b"out of range"),
            Reply::Error("out of range".into())
        );
    }

    #[test]
    fn decode_value() {
        assert_eq!(decode_reply(b"87\r\n"), Reply::Value("87".into()));
        assert_eq!(decode_reply(b"100.0"), Reply::Value("100.0".into()));
    }

    #[test]
    fn decode_tolerates_trailing_garbage() {
        assert_eq!(decode_reply(b"ok\xcc\xcc"), Reply::Ok);
        assert_eq!(decode_reply(b"87\xff"), Reply::Value("87".into()));
    }

    #[test]
    fn outcome_for_read_value() {
        assert_eq!(
            outcome_for(CommandKind::Read, Reply::Value("87".into())),
            CommandOutcome::Ok("87".into())
        );
    }

    #[test]
    fn outcome_for_control_ok_and_error() {
        assert_eq!(
            outcome_for(CommandKind::Control, Reply::Ok),
            CommandOutcome::Ok(String::new())
        );
        assert_eq!(
            outcome_for(CommandKind::Control, Reply::Error("Motor stop".into())),
            CommandOutcome::Rejected("Motor stop".into())
        );
    }

    #[test]
    fn outcome_for_control_unexpected_value_is_rejection() {
        assert_eq!(
            outcome_for(CommandKind::Set, Reply::Value("busy".into())),
            CommandOutcome::Rejected("busy".into())
        );
    }

    #[test]
    fn outcome_for_empty_reply() {
        assert_eq!(
            outcome_for(CommandKind::Read, Reply::Value(String::new())),
            CommandOutcome::Rejected("empty reply".into())
        );
    }
}
