//! Asynchronous session event types.
//!
//! Events are emitted by the device session through a
//! [`tokio::sync::broadcast`] channel: state transitions, link-loss
//! detection, and channel faults arrive on one stream so callers do not
//! have to poll.

use std::time::Duration;

use crate::types::{Channel, SdkVersion, SessionState};

/// An event emitted by the device session.
///
/// Delivered on a best-effort basis through a bounded broadcast channel;
/// slow consumers may miss events (they observe `RecvError::Lagged`).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved between lifecycle states.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },

    /// No telemetry was parsed for longer than the staleness threshold.
    LinkLost {
        /// Time since the last successfully parsed snapshot.
        staleness: Duration,
    },

    /// A socket failed; the affected channel has stopped.
    TransportFault {
        channel: Channel,
        reason: String,
    },

    /// The telemetry schema in use, chosen after the handshake.
    SdkDetected { version: SdkVersion },

    /// The device did not accept `streamon`; video will not flow.
    VideoStreamUnavailable { reason: String },

    /// A command reply arrived with no command outstanding and was discarded.
    UnsolicitedReply { reply: String },

    /// A video access unit was dropped (gap, timeout, or overflow).
    FragmentLoss {
        /// Total access units lost since the pipeline started.
        total: u64,
    },
}
