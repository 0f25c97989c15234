//! Datagram transport traits.
//!
//! The [`DatagramTransport`] trait abstracts over one UDP socket bound for a
//! single logical channel (command, telemetry, or video). It has no protocol
//! knowledge: it moves whole datagrams and reports socket failures. Retry
//! policy lives in the channel that uses it.
//!
//! A [`Connector`] opens the transport for each [`Channel`]. The real
//! implementation binds fixed UDP ports (`tello-transport`); tests substitute
//! the in-memory connectors from `tello-test-harness`.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::types::Channel;

/// Asynchronous datagram transport to the device.
///
/// Each `send()` is one datagram. Each successful `receive()` yields exactly
/// one datagram; bytes beyond `buf.len()` are discarded (standard UDP
/// behavior).
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to the device. Fire-and-forget: delivery is not
    /// guaranteed.
    ///
    /// Receive-only channels return
    /// [`Error::InvalidState`](crate::error::Error::InvalidState).
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive one datagram into `buf`, waiting at most `timeout`.
    ///
    /// Returns the datagram length, or [`Error::Timeout`](crate::error::Error::Timeout)
    /// if nothing arrived before the deadline. Never blocks indefinitely.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Release the socket. Idempotent.
    ///
    /// After `close()`, `send()` and `receive()` return
    /// [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Whether the socket is still open.
    fn is_open(&self) -> bool;
}

/// Opens the transport for one of the device's three channels.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Bind (and for the command channel, connect) the socket for `channel`.
    async fn open(&self, channel: Channel) -> Result<Box<dyn DatagramTransport>>;
}
