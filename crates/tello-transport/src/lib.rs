//! UDP transport for the tello client.
//!
//! This crate provides the concrete [`DatagramTransport`](tello_core::DatagramTransport)
//! and [`Connector`](tello_core::Connector) implementations used against a real
//! aircraft:
//!
//! - [`UdpTransport`]: one tokio UDP socket with per-call receive deadlines
//! - [`UdpConnector`]: binds the command, telemetry, and video sockets on
//!   the device's fixed port plan
//!
//! # Example
//!
//! ```no_run
//! use tello_core::{Channel, Connector};
//! use tello_transport::UdpConnector;
//! use std::time::Duration;
//!
//! # async fn example() -> tello_core::Result<()> {
//! let connector = UdpConnector::default();
//! let mut command = connector.open(Channel::Command).await?;
//!
//! command.send(b"command").await?;
//! let mut buf = [0u8; 1024];
//! let n = command.receive(&mut buf, Duration::from_secs(7)).await?;
//! # Ok(())
//! # }
//! ```

pub mod udp;

pub use udp::{
    DEFAULT_COMMAND_PORT, DEFAULT_DEVICE_ADDR, DEFAULT_TELEMETRY_PORT, DEFAULT_VIDEO_PORT,
    UdpConnector, UdpTransport,
};
