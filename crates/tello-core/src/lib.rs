//! tello-core: Core traits, types, and error definitions for the tello
//! protocol client.
//!
//! This crate defines the abstractions shared by the transport, the test
//! harness, and the protocol client itself. Applications normally use it
//! through the re-exports in the `tello` crate.
//!
//! # Key types
//!
//! - [`DatagramTransport`] / [`Connector`] -- byte-level UDP channel and its opener
//! - [`SessionState`] / [`CommandOutcome`] -- the session and command result model
//! - [`SessionEvent`] -- asynchronous session notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use events::SessionEvent;
pub use transport::{Connector, DatagramTransport};
pub use types::*;
