//! tello-test-harness: mock transports and a simulated aircraft for testing
//! the tello client without hardware.
//!
//! - [`MockTransport`] -- scripted request/reply datagrams for unit-testing
//!   the command channel
//! - [`mock_link`] -- in-memory datagram pairs and a [`MockConnector`] that
//!   hands the device side of every opened channel to the test
//! - [`SimulatedDrone`] -- a scripted device that answers commands, pushes
//!   telemetry, and lets tests inject video fragments

pub mod drone;
pub mod mock_link;
pub mod mock_transport;

pub use drone::{DroneReply, SimulatedDrone, SAMPLE_TELEMETRY};
pub use mock_link::{LinkBreaker, MockConnector, MockDatagramTransport, MockPeer, mock_pair};
pub use mock_transport::{MockTransport, SentLog};
