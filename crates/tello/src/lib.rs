//! # tello -- Asynchronous client for the Tello quadcopter
//!
//! `tello` drives a Tello or Tello EDU over its UDP text SDK. It provides:
//!
//! - **Commands** ([`commands`]) -- typed, range-checked constructors for
//!   every SDK verb, rendered to the ASCII wire grammar.
//! - **Command channel** ([`io`]) -- one IO task owning the command socket:
//!   strict request/ack, per-attempt timeout, identical-byte retries, and a
//!   bounded FIFO queue.
//! - **Telemetry** ([`telemetry`]) -- parses the `key:value;` push into
//!   immutable, sequence-numbered snapshots readable without blocking.
//! - **Video** ([`video`]) -- reassembles fragmented H.264 access units,
//!   decodes them through a pluggable [`VideoDecoder`], and fans frames out
//!   to independent subscribers.
//! - **Session** ([`session`]) -- the device state machine tying the three
//!   channels together, with link-loss detection and keepalives.
//! - **TelloBuilder** ([`builder`]) -- fluent configuration with defaults
//!   for the aircraft's own access point.
//!
//! # Architecture
//!
//! | Crate                | Purpose                                          |
//! |----------------------|--------------------------------------------------|
//! | `tello-core`         | Error, state, outcome, and event types; transport traits |
//! | `tello-transport`    | UDP sockets on the device port plan              |
//! | `tello-test-harness` | Mock transports and a simulated aircraft         |
//! | **`tello`**          | This crate -- protocol and session               |
//!
//! # Example
//!
//! ```no_run
//! use tello::{Command, SessionState, TelloBuilder};
//!
//! # async fn example() -> tello::Result<()> {
//! let session = TelloBuilder::new().build()?;
//! session.connect().await?;
//!
//! session.submit(Command::takeoff()).await.into_result()?;
//! assert_eq!(session.state(), SessionState::Flying);
//! session.submit(Command::forward(50)?).await.into_result()?;
//! session.submit(Command::land()).await.into_result()?;
//!
//! if let Some(snapshot) = session.latest_telemetry() {
//!     println!("battery {}%, height {} cm", snapshot.battery(), snapshot.height());
//! }
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod commands;
pub mod io;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod video;

pub use builder::TelloBuilder;
pub use commands::{Command, FlipDirection, MissionPad, PadDirection, Verb};
pub use io::{CommandCounters, QueuePolicy};
pub use session::TelloSession;
pub use telemetry::{MissionPadState, TelemetryCounters, TelemetrySnapshot, TelemetrySubscription};
pub use video::{
    DecodedImage, DropPolicy, PassthroughDecoder, PixelFormat, VideoCounters, VideoDecoder,
    VideoFrame, VideoFraming, VideoSubscription,
};

pub use tello_core::{
    Channel, CommandKind, CommandOutcome, Connector, DatagramTransport, Error, ErrorKind, Result,
    SdkVersion, SessionEvent, SessionState,
};
