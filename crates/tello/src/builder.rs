//! TelloBuilder -- fluent builder for constructing [`TelloSession`] instances.
//!
//! Separates configuration from construction so that callers can set up
//! addresses, timing, and video behavior before the session opens any
//! socket. Nothing touches the network until [`TelloSession::connect`].
//!
//! # Example
//!
//! ```no_run
//! use tello::{Command, TelloBuilder};
//! use std::time::Duration;
//!
//! # async fn example() -> tello::Result<()> {
//! let session = TelloBuilder::new()
//!     .command_timeout(Duration::from_secs(5))
//!     .video(false)
//!     .build()?;
//!
//! session.connect().await?;
//! let battery = session.submit(Command::read_battery()).await.into_result()?;
//! println!("battery {battery}%");
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tello_core::error::{Error, Result};
use tello_core::transport::Connector;
use tello_core::types::SdkVersion;
use tello_transport::UdpConnector;

use crate::io::{IoConfig, QueuePolicy};
use crate::session::{SessionConfig, TelloSession};
use crate::video::{DropPolicy, VideoConfig, VideoDecoder, VideoFraming};

/// Default per-attempt reply timeout.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(7);

/// Default resends after the first attempt times out.
const DEFAULT_RETRIES: u32 = 2;

/// Default number of commands that may wait behind the one in flight.
const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Default telemetry age that counts as link loss.
const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(3);

/// Default command-channel idle time before a keepalive. The aircraft lands
/// on its own after 15 s without a command.
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

/// Default snapshots buffered per telemetry subscriber.
const DEFAULT_TELEMETRY_BUFFER: usize = 16;

/// Fluent builder for [`TelloSession`].
///
/// All configuration has defaults matching the aircraft's own access point,
/// so the simplest usage is:
///
/// ```ignore
/// let session = TelloBuilder::new().build()?;
/// session.connect().await?;
/// ```
pub struct TelloBuilder {
    connector: UdpConnector,
    io: IoConfig,
    staleness_threshold: Duration,
    sdk: Option<SdkVersion>,
    video_enabled: bool,
    video: VideoConfig,
    keepalive: Option<Duration>,
    telemetry_buffer: usize,
    safety: bool,
}

impl TelloBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        TelloBuilder {
            connector: UdpConnector::default(),
            io: IoConfig {
                command_timeout: DEFAULT_COMMAND_TIMEOUT,
                retries: DEFAULT_RETRIES,
                queue_depth: DEFAULT_QUEUE_DEPTH,
                policy: QueuePolicy::default(),
            },
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
            sdk: None,
            video_enabled: true,
            video: VideoConfig::default(),
            keepalive: Some(DEFAULT_KEEPALIVE),
            telemetry_buffer: DEFAULT_TELEMETRY_BUFFER,
            safety: true,
        }
    }

    /// Set the aircraft's address (default: 192.168.10.1).
    pub fn device_addr(mut self, addr: IpAddr) -> Self {
        self.connector.device_addr = addr;
        self
    }

    /// Set the local interface to bind on (default: all interfaces).
    pub fn local_addr(mut self, addr: IpAddr) -> Self {
        self.connector.local_addr = addr;
        self
    }

    /// Set the local and device command ports (default: 8889 / 8889).
    pub fn command_ports(mut self, local: u16, device: u16) -> Self {
        self.connector.command_port = local;
        self.connector.device_command_port = device;
        self
    }

    /// Set the local telemetry port (default: 8890).
    pub fn telemetry_port(mut self, port: u16) -> Self {
        self.connector.telemetry_port = port;
        self
    }

    /// Set the local video port (default: 11111).
    pub fn video_port(mut self, port: u16) -> Self {
        self.connector.video_port = port;
        self
    }

    /// Set the per-attempt reply timeout (default: 7s).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.io.command_timeout = timeout;
        self
    }

    /// Set how many times a timed-out command is resent (default: 2).
    pub fn retries(mut self, retries: u32) -> Self {
        self.io.retries = retries;
        self
    }

    /// Set how many commands may queue behind the one in flight (default: 16).
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.io.queue_depth = depth;
        self
    }

    /// Set what happens to a submission while a command is outstanding
    /// (default: [`QueuePolicy::Fifo`]).
    pub fn queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.io.policy = policy;
        self
    }

    /// Set the telemetry age that moves the session to `Error(LinkLost)`
    /// (default: 3s).
    pub fn staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    /// Fix the telemetry schema instead of asking the device with `sdk?`.
    pub fn sdk_version(mut self, sdk: SdkVersion) -> Self {
        self.sdk = Some(sdk);
        self
    }

    /// Enable or disable `streamon` and the video pipeline (default: true).
    pub fn video(mut self, enable: bool) -> Self {
        self.video_enabled = enable;
        self
    }

    /// Set how video datagrams delimit access units.
    pub fn video_framing(mut self, framing: VideoFraming) -> Self {
        self.video.framing = framing;
        self
    }

    /// Set the frames buffered per video subscriber (default: 8).
    pub fn video_buffer(mut self, frames: usize) -> Self {
        self.video.subscriber_buffer = frames;
        self
    }

    /// Set the slow-subscriber policy (default: [`DropPolicy::DropOldest`]).
    pub fn video_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.video.drop_policy = policy;
        self
    }

    /// Set how long an incomplete access unit may wait for its remaining
    /// fragments (default: 500ms).
    pub fn assembly_timeout(mut self, timeout: Duration) -> Self {
        self.video.assembly_timeout = timeout;
        self
    }

    /// Plug in a decoder. `factory` runs once per connection.
    pub fn video_decoder<F, D>(mut self, factory: F) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: VideoDecoder,
    {
        self.video.decoder = Arc::new(move || Box::new(factory()) as Box<dyn VideoDecoder>);
        self
    }

    /// Set the command-channel idle time before a `command` keepalive is
    /// sent; `None` disables keepalives (default: 10s).
    pub fn keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive = interval;
        self
    }

    /// Land the aircraft on `disconnect()` if it is still airborne
    /// (default: true).
    pub fn safety(mut self, enabled: bool) -> Self {
        self.safety = enabled;
        self
    }

    /// Set the snapshots buffered per telemetry subscriber (default: 16).
    pub fn telemetry_buffer(mut self, snapshots: usize) -> Self {
        self.telemetry_buffer = snapshots;
        self
    }

    /// Build a session over UDP sockets on the configured port plan.
    pub fn build(self) -> Result<TelloSession> {
        let connector = Box::new(self.connector.clone());
        self.build_with_connector(connector)
    }

    /// Build a session that opens its channels through `connector`.
    ///
    /// This is the primary entry point for testing: pass a connector backed
    /// by mock transports or a simulated aircraft.
    pub fn build_with_connector(self, connector: Box<dyn Connector>) -> Result<TelloSession> {
        let config = self.validate()?;
        Ok(TelloSession::new(connector, config))
    }

    fn validate(self) -> Result<SessionConfig> {
        if self.io.command_timeout.is_zero() {
            return Err(Error::InvalidParameter("command timeout must be nonzero".into()));
        }
        if self.io.queue_depth == 0 {
            return Err(Error::InvalidParameter("queue depth must be at least 1".into()));
        }
        if self.staleness_threshold.is_zero() {
            return Err(Error::InvalidParameter(
                "staleness threshold must be nonzero".into(),
            ));
        }
        if self.video.subscriber_buffer == 0 || self.telemetry_buffer == 0 {
            return Err(Error::InvalidParameter(
                "subscriber buffers must hold at least one item".into(),
            ));
        }
        if self.video.assembly_timeout.is_zero() {
            return Err(Error::InvalidParameter("assembly timeout must be nonzero".into()));
        }
        if self.keepalive.is_some_and(|k| k.is_zero()) {
            return Err(Error::InvalidParameter(
                "keepalive interval must be nonzero; use None to disable".into(),
            ));
        }

        Ok(SessionConfig {
            io: self.io,
            staleness_threshold: self.staleness_threshold,
            sdk: self.sdk,
            video_enabled: self.video_enabled,
            video: self.video,
            keepalive: self.keepalive,
            telemetry_buffer: self.telemetry_buffer,
            safety_landing: self.safety,
        })
    }
}

impl Default for TelloBuilder {
    fn default() -> Self {
        Self::new()
    }
}
