//! The device session: lifecycle, state machine, and supervision.
//!
//! [`TelloSession`] composes the command channel, the telemetry channel, and
//! the video pipeline over one [`Connector`]. It owns [`SessionState`]; the
//! channels never change it themselves, they report faults here.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Flying
//!                      \            \           \
//!                       +------------+-----------+--> Error(kind)
//! ```
//!
//! `connect()` opens the command socket and sends the `command` handshake.
//! Only when that succeeds does it detect the SDK version, open telemetry,
//! and enable video. `disconnect()` is safe from any state and always ends in
//! `Disconnected`. Leaving `Error` takes `disconnect()` then `connect()`.
//! With safety landing on, `disconnect()` first lands an airborne aircraft.
//!
//! Flight rules are checked twice: when a command is submitted, and again by
//! the command IO task when it dequeues the command. The second check sees
//! the state left by every command ahead of it, so two queued `takeoff`s
//! cannot both reach the device.
//!
//! While established a supervisor task watches channel faults (to
//! `Error(Transport)`) and telemetry staleness beyond the threshold (to
//! `Error(LinkLost)`). It also sends a `command` keepalive once the command
//! socket has been quiet for the keepalive period, so the aircraft does not
//! auto-land.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tello_core::error::{Error, Result};
use tello_core::events::SessionEvent;
use tello_core::transport::Connector;
use tello_core::types::{Channel, CommandOutcome, ErrorKind, SdkVersion, SessionState};

use crate::commands::{Command, Verb};
use crate::io::{self, CommandChannel, CommandCounters, CommandSender, DispatchHooks, IoConfig};
use crate::telemetry::{
    self, TelemetryChannel, TelemetryCounters, TelemetryHub, TelemetrySnapshot,
    TelemetrySubscription,
};
use crate::video::{self, VideoConfig, VideoCounters, VideoPipeline, VideoSubscription};

/// A channel task reporting that its socket failed.
#[derive(Debug, Clone)]
pub(crate) struct Fault {
    pub(crate) channel: Channel,
    pub(crate) reason: String,
}

/// Everything the session needs besides its connector.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub io: IoConfig,
    /// Telemetry older than this moves the session to `Error(LinkLost)`.
    pub staleness_threshold: Duration,
    /// Fixed telemetry schema; `None` asks the device with `sdk?`.
    pub sdk: Option<SdkVersion>,
    /// Send `streamon` and run the video pipeline.
    pub video_enabled: bool,
    pub video: VideoConfig,
    /// Idle time after which a `command` keepalive is sent.
    pub keepalive: Option<Duration>,
    /// Snapshots buffered per telemetry subscriber.
    pub telemetry_buffer: usize,
    /// Land an airborne aircraft before `disconnect()` closes the sockets.
    pub safety_landing: bool,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the session handle, callbacks, and the supervisor.
struct Shared {
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    /// Set by an acknowledged `takeoff`, cleared by `land` or `emergency`.
    /// Survives a move to `Error`.
    airborne: AtomicBool,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Unconditionally move to `to`.
    fn set_state(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(%from, %to, "session state changed");
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    /// Move to `to` only if the current state satisfies `allowed`.
    fn transition(&self, allowed: impl Fn(SessionState) -> bool, to: SessionState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if allowed(*state) && *state != to {
                from = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        match from {
            Some(from) => {
                info!(%from, %to, "session state changed");
                self.emit(SessionEvent::StateChanged { from, to });
                true
            }
            None => false,
        }
    }

    fn airborne(&self) -> bool {
        self.airborne.load(Ordering::SeqCst)
    }

    /// Refuse commands the current state cannot carry.
    fn check(&self, verb: Verb) -> std::result::Result<(), CommandOutcome> {
        match self.state() {
            SessionState::Disconnected => Err(CommandOutcome::not_connected()),
            SessionState::Error(ErrorKind::LinkLost) => Err(CommandOutcome::link_lost()),
            SessionState::Connecting | SessionState::Error(_) => {
                Err(CommandOutcome::invalid_state())
            }
            SessionState::Flying if verb == Verb::Takeoff => Err(CommandOutcome::invalid_state()),
            SessionState::Connected if verb.requires_flight() => {
                Err(CommandOutcome::invalid_state())
            }
            SessionState::Connected | SessionState::Flying => Ok(()),
        }
    }

    /// Apply the flight transition a successful command implies.
    fn after(&self, verb: Verb, outcome: &CommandOutcome) {
        if !outcome.is_ok() {
            return;
        }
        match verb {
            Verb::Takeoff => {
                self.airborne.store(true, Ordering::SeqCst);
                self.transition(|s| s == SessionState::Connected, SessionState::Flying);
            }
            Verb::Land | Verb::Emergency => {
                self.airborne.store(false, Ordering::SeqCst);
                self.transition(|s| s == SessionState::Flying, SessionState::Connected);
            }
            _ => {}
        }
    }
}

impl DispatchHooks for Shared {
    fn admit(&self, command: &Command) -> std::result::Result<(), CommandOutcome> {
        let verb = command.verb();
        match self.state() {
            // Handshake and setup traffic.
            SessionState::Connecting => Ok(()),
            SessionState::Error(_) if matches!(verb, Verb::Land | Verb::Emergency) => Ok(()),
            _ => self.check(verb),
        }
    }

    fn settled(&self, command: &Command, outcome: &CommandOutcome) {
        self.after(command.verb(), outcome);
    }
}

// ---------------------------------------------------------------------------
// Running channels
// ---------------------------------------------------------------------------

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The channels of one established connection.
struct Running {
    command: CommandChannel,
    telemetry: Option<TelemetryChannel>,
    video: Option<VideoPipeline>,
    supervisor: Option<Supervisor>,
    sdk: SdkVersion,
}

impl Running {
    fn abort(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.cancel.cancel();
        }
        self.command.abort();
        if let Some(telemetry) = &self.telemetry {
            telemetry.abort();
        }
        if let Some(video) = &self.video {
            video.abort();
        }
    }

    async fn shutdown(self) {
        if let Some(supervisor) = self.supervisor {
            supervisor.cancel.cancel();
            let _ = supervisor.task.await;
        }
        self.command.shutdown().await;
        if let Some(telemetry) = self.telemetry {
            telemetry.shutdown().await;
        }
        if let Some(video) = self.video {
            video.shutdown().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A client session with one aircraft.
///
/// Construct with [`TelloBuilder`](crate::builder::TelloBuilder). All methods
/// take `&self`; share the session across tasks with an `Arc`.
pub struct TelloSession {
    connector: Box<dyn Connector>,
    config: SessionConfig,
    shared: Arc<Shared>,
    telemetry: Arc<TelemetryHub>,
    running: Mutex<Option<Running>>,
    /// Serializes `connect()` and `disconnect()`.
    lifecycle: tokio::sync::Mutex<()>,
}

impl TelloSession {
    pub(crate) fn new(connector: Box<dyn Connector>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let telemetry = Arc::new(TelemetryHub::new(config.telemetry_buffer));
        TelloSession {
            connector,
            config,
            shared: Arc::new(Shared {
                state,
                events,
                airborne: AtomicBool::new(false),
            }),
            telemetry,
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    // -- lifecycle ------------------------------------------------------

    /// Open the channels and perform the handshake.
    ///
    /// Returns `Ok` immediately if already connected. From `Error`, call
    /// [`disconnect`](Self::disconnect) first.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.shared.state() {
            SessionState::Disconnected => {}
            state if state.is_established() => return Ok(()),
            state => {
                return Err(Error::InvalidState(format!("cannot connect while {state}")));
            }
        }

        self.shared.airborne.store(false, Ordering::SeqCst);
        self.shared.set_state(SessionState::Connecting);
        match self.establish().await {
            Ok(running) => {
                let sdk = running.sdk;
                self.store(Some(running));
                // A channel may already have failed and moved us to Error.
                if self
                    .shared
                    .transition(|s| s == SessionState::Connecting, SessionState::Connected)
                {
                    info!(%sdk, "session established");
                    Ok(())
                } else {
                    Err(Error::InvalidState(format!(
                        "connection failed while establishing: {}",
                        self.shared.state()
                    )))
                }
            }
            Err((kind, e)) => {
                warn!(error = %e, "connect failed");
                self.shared.set_state(SessionState::Error(kind));
                Err(e)
            }
        }
    }

    async fn establish(&self) -> std::result::Result<Running, (ErrorKind, Error)> {
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let transport = self
            .connector
            .open(Channel::Command)
            .await
            .map_err(|e| (ErrorKind::Transport, e))?;
        let command = io::spawn_command_channel(
            transport,
            self.config.io.clone(),
            Arc::clone(&self.shared) as Arc<dyn DispatchHooks>,
            self.shared.events.clone(),
            fault_tx.clone(),
        );

        let handshake = command.submit(Command::command()).await;
        match handshake {
            CommandOutcome::Ok(_) => debug!("handshake accepted"),
            outcome => {
                command.shutdown().await;
                let kind = match outcome {
                    CommandOutcome::TransportError(_) => ErrorKind::Transport,
                    _ => ErrorKind::HandshakeFailed,
                };
                let error = outcome
                    .into_result()
                    .err()
                    .unwrap_or(Error::Rejected("handshake".into()));
                return Err((kind, error));
            }
        }

        let sdk = match self.config.sdk {
            Some(sdk) => sdk,
            None => detect_sdk(&command).await,
        };
        self.shared.emit(SessionEvent::SdkDetected { version: sdk });

        let mut running = Running {
            command,
            telemetry: None,
            video: None,
            supervisor: None,
            sdk,
        };

        match self.connector.open(Channel::Telemetry).await {
            Ok(transport) => {
                running.telemetry = Some(telemetry::spawn_telemetry_channel(
                    transport,
                    Arc::clone(&self.telemetry),
                    sdk,
                    fault_tx.clone(),
                ));
            }
            Err(e) => {
                running.shutdown().await;
                return Err((ErrorKind::Transport, e));
            }
        }

        if self.config.video_enabled {
            let stream_on = running.command.submit(Command::stream_on()).await;
            match stream_on {
                CommandOutcome::Ok(_) => match self.connector.open(Channel::Video).await {
                    Ok(transport) => {
                        running.video = Some(video::spawn_video_pipeline(
                            transport,
                            &self.config.video,
                            self.shared.events.clone(),
                            fault_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        running.shutdown().await;
                        return Err((ErrorKind::Transport, e));
                    }
                },
                outcome => {
                    warn!(%outcome, "streamon failed, continuing without video");
                    self.shared.emit(SessionEvent::VideoStreamUnavailable {
                        reason: outcome.to_string(),
                    });
                }
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(SupervisorContext {
            shared: Arc::clone(&self.shared),
            telemetry: Arc::clone(&self.telemetry),
            command: running.command.sender(),
            faults: fault_rx,
            staleness_threshold: self.config.staleness_threshold,
            keepalive: self.config.keepalive,
            connected_at: Instant::now(),
            cancel: cancel.clone(),
        }));
        running.supervisor = Some(Supervisor { cancel, task });

        Ok(running)
    }

    /// Stop every channel, close the sockets, and return to `Disconnected`.
    ///
    /// With safety landing on and the aircraft airborne (`Flying`, or an
    /// `Error` reached while flying), a `land` goes out first. It waits
    /// behind anything already queued and is bounded by the retry budget.
    ///
    /// Outstanding commands resolve `Rejected("cancelled")` and telemetry
    /// and video subscriptions end before this returns. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(running) = self.take() {
            if self.config.safety_landing && self.shared.airborne() {
                warn!(state = %self.shared.state(), "disconnecting while airborne, landing first");
                let landing = running.command.submit(Command::land()).await;
                if !landing.is_ok() {
                    warn!(outcome = %landing, "safety landing not acknowledged");
                }
            }
            running.shutdown().await;
            debug!("session channels stopped");
        }
        self.telemetry.close_subscribers();
        self.shared.set_state(SessionState::Disconnected);
        Ok(())
    }

    fn store(&self, running: Option<Running>) {
        if let Ok(mut slot) = self.running.lock() {
            *slot = running;
        }
    }

    fn take(&self) -> Option<Running> {
        self.running.lock().ok().and_then(|mut slot| slot.take())
    }

    fn sender(&self) -> Option<CommandSender> {
        self.running
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|r| r.command.sender()))
    }

    // -- commands -------------------------------------------------------

    /// Submit a command and wait for its outcome.
    ///
    /// Commands the current state cannot carry (`takeoff` while flying,
    /// motion while on the ground, anything while not connected) are refused
    /// without contacting the device. A successful `takeoff` moves the
    /// session to `Flying`; a successful `land` or `emergency` back to
    /// `Connected`. After `Error(LinkLost)` everything is refused with
    /// `Rejected("link lost")`.
    pub async fn submit(&self, command: Command) -> CommandOutcome {
        if let Err(refused) = self.shared.check(command.verb()) {
            debug!(command = %command, outcome = %refused, "command refused by session");
            return refused;
        }
        let Some(sender) = self.sender() else {
            return CommandOutcome::not_connected();
        };

        sender.submit(command).await
    }

    /// Submit a command and return immediately. `handler` runs exactly once
    /// with the outcome, and never after [`disconnect`](Self::disconnect)
    /// has returned.
    pub fn submit_with<F>(&self, command: Command, handler: F)
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        if let Err(refused) = self.shared.check(command.verb()) {
            handler(refused);
            return;
        }
        let Some(sender) = self.sender() else {
            handler(CommandOutcome::not_connected());
            return;
        };

        sender.submit_with(command, handler);
    }

    // -- observation ----------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// A receiver that tracks the session state.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// State changes, link loss, and channel faults.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// The telemetry schema of the current connection.
    pub fn sdk_version(&self) -> Option<SdkVersion> {
        self.running
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|r| r.sdk))
    }

    /// The most recent telemetry snapshot. Never blocks.
    pub fn latest_telemetry(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.telemetry.latest()
    }

    /// Time since the latest telemetry snapshot arrived. Never blocks.
    pub fn staleness(&self) -> Option<Duration> {
        self.telemetry.staleness()
    }

    pub fn subscribe_telemetry(&self) -> TelemetrySubscription {
        self.telemetry.subscribe()
    }

    /// Subscribe to decoded video frames of the current connection.
    pub fn subscribe_video(&self) -> Result<VideoSubscription> {
        let slot = self
            .running
            .lock()
            .map_err(|_| Error::InvalidState("session lock poisoned".into()))?;
        let running = slot.as_ref().ok_or(Error::NotConnected)?;
        running
            .video
            .as_ref()
            .map(VideoPipeline::subscribe)
            .ok_or_else(|| Error::InvalidState("video stream is not running".into()))
    }

    pub fn command_counters(&self) -> Option<CommandCounters> {
        self.sender().map(|s| s.stats())
    }

    pub fn telemetry_counters(&self) -> TelemetryCounters {
        self.telemetry.counters()
    }

    pub fn video_counters(&self) -> Option<VideoCounters> {
        self.running
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|r| r.video.as_ref().map(|v| v.counters())))
    }
}

impl Drop for TelloSession {
    fn drop(&mut self) {
        if let Some(running) = self.take() {
            running.abort();
        }
    }
}

async fn detect_sdk(command: &CommandChannel) -> SdkVersion {
    match command.submit(Command::read_sdk()).await {
        CommandOutcome::Ok(reply) => {
            let sdk = SdkVersion::from_sdk_reply(&reply);
            debug!(reply = %reply, %sdk, "sdk version detected");
            sdk
        }
        outcome => {
            debug!(%outcome, "sdk? not answered, assuming 1.3");
            SdkVersion::V1_3
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct SupervisorContext {
    shared: Arc<Shared>,
    telemetry: Arc<TelemetryHub>,
    command: CommandSender,
    faults: mpsc::UnboundedReceiver<Fault>,
    staleness_threshold: Duration,
    keepalive: Option<Duration>,
    connected_at: Instant,
    cancel: CancellationToken,
}

impl SupervisorContext {
    /// Time since the last snapshot of this connection, or since connecting.
    fn staleness(&self) -> Duration {
        let since = self
            .telemetry
            .latest()
            .map(|s| s.received_at().max(self.connected_at))
            .unwrap_or(self.connected_at);
        since.elapsed()
    }

    fn fault(&self, fault: Fault) {
        self.shared.emit(SessionEvent::TransportFault {
            channel: fault.channel,
            reason: fault.reason.clone(),
        });
        if self.shared.transition(
            |s| s.is_established() || s == SessionState::Connecting,
            SessionState::Error(ErrorKind::Transport),
        ) {
            warn!(channel = %fault.channel, reason = %fault.reason, "channel failed");
        }
    }

    fn check_link(&self) {
        let staleness = self.staleness();
        if staleness <= self.staleness_threshold {
            return;
        }
        if self.shared.transition(
            |s| s.is_established(),
            SessionState::Error(ErrorKind::LinkLost),
        ) {
            warn!(?staleness, "telemetry stale, link lost");
            self.shared.emit(SessionEvent::LinkLost { staleness });
        }
    }

    fn send_keepalive(&self, quiet: Duration) {
        if !self.shared.state().is_established() || !self.command.is_idle_for(quiet) {
            return;
        }
        debug!("sending keepalive");
        self.command.submit_with(Command::command(), |outcome| {
            if !outcome.is_ok() {
                debug!(%outcome, "keepalive not acknowledged");
            }
        });
    }
}

/// Earliest re-check of a keepalive that came due while the channel was busy.
const KEEPALIVE_RECHECK: Duration = Duration::from_millis(100);

async fn supervise(mut ctx: SupervisorContext) {
    let check_period = (ctx.staleness_threshold / 4).max(Duration::from_millis(10));
    let mut link_check = tokio::time::interval_at(Instant::now() + check_period, check_period);
    link_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // Re-armed from the latest send on every pass.
        let keepalive_due = ctx.keepalive.map(|period| {
            let now = Instant::now();
            let due = ctx.command.last_activity() + period;
            (period, if due > now { due } else { now + KEEPALIVE_RECHECK })
        });

        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => break,

            Some(fault) = ctx.faults.recv() => ctx.fault(fault),

            _ = link_check.tick() => ctx.check_link(),

            quiet = async move {
                match keepalive_due {
                    Some((period, due)) => {
                        tokio::time::sleep_until(due).await;
                        period
                    }
                    None => std::future::pending().await,
                }
            } => ctx.send_keepalive(quiet),
        }
    }
    debug!("session supervisor exited");
}
