//! A scripted stand-in for the aircraft.
//!
//! [`SimulatedDrone`] consumes the device ends published by a
//! [`MockConnector`] and plays the device's part on each channel:
//!
//! - **command**: records every command and answers from a per-verb script
//!   (`ok` unless told otherwise; reads get plausible values)
//! - **telemetry**: pushes a state line at a fixed interval
//! - **video**: forwards whatever the test injects with
//!   [`push_video`](SimulatedDrone::push_video)
//!
//! A reconnect opens fresh links; the drone picks them up transparently.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use tello_core::types::Channel;

use crate::mock_link::{LinkBreaker, MockConnector, MockPeer};

/// A complete SDK 1.3 state line: battery 87 %, on the ground.
pub const SAMPLE_TELEMETRY: &str = "pitch:0;roll:0;yaw:0;vgx:0;vgy:0;vgz:0;templ:60;temph:62;\
tof:10;h:0;bat:87;baro:0.1;time:0;agx:0.0;agy:0.0;agz:0.0;\r\n";

const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How the drone answers one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DroneReply {
    /// `ok`
    Ok,
    /// A bare value, as for read commands.
    Value(String),
    /// `error <reason>`, or the reason verbatim if it already starts with
    /// `error`/`unknown`/`out of range`.
    Error(String),
    /// Swallow the command.
    Silent,
}

impl DroneReply {
    fn payload(&self) -> Option<String> {
        match self {
            DroneReply::Ok => Some("ok".into()),
            DroneReply::Value(value) => Some(value.clone()),
            DroneReply::Error(reason) => {
                let lower = reason.to_ascii_lowercase();
                if lower.starts_with("error")
                    || lower.starts_with("unknown")
                    || lower.starts_with("out of range")
                {
                    Some(reason.clone())
                } else {
                    Some(format!("error {reason}"))
                }
            }
            DroneReply::Silent => None,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    fixed: HashMap<String, DroneReply>,
    queued: HashMap<String, VecDeque<DroneReply>>,
}

impl Script {
    fn reply_for(&mut self, verb: &str) -> DroneReply {
        if let Some(next) = self.queued.get_mut(verb).and_then(VecDeque::pop_front) {
            return next;
        }
        if let Some(fixed) = self.fixed.get(verb) {
            return fixed.clone();
        }
        default_reply(verb)
    }
}

fn default_reply(verb: &str) -> DroneReply {
    match verb {
        "battery?" => DroneReply::Value("87".into()),
        "sdk?" => DroneReply::Value("20".into()),
        "speed?" => DroneReply::Value("100.0".into()),
        "time?" => DroneReply::Value("0s".into()),
        "wifi?" => DroneReply::Value("90".into()),
        "sn?" => DroneReply::Value("0TQDG2KEDB4QJ7".into()),
        _ => DroneReply::Ok,
    }
}

#[derive(Debug)]
struct Shared {
    script: Mutex<Script>,
    reply_delay: Mutex<Duration>,
    commands: Mutex<Vec<String>>,
    command_count: watch::Sender<usize>,
    telemetry: Mutex<Option<String>>,
    telemetry_interval: Mutex<Duration>,
    telemetry_peer: Mutex<Option<MockPeer>>,
    telemetry_generation: AtomicU64,
    video_peer: Mutex<Option<MockPeer>>,
    breakers: Mutex<HashMap<Channel, LinkBreaker>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A simulated aircraft driven by a [`MockConnector`].
///
/// Background tasks are aborted when the drone is dropped.
#[derive(Debug)]
pub struct SimulatedDrone {
    shared: Arc<Shared>,
}

impl SimulatedDrone {
    /// Create a connector and a drone serving every channel it opens.
    pub fn with_connector() -> (MockConnector, SimulatedDrone) {
        let (connector, peers) = MockConnector::new();
        (connector, SimulatedDrone::spawn(peers))
    }

    /// Serve the device ends arriving on `peers`.
    pub fn spawn(mut peers: mpsc::UnboundedReceiver<MockPeer>) -> SimulatedDrone {
        let (command_count, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            script: Mutex::new(Script::default()),
            reply_delay: Mutex::new(Duration::ZERO),
            commands: Mutex::new(Vec::new()),
            command_count,
            telemetry: Mutex::new(Some(SAMPLE_TELEMETRY.to_string())),
            telemetry_interval: Mutex::new(DEFAULT_TELEMETRY_INTERVAL),
            telemetry_peer: Mutex::new(None),
            telemetry_generation: AtomicU64::new(0),
            video_peer: Mutex::new(None),
            breakers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept = tokio::spawn(async move {
            while let Some(peer) = peers.recv().await {
                accept_shared.attach(peer);
            }
        });
        shared.track(accept);

        SimulatedDrone { shared }
    }

    /// Answer every future `verb` command with `reply`.
    pub fn set_reply(&self, verb: &str, reply: DroneReply) {
        if let Ok(mut script) = self.shared.script.lock() {
            script.fixed.insert(verb.to_string(), reply);
        }
    }

    /// Answer the next `verb` commands with `replies`, in order, before
    /// falling back to the fixed or default reply.
    pub fn queue_replies(&self, verb: &str, replies: impl IntoIterator<Item = DroneReply>) {
        if let Ok(mut script) = self.shared.script.lock() {
            script
                .queued
                .entry(verb.to_string())
                .or_default()
                .extend(replies);
        }
    }

    /// Delay every command reply by `delay`.
    pub fn set_reply_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.shared.reply_delay.lock() {
            *d = delay;
        }
    }

    /// Every command received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.shared
            .commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Number of times `command` (the full text) was received.
    pub fn count_of(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    /// Wait until at least `n` commands have been received.
    pub async fn wait_for_commands(&self, n: usize) {
        let mut rx = self.shared.command_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Replace the periodic telemetry line; `None` stops telemetry.
    pub fn set_telemetry(&self, line: Option<&str>) {
        if let Ok(mut t) = self.shared.telemetry.lock() {
            *t = line.map(str::to_string);
        }
    }

    /// Change the telemetry push interval for links opened afterwards.
    pub fn set_telemetry_interval(&self, interval: Duration) {
        if let Ok(mut i) = self.shared.telemetry_interval.lock() {
            *i = interval;
        }
    }

    /// Push one telemetry datagram now. `false` if no telemetry link is open.
    pub fn push_telemetry(&self, raw: &[u8]) -> bool {
        push_on(&self.shared.telemetry_peer, raw)
    }

    /// Push one video datagram. `false` if no video link is open.
    pub fn push_video(&self, datagram: &[u8]) -> bool {
        push_on(&self.shared.video_peer, datagram)
    }

    /// Break the client's socket for `channel`.
    pub fn fail(&self, channel: Channel) {
        if let Ok(breakers) = self.shared.breakers.lock() {
            if let Some(breaker) = breakers.get(&channel) {
                breaker.fail();
            }
        }
    }
}

impl Drop for SimulatedDrone {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.shared.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn push_on(slot: &Mutex<Option<MockPeer>>, data: &[u8]) -> bool {
    slot.lock()
        .ok()
        .and_then(|peer| peer.as_ref().map(|p| p.push(data)))
        .unwrap_or(false)
}

impl Shared {
    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    fn attach(self: &Arc<Self>, peer: MockPeer) {
        let channel = peer.channel();
        if let Ok(mut breakers) = self.breakers.lock() {
            breakers.insert(channel, peer.breaker());
        }
        tracing::debug!(channel = %channel, "Simulated drone attached");

        match channel {
            Channel::Command => {
                let shared = Arc::clone(self);
                self.track(tokio::spawn(shared.serve_commands(peer)));
            }
            Channel::Telemetry => {
                if let Ok(mut slot) = self.telemetry_peer.lock() {
                    *slot = Some(peer);
                }
                let generation = self.telemetry_generation.fetch_add(1, Ordering::SeqCst) + 1;
                let interval = self
                    .telemetry_interval
                    .lock()
                    .map(|i| *i)
                    .unwrap_or(DEFAULT_TELEMETRY_INTERVAL);
                let shared = Arc::clone(self);
                self.track(tokio::spawn(shared.push_telemetry_loop(generation, interval)));
            }
            Channel::Video => {
                if let Ok(mut slot) = self.video_peer.lock() {
                    *slot = Some(peer);
                }
            }
        }
    }

    async fn serve_commands(self: Arc<Self>, mut peer: MockPeer) {
        while let Some(datagram) = peer.recv().await {
            let text = String::from_utf8_lossy(&datagram).trim().to_string();
            let verb = text.split_whitespace().next().unwrap_or("").to_string();

            if let Ok(mut commands) = self.commands.lock() {
                commands.push(text.clone());
                self.command_count.send_replace(commands.len());
            }

            let reply = self
                .script
                .lock()
                .map(|mut s| s.reply_for(&verb))
                .unwrap_or(DroneReply::Ok);
            let delay = self.reply_delay.lock().map(|d| *d).unwrap_or_default();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if let Some(payload) = reply.payload() {
                tracing::trace!(command = %text, reply = %payload, "Simulated drone reply");
                peer.push(payload.as_bytes());
            }
        }
    }

    async fn push_telemetry_loop(self: Arc<Self>, generation: u64, interval: Duration) {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            // A newer link took over.
            if self.telemetry_generation.load(Ordering::SeqCst) != generation {
                break;
            }
            let line = self.telemetry.lock().ok().and_then(|t| t.clone());
            if let Some(line) = line {
                if !push_on(&self.telemetry_peer, line.as_bytes()) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tello_core::transport::Connector;

    #[tokio::test]
    async fn answers_commands_from_script() {
        let (connector, drone) = SimulatedDrone::with_connector();
        drone.set_reply("takeoff", DroneReply::Error("Motor stop".into()));

        let mut link = connector.open(Channel::Command).await.unwrap();
        let mut buf = [0u8; 64];

        link.send(b"command").await.unwrap();
        let n = link.receive(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], b"ok");

        link.send(b"battery?").await.unwrap();
        let n = link.receive(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], b"87");

        link.send(b"takeoff").await.unwrap();
        let n = link.receive(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], b"error Motor stop");

        assert_eq!(drone.commands(), vec!["command", "battery?", "takeoff"]);
    }

    #[tokio::test]
    async fn queued_replies_come_first() {
        let (connector, drone) = SimulatedDrone::with_connector();
        drone.queue_replies("command", [DroneReply::Value("busy".into())]);

        let mut link = connector.open(Channel::Command).await.unwrap();
        let mut buf = [0u8; 64];
        for expected in [&b"busy"[..], &b"ok"[..]] {
            link.send(b"command").await.unwrap();
            let n = link.receive(&mut buf, Duration::from_secs(1)).await.unwrap();
            assert_eq!(&buf[..n], expected);
        }
        drone.wait_for_commands(2).await;
        assert_eq!(drone.count_of("command"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_telemetry_periodically() {
        let (connector, _drone) = SimulatedDrone::with_connector();
        let mut link = connector.open(Channel::Telemetry).await.unwrap();

        let mut buf = [0u8; 512];
        let n = link.receive(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], SAMPLE_TELEMETRY.as_bytes());
    }

    #[tokio::test]
    async fn forwards_injected_video() {
        let (connector, drone) = SimulatedDrone::with_connector();
        let mut link = connector.open(Channel::Video).await.unwrap();
        // Attach happens on the drone's task.
        while !drone.push_video(&[0, 0, 0, 1, 0x65]) {
            tokio::task::yield_now().await;
        }

        let mut buf = [0u8; 64];
        let n = link.receive(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], &[0, 0, 0, 1, 0x65]);
    }
}
