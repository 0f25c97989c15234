//! Telemetry: parsing pushed state lines into immutable snapshots.
//!
//! Once the handshake succeeds the device pushes one ASCII datagram to the
//! telemetry port roughly every 100 ms:
//!
//! ```text
//! pitch:0;roll:0;yaw:0;vgx:0;vgy:0;vgz:0;templ:60;temph:62;tof:10;h:0;bat:87;baro:0.1;time:0;agx:0.0;agy:0.0;agz:0.0;\r\n
//! ```
//!
//! SDK 2.0 firmware prefixes the mission-pad fields
//! `mid:-1;x:0;y:0;z:0;mpry:0,0,0;`.
//!
//! A snapshot is published only when every field its schema requires is
//! present and well-typed. Unknown keys are ignored. A malformed datagram is
//! counted and dropped; it never touches the published snapshot.
//!
//! Snapshots are shared as `Arc<TelemetrySnapshot>`: readers hold a
//! point-in-time value, and the next datagram replaces the `Arc` rather than
//! mutating what they hold.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tello_core::error::{Error, Result};
use tello_core::transport::DatagramTransport;
use tello_core::types::{Channel, SdkVersion};

use crate::session::Fault;

/// Fields every SDK 1.3 state line carries.
const FIELDS_V1_3: &[&str] = &[
    "pitch", "roll", "yaw", "vgx", "vgy", "vgz", "templ", "temph", "tof", "h", "bat", "baro",
    "time", "agx", "agy", "agz",
];

/// Fields SDK 2.0 adds.
const FIELDS_V2_0: &[&str] = &["mid", "x", "y", "z", "mpry"];

/// The required field set for a firmware generation.
pub fn required_fields(sdk: SdkVersion) -> Vec<&'static str> {
    let mut fields = FIELDS_V1_3.to_vec();
    if sdk >= SdkVersion::V2_0 {
        fields.extend_from_slice(FIELDS_V2_0);
    }
    fields
}

// ---------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------

/// Mission pad fix, reported by SDK 2.0 firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MissionPadState {
    /// Detected pad, 1-8; -1 or -2 when none is in view.
    pub id: i32,
    /// Position relative to the pad, in cm.
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Attitude relative to the pad, in degrees.
    pub pitch: i32,
    pub roll: i32,
    pub yaw: i32,
}

impl MissionPadState {
    /// The pad in view, if any.
    pub fn detected(&self) -> Option<u8> {
        u8::try_from(self.id).ok().filter(|id| (1..=8).contains(id))
    }
}

/// One parsed telemetry datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    seq: u64,
    received_at: Instant,
    sdk: SdkVersion,
    /// Attitude, in degrees.
    pub pitch: i32,
    pub roll: i32,
    pub yaw: i32,
    /// Velocity, in dm/s.
    pub vgx: i32,
    pub vgy: i32,
    pub vgz: i32,
    /// Lowest and highest motor-board temperature, °C.
    pub temp_low: i32,
    pub temp_high: i32,
    /// Time-of-flight distance sensor, in cm.
    pub tof: i32,
    /// Height above the takeoff point, in cm.
    pub height: i32,
    /// Battery, percent.
    pub battery: u8,
    /// Barometer altitude, in m.
    pub baro: f32,
    /// Motor-on time, in s.
    pub flight_time: u32,
    /// Acceleration, in 0.001 g.
    pub agx: f32,
    pub agy: f32,
    pub agz: f32,
    /// Present under the SDK 2.0 schema.
    pub mission_pad: Option<MissionPadState>,
    /// Wi-Fi SNR, when the firmware includes a `wifi` field.
    pub signal_strength: Option<i32>,
    raw: HashMap<String, String>,
}

impl TelemetrySnapshot {
    /// Parse one datagram against the `sdk` schema.
    ///
    /// The result carries sequence number 0; the publisher stamps the real
    /// one.
    pub fn parse(raw: &[u8], sdk: SdkVersion) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Error::Parse(format!("telemetry is not UTF-8: {e}")))?;
        let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

        let mut fields = HashMap::new();
        for field in text.split(';').filter(|f| !f.is_empty()) {
            let (key, value) = field
                .split_once(':')
                .ok_or_else(|| Error::Parse(format!("malformed field '{field}'")))?;
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }

        let missing: Vec<&str> = required_fields(sdk)
            .into_iter()
            .filter(|key| !fields.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Parse(format!("missing field {}", missing.join(", "))));
        }

        let schema = Fields(&fields);
        let mission_pad = if sdk >= SdkVersion::V2_0 {
            let (pitch, roll, yaw) = schema.triple("mpry")?;
            Some(MissionPadState {
                id: schema.num("mid")?,
                x: schema.num("x")?,
                y: schema.num("y")?,
                z: schema.num("z")?,
                pitch,
                roll,
                yaw,
            })
        } else {
            None
        };

        Ok(TelemetrySnapshot {
            seq: 0,
            received_at: Instant::now(),
            sdk,
            pitch: schema.num("pitch")?,
            roll: schema.num("roll")?,
            yaw: schema.num("yaw")?,
            vgx: schema.num("vgx")?,
            vgy: schema.num("vgy")?,
            vgz: schema.num("vgz")?,
            temp_low: schema.num("templ")?,
            temp_high: schema.num("temph")?,
            tof: schema.num("tof")?,
            height: schema.num("h")?,
            battery: schema.num("bat")?,
            baro: schema.num("baro")?,
            flight_time: schema.num("time")?,
            agx: schema.num("agx")?,
            agy: schema.num("agy")?,
            agz: schema.num("agz")?,
            mission_pad,
            signal_strength: schema.optional("wifi")?,
            raw: fields,
        })
    }

    fn stamped(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Strictly increasing per published snapshot.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// The schema this snapshot was parsed with.
    pub fn sdk(&self) -> SdkVersion {
        self.sdk
    }

    pub fn battery(&self) -> u8 {
        self.battery
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// Time since this snapshot arrived.
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// The raw text of any field in the datagram, known or not.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.raw.get(name).map(String::as_str)
    }
}

/// Typed lookups over the key/value pairs of one datagram.
struct Fields<'a>(&'a HashMap<String, String>);

impl Fields<'_> {
    fn value(&self, key: &str) -> Result<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::Parse(format!("missing field {key}")))
    }

    fn num<T: FromStr>(&self, key: &str) -> Result<T> {
        let value = self.value(key)?;
        value
            .parse()
            .map_err(|_| Error::Parse(format!("field {key}: invalid value '{value}'")))
    }

    fn optional<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(_) => self.num(key).map(Some),
        }
    }

    fn triple(&self, key: &str) -> Result<(i32, i32, i32)> {
        let value = self.value(key)?;
        let parts: Vec<i32> = value
            .split(',')
            .map(|p| p.trim().parse())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::Parse(format!("field {key}: invalid value '{value}'")))?;
        match parts.as_slice() {
            [a, b, c] => Ok((*a, *b, *c)),
            _ => Err(Error::Parse(format!(
                "field {key}: expected three values, got '{value}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------

/// Telemetry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryCounters {
    pub received: u64,
    pub published: u64,
    pub parse_errors: u64,
}

/// Holds the latest snapshot and fans new ones out to subscribers.
///
/// Lives as long as the session, so sequence numbers keep increasing across
/// reconnects. Subscriptions end at each disconnect.
#[derive(Debug)]
pub struct TelemetryHub {
    latest: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
    updates: Mutex<broadcast::Sender<Arc<TelemetrySnapshot>>>,
    subscriber_buffer: usize,
    seq: AtomicU64,
    received: AtomicU64,
    parse_errors: AtomicU64,
}

impl TelemetryHub {
    pub fn new(subscriber_buffer: usize) -> Self {
        let (latest, _) = watch::channel(None);
        let subscriber_buffer = subscriber_buffer.max(1);
        let (updates, _) = broadcast::channel(subscriber_buffer);
        TelemetryHub {
            latest,
            updates: Mutex::new(updates),
            subscriber_buffer,
            seq: AtomicU64::new(0),
            received: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        }
    }

    /// Parse and, on success, publish one datagram.
    pub fn ingest(&self, raw: &[u8], sdk: SdkVersion) -> Result<Arc<TelemetrySnapshot>> {
        self.received.fetch_add(1, Ordering::Relaxed);
        match TelemetrySnapshot::parse(raw, sdk) {
            Ok(snapshot) => Ok(self.publish(snapshot)),
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn publish(&self, snapshot: TelemetrySnapshot) -> Arc<TelemetrySnapshot> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(snapshot.stamped(seq));
        self.latest.send_replace(Some(Arc::clone(&snapshot)));
        let _ = self.updates().send(Arc::clone(&snapshot));
        snapshot
    }

    fn updates(&self) -> MutexGuard<'_, broadcast::Sender<Arc<TelemetrySnapshot>>> {
        self.updates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End every current subscription. Later subscribers are unaffected.
    pub fn close_subscribers(&self) {
        let (fresh, _) = broadcast::channel(self.subscriber_buffer);
        drop(std::mem::replace(&mut *self.updates(), fresh));
    }

    /// The most recent snapshot, if any has been parsed.
    pub fn latest(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.latest.borrow().clone()
    }

    /// Time since the latest snapshot arrived.
    pub fn staleness(&self) -> Option<Duration> {
        self.latest.borrow().as_ref().map(|s| s.age())
    }

    pub fn subscribe(&self) -> TelemetrySubscription {
        TelemetrySubscription {
            rx: self.updates().subscribe(),
        }
    }

    /// A receiver that always sees the latest snapshot, for `changed()`-style
    /// polling.
    pub fn watch(&self) -> watch::Receiver<Option<Arc<TelemetrySnapshot>>> {
        self.latest.subscribe()
    }

    pub fn counters(&self) -> TelemetryCounters {
        TelemetryCounters {
            received: self.received.load(Ordering::Relaxed),
            published: self.seq.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshots published after the subscription was made.
///
/// A subscriber that falls behind skips the snapshots it missed; it never
/// sees an older snapshot after a newer one.
#[derive(Debug)]
pub struct TelemetrySubscription {
    rx: broadcast::Receiver<Arc<TelemetrySnapshot>>,
}

impl TelemetrySubscription {
    /// The next snapshot, or `None` once the session disconnects.
    pub async fn next(&mut self) -> Option<Arc<TelemetrySnapshot>> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "telemetry subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<TelemetrySnapshot>> {
        BroadcastStream::new(self.rx).filter_map(|item| async move { item.ok() })
    }
}

// ---------------------------------------------------------------
// Receive task
// ---------------------------------------------------------------

/// Largest telemetry datagram accepted.
const MAX_DATAGRAM: usize = 2048;

const RECEIVE_POLL: Duration = Duration::from_secs(1);

/// Handle to the telemetry receive task.
pub struct TelemetryChannel {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TelemetryChannel {
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the task that feeds `hub` from the telemetry socket.
pub(crate) fn spawn_telemetry_channel(
    transport: Box<dyn DatagramTransport>,
    hub: Arc<TelemetryHub>,
    sdk: SdkVersion,
    fault_tx: mpsc::UnboundedSender<Fault>,
) -> TelemetryChannel {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(telemetry_loop(transport, hub, sdk, fault_tx, cancel.clone()));
    TelemetryChannel { cancel, task }
}

async fn telemetry_loop(
    mut transport: Box<dyn DatagramTransport>,
    hub: Arc<TelemetryHub>,
    sdk: SdkVersion,
    fault_tx: mpsc::UnboundedSender<Fault>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = transport.receive(&mut buf, RECEIVE_POLL) => result,
        };

        match result {
            Ok(n) => match hub.ingest(&buf[..n], sdk) {
                Ok(snapshot) => {
                    tracing::trace!(seq = snapshot.seq(), battery = snapshot.battery, "telemetry");
                }
                Err(e) => debug!(error = %e, "dropping telemetry datagram"),
            },
            Err(Error::Timeout) => {}
            Err(e) => {
                tracing::error!(error = %e, "telemetry socket failed");
                let _ = fault_tx.send(Fault {
                    channel: Channel::Telemetry,
                    reason: e.to_string(),
                });
                break;
            }
        }
    }

    let _ = transport.close().await;
    debug!("telemetry task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tello_test_harness::{SAMPLE_TELEMETRY, mock_pair};

    const SAMPLE_V2: &str = "mid:3;x:10;y:-20;z:80;mpry:1,2,3;pitch:1;roll:-2;yaw:45;\
vgx:0;vgy:0;vgz:0;templ:60;temph:62;tof:10;h:120;bat:55;baro:12.5;time:9;\
agx:-1.0;agy:2.0;agz:-999.0;\r\n";

    #[test]
    fn parse_sdk_1_3_line() {
        let s = TelemetrySnapshot::parse(SAMPLE_TELEMETRY.as_bytes(), SdkVersion::V1_3).unwrap();
        assert_eq!(s.battery(), 87);
        assert_eq!(s.height(), 0);
        assert_eq!(s.temp_low, 60);
        assert_eq!(s.temp_high, 62);
        assert_eq!(s.tof, 10);
        assert!((s.baro - 0.1).abs() < f32::EPSILON);
        assert_eq!(s.mission_pad, None);
        assert_eq!(s.signal_strength, None);
        assert_eq!(s.get("bat"), Some("87"));
    }

    #[test]
    fn parse_sdk_2_0_line() {
        let s = TelemetrySnapshot::parse(SAMPLE_V2.as_bytes(), SdkVersion::V2_0).unwrap();
        let pad = s.mission_pad.unwrap();
        assert_eq!(pad.detected(), Some(3));
        assert_eq!((pad.x, pad.y, pad.z), (10, -20, 80));
        assert_eq!((pad.pitch, pad.roll, pad.yaw), (1, 2, 3));
        assert_eq!(s.yaw, 45);
        assert_eq!(s.flight_time, 9);
        assert!((s.agz + 999.0).abs() < f32::EPSILON);
    }

    #[test]
    fn no_pad_in_view() {
        let line = SAMPLE_V2.replace("mid:3", "mid:-1");
        let s = TelemetrySnapshot::parse(line.as_bytes(), SdkVersion::V2_0).unwrap();
        assert_eq!(s.mission_pad.unwrap().detected(), None);
    }

    #[test]
    fn sdk_2_0_line_parses_under_1_3_schema() {
        let s = TelemetrySnapshot::parse(SAMPLE_V2.as_bytes(), SdkVersion::V1_3).unwrap();
        assert_eq!(s.mission_pad, None);
        assert_eq!(s.get("mid"), Some("3"));
    }

    #[test]
    fn sdk_1_3_line_fails_under_2_0_schema() {
        let err = TelemetrySnapshot::parse(SAMPLE_TELEMETRY.as_bytes(), SdkVersion::V2_0);
        assert!(matches!(err, Err(Error::Parse(m)) if m == "missing field mid, x, y, z, mpry"));
    }

    #[test]
    fn every_missing_field_is_named() {
        let line = SAMPLE_TELEMETRY.replace("tof:10;", "").replace("bat:87;", "");
        let err = TelemetrySnapshot::parse(line.as_bytes(), SdkVersion::V1_3);
        assert!(matches!(err, Err(Error::Parse(m)) if m == "missing field tof, bat"));
    }

    #[test]
    fn unknown_fields_ignored() {
        let line = format!("extra:42;{SAMPLE_TELEMETRY}");
        let s = TelemetrySnapshot::parse(line.as_bytes(), SdkVersion::V1_3).unwrap();
        assert_eq!(s.get("extra"), Some("42"));
        assert_eq!(s.battery(), 87);
    }

    #[test]
    fn truncated_line_is_rejected() {
        let err = TelemetrySnapshot::parse(b"pitch:0;roll:0;yaw", SdkVersion::V1_3);
        assert!(matches!(err, Err(Error::Parse(_))));
    }

    #[test]
    fn missing_field_is_rejected() {
        let line = SAMPLE_TELEMETRY.replace("bat:87;", "");
        let err = TelemetrySnapshot::parse(line.as_bytes(), SdkVersion::V1_3);
        assert!(matches!(err, Err(Error::Parse(m)) if m == "missing field bat"));
    }

    #[test]
    fn bad_number_is_rejected() {
        let line = SAMPLE_TELEMETRY.replace("bat:87", "bat:eighty");
        assert!(TelemetrySnapshot::parse(line.as_bytes(), SdkVersion::V1_3).is_err());
        let line = SAMPLE_TELEMETRY.replace("bat:87", "bat:300");
        assert!(TelemetrySnapshot::parse(line.as_bytes(), SdkVersion::V1_3).is_err());
    }

    #[test]
    fn required_fields_by_version() {
        assert_eq!(required_fields(SdkVersion::V1_3).len(), 16);
        assert!(required_fields(SdkVersion::V2_0).contains(&"mpry"));
    }

    #[tokio::test]
    async fn hub_sequences_and_ignores_malformed() {
        let hub = TelemetryHub::new(8);
        assert!(hub.latest().is_none());
        assert!(hub.staleness().is_none());

        let first = hub.ingest(SAMPLE_TELEMETRY.as_bytes(), SdkVersion::V1_3).unwrap();
        assert!(hub.ingest(b"pitch:0;roll", SdkVersion::V1_3).is_err());
        assert_eq!(hub.latest().unwrap().seq(), first.seq());

        let second = hub.ingest(SAMPLE_TELEMETRY.as_bytes(), SdkVersion::V1_3).unwrap();
        assert_eq!(second.seq(), first.seq() + 1);
        assert_eq!(
            hub.counters(),
            TelemetryCounters {
                received: 3,
                published: 2,
                parse_errors: 1
            }
        );
    }

    #[tokio::test]
    async fn held_snapshot_is_not_mutated() {
        let hub = TelemetryHub::new(8);
        let held = hub.ingest(SAMPLE_TELEMETRY.as_bytes(), SdkVersion::V1_3).unwrap();
        let line = SAMPLE_TELEMETRY.replace("bat:87", "bat:40");
        hub.ingest(line.as_bytes(), SdkVersion::V1_3).unwrap();

        assert_eq!(held.battery(), 87);
        assert_eq!(hub.latest().unwrap().battery(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_grows_with_time() {
        let hub = TelemetryHub::new(8);
        hub.ingest(SAMPLE_TELEMETRY.as_bytes(), SdkVersion::V1_3).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(hub.staleness(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn lagging_subscriber_never_goes_backwards() {
        let hub = TelemetryHub::new(2);
        let mut sub = hub.subscribe();
        for _ in 0..5 {
            hub.ingest(SAMPLE_TELEMETRY.as_bytes(), SdkVersion::V1_3).unwrap();
        }

        let mut last = 0;
        while let Ok(Some(s)) =
            tokio::time::timeout(Duration::from_millis(10), sub.next()).await
        {
            assert!(s.seq() > last);
            last = s.seq();
        }
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let hub = TelemetryHub::new(4);
        let mut old = hub.subscribe();
        hub.close_subscribers();
        let mut new = hub.subscribe();

        hub.ingest(SAMPLE_TELEMETRY.as_bytes(), SdkVersion::V1_3).unwrap();
        assert!(old.next().await.is_none());
        assert_eq!(new.next().await.unwrap().seq(), 1);
    }

    #[tokio::test]
    async fn channel_publishes_from_socket() {
        let (client, peer) = mock_pair(Channel::Telemetry);
        let hub = Arc::new(TelemetryHub::new(8));
        let mut sub = hub.subscribe();
        let (fault_tx, _faults) = mpsc::unbounded_channel();
        let channel =
            spawn_telemetry_channel(Box::new(client), Arc::clone(&hub), SdkVersion::V1_3, fault_tx);

        peer.push(b"garbage");
        peer.push(SAMPLE_TELEMETRY.as_bytes());

        let snapshot = sub.next().await.unwrap();
        assert_eq!(snapshot.seq(), 1);
        assert_eq!(hub.counters().parse_errors, 1);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn socket_failure_reports_fault() {
        let (client, peer) = mock_pair(Channel::Telemetry);
        let hub = Arc::new(TelemetryHub::new(8));
        let (fault_tx, mut faults) = mpsc::unbounded_channel();
        let channel = spawn_telemetry_channel(Box::new(client), hub, SdkVersion::V1_3, fault_tx);

        peer.fail();
        let fault = tokio::time::timeout(Duration::from_secs(5), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fault.channel, Channel::Telemetry);
        channel.shutdown().await;
    }
}
