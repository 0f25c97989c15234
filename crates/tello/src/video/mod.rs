//! The video pipeline: reassembly, decoding, and fan-out.
//!
//! One task owns the video socket. Datagrams go through a
//! [`FrameAssembler`]; every complete access unit goes to the
//! [`VideoDecoder`]; every decoded image becomes a [`VideoFrame`] delivered
//! to each subscriber independently.
//!
//! Delivery never waits on a subscriber. Under [`DropPolicy::DropOldest`] a
//! subscriber that falls behind skips the frames it missed; under
//! [`DropPolicy::DropNewest`] frames arriving while its buffer is full are
//! discarded for that subscriber only. Either way a subscriber sees frames in
//! increasing `index` order.

pub mod assembly;
pub mod decoder;
pub mod h264;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tello_core::error::Error;
use tello_core::events::SessionEvent;
use tello_core::transport::DatagramTransport;
use tello_core::types::Channel;

pub use assembly::{FrameAssembler, VideoFraming};
pub use decoder::{DecodedImage, PassthroughDecoder, PixelFormat, VideoDecoder};

use crate::session::Fault;

/// One frame as delivered to subscribers.
///
/// `data` is reference-counted and immutable; each subscriber owns its
/// handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Presentation order, starting at 1 per connection.
    pub index: u64,
    /// Whether the source access unit carried an IDR slice.
    pub keyframe: bool,
    pub data: Bytes,
}

/// What happens to a frame a subscriber has no room for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Evict the subscriber's oldest buffered frame.
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

/// Builds a fresh decoder for each connection.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn VideoDecoder> + Send + Sync>;

/// Video pipeline configuration.
#[derive(Clone)]
pub struct VideoConfig {
    pub framing: VideoFraming,
    /// Frames buffered per subscriber.
    pub subscriber_buffer: usize,
    pub drop_policy: DropPolicy,
    /// A unit still incomplete after this long is dropped.
    pub assembly_timeout: Duration,
    pub decoder: DecoderFactory,
}

impl Default for VideoConfig {
    fn default() -> Self {
        VideoConfig {
            framing: VideoFraming::default(),
            subscriber_buffer: 8,
            drop_policy: DropPolicy::default(),
            assembly_timeout: Duration::from_millis(500),
            decoder: Arc::new(|| Box::new(PassthroughDecoder::default()) as Box<dyn VideoDecoder>),
        }
    }
}

impl std::fmt::Debug for VideoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoConfig")
            .field("framing", &self.framing)
            .field("subscriber_buffer", &self.subscriber_buffer)
            .field("drop_policy", &self.drop_policy)
            .field("assembly_timeout", &self.assembly_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------
// Counters
// ---------------------------------------------------------------

#[derive(Debug, Default)]
struct VideoStats {
    fragments: AtomicU64,
    units: AtomicU64,
    losses: AtomicU64,
    decode_errors: AtomicU64,
    frames: AtomicU64,
    subscriber_drops: AtomicU64,
}

/// A point-in-time copy of the video counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoCounters {
    /// Datagrams received.
    pub fragments: u64,
    /// Complete access units reassembled.
    pub units: u64,
    /// Access units dropped by the assembler.
    pub losses: u64,
    pub decode_errors: u64,
    /// Frames delivered to the fan-out.
    pub frames: u64,
    /// Frames a subscriber missed because it fell behind.
    pub subscriber_drops: u64,
}

impl VideoStats {
    fn snapshot(&self) -> VideoCounters {
        VideoCounters {
            fragments: self.fragments.load(Ordering::Relaxed),
            units: self.units.load(Ordering::Relaxed),
            losses: self.losses.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            subscriber_drops: self.subscriber_drops.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------

struct Fanout {
    policy: DropPolicy,
    buffer: usize,
    broadcast: broadcast::Sender<VideoFrame>,
    queues: Mutex<Vec<mpsc::Sender<VideoFrame>>>,
    stats: Arc<VideoStats>,
}

impl Fanout {
    fn new(policy: DropPolicy, buffer: usize, stats: Arc<VideoStats>) -> Self {
        let buffer = buffer.max(1);
        let (broadcast, _) = broadcast::channel(buffer);
        Fanout {
            policy,
            buffer,
            broadcast,
            queues: Mutex::new(Vec::new()),
            stats,
        }
    }

    fn subscribe(&self) -> VideoSubscription {
        let inner = match self.policy {
            DropPolicy::DropOldest => Inner::Latest(self.broadcast.subscribe()),
            DropPolicy::DropNewest => {
                let (tx, rx) = mpsc::channel(self.buffer);
                if let Ok(mut queues) = self.queues.lock() {
                    queues.push(tx);
                }
                Inner::Queued(rx)
            }
        };
        VideoSubscription {
            inner,
            stats: Arc::clone(&self.stats),
        }
    }

    fn deliver(&self, frame: VideoFrame) {
        match self.policy {
            DropPolicy::DropOldest => {
                let _ = self.broadcast.send(frame);
            }
            DropPolicy::DropNewest => {
                if let Ok(mut queues) = self.queues.lock() {
                    queues.retain(|q| match q.try_send(frame.clone()) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.stats.subscriber_drops.fetch_add(1, Ordering::Relaxed);
                            true
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    });
                }
            }
        }
    }
}

enum Inner {
    Latest(broadcast::Receiver<VideoFrame>),
    Queued(mpsc::Receiver<VideoFrame>),
}

/// A subscriber's frame stream.
///
/// Ends (`None`) when the session disconnects; subscribe again after
/// reconnecting.
pub struct VideoSubscription {
    inner: Inner,
    stats: Arc<VideoStats>,
}

impl VideoSubscription {
    pub async fn next(&mut self) -> Option<VideoFrame> {
        match &mut self.inner {
            Inner::Latest(rx) => loop {
                match rx.recv().await {
                    Ok(frame) => return Some(frame),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "video subscriber lagged");
                        self.stats
                            .subscriber_drops
                            .fetch_add(skipped, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Inner::Queued(rx) => rx.recv().await,
        }
    }

    /// Consume the subscription as a `Stream`.
    pub fn into_stream(self) -> BoxStream<'static, VideoFrame> {
        match self.inner {
            Inner::Latest(rx) => {
                let stats = self.stats;
                BroadcastStream::new(rx)
                    .filter_map(move |item| {
                        let stats = Arc::clone(&stats);
                        async move {
                            match item {
                                Ok(frame) => Some(frame),
                                Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(
                                    skipped,
                                )) => {
                                    stats.subscriber_drops.fetch_add(skipped, Ordering::Relaxed);
                                    None
                                }
                            }
                        }
                    })
                    .boxed()
            }
            Inner::Queued(rx) => ReceiverStream::new(rx).boxed(),
        }
    }
}

// ---------------------------------------------------------------
// Pipeline task
// ---------------------------------------------------------------

/// Largest video datagram read.
const MAX_DATAGRAM: usize = 4096;

/// Receive window; also the granularity of assembly timeouts.
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Handle to a running video pipeline.
pub struct VideoPipeline {
    fanout: Arc<Fanout>,
    stats: Arc<VideoStats>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl VideoPipeline {
    pub fn subscribe(&self) -> VideoSubscription {
        self.fanout.subscribe()
    }

    pub fn counters(&self) -> VideoCounters {
        self.stats.snapshot()
    }

    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }

    /// Stop the task. Subscriptions end once this handle is dropped too.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the pipeline over the video socket.
pub(crate) fn spawn_video_pipeline(
    transport: Box<dyn DatagramTransport>,
    config: &VideoConfig,
    event_tx: broadcast::Sender<SessionEvent>,
    fault_tx: mpsc::UnboundedSender<Fault>,
) -> VideoPipeline {
    let stats = Arc::new(VideoStats::default());
    let fanout = Arc::new(Fanout::new(
        config.drop_policy,
        config.subscriber_buffer,
        Arc::clone(&stats),
    ));
    let cancel = CancellationToken::new();

    let worker = VideoWorker {
        assembler: FrameAssembler::new(config.framing, config.assembly_timeout),
        decoder: (config.decoder)(),
        fanout: Arc::clone(&fanout),
        stats: Arc::clone(&stats),
        event_tx,
        next_index: 1,
        reported_losses: 0,
    };
    let task = tokio::spawn(worker.run(transport, fault_tx, cancel.clone()));

    VideoPipeline {
        fanout,
        stats,
        cancel,
        task,
    }
}

struct VideoWorker {
    assembler: FrameAssembler,
    decoder: Box<dyn VideoDecoder>,
    fanout: Arc<Fanout>,
    stats: Arc<VideoStats>,
    event_tx: broadcast::Sender<SessionEvent>,
    next_index: u64,
    reported_losses: u64,
}

impl VideoWorker {
    async fn run(
        mut self,
        mut transport: Box<dyn DatagramTransport>,
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

            let now = Instant::now();
            match result {
                Ok(n) => {
                    self.stats.fragments.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(len = n, "video datagram");
                    if let Some(unit) = self.assembler.push(&buf[..n], now) {
                        self.handle_unit(unit);
                    }
                }
                Err(Error::Timeout) => self.assembler.expire(now),
                Err(e) => {
                    tracing::error!(error = %e, "video socket failed");
                    let _ = fault_tx.send(Fault {
                        channel: Channel::Video,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
            self.report_losses();
        }

        let _ = transport.close().await;
        debug!("video task exited");
    }

    fn handle_unit(&mut self, unit: Bytes) {
        self.stats.units.fetch_add(1, Ordering::Relaxed);
        let keyframe = h264::is_keyframe(&h264::split_nal_units(&unit));

        match self.decoder.decode(&unit) {
            Ok(images) => {
                for image in images {
                    let frame = VideoFrame {
                        width: image.width,
                        height: image.height,
                        pixel_format: image.pixel_format,
                        index: self.next_index,
                        keyframe,
                        data: image.data,
                    };
                    self.next_index += 1;
                    self.stats.frames.fetch_add(1, Ordering::Relaxed);
                    self.fanout.deliver(frame);
                }
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, bytes = unit.len(), "skipping undecodable access unit");
            }
        }
    }

    fn report_losses(&mut self) {
        let total = self.assembler.losses();
        if total > self.reported_losses {
            debug!(total, new = total - self.reported_losses, "video fragment loss");
            self.reported_losses = total;
            self.stats.losses.store(total, Ordering::Relaxed);
            let _ = self.event_tx.send(SessionEvent::FragmentLoss { total });
        }
    }
}
