//! In-memory datagram links.
//!
//! [`mock_pair`] returns the client end of a channel (a
//! [`DatagramTransport`]) and the device end ([`MockPeer`]). Datagrams
//! travel through unbounded queues, so the pair behaves like a loss-free
//! UDP link with no fixed ports.
//!
//! [`MockConnector`] opens a fresh pair for every [`Channel`] the session
//! asks for and hands the device ends to the test, including across
//! reconnects.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use tello_core::error::{Error, Result};
use tello_core::transport::{Connector, DatagramTransport};
use tello_core::types::Channel;

/// Client end of an in-memory link.
#[derive(Debug)]
pub struct MockDatagramTransport {
    channel: Channel,
    to_device: mpsc::UnboundedSender<Vec<u8>>,
    from_device: mpsc::UnboundedReceiver<Vec<u8>>,
    open: bool,
    failed: Arc<AtomicBool>,
}

/// Device end of an in-memory link.
#[derive(Debug)]
pub struct MockPeer {
    channel: Channel,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    failed: Arc<AtomicBool>,
}

/// Create a connected client/device pair for `channel`.
pub fn mock_pair(channel: Channel) -> (MockDatagramTransport, MockPeer) {
    let (to_device, from_client) = mpsc::unbounded_channel();
    let (to_client, from_device) = mpsc::unbounded_channel();
    let failed = Arc::new(AtomicBool::new(false));

    let client = MockDatagramTransport {
        channel,
        to_device,
        from_device,
        open: true,
        failed: Arc::clone(&failed),
    };
    let peer = MockPeer {
        channel,
        to_client,
        from_client,
        failed,
    };
    (client, peer)
}

#[async_trait]
impl DatagramTransport for MockDatagramTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::Transport("simulated socket failure".into()));
        }
        if self.channel != Channel::Command {
            return Err(Error::InvalidState(format!(
                "{} channel is receive-only",
                self.channel
            )));
        }
        // UDP semantics: a vanished peer is not an error for the sender.
        let _ = self.to_device.send(data.to_vec());
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::Transport("simulated socket failure".into()));
        }

        match tokio::time::timeout(timeout, self.from_device.recv()).await {
            Ok(Some(datagram)) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            Ok(None) => {
                // Device end dropped: nothing will ever arrive.
                tokio::time::sleep(timeout).await;
                Err(Error::Timeout)
            }
            Err(_) => {
                if self.failed.load(Ordering::SeqCst) {
                    return Err(Error::Transport("simulated socket failure".into()));
                }
                Err(Error::Timeout)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl MockPeer {
    /// Which channel this peer serves.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Deliver one datagram to the client. Returns `false` if the client
    /// end is gone.
    pub fn push(&self, data: &[u8]) -> bool {
        self.to_client.send(data.to_vec()).is_ok()
    }

    /// Wait for the next datagram the client sends. `None` once the client
    /// end is dropped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_client.recv().await
    }

    /// Take a datagram the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.from_client.try_recv().ok()
    }

    /// Break the client's socket: its next `send()`/`receive()` fails with
    /// [`Error::Transport`].
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// A handle that can break this link after the peer has been moved.
    pub fn breaker(&self) -> LinkBreaker {
        LinkBreaker(Arc::clone(&self.failed))
    }
}

/// Breaks one in-memory link from anywhere.
#[derive(Debug, Clone)]
pub struct LinkBreaker(Arc<AtomicBool>);

impl LinkBreaker {
    pub fn fail(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A [`Connector`] that opens in-memory links.
///
/// Every `open()` creates a new pair; the device end is published on the
/// receiver returned by [`MockConnector::new`].
#[derive(Debug, Clone)]
pub struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    refuse: Arc<Mutex<HashSet<Channel>>>,
}

impl MockConnector {
    /// Create a connector and the stream of device ends it opens.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let connector = MockConnector {
            peers,
            refuse: Arc::new(Mutex::new(HashSet::new())),
        };
        (connector, peers_rx)
    }

    /// Make `open(channel)` fail as if the port were already in use.
    pub fn refuse(&self, channel: Channel) {
        if let Ok(mut refuse) = self.refuse.lock() {
            refuse.insert(channel);
        }
    }

    /// Undo [`refuse`](Self::refuse).
    pub fn allow(&self, channel: Channel) {
        if let Ok(mut refuse) = self.refuse.lock() {
            refuse.remove(&channel);
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, channel: Channel) -> Result<Box<dyn DatagramTransport>> {
        let refused = self
            .refuse
            .lock()
            .map(|refuse| refuse.contains(&channel))
            .unwrap_or(false);
        if refused {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{channel} port in use"),
            )));
        }

        let (client, peer) = mock_pair(channel);
        tracing::trace!(channel = %channel, "Mock channel opened");
        let _ = self.peers.send(peer);
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_round_trip() {
        let (mut client, mut peer) = mock_pair(Channel::Command);

        client.send(b"command").await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), b"command");

        assert!(peer.push(b"ok"));
        let mut buf = [0u8; 16];
        let n = client
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test]
    async fn telemetry_end_is_receive_only() {
        let (mut client, _peer) = mock_pair(Channel::Telemetry);
        assert!(matches!(
            client.send(b"x").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out() {
        let (mut client, _peer) = mock_pair(Channel::Video);
        let mut buf = [0u8; 16];
        let result = client.receive(&mut buf, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn failed_peer_breaks_client() {
        let (mut client, peer) = mock_pair(Channel::Command);
        peer.fail();
        assert!(matches!(
            client.send(b"command").await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn connector_publishes_peers() {
        let (connector, mut peers) = MockConnector::new();
        let _client = connector.open(Channel::Telemetry).await.unwrap();
        let peer = peers.recv().await.unwrap();
        assert_eq!(peer.channel(), Channel::Telemetry);
    }

    #[tokio::test]
    async fn connector_refuses_channel() {
        let (connector, _peers) = MockConnector::new();
        connector.refuse(Channel::Video);
        assert!(matches!(
            connector.open(Channel::Video).await,
            Err(Error::Io(_))
        ));
        connector.allow(Channel::Video);
        assert!(connector.open(Channel::Video).await.is_ok());
    }
}
