//! UDP sockets for the three device channels.
//!
//! The aircraft listens for text commands on UDP 8889 and replies to the
//! sender. Once in SDK mode it pushes telemetry to UDP 8890 and, after
//! `streamon`, raw H.264 to UDP 11111 on the host that sent the handshake.
//!
//! [`UdpTransport`] wraps a [`tokio::net::UdpSocket`] with error mapping
//! consistent with the rest of the workspace. [`UdpConnector`] knows the
//! port plan and opens one transport per [`Channel`].

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

use tello_core::error::{Error, Result};
use tello_core::transport::{Connector, DatagramTransport};
use tello_core::types::Channel;

/// The aircraft's address on its own access point.
pub const DEFAULT_DEVICE_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 10, 1));
/// Command port, used on both ends.
pub const DEFAULT_COMMAND_PORT: u16 = 8889;
/// Local port the telemetry push arrives on.
pub const DEFAULT_TELEMETRY_PORT: u16 = 8890;
/// Local port the video stream arrives on.
pub const DEFAULT_VIDEO_PORT: u16 = 11111;

/// A datagram transport over one UDP socket.
///
/// A transport with a remote address (the command channel) sends to and
/// only accepts datagrams from that address. A transport without one is
/// receive-only.
#[derive(Debug)]
pub struct UdpTransport {
    /// The underlying socket; `None` once closed.
    socket: Option<UdpSocket>,
    /// The local address the socket is bound to.
    local_addr: SocketAddr,
    /// The connected peer, if any.
    remote_addr: Option<SocketAddr>,
}

impl UdpTransport {
    /// Bind a receive-only socket to a local address such as `0.0.0.0:8890`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        tracing::debug!(addr = %addr, "Binding UDP socket");

        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "Failed to bind UDP socket");
            Error::Io(e)
        })?;

        let local_addr = socket.local_addr().map_err(|e| {
            tracing::error!(error = %e, "Failed to get local address");
            Error::Io(e)
        })?;

        tracing::debug!(local_addr = %local_addr, "UDP socket bound");

        Ok(Self {
            socket: Some(socket),
            local_addr,
            remote_addr: None,
        })
    }

    /// Bind to `local` and connect to `remote`.
    ///
    /// UDP "connect" performs no handshake; it sets the default destination
    /// and makes the OS drop datagrams from any other source.
    pub async fn connect(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let mut transport = Self::bind(local).await?;
        let socket = transport.socket()?;

        socket.connect(remote).await.map_err(|e| {
            tracing::error!(
                local = %local,
                remote = %remote,
                error = %e,
                "Failed to connect UDP socket"
            );
            Error::Io(e)
        })?;

        tracing::debug!(local = %transport.local_addr, remote = %remote, "UDP socket connected");
        transport.remote_addr = Some(remote);
        Ok(transport)
    }

    /// The local address this socket is bound to.
    ///
    /// Useful when binding to port 0 to discover the assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The connected peer, if this transport can send.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let socket = self.socket()?;
        let remote = self.remote_addr.ok_or_else(|| {
            Error::InvalidState(format!("socket {} is receive-only", self.local_addr))
        })?;

        tracing::trace!(
            local = %self.local_addr,
            remote = %remote,
            bytes = data.len(),
            "Sending datagram"
        );

        socket.send(data).await.map_err(|e| {
            tracing::error!(
                local = %self.local_addr,
                remote = %remote,
                error = %e,
                "Failed to send datagram"
            );
            Error::Io(e)
        })?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let socket = self.socket()?;

        match tokio::time::timeout(timeout, socket.recv_from(buf)).await {
            Ok(Ok((n, src))) => {
                tracing::trace!(
                    local = %self.local_addr,
                    remote = %src,
                    bytes = n,
                    "Received datagram"
                );
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(
                    local = %self.local_addr,
                    error = %e,
                    "Failed to receive datagram"
                );
                Err(Error::Io(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            tracing::debug!(local = %self.local_addr, "UDP socket closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

/// Opens the three device channels on the documented port plan.
#[derive(Debug, Clone)]
pub struct UdpConnector {
    /// The aircraft's address.
    pub device_addr: IpAddr,
    /// Local interface to bind on.
    pub local_addr: IpAddr,
    /// Local command port.
    pub command_port: u16,
    /// Device command port.
    pub device_command_port: u16,
    /// Local telemetry port.
    pub telemetry_port: u16,
    /// Local video port.
    pub video_port: u16,
}

impl Default for UdpConnector {
    fn default() -> Self {
        Self {
            device_addr: DEFAULT_DEVICE_ADDR,
            local_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            command_port: DEFAULT_COMMAND_PORT,
            device_command_port: DEFAULT_COMMAND_PORT,
            telemetry_port: DEFAULT_TELEMETRY_PORT,
            video_port: DEFAULT_VIDEO_PORT,
        }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    async fn open(&self, channel: Channel) -> Result<Box<dyn DatagramTransport>> {
        let transport = match channel {
            Channel::Command => {
                UdpTransport::connect(
                    SocketAddr::new(self.local_addr, self.command_port),
                    SocketAddr::new(self.device_addr, self.device_command_port),
                )
                .await?
            }
            Channel::Telemetry => {
                UdpTransport::bind(SocketAddr::new(self.local_addr, self.telemetry_port)).await?
            }
            Channel::Video => {
                UdpTransport::bind(SocketAddr::new(self.local_addr, self.video_port)).await?
            }
        };
        tracing::debug!(channel = %channel, local = %transport.local_addr(), "Channel opened");
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn bind_and_local_addr() {
        let transport = UdpTransport::bind(loopback()).await.unwrap();
        let addr = transport.local_addr();

        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0, "OS should assign a nonzero port");
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn send_receive_loopback() {
        let mut device = UdpTransport::bind(loopback()).await.unwrap();
        let mut client = UdpTransport::connect(loopback(), device.local_addr())
            .await
            .unwrap();

        client.send(b"command").await.unwrap();

        let mut buf = [0u8; 256];
        let n = device
            .receive(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"command");
    }

    #[tokio::test]
    async fn receive_timeout() {
        let mut transport = UdpTransport::bind(loopback()).await.unwrap();

        let mut buf = [0u8; 256];
        let result = transport
            .receive(&mut buf, Duration::from_millis(50))
            .await;

        assert!(
            matches!(result, Err(Error::Timeout)),
            "expected Timeout, got: {:?}",
            result
        );
    }

    #[tokio::test]
    async fn receive_only_socket_cannot_send() {
        let mut transport = UdpTransport::bind(loopback()).await.unwrap();
        let result = transport.send(b"takeoff").await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut transport = UdpTransport::bind(loopback()).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());

        let mut buf = [0u8; 16];
        let result = transport.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn connect_filters_source() {
        let mut device = UdpTransport::bind(loopback()).await.unwrap();
        let stranger = UdpTransport::bind(loopback()).await.unwrap();
        let mut client = UdpTransport::connect(loopback(), device.local_addr())
            .await
            .unwrap();

        // Reply path: the device answers the client's address.
        client.send(b"battery?").await.unwrap();
        let mut buf = [0u8; 256];
        device.receive(&mut buf, Duration::from_secs(2)).await.unwrap();

        let std_stranger = stranger.socket().unwrap();
        std_stranger
            .send_to(b"from stranger", client.local_addr())
            .await
            .unwrap();

        let device_socket = device.socket().unwrap();
        device_socket
            .send_to(b"87", client.local_addr())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        let n = client
            .receive(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"87");
    }

    #[tokio::test]
    async fn large_datagram() {
        let mut device = UdpTransport::bind(loopback()).await.unwrap();
        let mut client = UdpTransport::connect(loopback(), device.local_addr())
            .await
            .unwrap();

        // 1460 bytes is the largest video fragment the aircraft sends.
        let data: Vec<u8> = (0..1460).map(|i| (i % 256) as u8).collect();
        client.send(&data).await.unwrap();

        let mut buf = [0u8; 2048];
        let n = device
            .receive(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(n, 1460);
        assert_eq!(&buf[..n], &data[..]);
    }

    #[tokio::test]
    async fn connector_opens_receive_only_channels() {
        let connector = UdpConnector {
            local_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            device_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            command_port: 0,
            device_command_port: 9,
            telemetry_port: 0,
            video_port: 0,
        };

        let mut telemetry = connector.open(Channel::Telemetry).await.unwrap();
        assert!(telemetry.is_open());
        assert!(matches!(
            telemetry.send(b"x").await,
            Err(Error::InvalidState(_))
        ));

        let command = connector.open(Channel::Command).await.unwrap();
        assert!(command.is_open());
    }

    #[test]
    fn connector_default_port_plan() {
        let connector = UdpConnector::default();
        assert_eq!(connector.device_addr, DEFAULT_DEVICE_ADDR);
        assert_eq!(connector.command_port, 8889);
        assert_eq!(connector.telemetry_port, 8890);
        assert_eq!(connector.video_port, 11111);
    }
}
