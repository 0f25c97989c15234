//! Scripted datagram transport for deterministic command-channel tests.
//!
//! [`MockTransport`] implements [`DatagramTransport`] with pre-loaded
//! request/reply pairs. Each `send()` is matched against the next
//! expectation; its reply datagrams are then returned by subsequent
//! `receive()` calls. With nothing to deliver, `receive()` sleeps for the
//! full timeout before reporting [`Error::Timeout`], so tests running on a
//! paused tokio clock observe realistic elapsed time.
//!
//! # Example
//!
//! ```
//! use tello_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! mock.expect(b"command", b"ok");
//! mock.expect(b"battery?", b"87\r\n");
//! // A takeoff that the aircraft never answers.
//! mock.expect(b"takeoff", b"");
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tello_core::error::{Error, Result};
use tello_core::transport::DatagramTransport;

/// A pre-loaded request and the datagrams sent back for it.
#[derive(Debug, Clone)]
struct Expectation {
    request: Vec<u8>,
    replies: Vec<Vec<u8>>,
}

/// Shared record of every datagram sent through a [`MockTransport`].
///
/// Survives the transport being moved into a channel task.
#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl SentLog {
    /// All datagrams sent so far, in order.
    pub fn datagrams(&self) -> Vec<Vec<u8>> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Sent datagrams decoded as text.
    pub fn commands(&self) -> Vec<String> {
        self.datagrams()
            .iter()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .collect()
    }

    /// Number of datagrams sent so far.
    pub fn len(&self) -> usize {
        self.0.lock().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, data: &[u8]) {
        if let Ok(mut log) = self.0.lock() {
            log.push(data.to_vec());
        }
    }
}

/// A scripted [`DatagramTransport`].
///
/// If a sent datagram does not match the next expectation, or the queue is
/// exhausted, `send()` fails with [`Error::Transport`].
#[derive(Debug)]
pub struct MockTransport {
    expectations: VecDeque<Expectation>,
    /// Datagrams waiting to be returned by `receive()`.
    inbox: VecDeque<Vec<u8>>,
    open: bool,
    /// Simulated OS-level failure for every subsequent operation.
    fault: Option<String>,
    sent_log: SentLog,
}

impl MockTransport {
    /// Create a new, open mock transport.
    pub fn new() -> Self {
        MockTransport {
            expectations: VecDeque::new(),
            inbox: VecDeque::new(),
            open: true,
            fault: None,
            sent_log: SentLog::default(),
        }
    }

    /// Expect `request`; reply with one datagram, or with nothing if
    /// `reply` is empty.
    pub fn expect(&mut self, request: &[u8], reply: &[u8]) {
        let replies = if reply.is_empty() {
            Vec::new()
        } else {
            vec![reply.to_vec()]
        };
        self.expect_replies(request, &replies);
    }

    /// Expect `request` and reply with several datagrams in order.
    pub fn expect_replies(&mut self, request: &[u8], replies: &[Vec<u8>]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            replies: replies.to_vec(),
        });
    }

    /// Queue a datagram that arrives without being asked for.
    pub fn push_datagram(&mut self, data: &[u8]) {
        self.inbox.push_back(data.to_vec());
    }

    /// Make every subsequent `send()`/`receive()` fail as if the OS socket
    /// had broken.
    pub fn fail_with(&mut self, reason: &str) {
        self.fault = Some(reason.to_string());
    }

    /// A handle to the record of sent datagrams.
    pub fn sent_log(&self) -> SentLog {
        self.sent_log.clone()
    }

    /// Number of expectations not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }

    fn check_usable(&self) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        if let Some(reason) = &self.fault {
            return Err(Error::Transport(reason.clone()));
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatagramTransport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        self.sent_log.push(data);

        let expectation = self.expectations.pop_front().ok_or_else(|| {
            Error::Transport(format!(
                "no more expectations in mock transport (sent {:?})",
                String::from_utf8_lossy(data)
            ))
        })?;

        if data != expectation.request.as_slice() {
            return Err(Error::Transport(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            )));
        }

        self.inbox.extend(expectation.replies);
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.check_usable()?;

        match self.inbox.pop_front() {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Err(Error::Timeout)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.inbox.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_follows_matching_send() {
        let mut mock = MockTransport::new();
        mock.expect(b"command", b"ok");

        mock.send(b"command").await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"ok");
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn sent_log_survives_move() {
        let mut mock = MockTransport::new();
        mock.expect(b"command", b"ok");
        mock.expect(b"takeoff", b"ok");
        let log = mock.sent_log();

        let mut boxed: Box<dyn DatagramTransport> = Box::new(mock);
        boxed.send(b"command").await.unwrap();
        boxed.send(b"takeoff").await.unwrap();

        assert_eq!(log.commands(), vec!["command", "takeoff"]);
    }

    #[tokio::test]
    async fn wrong_data_errors() {
        let mut mock = MockTransport::new();
        mock.expect(b"land", b"ok");

        let result = mock.send(b"takeoff").await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_reply_times_out_after_full_deadline() {
        let mut mock = MockTransport::new();
        mock.expect(b"takeoff", b"");
        mock.send(b"takeoff").await.unwrap();

        let start = tokio::time::Instant::now();
        let mut buf = [0u8; 64];
        let result = mock.receive(&mut buf, Duration::from_secs(7)).await;

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn pushed_datagram_is_received_first() {
        let mut mock = MockTransport::new();
        mock.push_datagram(b"ok");
        mock.expect(b"battery?", b"87");

        mock.send(b"battery?").await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], b"87");
    }

    #[tokio::test]
    async fn fault_breaks_send_and_receive() {
        let mut mock = MockTransport::new();
        mock.fail_with("network unreachable");

        assert!(matches!(mock.send(b"command").await, Err(Error::Transport(_))));
        let mut buf = [0u8; 8];
        assert!(matches!(
            mock.receive(&mut buf, Duration::from_millis(10)).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn closed_transport_reports_not_connected() {
        let mut mock = MockTransport::new();
        mock.close().await.unwrap();
        mock.close().await.unwrap();
        assert!(!mock.is_open());
        assert!(matches!(mock.send(b"command").await, Err(Error::NotConnected)));
    }
}
