//! The command channel: one IO task owning the command socket.
//!
//! The device protocol is strictly half-duplex, so a single tokio task owns
//! the transport and runs every exchange to completion before taking the next
//! request off a bounded FIFO queue. That gives the two ordering guarantees
//! for free: at most one command in flight, and outcomes resolved in
//! submission order.
//!
//! Per command the task:
//!
//! 1. drains any datagram already waiting (a late or duplicate reply to an
//!    earlier command) so it cannot be mistaken for this command's reply;
//! 2. sends the wire bytes and waits up to `command_timeout` for a reply;
//! 3. on timeout resends the identical bytes, up to `retries` more times,
//!    then resolves [`CommandOutcome::TimedOut`].
//!
//! Before a command is sent the task asks its [`DispatchHooks`] whether it
//! may go out, and reports the outcome back through them before resolving
//! the caller. The session uses this to apply flight-state rules at the
//! moment of dispatch rather than at submission.
//!
//! With no command outstanding the task keeps reading the socket and
//! discards whatever arrives.
//!
//! A socket failure resolves the in-flight command with
//! [`CommandOutcome::TransportError`], fails everything still queued the
//! same way, reports the fault to the session, and ends the task.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tello_core::error::Error;
use tello_core::events::SessionEvent;
use tello_core::transport::DatagramTransport;
use tello_core::types::{Channel, CommandOutcome};

use crate::commands::Command;
use crate::protocol;
use crate::session::Fault;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What `submit` does while another command is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Queue behind the outstanding command, up to the queue depth.
    /// Overflow resolves `Rejected("queue-full")`.
    #[default]
    Fifo,
    /// Refuse with `Rejected("busy")`.
    RejectWhenBusy,
}

/// Configuration for the command IO task.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// How long to wait for a reply to one attempt.
    pub command_timeout: Duration,
    /// Additional attempts after the first times out.
    pub retries: u32,
    /// Commands that may wait behind the one in flight.
    pub queue_depth: usize,
    pub policy: QueuePolicy,
}

/// A completion handler for [`CommandChannel::submit_with`].
pub type Completion = Box<dyn FnOnce(CommandOutcome) + Send + 'static>;

enum Responder {
    Await(oneshot::Sender<CommandOutcome>),
    Callback(Completion),
}

impl Responder {
    fn resolve(self, outcome: CommandOutcome) {
        match self {
            Responder::Await(tx) => {
                let _ = tx.send(outcome);
            }
            Responder::Callback(handler) => handler(outcome),
        }
    }
}

struct Request {
    command: Command,
    responder: Responder,
}

/// Checks run by the IO task around each command it dequeues.
pub(crate) trait DispatchHooks: Send + Sync {
    /// Refuse `command` without sending it.
    fn admit(&self, command: &Command) -> Result<(), CommandOutcome>;

    /// Called with every outcome of a sent command, before its caller sees it.
    fn settled(&self, command: &Command, outcome: &CommandOutcome);
}

/// Command channel counters. Read without blocking.
#[derive(Debug, Default)]
pub struct CommandStats {
    sent: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    late_replies: AtomicU64,
}

/// A point-in-time copy of [`CommandStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandCounters {
    /// Datagrams sent, retries included.
    pub sent: u64,
    pub retries: u64,
    /// Commands that resolved `TimedOut`.
    pub timeouts: u64,
    /// Replies discarded because no command was waiting for them.
    pub late_replies: u64,
}

impl CommandStats {
    pub fn snapshot(&self) -> CommandCounters {
        CommandCounters {
            sent: self.sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            late_replies: self.late_replies.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable submission handle for the command IO task.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Request>,
    policy: QueuePolicy,
    outstanding: Arc<AtomicUsize>,
    last_activity: Arc<Mutex<Instant>>,
    stats: Arc<CommandStats>,
}

impl CommandSender {
    /// Submit a command and wait for its outcome.
    ///
    /// The wait is bounded by the commands queued ahead of this one, each
    /// taking at most `(retries + 1) * command_timeout`.
    pub async fn submit(&self, command: Command) -> CommandOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(command, Responder::Await(reply_tx));
        reply_rx.await.unwrap_or_else(|_| CommandOutcome::cancelled())
    }

    /// Submit a command and return immediately; `handler` is called exactly
    /// once with the outcome, on the IO task (or inline, if the command is
    /// refused before it is queued).
    pub fn submit_with<F>(&self, command: Command, handler: F)
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        self.enqueue(command, Responder::Callback(Box::new(handler)));
    }

    fn enqueue(&self, command: Command, responder: Responder) {
        let ahead = self.outstanding.fetch_add(1, Ordering::SeqCst);
        if ahead > 0 && self.policy == QueuePolicy::RejectWhenBusy {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            debug!(command = %command, "command refused, another is outstanding");
            responder.resolve(CommandOutcome::busy());
            return;
        }

        match self.tx.try_send(Request { command, responder }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(req)) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                debug!(command = %req.command, "command queue full");
                req.responder.resolve(CommandOutcome::queue_full());
            }
            Err(mpsc::error::TrySendError::Closed(req)) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                req.responder.resolve(CommandOutcome::not_connected());
            }
        }
    }

    /// Commands queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// When the last datagram went out on the command socket.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }

    /// Whether nothing is outstanding and nothing was sent for `quiet`.
    pub fn is_idle_for(&self, quiet: Duration) -> bool {
        self.outstanding() == 0 && self.last_activity().elapsed() >= quiet
    }

    pub fn stats(&self) -> CommandCounters {
        self.stats.snapshot()
    }
}

/// Owning handle to the command IO task.
pub struct CommandChannel {
    sender: CommandSender,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CommandChannel {
    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    pub async fn submit(&self, command: Command) -> CommandOutcome {
        self.sender.submit(command).await
    }

    pub fn submit_with<F>(&self, command: Command, handler: F)
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        self.sender.submit_with(command, handler);
    }

    pub fn outstanding(&self) -> usize {
        self.sender.outstanding()
    }

    pub fn stats(&self) -> CommandCounters {
        self.sender.stats()
    }

    /// Whether the IO task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the IO task to stop without waiting for it.
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }

    /// Stop the IO task and wait for it to exit.
    ///
    /// The in-flight command and everything queued resolve
    /// `Rejected("cancelled")` before this returns; no completion handler
    /// runs afterwards.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the command IO task over `transport`.
pub(crate) fn spawn_command_channel(
    transport: Box<dyn DatagramTransport>,
    config: IoConfig,
    hooks: Arc<dyn DispatchHooks>,
    event_tx: broadcast::Sender<SessionEvent>,
    fault_tx: mpsc::UnboundedSender<Fault>,
) -> CommandChannel {
    let (tx, rx) = mpsc::channel::<Request>(config.queue_depth.max(1));
    let cancel = CancellationToken::new();
    let outstanding = Arc::new(AtomicUsize::new(0));
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let stats = Arc::new(CommandStats::default());
    let policy = config.policy;

    let ctx = IoContext {
        config,
        hooks,
        event_tx,
        fault_tx,
        outstanding: Arc::clone(&outstanding),
        last_activity: Arc::clone(&last_activity),
        stats: Arc::clone(&stats),
    };
    let task = tokio::spawn(io_loop(transport, ctx, rx, cancel.clone()));

    CommandChannel {
        sender: CommandSender {
            tx,
            policy,
            outstanding,
            last_activity,
            stats,
        },
        cancel,
        task,
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// Largest datagram the command socket reads. Replies are a few bytes.
const MAX_REPLY: usize = 1518;

/// Receive window of the idle arm before re-checking the queue.
const IDLE_POLL: Duration = Duration::from_millis(100);

struct IoContext {
    config: IoConfig,
    hooks: Arc<dyn DispatchHooks>,
    event_tx: broadcast::Sender<SessionEvent>,
    fault_tx: mpsc::UnboundedSender<Fault>,
    outstanding: Arc<AtomicUsize>,
    last_activity: Arc<Mutex<Instant>>,
    stats: Arc<CommandStats>,
}

impl IoContext {
    fn finish(&self, responder: Responder, outcome: CommandOutcome) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        responder.resolve(outcome);
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn late_reply(&self, datagram: &[u8]) {
        let reply = protocol::printable(datagram);
        self.stats.late_replies.fetch_add(1, Ordering::Relaxed);
        debug!(reply = %reply, "discarding reply with no command outstanding");
        let _ = self.event_tx.send(SessionEvent::UnsolicitedReply { reply });
    }

    fn fault(&self, reason: &str) {
        tracing::error!(reason, "command socket failed");
        let _ = self.fault_tx.send(Fault {
            channel: Channel::Command,
            reason: reason.to_string(),
        });
    }
}

/// Why the loop stopped.
enum Exit {
    Cancelled,
    Failed(String),
}

/// The main IO loop. Runs as a spawned Tokio task.
///
/// Uses `tokio::select! { biased; }` to prioritize:
/// 1. Cancellation
/// 2. Queued commands, checked against the dispatch hooks
/// 3. Idle reading of unsolicited replies
async fn io_loop(
    mut transport: Box<dyn DatagramTransport>,
    ctx: IoContext,
    mut rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) {
    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("command IO task cancelled");
                break Exit::Cancelled;
            }

            req = rx.recv() => {
                let Some(Request { command, responder }) = req else {
                    debug!("command queue closed, exiting IO task");
                    break Exit::Cancelled;
                };

                if let Err(refused) = ctx.hooks.admit(&command) {
                    debug!(command = %command, outcome = %refused, "command refused at dispatch");
                    ctx.finish(responder, refused);
                    continue;
                }

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    outcome = execute(&mut *transport, &command, &ctx) => Some(outcome),
                };
                if let Some(outcome) = &outcome {
                    ctx.hooks.settled(&command, outcome);
                }

                match outcome {
                    None => {
                        debug!(command = %command, "in-flight command cancelled");
                        ctx.finish(responder, CommandOutcome::cancelled());
                        break Exit::Cancelled;
                    }
                    Some(CommandOutcome::TransportError(reason)) => {
                        ctx.finish(responder, CommandOutcome::TransportError(reason.clone()));
                        break Exit::Failed(reason);
                    }
                    Some(outcome) => {
                        debug!(command = %command, outcome = %outcome, "command resolved");
                        ctx.finish(responder, outcome);
                    }
                }
            }

            // Idle: anything arriving now answers nobody.
            result = async {
                let mut buf = [0u8; MAX_REPLY];
                transport.receive(&mut buf, IDLE_POLL).await.map(|n| buf[..n].to_vec())
            } => {
                match result {
                    Ok(datagram) => ctx.late_reply(&datagram),
                    Err(Error::Timeout) => {}
                    Err(e) => break Exit::Failed(e.to_string()),
                }
            }
        }
    };

    // Resolve whatever is still queued, then release the socket.
    rx.close();
    let leftover = match &exit {
        Exit::Cancelled => CommandOutcome::cancelled(),
        Exit::Failed(reason) => {
            ctx.fault(reason);
            CommandOutcome::TransportError(reason.clone())
        }
    };
    while let Ok(Request { responder, .. }) = rx.try_recv() {
        ctx.finish(responder, leftover.clone());
    }
    let _ = transport.close().await;
    debug!("command IO task exited");
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

/// Run one command to completion: drain, send, wait, retry.
async fn execute(
    transport: &mut dyn DatagramTransport,
    command: &Command,
    ctx: &IoContext,
) -> CommandOutcome {
    let wire = command.to_wire();
    let mut buf = [0u8; MAX_REPLY];

    // Stale datagrams belong to an earlier exchange.
    loop {
        match transport.receive(&mut buf, Duration::ZERO).await {
            Ok(n) => ctx.late_reply(&buf[..n]),
            Err(Error::Timeout) => break,
            Err(e) => return CommandOutcome::TransportError(e.to_string()),
        }
    }

    for attempt in 0..=ctx.config.retries {
        if attempt > 0 {
            ctx.stats.retries.fetch_add(1, Ordering::Relaxed);
            debug!(command = %command, attempt, "no reply, resending");
        }

        if let Err(e) = transport.send(&wire).await {
            return CommandOutcome::TransportError(e.to_string());
        }
        ctx.touch();
        ctx.stats.sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(command = %command, attempt, "command sent");

        match transport.receive(&mut buf, ctx.config.command_timeout).await {
            Ok(n) => {
                let reply = protocol::decode_reply(&buf[..n]);
                tracing::trace!(command = %command, reply = ?reply, "reply received");
                return protocol::outcome_for(command.kind(), reply);
            }
            Err(Error::Timeout) => continue,
            Err(e) => return CommandOutcome::TransportError(e.to_string()),
        }
    }

    ctx.stats.timeouts.fetch_add(1, Ordering::Relaxed);
    debug!(
        command = %command,
        attempts = ctx.config.retries + 1,
        "command timed out"
    );
    CommandOutcome::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Verb;
    use tello_test_harness::MockTransport;

    fn config() -> IoConfig {
        IoConfig {
            command_timeout: Duration::from_secs(7),
            retries: 2,
            queue_depth: 16,
            policy: QueuePolicy::Fifo,
        }
    }

    /// Dispatches everything and records what settled.
    #[derive(Default)]
    struct Recorder {
        refuse: Mutex<Option<Verb>>,
        settled: Mutex<Vec<String>>,
    }

    impl DispatchHooks for Recorder {
        fn admit(&self, command: &Command) -> Result<(), CommandOutcome> {
            match *self.refuse.lock().unwrap() {
                Some(verb) if verb == command.verb() => Err(CommandOutcome::invalid_state()),
                _ => Ok(()),
            }
        }

        fn settled(&self, command: &Command, _outcome: &CommandOutcome) {
            self.settled.lock().unwrap().push(command.to_string());
        }
    }

    fn spawn_hooked(
        mock: MockTransport,
        config: IoConfig,
        hooks: Arc<Recorder>,
    ) -> (CommandChannel, mpsc::UnboundedReceiver<Fault>) {
        let (event_tx, _) = broadcast::channel(16);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        (
            spawn_command_channel(Box::new(mock), config, hooks, event_tx, fault_tx),
            fault_rx,
        )
    }

    fn spawn(
        mock: MockTransport,
        config: IoConfig,
    ) -> (CommandChannel, mpsc::UnboundedReceiver<Fault>) {
        spawn_hooked(mock, config, Arc::new(Recorder::default()))
    }

    #[tokio::test]
    async fn ok_reply_resolves_ok_empty() {
        let mut mock = MockTransport::new();
        mock.expect(b"command", b"ok");
        let (io, _faults) = spawn(mock, config());

        assert_eq!(
            io.submit(Command::command()).await,
            CommandOutcome::Ok(String::new())
        );
        io.shutdown().await;
    }

    #[tokio::test]
    async fn read_reply_resolves_value() {
        let mut mock = MockTransport::new();
        mock.expect(b"battery?", b"87\r\n");
        let (io, _faults) = spawn(mock, config());

        assert_eq!(
            io.submit(Command::read_battery()).await,
            CommandOutcome::Ok("87".into())
        );
        io.shutdown().await;
    }

    #[tokio::test]
    async fn error_reply_resolves_rejected() {
        let mut mock = MockTransport::new();
        mock.expect(b"takeoff", b"error Motor stop");
        let (io, _faults) = spawn(mock, config());

        assert_eq!(
            io.submit(Command::takeoff()).await,
            CommandOutcome::Rejected("Motor stop".into())
        );
        io.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_refusal_is_never_sent() {
        let mut mock = MockTransport::new();
        mock.expect(b"battery?", b"87");
        let log = mock.sent_log();
        let hooks = Arc::new(Recorder::default());
        *hooks.refuse.lock().unwrap() = Some(Verb::Takeoff);
        let (io, _faults) = spawn_hooked(mock, config(), Arc::clone(&hooks));

        let (takeoff, battery) = tokio::join!(
            io.submit(Command::takeoff()),
            io.submit(Command::read_battery()),
        );
        assert_eq!(takeoff, CommandOutcome::invalid_state());
        assert_eq!(battery, CommandOutcome::Ok("87".into()));
        assert_eq!(log.commands(), vec!["battery?"]);
        assert_eq!(*hooks.settled.lock().unwrap(), vec!["battery?".to_string()]);
        assert_eq!(io.outstanding(), 0);
        io.shutdown().await;
    }

    #[tokio::test]
    async fn settled_runs_before_the_caller_resumes() {
        let mut mock = MockTransport::new();
        mock.expect(b"takeoff", b"ok");
        let hooks = Arc::new(Recorder::default());
        let (io, _faults) = spawn_hooked(mock, config(), Arc::clone(&hooks));

        assert!(io.submit(Command::takeoff()).await.is_ok());
        assert_eq!(*hooks.settled.lock().unwrap(), vec!["takeoff".to_string()]);
        io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn last_activity_tracks_the_latest_send() {
        let mut mock = MockTransport::new();
        mock.expect(b"land", b"");
        mock.expect(b"land", b"ok");
        let (io, _faults) = spawn(mock, config());
        let sender = io.sender();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(sender.is_idle_for(Duration::from_secs(3)));

        let start = Instant::now();
        assert!(sender.submit(Command::land()).await.is_ok());
        // The retry went out one timeout after the first attempt.
        assert_eq!(sender.last_activity(), start + Duration::from_secs(7));
        assert!(!sender.is_idle_for(Duration::from_secs(1)));
        io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_retries_exactly_the_budget() {
        let mut mock = MockTransport::new();
        for _ in 0..3 {
            mock.expect(b"takeoff", b"");
        }
        let log = mock.sent_log();
        let (io, _faults) = spawn(mock, config());

        let start = Instant::now();
        let outcome = io.submit(Command::takeoff()).await;
        let elapsed = start.elapsed();

        assert_eq!(outcome, CommandOutcome::TimedOut);
        assert_eq!(log.commands(), vec!["takeoff", "takeoff", "takeoff"]);
        assert!(elapsed <= Duration::from_secs(21), "took {elapsed:?}");
        assert!(elapsed >= Duration::from_secs(21) - Duration::from_millis(1));

        let stats = io.stats();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.timeouts, 1);
        io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_second_attempt() {
        let mut mock = MockTransport::new();
        mock.expect(b"land", b"");
        mock.expect(b"land", b"ok");
        let (io, _faults) = spawn(mock, config());

        assert!(io.submit(Command::land()).await.is_ok());
        assert_eq!(io.stats().retries, 1);
        io.shutdown().await;
    }

    #[tokio::test]
    async fn outcomes_follow_submission_order() {
        let mut mock = MockTransport::new();
        mock.expect(b"command", b"ok");
        mock.expect(b"battery?", b"87");
        mock.expect(b"speed?", b"100.0");
        mock.expect(b"time?", b"0s");
        let (io, _faults) = spawn(mock, config());

        let (a, b, c, d) = tokio::join!(
            io.submit(Command::command()),
            io.submit(Command::read_battery()),
            io.submit(Command::read_speed()),
            io.submit(Command::read_time()),
        );
        assert_eq!(a, CommandOutcome::Ok(String::new()));
        assert_eq!(b, CommandOutcome::Ok("87".into()));
        assert_eq!(c, CommandOutcome::Ok("100.0".into()));
        assert_eq!(d, CommandOutcome::Ok("0s".into()));
        io.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_reply_is_not_delivered_to_next_command() {
        let mut mock = MockTransport::new();
        mock.expect_replies(b"battery?", &[b"87".to_vec(), b"87".to_vec()]);
        mock.expect(b"speed?", b"100.0");
        let (io, _faults) = spawn(mock, config());

        assert_eq!(
            io.submit(Command::read_battery()).await,
            CommandOutcome::Ok("87".into())
        );
        assert_eq!(
            io.submit(Command::read_speed()).await,
            CommandOutcome::Ok("100.0".into())
        );
        assert_eq!(io.stats().late_replies, 1);
        io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_datagram_is_discarded() {
        let mut mock = MockTransport::new();
        mock.push_datagram(b"ok");
        mock.expect(b"battery?", b"55");
        let (event_tx, mut events) = broadcast::channel(16);
        let (fault_tx, _faults) = mpsc::unbounded_channel();
        let hooks = Arc::new(Recorder::default());
        let io = spawn_command_channel(Box::new(mock), config(), hooks, event_tx, fault_tx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::UnsolicitedReply { reply: "ok".into() }
        );
        assert_eq!(
            io.submit(Command::read_battery()).await,
            CommandOutcome::Ok("55".into())
        );
        io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn busy_policy_rejects_second_submission() {
        let mut mock = MockTransport::new();
        mock.expect(b"takeoff", b"");
        mock.expect(b"takeoff", b"ok");
        let mut cfg = config();
        cfg.policy = QueuePolicy::RejectWhenBusy;
        let (io, _faults) = spawn(mock, cfg);

        let (first, second) = tokio::join!(io.submit(Command::takeoff()), async {
            tokio::task::yield_now().await;
            io.submit(Command::read_battery()).await
        });
        assert!(first.is_ok());
        assert_eq!(second, CommandOutcome::busy());
        io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queue_overflow_rejects() {
        let mut mock = MockTransport::new();
        mock.expect(b"takeoff", b"");
        let mut cfg = config();
        cfg.queue_depth = 1;
        cfg.retries = 0;
        let (io, _faults) = spawn(mock, cfg);

        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            let tx = tx.clone();
            io.submit_with(Command::takeoff(), move |o| {
                let _ = tx.send(o);
            });
        }
        // Queue holds one; the IO task may or may not have taken the first yet.
        let first = rx.recv().await.unwrap();
        assert_eq!(first, CommandOutcome::queue_full());
        io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_and_queued() {
        let mut mock = MockTransport::new();
        mock.expect(b"takeoff", b"");
        let (io, _faults) = spawn(mock, config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        for cmd in [Command::takeoff(), Command::read_battery()] {
            let tx = tx.clone();
            io.submit_with(cmd, move |o| {
                let _ = tx.send(o);
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        io.shutdown().await;

        assert_eq!(rx.try_recv().unwrap(), CommandOutcome::cancelled());
        assert_eq!(rx.try_recv().unwrap(), CommandOutcome::cancelled());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_not_connected() {
        let mock = MockTransport::new();
        let (io, _faults) = spawn(mock, config());
        io.abort();
        while io.is_running() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            io.submit(Command::command()).await,
            CommandOutcome::not_connected()
        );
        io.shutdown().await;
    }

    #[tokio::test]
    async fn transport_failure_reports_fault() {
        let mut mock = MockTransport::new();
        mock.fail_with("network unreachable");
        let (io, mut faults) = spawn(mock, config());

        let outcome = io.submit(Command::command()).await;
        assert!(
            matches!(outcome, CommandOutcome::TransportError(ref r) if r.contains("network unreachable")),
            "got {outcome:?}"
        );
        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.channel, Channel::Command);

        // The channel is dead; later submissions are refused.
        assert!(!io.submit(Command::command()).await.is_ok());
        io.shutdown().await;
    }
}
