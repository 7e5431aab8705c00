//! Gateway session lifecycle.
//!
//! One actor task owns the transport handle and the state enum; every
//! lifecycle transition — connect, disconnect, reconnect, shutdown, inbound
//! transport events — is serialized through its command channel, so two
//! transports can never be active for the same session and overlapping
//! lifecycle calls cannot race each other.

use std::sync::Arc;
use strum::Display;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use url::Url;

use super::commands::{CommandFrame, CommandQueue};
use super::connector::{EndpointResolver, GatewayConnector, GatewayTransport, TransportEvent};
use crate::types::{ErrorKind, Result};

/// Close code for a locally initiated, orderly close
pub const CLOSE_NORMAL: u16 = 1000;
/// Distinguished close code used when the peer asked for the reconnect
pub const CLOSE_RECONNECT_REQUESTED: u16 = 4199;

/// Delay between early reconnect attempts
const SHORT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Delay once reconnecting has failed repeatedly
const LONG_RETRY_DELAY: Duration = Duration::from_secs(15);
/// Past this many attempts, a stale endpoint is treated as the likely cause:
/// the delay stretches and the endpoint is re-resolved before connecting
const RETRIES_BEFORE_RERESOLVE: u32 = 3;

/// Lifecycle state of a gateway session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    /// No transport; initial and terminal state
    Disconnected,
    /// A transport is being established
    Connecting,
    /// The transport is open
    Connected,
    /// A reconnect attempt is scheduled
    PendingReconnect,
}

/// Events emitted to the owner of the session
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// The transport opened. `resumed` tells the owner whether to replay
    /// missed events or re-identify from scratch; it reflects the cause of
    /// the preceding disconnect, not a decision made here.
    Open {
        /// Whether the previous session is being resumed
        resumed: bool,
    },
    /// An inbound frame; interpretation is up to higher-level dispatch
    Message(String),
    /// The connection closed, locally or by the peer
    Closed {
        /// Close code
        code: u16,
        /// Close reason, possibly empty
        reason: String,
    },
    /// The transport failed
    TransportError(String),
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Current lifecycle state
    pub state: SessionState,
    /// Reconnect attempts scheduled since the last successful connect
    pub retry_count: u32,
    /// Whether the next open resumes the previous session
    pub resume_requested: bool,
    /// Commands waiting for the transport to become ready
    pub queued_commands: usize,
    /// Resolved endpoint, if discovery has run
    pub endpoint: Option<Url>,
}

enum GatewayCmd {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reconnect: bool,
        resume: bool,
        server_requested: bool,
        reply: oneshot::Sender<()>,
    },
    Reconnect,
    Send(CommandFrame),
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a gateway session.
///
/// Cheap to use from any task; all operations are forwarded to the single
/// actor that owns the transport. Dropping the handle shuts the session
/// down.
#[derive(Debug)]
pub struct GatewaySession {
    cmd_tx: mpsc::UnboundedSender<GatewayCmd>,
    task: Option<JoinHandle<()>>,
}

impl GatewaySession {
    /// Spawn the connection actor for one session.
    ///
    /// `events` receives [`GatewayEvent`]s; the receiver side is owned by
    /// whatever drives higher-level event dispatch.
    #[must_use]
    pub fn spawn(
        resolver: Arc<dyn EndpointResolver>,
        connector: Arc<dyn GatewayConnector>,
        events: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            resolver,
            connector,
            events,
            cmd_rx,
            state: SessionState::Disconnected,
            endpoint: None,
            transport: None,
            queue: CommandQueue::default(),
            retry_count: 0,
            resume_requested: false,
            reconnect_at: None,
            reresolve_before_connect: false,
            active: true,
        };
        Self {
            cmd_tx,
            task: Some(tokio::spawn(connection.run())),
        }
    }

    /// Connect the session.
    ///
    /// Resolves the endpoint first if it has not been fetched yet.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::GatewayAlreadyConnected`] if a transport is
    /// already active or being established — this is a programming error and
    /// performs no transport action. Transient connect failures are returned
    /// too, but the session keeps retrying with backoff on its own.
    pub async fn connect(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(GatewayCmd::Connect { reply })
            .map_err(|_| ErrorKind::GatewayTaskExited)?;
        response.await.map_err(|_| ErrorKind::GatewayTaskExited)?
    }

    /// Close the transport.
    ///
    /// `server_requested` picks the distinguished close code so the peer can
    /// tell an orderly client close from one it asked for. `resume` records
    /// whether the next open should resume the session; it is decided by the
    /// caller from the disconnect cause. When `reconnect` is set, a
    /// reconnect is scheduled immediately after the close.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::GatewayTaskExited`] if the session is shut down.
    pub async fn disconnect(
        &self,
        reconnect: bool,
        resume: bool,
        server_requested: bool,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(GatewayCmd::Disconnect {
                reconnect,
                resume,
                server_requested,
                reply,
            })
            .map_err(|_| ErrorKind::GatewayTaskExited)?;
        response.await.map_err(|_| ErrorKind::GatewayTaskExited)
    }

    /// Schedule a reconnect. No-op unless the session is disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::GatewayTaskExited`] if the session is shut down.
    pub fn reconnect(&self) -> Result<()> {
        self.cmd_tx
            .send(GatewayCmd::Reconnect)
            .map_err(|_| ErrorKind::GatewayTaskExited)
    }

    /// Send a command frame over the transport.
    ///
    /// Frames submitted while the transport is not ready are queued in order
    /// and flushed on the next open.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::GatewayTaskExited`] if the session is shut down.
    pub fn send(&self, frame: CommandFrame) -> Result<()> {
        self.cmd_tx
            .send(GatewayCmd::Send(frame))
            .map_err(|_| ErrorKind::GatewayTaskExited)
    }

    /// Current state of the session
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::GatewayTaskExited`] if the session is shut down.
    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(GatewayCmd::Snapshot { reply })
            .map_err(|_| ErrorKind::GatewayTaskExited)?;
        response.await.map_err(|_| ErrorKind::GatewayTaskExited)
    }

    /// Unconditional disconnect with no reconnect; terminal.
    pub async fn shutdown(mut self) {
        let (reply, response) = oneshot::channel();
        if self.cmd_tx.send(GatewayCmd::Shutdown { reply }).is_ok() {
            let _ = response.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        // Best-effort shutdown signal
        let (reply, _response) = oneshot::channel();
        let _ = self.cmd_tx.send(GatewayCmd::Shutdown { reply });
    }
}

/// What woke the actor
enum Tick {
    Cmd(Option<GatewayCmd>),
    Inbound(Option<TransportEvent>),
    ReconnectDue,
}

/// The actor owning one session's transport and state
struct Connection {
    resolver: Arc<dyn EndpointResolver>,
    connector: Arc<dyn GatewayConnector>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    cmd_rx: mpsc::UnboundedReceiver<GatewayCmd>,
    state: SessionState,
    endpoint: Option<Url>,
    transport: Option<Box<dyn GatewayTransport>>,
    queue: CommandQueue,
    retry_count: u32,
    resume_requested: bool,
    /// Deadline of the scheduled reconnect attempt, if one is pending
    reconnect_at: Option<Instant>,
    reresolve_before_connect: bool,
    active: bool,
}

impl Connection {
    async fn run(mut self) {
        while self.active {
            let tick = {
                let cmd_rx = &mut self.cmd_rx;
                let transport = &mut self.transport;
                let reconnect_at = self.reconnect_at;
                tokio::select! {
                    cmd = cmd_rx.recv() => Tick::Cmd(cmd),
                    event = async {
                        match transport.as_mut() {
                            Some(transport) => transport.next_event().await,
                            None => std::future::pending().await,
                        }
                    } => Tick::Inbound(event),
                    () = async {
                        match reconnect_at {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    } => Tick::ReconnectDue,
                }
            };

            match tick {
                // Every handle is gone; nothing can drive this session
                Tick::Cmd(None) => break,
                Tick::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                Tick::Inbound(None) => {
                    self.handle_closed(1006, "connection reset".to_string()).await;
                }
                Tick::Inbound(Some(TransportEvent::Message(text))) => {
                    self.emit(GatewayEvent::Message(text));
                }
                Tick::Inbound(Some(TransportEvent::Closed { code, reason })) => {
                    self.handle_closed(code, reason).await;
                }
                Tick::Inbound(Some(TransportEvent::Error(message))) => {
                    self.handle_transport_failure(message);
                }
                Tick::ReconnectDue => self.run_scheduled_reconnect().await,
            }
        }
    }

    async fn handle_command(&mut self, cmd: GatewayCmd) {
        match cmd {
            GatewayCmd::Connect { reply } => {
                let result = self.connect_requested().await;
                let _ = reply.send(result);
            }
            GatewayCmd::Disconnect {
                reconnect,
                resume,
                server_requested,
                reply,
            } => {
                self.disconnect(reconnect, resume, server_requested).await;
                let _ = reply.send(());
            }
            GatewayCmd::Reconnect => self.begin_reconnect(),
            GatewayCmd::Send(frame) => self.send_or_queue(frame).await,
            GatewayCmd::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            GatewayCmd::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn connect_requested(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                // Calling connect on a running session is a programming
                // error: fail loudly, touch nothing
                return Err(ErrorKind::GatewayAlreadyConnected);
            }
            SessionState::PendingReconnect => {
                // A manual connect overrides the scheduled attempt
                self.reconnect_at = None;
                self.state = SessionState::Disconnected;
            }
            SessionState::Disconnected => {}
        }

        // A user-initiated connect starts a fresh session
        self.resume_requested = false;
        let result = self.attempt_connect().await;
        if result.is_err() {
            self.begin_reconnect();
        }
        result
    }

    /// Establish the transport, resolving the endpoint first if needed
    async fn attempt_connect(&mut self) -> Result<()> {
        if self.reresolve_before_connect {
            self.endpoint = None;
            self.reresolve_before_connect = false;
        }
        if self.endpoint.is_none() {
            match self.resolver.resolve().await {
                Ok(url) => self.endpoint = Some(url),
                Err(e) => {
                    log::warn!("Gateway endpoint resolution failed: {e}");
                    self.state = SessionState::Disconnected;
                    return Err(e);
                }
            }
        }
        let url = self.endpoint.clone().expect("endpoint resolved above");

        self.state = SessionState::Connecting;
        log::debug!("Connecting to gateway at {url}");
        match self.connector.connect(&url).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state = SessionState::Connected;
                self.retry_count = 0;
                let resumed = self.resume_requested;
                log::info!("Gateway connected (resume: {resumed})");
                self.emit(GatewayEvent::Open { resumed });
                self.flush_queue().await;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                self.emit(GatewayEvent::TransportError(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self, reconnect: bool, resume: bool, server_requested: bool) {
        self.resume_requested = resume;
        // Cancel any scheduled reconnect attempt. The retry counter is not
        // rolled back: a cancelled attempt still counts.
        self.reconnect_at = None;

        if self.state == SessionState::Disconnected {
            self.transport = None;
            return;
        }

        if let Some(mut transport) = self.transport.take() {
            let (code, reason) = if server_requested {
                (CLOSE_RECONNECT_REQUESTED, "reconnect requested by server")
            } else {
                (CLOSE_NORMAL, "client disconnecting")
            };
            transport.close(code, reason).await;
            self.emit(GatewayEvent::Closed {
                code,
                reason: reason.to_string(),
            });
        }
        self.state = SessionState::Disconnected;
        log::debug!("Gateway disconnected (reconnect: {reconnect}, resume: {resume})");

        if reconnect {
            self.begin_reconnect();
        }
    }

    /// Schedule the next reconnect attempt.
    ///
    /// The first attempt after a successful session connects on the next
    /// scheduling opportunity; later attempts back off 1 s, then 15 s once
    /// more than [`RETRIES_BEFORE_RERESOLVE`] have been scheduled — at which
    /// point the endpoint is also re-resolved before connecting.
    fn begin_reconnect(&mut self) {
        if !self.active || self.state != SessionState::Disconnected {
            return;
        }
        self.state = SessionState::PendingReconnect;

        let attempt = self.retry_count;
        // The counter advances when the attempt is scheduled, not when its
        // timer fires
        self.retry_count += 1;

        if attempt == 0 {
            self.reconnect_at = Some(Instant::now());
            return;
        }

        let delay = if attempt <= RETRIES_BEFORE_RERESOLVE {
            SHORT_RETRY_DELAY
        } else {
            LONG_RETRY_DELAY
        };
        self.reresolve_before_connect = attempt > RETRIES_BEFORE_RERESOLVE;
        log::warn!(
            "Attempting to reconnect to the gateway in {}s [retry={attempt}]",
            delay.as_secs()
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn run_scheduled_reconnect(&mut self) {
        self.reconnect_at = None;
        if self.state != SessionState::PendingReconnect {
            return;
        }
        self.state = SessionState::Disconnected;
        if self.attempt_connect().await.is_err() {
            self.begin_reconnect();
        }
    }

    /// A close initiated by the peer (or the transport dying underneath us).
    /// The close code decides whether to reconnect and whether the next
    /// session resumes.
    async fn handle_closed(&mut self, code: u16, reason: String) {
        log::debug!("Gateway closed by peer: {code} {reason}");
        self.transport = None;
        self.state = SessionState::Disconnected;
        self.emit(GatewayEvent::Closed { code, reason });

        let (reconnect, resume) = match code {
            // Orderly close: the session is over
            CLOSE_NORMAL => (false, false),
            // Anything else is abnormal; come back and replay missed events
            _ => (true, true),
        };
        self.resume_requested = resume;
        if reconnect {
            self.begin_reconnect();
        }
    }

    fn handle_transport_failure(&mut self, message: String) {
        log::warn!("Gateway transport error: {message}");
        self.transport = None;
        self.state = SessionState::Disconnected;
        self.resume_requested = true;
        self.emit(GatewayEvent::TransportError(message));
        self.begin_reconnect();
    }

    async fn send_or_queue(&mut self, frame: CommandFrame) {
        if self.state == SessionState::Connected {
            self.send_now(frame).await;
        } else {
            self.queue.enqueue(frame);
        }
    }

    /// Send one frame over the open transport. On failure the frame goes
    /// back to the head of the queue and the connection enters the failure
    /// path. Returns whether the send went through.
    async fn send_now(&mut self, frame: CommandFrame) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            self.queue.enqueue(frame);
            return false;
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Dropping unserializable gateway command: {e}");
                return true;
            }
        };
        log::debug!("Sending gateway command op {}", frame.op);
        match transport.send(text).await {
            Ok(()) => true,
            Err(e) => {
                self.queue.requeue_front(frame);
                self.handle_transport_failure(e.to_string());
                false
            }
        }
    }

    /// Drain commands buffered while the transport was down
    async fn flush_queue(&mut self) {
        while self.state == SessionState::Connected {
            let Some(frame) = self.queue.dequeue() else {
                break;
            };
            if !self.send_now(frame).await {
                break;
            }
        }
    }

    async fn shutdown(&mut self) {
        log::debug!("Shutting down gateway session");
        self.disconnect(false, false, false).await;
        self.queue.clear();
        self.active = false;
    }

    fn emit(&self, event: GatewayEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Gateway event receiver dropped");
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            retry_count: self.retry_count,
            resume_requested: self.resume_requested,
            queued_commands: self.queue.len(),
            endpoint: self.endpoint.clone(),
        }
    }
}
