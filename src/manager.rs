//! Connection manager.
//!
//! One tokio task owns the link, the reconnection policy, the keepalive
//! timers and the outbound queue. Callers talk to it through a cloneable
//! [`ManagerHandle`]; every input (caller command, link event, timer
//! deadline) is handled to completion before the next one is looked at, so
//! the state below is never observed half-updated. Connect attempts run in
//! their own task and report back as one more input, so commands are still
//! served while a handshake is in flight.
//!
//! ```text
//!            connect()                    open
//!   Idle ───────────────▶ Connecting ─────────────▶ Connected
//!    ▲                     ▲      │                   │
//!    │ disconnect()        │      │ error / abnormal  │ error / abnormal close
//!    │ clean close         │      ▼  close            │ missed pong
//!    │                  backoff  Waiting ◀────────────┘
//!    │                  elapsed   │
//!    │                            │ attempts == max
//!    └────────────────────────────┴──────▶ GivenUp
//! ```

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::{Backoff, PolicyPhase, ReconnectPolicy};
use crate::dispatcher::{self, Dispatched};
use crate::errors::{ConnectionError, TransportError};
use crate::protocol::OutboundFrame;
use crate::queue::{OutboundQueue, PendingMessage, PendingSink};
use crate::session::{SessionId, session_endpoint};
use crate::store::{AppStore, ChatMessage, ErrorNotice, MessageStatus, Role};
use crate::timers::{TimerKind, TimerRegistry};
use crate::transport::{
    CLOSE_KEEPALIVE_TIMEOUT, CLOSE_NORMAL, Connector, Link, LinkEvent,
};

const COMMAND_BUFFER: usize = 64;

/// Connection state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Base URL; the session path is appended per connect.
    pub endpoint: String,
    pub policy: ReconnectPolicy,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8087".to_string(),
            policy: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Snapshot of the manager, published after every handled input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub phase: PolicyPhase,
    pub attempts: u32,
    pub max_attempts: u32,
    pub session_id: String,
    pub endpoint: String,
    pub queued: usize,
    pub pending_timers: usize,
}

/// How a chat message left the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReceipt {
    Sent { id: String },
    /// Held until the next successful open.
    Queued { id: String },
}

impl SendReceipt {
    pub fn id(&self) -> &str {
        match self {
            SendReceipt::Sent { id } | SendReceipt::Queued { id } => id,
        }
    }
}

enum Command {
    Connect {
        endpoint: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<()>,
    },
    SendMessage {
        content: String,
        project_id: Option<String>,
        reply: oneshot::Sender<Result<SendReceipt, ConnectionError>>,
    },
    SendProjectAction {
        action: String,
        payload: Value,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ManagerHandle {
    /// Open a link to the configured endpoint. Returns once the attempt
    /// has either opened or failed (and been handed to the backoff policy).
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Connect {
            endpoint: None,
            reply,
        })
        .await
    }

    /// Like [`connect`](Self::connect) but against another base URL. A
    /// no-op when already connected to that endpoint.
    pub async fn connect_to(&self, endpoint: impl Into<String>) -> Result<(), ConnectionError> {
        let endpoint = endpoint.into();
        self.request(|reply| Command::Connect {
            endpoint: Some(endpoint),
            reply,
        })
        .await
    }

    /// Close with code 1000, cancel every timer, drop the queue and stop
    /// reconnecting until the next explicit connect. A connect attempt still
    /// in flight is abandoned; its link is never used.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Tear down and connect again with a fresh attempt counter. Returns
    /// once the new attempt has opened or failed.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    pub async fn send_message(
        &self,
        content: impl Into<String>,
        project_id: Option<String>,
    ) -> Result<SendReceipt, ConnectionError> {
        let content = content.into();
        self.request(|reply| Command::SendMessage {
            content,
            project_id,
            reply,
        })
        .await?
    }

    /// Project actions are never queued.
    pub async fn send_project_action(
        &self,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<(), ConnectionError> {
        let action = action.into();
        self.request(|reply| Command::SendProjectAction {
            action,
            payload,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<ConnectionStatus, ConnectionError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Disconnect and stop the manager task.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ConnectionError::ManagerStopped)?;
        rx.await.map_err(|_| ConnectionError::ManagerStopped)
    }
}

pub struct ConnectionManager {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    store: Arc<dyn AppStore>,
    session: SessionId,
    endpoint: String,
    link: Option<Box<dyn Link>>,
    connecting: Option<PendingConnect>,
    /// Callers of connect/reconnect waiting for the attempt to resolve.
    connect_waiters: Vec<oneshot::Sender<()>>,
    /// Endpoint the current link was opened against.
    linked_endpoint: Option<String>,
    state: ConnectionState,
    phase: PolicyPhase,
    backoff: Backoff,
    timers: TimerRegistry,
    queue: OutboundQueue,
    /// Set by a manual disconnect; blocks every automatic reconnect.
    suppressed: bool,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn AppStore>,
    ) -> Self {
        let session = SessionId::generate();
        let endpoint = config.endpoint.clone();
        let backoff = Backoff::new(config.policy.clone());
        let (status_tx, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            phase: PolicyPhase::Idle,
            attempts: 0,
            max_attempts: config.policy.max_attempts,
            session_id: session.to_string(),
            endpoint: endpoint.clone(),
            queued: 0,
            pending_timers: 0,
        });
        Self {
            config,
            connector,
            store,
            session,
            endpoint,
            link: None,
            connecting: None,
            connect_waiters: Vec::new(),
            linked_endpoint: None,
            state: ConnectionState::Disconnected,
            phase: PolicyPhase::Idle,
            backoff,
            timers: TimerRegistry::new(),
            queue: OutboundQueue::new(),
            suppressed: false,
            status_tx,
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = session;
        self.publish_status();
        self
    }

    /// Spawn the manager task. It runs until [`ManagerHandle::shutdown`] or
    /// until every handle is dropped.
    pub fn start(self) -> ManagerHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let status = self.status_tx.subscribe();
        tokio::spawn(self.run(rx));
        ManagerHandle {
            commands: tx,
            status,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::debug!(session_id = %self.session, "Connection manager started");
        loop {
            let deadline = self.timers.next();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.disconnect().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                event = next_link_event(&mut self.link) => self.handle_link_event(event).await,
                (url, outcome) = connect_outcome(&mut self.connecting) => {
                    self.handle_connect_outcome(url, outcome).await
                }
                kind = wait_for_deadline(deadline) => self.handle_timer(kind).await,
            }
            self.publish_status();
        }
        tracing::debug!(session_id = %self.session, "Connection manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { endpoint, reply } => {
                self.connect_waiters.push(reply);
                self.connect(endpoint).await;
                if self.connecting.is_none() {
                    self.release_connect_waiters();
                }
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Reconnect { reply } => {
                tracing::info!("Manual reconnect requested");
                self.suppressed = false;
                self.backoff.reset();
                self.timers.cancel(TimerKind::Backoff);
                self.connect_waiters.push(reply);
                self.open_link().await;
            }
            Command::SendMessage {
                content,
                project_id,
                reply,
            } => {
                let result = self.send_message(content, project_id).await;
                let _ = reply.send(result);
            }
            Command::SendProjectAction {
                action,
                payload,
                reply,
            } => {
                let result = self.send_project_action(action, payload).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled in the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn connect(&mut self, endpoint: Option<String>) {
        let endpoint = endpoint.unwrap_or_else(|| self.endpoint.clone());
        if self.link.is_some() && self.linked_endpoint.as_deref() == Some(endpoint.as_str()) {
            tracing::debug!(endpoint = %endpoint, "Already connected");
            return;
        }
        if self.connecting.is_some() && self.endpoint == endpoint {
            tracing::debug!(endpoint = %endpoint, "Connect already in progress");
            return;
        }
        self.endpoint = endpoint;
        self.suppressed = false;
        if self.phase == PolicyPhase::GivenUp {
            self.backoff.reset();
        }
        self.open_link().await;
    }

    async fn disconnect(&mut self) {
        self.suppressed = true;
        self.abort_connect();
        self.timers.clear();
        self.teardown_link(CLOSE_NORMAL, "Client disconnect").await;
        for pending in self.queue.iter() {
            self.store.update_chat_status(&pending.id, MessageStatus::Error);
        }
        self.queue.clear();
        self.backoff.reset();
        self.phase = PolicyPhase::Idle;
        self.set_state(ConnectionState::Disconnected);
        self.release_connect_waiters();
        tracing::info!("Disconnected by client");
    }

    fn abort_connect(&mut self) {
        if let Some(pending) = self.connecting.take() {
            pending.task.abort();
            tracing::debug!(url = %pending.url, "Abandoned connect attempt");
        }
    }

    fn release_connect_waiters(&mut self) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Close and drop the current link, if any. Events from it are never
    /// observed afterwards.
    async fn teardown_link(&mut self, code: u16, reason: &str) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close(code, reason).await {
                tracing::debug!(error = %e, "Error while closing link");
            }
        }
        self.linked_endpoint = None;
        self.timers.clear_keepalive();
    }

    /// Start a connect attempt. Its result arrives through
    /// [`connect_outcome`] in the run loop.
    async fn open_link(&mut self) {
        self.abort_connect();
        self.teardown_link(CLOSE_NORMAL, "Reconnecting").await;
        self.timers.cancel(TimerKind::Backoff);
        self.phase = PolicyPhase::Connecting;
        self.set_state(ConnectionState::Connecting);

        let url = session_endpoint(&self.endpoint, &self.session);
        tracing::info!(
            url = %url,
            attempt = self.backoff.attempts(),
            "Connecting to conversational engine"
        );
        let connector = self.connector.clone();
        let target = url.clone();
        let task = tokio::spawn(async move { connector.connect(&target).await });
        self.connecting = Some(PendingConnect { url, task });
    }

    async fn handle_connect_outcome(
        &mut self,
        url: String,
        outcome: Result<Box<dyn Link>, TransportError>,
    ) {
        match outcome {
            Ok(link) => self.on_open(link).await,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Connection attempt failed");
                self.on_link_lost(false).await;
            }
        }
        self.release_connect_waiters();
    }

    async fn on_open(&mut self, link: Box<dyn Link>) {
        self.link = Some(link);
        self.linked_endpoint = Some(self.endpoint.clone());
        self.backoff.reset();
        self.phase = PolicyPhase::Connected;
        self.set_state(ConnectionState::Connected);
        self.timers
            .set(TimerKind::Ping, Instant::now() + self.config.ping_interval);
        tracing::info!(session_id = %self.session, "Connected to conversational engine");

        if self.queue.is_empty() {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let mut sink = LinkSink {
            link,
            session: &self.session,
        };
        let report = self.queue.flush(&mut sink).await;
        for id in &report.sent {
            self.store.update_chat_status(id, MessageStatus::Sent);
        }
        tracing::info!(
            sent = report.sent.len(),
            remaining = report.remaining,
            "Flushed queued messages"
        );
    }

    /// The link failed, closed abnormally, missed a pong, or never opened.
    async fn on_link_lost(&mut self, was_open: bool) {
        self.link = None;
        self.linked_endpoint = None;
        self.timers.clear_keepalive();
        self.set_state(ConnectionState::Error);

        if self.suppressed {
            self.phase = PolicyPhase::Idle;
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        if was_open {
            self.store.notify_error(ErrorNotice::transient(
                "Connection lost. Attempting to reconnect...",
            ));
        }
        match self.backoff.next_delay() {
            Some(delay) => {
                self.phase = PolicyPhase::Waiting;
                self.timers.set(TimerKind::Backoff, Instant::now() + delay);
                tracing::info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.backoff.attempts(),
                    max_attempts = self.backoff.policy().max_attempts,
                    "Scheduling reconnect"
                );
            }
            None => {
                self.phase = PolicyPhase::GivenUp;
                tracing::error!(
                    attempts = self.backoff.attempts(),
                    "Giving up on reconnecting to conversational engine"
                );
                self.store.notify_error(ErrorNotice::persistent(
                    "Failed to reconnect. Cannot connect to the conversational engine.",
                ));
            }
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(raw) => match dispatcher::dispatch_frame(&raw, self.store.as_ref()) {
                Dispatched::Pong => {
                    tracing::debug!("Pong received");
                    self.timers.cancel(TimerKind::PongTimeout);
                }
                Dispatched::SessionConfirmed(Some(id)) if id != self.session.as_str() => {
                    tracing::info!(session_id = %id, "Engine assigned session id");
                    self.session = SessionId::from(id);
                }
                Dispatched::SessionConfirmed(_) | Dispatched::Applied | Dispatched::Ignored => {}
            },
            LinkEvent::Closed { code, reason } if code == CLOSE_NORMAL => {
                tracing::info!(code, reason = %reason, "Engine closed the connection");
                self.link = None;
                self.linked_endpoint = None;
                self.timers.clear();
                self.backoff.reset();
                self.phase = PolicyPhase::Idle;
                self.set_state(ConnectionState::Disconnected);
            }
            LinkEvent::Closed { code, reason } => {
                tracing::warn!(code, reason = %reason, "Connection closed abnormally");
                self.on_link_lost(true).await;
            }
            LinkEvent::Error(detail) => {
                tracing::warn!(error = %detail, "Connection error");
                self.on_link_lost(true).await;
            }
        }
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        if !self.timers.take(kind) {
            return;
        }
        match kind {
            TimerKind::Backoff => self.open_link().await,
            TimerKind::Ping => self.send_ping().await,
            TimerKind::PongTimeout => {
                tracing::warn!(
                    timeout_ms = self.config.pong_timeout.as_millis() as u64,
                    "No pong received, closing connection"
                );
                if let Some(mut link) = self.link.take() {
                    if let Err(e) = link.close(CLOSE_KEEPALIVE_TIMEOUT, "Keepalive timeout").await {
                        tracing::debug!(error = %e, "Error while closing link");
                    }
                }
                self.on_link_lost(true).await;
            }
        }
    }

    async fn send_ping(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let frame = match OutboundFrame::Ping.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode ping");
                return;
            }
        };
        if let Err(e) = link.send(frame).await {
            tracing::warn!(error = %e, "Ping failed");
            self.on_link_lost(true).await;
            return;
        }
        let now = Instant::now();
        self.timers
            .set(TimerKind::PongTimeout, now + self.config.pong_timeout);
        self.timers
            .set(TimerKind::Ping, now + self.config.ping_interval);
    }

    async fn send_message(
        &mut self,
        content: String,
        project_id: Option<String>,
    ) -> Result<SendReceipt, ConnectionError> {
        let id = format!("msg-{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now();
        self.store.append_chat(ChatMessage {
            id: id.clone(),
            role: Role::User,
            content: content.clone(),
            timestamp: now,
            status: MessageStatus::Sending,
        });

        let Some(link) = self.link.as_mut() else {
            self.queue.enqueue(PendingMessage {
                id: id.clone(),
                content,
                project_id,
                enqueued_at: now,
            });
            self.store.notify_error(ErrorNotice::transient(
                "Not connected to server. Message queued.",
            ));
            tracing::debug!(message_id = %id, queued = self.queue.len(), "Message queued");
            return Ok(SendReceipt::Queued { id });
        };

        let frame = OutboundFrame::chat(content, project_id, self.session.clone());
        let sent = match frame.encode() {
            Ok(raw) => link.send(raw).await.map_err(ConnectionError::from),
            Err(e) => Err(ConnectionError::Encode(e)),
        };
        match sent {
            Ok(()) => {
                self.store.update_chat_status(&id, MessageStatus::Sent);
                Ok(SendReceipt::Sent { id })
            }
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "Failed to send message");
                self.store.update_chat_status(&id, MessageStatus::Error);
                self.store
                    .notify_error(ErrorNotice::transient("Failed to send message"));
                Err(e)
            }
        }
    }

    async fn send_project_action(
        &mut self,
        action: String,
        payload: Value,
    ) -> Result<(), ConnectionError> {
        let Some(link) = self.link.as_mut() else {
            self.store
                .notify_error(ErrorNotice::transient("Not connected to server"));
            return Err(ConnectionError::NotConnected);
        };
        let raw = OutboundFrame::project_action(action, payload, self.session.clone())
            .encode()
            .map_err(ConnectionError::Encode)?;
        if let Err(e) = link.send(raw).await {
            tracing::warn!(error = %e, "Failed to send project action");
            self.store
                .notify_error(ErrorNotice::transient("Failed to send project action"));
            return Err(e.into());
        }
        Ok(())
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.store.set_connection_state(state);
        self.publish_status();
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            phase: self.phase,
            attempts: self.backoff.attempts(),
            max_attempts: self.backoff.policy().max_attempts,
            session_id: self.session.to_string(),
            endpoint: self.endpoint.clone(),
            queued: self.queue.len(),
            pending_timers: self.timers.pending(),
        }
    }

    fn publish_status(&self) {
        let next = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Pending until the link reports something; forever when there is none.
async fn next_link_event(link: &mut Option<Box<dyn Link>>) -> LinkEvent {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

/// A connect attempt running in its own task.
struct PendingConnect {
    url: String,
    task: JoinHandle<Result<Box<dyn Link>, TransportError>>,
}

/// Resolves with the in-flight attempt's result and clears the slot;
/// pending forever when nothing is connecting.
async fn connect_outcome(
    pending: &mut Option<PendingConnect>,
) -> (String, Result<Box<dyn Link>, TransportError>) {
    let Some(attempt) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let joined = (&mut attempt.task).await;
    let url = attempt.url.clone();
    *pending = None;
    let outcome = joined.unwrap_or_else(|e| {
        Err(TransportError::ConnectFailed {
            url: url.clone(),
            message: e.to_string(),
        })
    });
    (url, outcome)
}

async fn wait_for_deadline(deadline: Option<(TimerKind, Instant)>) -> TimerKind {
    match deadline {
        Some((kind, at)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

/// Flushes queued chat messages over an open link.
struct LinkSink<'a> {
    link: &'a mut Box<dyn Link>,
    session: &'a SessionId,
}

#[async_trait::async_trait]
impl PendingSink for LinkSink<'_> {
    async fn send_pending(&mut self, message: &PendingMessage) -> Result<(), TransportError> {
        let frame = OutboundFrame::chat(
            message.content.clone(),
            message.project_id.clone(),
            self.session.clone(),
        );
        let raw = frame
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.link.send(raw).await
    }
}
