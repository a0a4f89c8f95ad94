//! Frontend facade over the backend process.
//!
//! A [`Bridge`] owns at most one [`Connection`] at a time, a [`Dispatcher`]
//! shared across reconnects, and an [`EventBus`] for connection-level events.
//! Frontends register handlers once and call [`Bridge::connect`] as often as
//! they need; subscriptions survive a backend restart.

use crate::bus::{BridgeEvent, EventBus};
use crate::connection::{Connection, ConnectionState, DisconnectReason};
use crate::dispatcher::{Dispatcher, Subscription};
use crate::logging::TraceLog;
use crate::protocol::{BackendStatus, CodecError, Frame, FrameCodec, FrameKind};
use crate::transport::{
    Channel, ChannelEvents, ChannelSpec, DiagnosticPolicy, TransportError, DEFAULT_CLOSE_GRACE,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("not connected ({0})")]
    NotConnected(ConnectionState),

    #[error("backend did not complete the handshake within {0:?}")]
    ConnectTimeout(Duration),

    #[error("backend disconnected: {0}")]
    Disconnected(DisconnectReason),

    #[error("no status reply within {0:?}")]
    StatusTimeout(Duration),

    #[error("request abandoned: the connection closed before a reply arrived")]
    Abandoned,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Options for spawning and talking to the backend.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Backend executable
    pub backend_program: String,
    /// Arguments for the backend; the line protocol needs `--json`
    pub backend_args: Vec<String>,
    /// Working directory for the backend process
    pub working_dir: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub status_timeout: Duration,
    /// Grace period for [`Bridge::disconnect`]
    pub close_grace: Duration,
    pub diagnostics: DiagnosticPolicy,
    /// Directory for per-connection wire traces; `None` disables tracing
    pub trace_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend_program: "yac-backend".to_string(),
            backend_args: vec!["--json".to_string()],
            working_dir: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            diagnostics: DiagnosticPolicy::default(),
            trace_dir: None,
        }
    }
}

impl BridgeConfig {
    pub fn new(backend_program: impl Into<String>) -> Self {
        Self {
            backend_program: backend_program.into(),
            ..Self::default()
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.backend_args = args;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn handshake_timeout(mut self, bound: Duration) -> Self {
        self.handshake_timeout = bound;
        self
    }

    pub fn status_timeout(mut self, bound: Duration) -> Self {
        self.status_timeout = bound;
        self
    }

    pub fn diagnostics(mut self, policy: DiagnosticPolicy) -> Self {
        self.diagnostics = policy;
        self
    }

    pub fn trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }
}

pub struct Bridge {
    config: BridgeConfig,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    connection: Option<Connection>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let bus = Arc::new(EventBus::new());
        Self {
            config,
            dispatcher,
            bus,
            connection: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Spawn the backend and wait for its handshake.
    ///
    /// Does nothing if already connected. A previous, disconnected connection
    /// is replaced by a fresh one.
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        if self.is_connected() {
            return Ok(());
        }

        let connection_id = Uuid::new_v4().to_string();
        let trace = TraceLog::open(self.config.trace_dir.as_deref(), &connection_id);
        let mut spec = ChannelSpec::new(
            self.config.backend_program.clone(),
            self.config.backend_args.clone(),
        )
        .diagnostics(self.config.diagnostics.clone())
        .trace(trace);
        if let Some(ref dir) = self.config.working_dir {
            spec = spec.working_dir(dir);
        }

        log::info!(
            "Connecting to {} {}",
            self.config.backend_program,
            self.config.backend_args.join(" ")
        );
        let (channel, events) = Channel::open(spec, FrameCodec)?;
        self.attach(channel, events).await
    }

    /// Run the handshake over an already-open channel.
    pub async fn connect_channel(
        &mut self,
        channel: Channel,
        events: ChannelEvents<Frame>,
    ) -> Result<(), BridgeError> {
        if self.is_connected() {
            self.disconnect().await;
        }
        self.attach(channel, events).await
    }

    async fn attach(
        &mut self,
        channel: Channel,
        events: ChannelEvents<Frame>,
    ) -> Result<(), BridgeError> {
        // Dropping the old connection kills whatever is left of it.
        self.connection.take();
        let connection =
            Connection::start(channel, events, self.dispatcher.clone(), self.bus.clone());
        let result = connection
            .wait_connected(self.config.handshake_timeout)
            .await;
        self.connection = Some(connection);
        result
    }

    /// Current connection state, or `None` before the first connect.
    pub fn state(&self) -> Option<ConnectionState> {
        self.connection.as_ref().map(Connection::state)
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(Connection::is_connected)
    }

    fn live(&self) -> Result<&Connection, BridgeError> {
        match self.connection {
            Some(ref connection) if connection.is_connected() => Ok(connection),
            Some(ref connection) => Err(BridgeError::NotConnected(connection.state())),
            None => Err(BridgeError::NotConnected(ConnectionState::Disconnected(
                DisconnectReason::ProcessExited(None),
            ))),
        }
    }

    /// Send a user message. Returns the correlation id used.
    pub async fn send_message(&self, text: &str) -> Result<String, BridgeError> {
        let connection = self.live()?;
        let id = Uuid::new_v4().to_string();
        connection.send(&Frame::user_message(&id, text)).await?;
        Ok(id)
    }

    /// Send a slash command. Returns the correlation id used.
    pub async fn send_command(&self, text: &str) -> Result<String, BridgeError> {
        let connection = self.live()?;
        let id = Uuid::new_v4().to_string();
        connection.send(&Frame::command(&id, text)).await?;
        Ok(id)
    }

    /// Ask the backend for a status snapshot.
    pub async fn get_status(&self) -> Result<BackendStatus, BridgeError> {
        let connection = self.live()?;
        let id = Uuid::new_v4().to_string();
        // Register before writing so a fast reply cannot slip past.
        let reply = self.dispatcher.once_correlated(FrameKind::Status, id.clone());
        connection.send(&Frame::status_request(&id)).await?;

        let bound = self.config.status_timeout;
        match tokio::time::timeout(bound, reply).await {
            Ok(Ok(frame)) => Ok(frame.payload_as()?),
            Ok(Err(_)) => Err(BridgeError::Abandoned),
            Err(_) => {
                log::warn!("Status request {} timed out after {:?}", id, bound);
                Err(BridgeError::StatusTimeout(bound))
            }
        }
    }

    /// Register a persistent handler for one frame kind.
    pub fn subscribe<F>(&self, kind: FrameKind, handler: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(kind, handler)
    }

    /// Register a handler for frames of unknown kind.
    pub fn on_unknown<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.dispatcher.on_unknown(handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.dispatcher.unsubscribe(subscription)
    }

    /// Resolve with the next frame of `kind`.
    pub fn once(&self, kind: FrameKind) -> oneshot::Receiver<Frame> {
        self.dispatcher.once(kind)
    }

    pub fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.bus.subscribe()
    }

    /// Close the backend's stdin and wait for it to exit, killing it after the
    /// grace period.
    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close(self.config.close_grace).await;
            connection.closed().await;
        }
    }
}
