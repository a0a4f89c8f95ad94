//! Connection lifecycle on top of a frame channel.
//!
//! One [`Connection`] represents one backend lifetime:
//!
//! ```text
//! Connecting ──connected frame──▶ Connected ──exit / I/O failure──▶ Disconnected(reason)
//!      └──────────── handshake timeout / exit ──────────────────────▶ Disconnected(reason)
//! ```
//!
//! `Disconnected` is terminal. State lives in a `watch` channel and every
//! transition goes through `send_if_modified`, so a terminal state is never
//! overwritten. A single drain task owns the channel's event receiver and is
//! the only place frames are dispatched.

use crate::bridge::BridgeError;
use crate::bus::{BridgeEvent, EventBus};
use crate::dispatcher::Dispatcher;
use crate::protocol::{encode, Frame, FrameKind, ToolStartPayload};
use crate::transport::{Channel, ChannelEvent, ChannelEvents};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No handshake arrived within the bound
    Timeout,
    /// The backend exited, with its exit code if it had one
    ProcessExited(Option<i32>),
    /// Reading from or writing to the backend failed
    TransportFailure(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Timeout => write!(f, "handshake timed out"),
            DisconnectReason::ProcessExited(Some(code)) => {
                write!(f, "backend exited with code {code}")
            }
            DisconnectReason::ProcessExited(None) => write!(f, "backend exited"),
            DisconnectReason::TransportFailure(e) => write!(f, "transport failure: {e}"),
        }
    }
}

/// Shared state cell plus the bus that announces its transitions.
#[derive(Clone)]
struct StateCell {
    tx: Arc<watch::Sender<ConnectionState>>,
    bus: Arc<EventBus>,
}

impl StateCell {
    fn get(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    /// Apply a transition if it is legal. Returns true if the state changed.
    fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            let legal = match (&*current, &next) {
                (ConnectionState::Disconnected(_), _) => false,
                (ConnectionState::Connecting, ConnectionState::Connected) => true,
                (ConnectionState::Connecting, ConnectionState::Disconnected(_)) => true,
                // A handshake timeout cannot fire once connected.
                (_, ConnectionState::Disconnected(DisconnectReason::Timeout)) => false,
                (_, ConnectionState::Disconnected(_)) => true,
                _ => false,
            };
            if legal {
                *current = next.clone();
            }
            legal
        });
        if changed {
            log::info!("Connection {}", next);
            self.bus.emit(BridgeEvent::StateChanged(next));
        }
        changed
    }
}

/// Tool invocations announced with `tool_start` and not yet finished.
#[derive(Debug, Default)]
struct InFlightTools {
    open: HashMap<String, String>,
}

impl InFlightTools {
    fn observe(&mut self, frame: &Frame) {
        let Some(id) = frame.id() else {
            return;
        };
        match frame.kind() {
            FrameKind::ToolStart => {
                let tool = frame
                    .payload_as::<ToolStartPayload>()
                    .map(|p| p.tool)
                    .unwrap_or_default();
                self.open.insert(id.to_string(), tool);
            }
            FrameKind::ToolResult | FrameKind::ToolError => {
                self.open.remove(id);
            }
            _ => {}
        }
    }

    fn drain(&mut self) -> Vec<(String, String)> {
        let mut open: Vec<_> = self.open.drain().collect();
        open.sort();
        open
    }
}

/// One backend lifetime.
///
/// Dropping a connection kills its channel.
pub struct Connection {
    channel: Arc<Channel>,
    state: StateCell,
    drain: JoinHandle<()>,
}

impl Connection {
    /// Enter `Connecting` and start draining `events`.
    pub fn start(
        channel: Channel,
        events: ChannelEvents<Frame>,
        dispatcher: Arc<Dispatcher>,
        bus: Arc<EventBus>,
    ) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Connecting);
        let state = StateCell {
            tx: Arc::new(tx),
            bus,
        };
        state
            .bus
            .emit(BridgeEvent::StateChanged(ConnectionState::Connecting));

        let channel = Arc::new(channel);
        let drain = tokio::spawn(drain_events(
            events,
            channel.clone(),
            dispatcher,
            state.clone(),
        ));

        Self {
            channel,
            state,
            drain,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// A receiver that observes every state transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.tx.subscribe()
    }

    /// Wait for the handshake.
    ///
    /// If `bound` elapses first the connection becomes `Disconnected(Timeout)`
    /// and the child is killed.
    pub async fn wait_connected(&self, bound: Duration) -> Result<(), BridgeError> {
        let mut rx = self.watch();
        let outcome = tokio::time::timeout(bound, async move {
            let state = rx
                .wait_for(|s| *s != ConnectionState::Connecting)
                .await
                .map(|s| s.clone());
            state
        })
        .await;

        match outcome {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(ConnectionState::Disconnected(reason))) => Err(BridgeError::Disconnected(reason)),
            Ok(_) => Err(BridgeError::NotConnected(self.state())),
            Err(_) => {
                if self
                    .state
                    .transition(ConnectionState::Disconnected(DisconnectReason::Timeout))
                {
                    log::warn!("No handshake within {:?}, killing backend", bound);
                    self.channel.kill();
                    Err(BridgeError::ConnectTimeout(bound))
                } else if self.is_connected() {
                    // The handshake won the race with the timer.
                    Ok(())
                } else {
                    Err(BridgeError::ConnectTimeout(bound))
                }
            }
        }
    }

    /// Encode and write a frame. Fails fast unless `Connected`.
    pub async fn send(&self, frame: &Frame) -> Result<(), BridgeError> {
        let state = self.state();
        if !state.is_connected() {
            return Err(BridgeError::NotConnected(state));
        }
        let line = encode(frame)?;
        if let Err(e) = self.channel.write_line(&line).await {
            log::warn!("Write to backend failed: {}", e);
            self.state.transition(ConnectionState::Disconnected(
                DisconnectReason::TransportFailure(e.to_string()),
            ));
            self.channel.kill();
            return Err(e.into());
        }
        Ok(())
    }

    /// Close stdin, wait up to `grace`, then kill.
    pub async fn close(&self, grace: Duration) {
        self.channel.close(grace).await;
    }

    pub fn kill(&self) {
        self.channel.kill();
    }

    /// Wait until the drain task has observed the end of the channel.
    pub async fn closed(&mut self) {
        if !self.drain.is_finished() {
            let _ = (&mut self.drain).await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.channel.kill();
    }
}

async fn drain_events(
    mut events: ChannelEvents<Frame>,
    channel: Arc<Channel>,
    dispatcher: Arc<Dispatcher>,
    state: StateCell,
) {
    let mut in_flight = InFlightTools::default();

    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Item(frame) => match state.get() {
                ConnectionState::Connecting => {
                    if frame.kind() == &FrameKind::Connected {
                        state.transition(ConnectionState::Connected);
                    } else {
                        log::warn!("Dropping '{}' frame received before handshake", frame.kind());
                    }
                }
                ConnectionState::Connected => {
                    if frame.kind() == &FrameKind::Connected {
                        log::debug!("Ignoring repeated handshake");
                        continue;
                    }
                    in_flight.observe(&frame);
                    dispatcher.dispatch(&frame);
                    if !frame.kind().is_known() {
                        state.bus.emit(BridgeEvent::UnknownFrame(frame));
                    }
                }
                ConnectionState::Disconnected(_) => {
                    log::debug!("Ignoring '{}' frame after disconnect", frame.kind());
                }
            },
            ChannelEvent::Diagnostic(text) => {
                log::warn!("backend: {}", text);
                state.bus.emit(BridgeEvent::Diagnostic(text));
            }
            ChannelEvent::TransportError(e) => {
                state.transition(ConnectionState::Disconnected(
                    DisconnectReason::TransportFailure(e),
                ));
                channel.kill();
            }
            ChannelEvent::Closed(exit) => {
                state.transition(ConnectionState::Disconnected(
                    DisconnectReason::ProcessExited(exit.code),
                ));
                break;
            }
        }
    }

    state.transition(ConnectionState::Disconnected(
        DisconnectReason::ProcessExited(None),
    ));
    dispatcher.abandon_pending();
    for (id, tool) in in_flight.drain() {
        log::warn!("Tool invocation {} ({}) abandoned by disconnect", id, tool);
        state.bus.emit(BridgeEvent::ToolAbandoned { id, tool });
    }
}
