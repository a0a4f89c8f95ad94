//! Connection-level event broadcasting.
//!
//! The EventBus carries events that are not frames but that every frontend
//! observer cares about: state transitions, diagnostics from the backend's
//! output, unknown frames, and tool invocations cut short by a disconnect.
//!
//! # Example
//!
//! ```rust
//! use yac_core::bus::{BridgeEvent, EventBus};
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//! bus.emit(BridgeEvent::Diagnostic("warning: slow start".into()));
//! assert!(matches!(rx.try_recv(), Ok(BridgeEvent::Diagnostic(_))));
//! ```

use crate::connection::ConnectionState;
use crate::protocol::Frame;
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
/// Events beyond this capacity will cause slow subscribers to miss events (lag).
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The connection moved to a new state
    StateChanged(ConnectionState),
    /// A diagnostic line from the backend
    Diagnostic(String),
    /// A frame whose kind is not part of the protocol
    UnknownFrame(Frame),
    /// A tool invocation that was started but never finished
    ToolAbandoned { id: String, tool: String },
}

pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    /// Create a new EventBus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers.
    ///
    /// Having no subscribers is not an error; the event is simply dropped.
    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
