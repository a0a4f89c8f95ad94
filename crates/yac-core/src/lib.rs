//! # yac-core
//!
//! Process bridge and session orchestration for YAC, a terminal front end for
//! a tool-using AI agent backend.
//!
//! The two sides talk newline-delimited JSON frames over the backend's stdio:
//!
//! - **Frontend**: [`Bridge`] spawns the backend, waits for the handshake,
//!   routes frames to subscribers and correlates status queries.
//! - **Backend**: [`orchestrator::serve`] drives an [`Orchestrator`] that owns
//!   the session, calls the model and runs tools one at a time.
//!
//! ## Key Concepts
//!
//! - **Frame**: one JSON object on one line, see [`protocol`]
//! - **Connection**: one child-process lifetime with a watch-based state machine
//! - **Turn**: a user message, the tool calls it triggers, and the final answer

pub mod bridge;
pub mod bus;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod transport;

// Re-export commonly used types
pub use bridge::{Bridge, BridgeConfig, BridgeError};
pub use bus::{BridgeEvent, EventBus};
pub use config::YacConfig;
pub use connection::{ConnectionState, DisconnectReason};
pub use orchestrator::{Flow, Orchestrator, OrchestratorOptions};
pub use protocol::{BackendStatus, Frame, FrameKind};
pub use session::{Session, SessionId};
pub use tools::{ToolHost, ToolRegistry};
