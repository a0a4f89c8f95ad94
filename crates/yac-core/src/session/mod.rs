//! Backend session state: conversation history, active model, connected tool
//! servers and current activity.

mod invocation;
mod message;
mod state;

pub use invocation::{InvocationStatus, ToolInvocation};
pub use message::{ChatMessage, Role, ToolCall};
pub use state::{Activity, Session, SessionId};
