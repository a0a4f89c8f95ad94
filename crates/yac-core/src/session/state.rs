//! Per-process session state.

use super::message::ChatMessage;
use crate::protocol::BackendStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the session is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Idle,
    AwaitingModel,
    ExecutingTool(String),
}

/// Backend-side conversation state.
///
/// Created once per backend process and mutated only by the orchestrator.
/// The history is append-only; [`Session::clear_history`] is the one exception.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    history: Vec<ChatMessage>,
    active_model: String,
    servers: BTreeSet<String>,
    activity: Activity,
}

impl Session {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            history: Vec::new(),
            active_model: model.into(),
            servers: BTreeSet::new(),
            activity: Activity::Idle,
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    /// Empty the history. Returns how many entries were removed.
    pub fn clear_history(&mut self) -> usize {
        let removed = self.history.len();
        self.history.clear();
        removed
    }

    pub fn active_model(&self) -> &str {
        &self.active_model
    }

    /// Switch models. Returns the previous model.
    pub fn set_model(&mut self, model: impl Into<String>) -> String {
        std::mem::replace(&mut self.active_model, model.into())
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.servers.iter().map(String::as_str)
    }

    pub fn set_servers<I, S>(&mut self, servers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn set_activity(&mut self, activity: Activity) {
        if activity != self.activity {
            log::debug!("Session {}: {:?} -> {:?}", self.id, self.activity, activity);
        }
        self.activity = activity;
    }

    pub fn is_busy(&self) -> bool {
        self.activity != Activity::Idle
    }

    /// Snapshot for `status` frames.
    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            servers: self.servers.iter().cloned().collect(),
            model: self.active_model.clone(),
            busy: self.is_busy(),
            current_tool: match self.activity {
                Activity::ExecutingTool(ref tool) => Some(tool.clone()),
                _ => None,
            },
        }
    }
}
