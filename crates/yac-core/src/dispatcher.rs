//! Kind-based frame routing.
//!
//! The [`Dispatcher`] keeps two tables:
//! - persistent handlers, keyed by [`FrameKind`], plus catch-all handlers for
//!   kinds outside the protocol
//! - one-shot waiters, resolved by the next matching frame
//!
//! A connection's drain task is the only caller of [`Dispatcher::dispatch`], so
//! frames are dispatched one at a time in arrival order. Handlers are cloned
//! out of the table before they run; a handler may subscribe or unsubscribe
//! without deadlocking.

use crate::protocol::{Frame, FrameKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

/// A persistent frame handler.
pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Handle returned by [`Dispatcher::subscribe`] and [`Dispatcher::on_unknown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    kind: Option<FrameKind>,
}

impl Subscription {
    /// The subscribed kind, or `None` for a catch-all handler.
    pub fn kind(&self) -> Option<&FrameKind> {
        self.kind.as_ref()
    }
}

struct Waiter {
    kind: FrameKind,
    correlation: Option<String>,
    tx: oneshot::Sender<Frame>,
}

impl Waiter {
    fn matches(&self, frame: &Frame) -> bool {
        if &self.kind != frame.kind() {
            return false;
        }
        match self.correlation {
            Some(ref id) => frame.id() == Some(id.as_str()),
            None => true,
        }
    }
}

#[derive(Default)]
struct Table {
    next_id: u64,
    handlers: HashMap<FrameKind, Vec<(u64, FrameHandler)>>,
    catch_all: Vec<(u64, FrameHandler)>,
    waiters: Vec<Waiter>,
}

impl Table {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct Dispatcher {
    table: Mutex<Table>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a persistent handler for one kind.
    pub fn subscribe<F>(&self, kind: FrameKind, handler: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let mut table = self.table();
        let id = table.allocate();
        table
            .handlers
            .entry(kind.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            kind: Some(kind),
        }
    }

    /// Register a catch-all handler for frames of unknown kind.
    pub fn on_unknown<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let mut table = self.table();
        let id = table.allocate();
        table.catch_all.push((id, Arc::new(handler)));
        Subscription { id, kind: None }
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut table = self.table();
        let list = match subscription.kind {
            Some(ref kind) => match table.handlers.get_mut(kind) {
                Some(list) => list,
                None => return false,
            },
            None => &mut table.catch_all,
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        before != list.len()
    }

    /// Resolve with the next frame of `kind`.
    pub fn once(&self, kind: FrameKind) -> oneshot::Receiver<Frame> {
        self.add_waiter(kind, None)
    }

    /// Resolve with the next frame of `kind` whose id equals `id`.
    pub fn once_correlated(
        &self,
        kind: FrameKind,
        id: impl Into<String>,
    ) -> oneshot::Receiver<Frame> {
        self.add_waiter(kind, Some(id.into()))
    }

    fn add_waiter(&self, kind: FrameKind, correlation: Option<String>) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.table().waiters.push(Waiter {
            kind,
            correlation,
            tx,
        });
        rx
    }

    /// Route one frame to its handlers and matching waiters.
    pub fn dispatch(&self, frame: &Frame) {
        let (handlers, ready) = {
            let mut table = self.table();
            table.waiters.retain(|w| !w.tx.is_closed());

            let mut ready = Vec::new();
            for waiter in std::mem::take(&mut table.waiters) {
                if waiter.matches(frame) {
                    ready.push(waiter.tx);
                } else {
                    table.waiters.push(waiter);
                }
            }

            let handlers: Vec<FrameHandler> = if frame.kind().is_known() {
                table
                    .handlers
                    .get(frame.kind())
                    .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default()
            } else {
                table.catch_all.iter().map(|(_, h)| h.clone()).collect()
            };
            (handlers, ready)
        };

        if !frame.kind().is_known() && handlers.is_empty() {
            log::warn!("Unhandled frame of unknown kind '{}'", frame.kind());
        }

        for handler in handlers {
            handler(frame);
        }
        for tx in ready {
            let _ = tx.send(frame.clone());
        }
    }

    /// Drop every outstanding waiter. Their receivers observe a closed channel.
    pub fn abandon_pending(&self) -> usize {
        let abandoned = std::mem::take(&mut self.table().waiters);
        if !abandoned.is_empty() {
            log::debug!("Abandoning {} pending waiter(s)", abandoned.len());
        }
        abandoned.len()
    }

    pub fn pending_waiters(&self) -> usize {
        self.table().waiters.len()
    }
}
