//! Event emitter: controller → UI context notifications.
//!
//! Delivery is at-most-once and best effort. A context whose link has closed
//! is pruned on the next delivery attempt without surfacing an error to
//! `broadcast` callers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    channel::{ChannelRegistry, Direction},
    error::{Result, TetherError},
    ipc::envelope::{ContextId, Envelope},
};

struct ContextSlot {
    tx: mpsc::UnboundedSender<Envelope>,
    /// Event channels this context currently has at least one listener for.
    interest: HashSet<String>,
}

pub struct EventEmitter {
    registry: Arc<ChannelRegistry>,
    /// Ordered by id so broadcast visits contexts in attach order.
    contexts: Mutex<BTreeMap<ContextId, ContextSlot>>,
}

impl EventEmitter {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            contexts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Track a newly attached context's outbound sender.
    pub fn register(&self, id: ContextId, tx: mpsc::UnboundedSender<Envelope>) {
        self.contexts.lock().insert(
            id,
            ContextSlot {
                tx,
                interest: HashSet::new(),
            },
        );
    }

    /// Forget a context. Dropping its sender closes the UI side's inbound
    /// stream. Returns `false` if the context was already gone.
    pub fn remove(&self, id: ContextId) -> bool {
        self.contexts.lock().remove(&id).is_some()
    }

    /// Record listener interest announced by a context.
    pub fn subscribe(&self, id: ContextId, channel: &str) {
        if !self.registry.contains(channel, Direction::Event) {
            warn!(%id, channel, "ignoring subscription to non-event channel");
            return;
        }
        if let Some(slot) = self.contexts.lock().get_mut(&id) {
            slot.interest.insert(channel.to_string());
            debug!(%id, channel, "context subscribed");
        }
    }

    pub fn unsubscribe(&self, id: ContextId, channel: &str) {
        if let Some(slot) = self.contexts.lock().get_mut(&id) {
            if slot.interest.remove(channel) {
                debug!(%id, channel, "context unsubscribed");
            }
        }
    }

    /// Send `payload` to every live context listening on `name`.
    ///
    /// Returns the number of contexts the event was handed to.
    ///
    /// # Errors
    /// `UnknownChannel` / `ShapeMismatch` if the event does not match the
    /// registry. Dead contexts are never an error.
    pub fn broadcast(&self, name: &str, payload: Value) -> Result<usize> {
        self.registry.validate(name, Direction::Event, &payload)?;
        let envelope = Envelope::event(name, payload);

        let mut contexts = self.contexts.lock();
        let mut delivered = 0usize;
        let mut dead = Vec::new();
        for (id, slot) in contexts.iter() {
            if !slot.interest.contains(name) {
                continue;
            }
            if slot.tx.send(envelope.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            debug!(%id, "pruning closed context");
            contexts.remove(&id);
        }
        Ok(delivered)
    }

    /// Send `payload` to one context.
    ///
    /// # Errors
    /// `UnknownContext` if `id` is stale or its link has closed, plus the
    /// validation errors of [`EventEmitter::broadcast`].
    pub fn unicast(&self, id: ContextId, name: &str, payload: Value) -> Result<()> {
        self.registry.validate(name, Direction::Event, &payload)?;
        if self.deliver(id, Envelope::event(name, payload)) {
            Ok(())
        } else {
            Err(TetherError::UnknownContext(id))
        }
    }

    /// Hand any envelope to one context. Returns `false` (and prunes the
    /// slot) if the context is gone.
    pub fn deliver(&self, id: ContextId, envelope: Envelope) -> bool {
        let mut contexts = self.contexts.lock();
        let Some(slot) = contexts.get(&id) else {
            return false;
        };
        if slot.tx.send(envelope).is_ok() {
            true
        } else {
            contexts.remove(&id);
            false
        }
    }

    /// Drop every context's sender.
    pub fn close_all(&self) -> usize {
        let mut contexts = self.contexts.lock();
        let n = contexts.len();
        contexts.clear();
        n
    }

    pub fn is_live(&self, id: ContextId) -> bool {
        self.contexts
            .lock()
            .get(&id)
            .is_some_and(|slot| !slot.tx.is_closed())
    }

    /// Whether context `id` has announced a listener on `channel`.
    pub fn is_subscribed(&self, id: ContextId, channel: &str) -> bool {
        self.contexts
            .lock()
            .get(&id)
            .is_some_and(|slot| slot.interest.contains(channel))
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        self.contexts.lock().keys().copied().collect()
    }
}
