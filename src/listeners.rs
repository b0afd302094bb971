//! Engine subscriptions owned by one resource

use crate::engine::{Engine, ListenerId, ObjectId, SignalKind};
use log::warn;

/// Listener ids plus the flag guarding their one-time teardown
///
/// Destroy and unmap paths can both try to tear a resource down;
/// whichever runs first removes the listeners, the other is a no-op.
#[derive(Debug, Default)]
pub struct ListenerSet {
    ids: Vec<ListenerId>,
    torn_down: bool,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, engine: &mut dyn Engine, source: ObjectId, kind: SignalKind) -> Option<ListenerId> {
        if self.torn_down {
            warn!("Refusing {:?} listener on torn-down {:?}", kind, source);
            return None;
        }
        let id = engine.add_listener(source, kind);
        self.ids.push(id);
        Some(id)
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        !self.torn_down && self.ids.contains(&id)
    }

    pub fn is_active(&self) -> bool {
        !self.torn_down
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Remove every listener once; returns false when already torn down
    pub fn remove_all(&mut self, engine: &mut dyn Engine) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;
        for id in self.ids.drain(..) {
            if let Err(e) = engine.remove_listener(id) {
                warn!("Listener teardown: {}", e);
            }
        }
        true
    }
}
