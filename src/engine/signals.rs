//! Signal queue shared by the engines
//!
//! Engines record every signal they raise, whether or not anybody listens
//! yet. Listeners are matched when a signal is taken off the queue, so a
//! subscription made while handling one signal still sees the signals that
//! were raised behind it in the same batch (a toplevel's creation followed by
//! its initial commit, for instance).

use super::{ListenerId, ObjectId, Signal, SignalData, SignalKind};
use log::trace;
use smithay::reexports::calloop::ping::Ping;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subscription {
    source: ObjectId,
    kind: SignalKind,
}

#[derive(Debug, Clone)]
struct Raised {
    source: ObjectId,
    kind: SignalKind,
    data: SignalData,
}

pub struct SignalQueue {
    listeners: BTreeMap<ListenerId, Subscription>,
    raised: VecDeque<Raised>,
    /// Deliveries of the signal currently being handed out
    deliveries: VecDeque<Signal>,
    next_listener: u32,
    wakeup: Option<Ping>,
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalQueue {
    pub fn new() -> Self {
        Self {
            listeners: BTreeMap::new(),
            raised: VecDeque::new(),
            deliveries: VecDeque::new(),
            next_listener: 1,
            wakeup: None,
        }
    }

    /// Ping the event loop whenever a signal is raised
    pub fn with_wakeup(ping: Ping) -> Self {
        Self {
            wakeup: Some(ping),
            ..Self::new()
        }
    }

    pub fn subscribe(&mut self, source: ObjectId, kind: SignalKind) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.insert(id, Subscription { source, kind });
        id
    }

    /// Returns false when the listener was not registered
    pub fn unsubscribe(&mut self, listener: ListenerId) -> bool {
        self.listeners.remove(&listener).is_some()
    }

    pub fn raise(&mut self, source: ObjectId, kind: SignalKind, data: SignalData) {
        trace!("Raised {:?} on {:?}", kind, source);
        self.raised.push_back(Raised { source, kind, data });
        if let Some(ping) = &self.wakeup {
            ping.ping();
        }
    }

    /// Next delivery to a listener that is still registered
    ///
    /// Signals nobody listens to at this point are dropped.
    pub fn pop(&mut self) -> Option<Signal> {
        loop {
            while let Some(signal) = self.deliveries.pop_front() {
                if self.listeners.contains_key(&signal.listener) {
                    return Some(signal);
                }
            }

            let raised = self.raised.pop_front()?;
            let mut matched = false;
            for (id, sub) in &self.listeners {
                if sub.source == raised.source && sub.kind == raised.kind {
                    matched = true;
                    self.deliveries.push_back(Signal {
                        listener: *id,
                        source: raised.source,
                        kind: raised.kind,
                        data: raised.data.clone(),
                    });
                }
            }
            if !matched {
                trace!("No listener for {:?} on {:?}", raised.kind, raised.source);
            }
        }
    }

    /// Signals raised or resolved but not yet handed out
    pub fn pending(&self) -> usize {
        self.raised.len() + self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raised.is_empty() && self.deliveries.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drop queued signals; listeners stay registered
    pub fn clear(&mut self) {
        self.raised.clear();
        self.deliveries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SurfaceId, ToplevelId};

    #[test]
    fn test_listener_added_after_raise_still_receives() {
        let mut queue = SignalQueue::new();
        let toplevel = ToplevelId(7);
        let surface = ObjectId::Surface(SurfaceId(8));
        queue.subscribe(ObjectId::XdgShell, SignalKind::NewToplevel);
        queue.raise(ObjectId::XdgShell, SignalKind::NewToplevel, SignalData::Toplevel(toplevel));
        queue.raise(surface, SignalKind::SurfaceCommit, SignalData::Commit { initial: true });

        let first = queue.pop().unwrap();
        assert_eq!(first.data, SignalData::Toplevel(toplevel));

        // Subscribing while the first signal is handled
        let listener = queue.subscribe(surface, SignalKind::SurfaceCommit);
        let second = queue.pop().unwrap();
        assert_eq!(second.listener, listener);
        assert_eq!(second.data, SignalData::Commit { initial: true });
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_unheard_signals_are_dropped() {
        let mut queue = SignalQueue::new();
        queue.raise(ObjectId::Backend, SignalKind::NewOutput, SignalData::None);
        assert_eq!(queue.pending(), 1);
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());

        queue.subscribe(ObjectId::Backend, SignalKind::NewOutput);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_unsubscribe_cancels_resolved_deliveries() {
        let mut queue = SignalQueue::new();
        let a = queue.subscribe(ObjectId::Seat, SignalKind::RequestCursor);
        let b = queue.subscribe(ObjectId::Seat, SignalKind::RequestCursor);
        queue.raise(ObjectId::Seat, SignalKind::RequestCursor, SignalData::None);

        assert_eq!(queue.pop().map(|s| s.listener), Some(a));
        assert!(queue.unsubscribe(b));
        assert!(queue.pop().is_none());
        assert!(!queue.unsubscribe(b));
        assert_eq!(queue.listener_count(), 1);
    }
}
