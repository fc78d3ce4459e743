//! The observer set a machine gossips transitions to.
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use troupe::{ActorId, ActorRef};

use crate::event::Notice;

/// Observers keyed by actor id. Confined to the machine's serialized
/// execution context; gossip runs inside the receive.
pub(crate) struct Listeners<S> {
    observers: HashMap<ActorId, ActorRef<Notice<S>>>,
}

impl<S: Clone> Listeners<S> {
    pub fn new() -> Self {
        Self {
            observers: HashMap::new(),
        }
    }

    /// Admit an observer. Re-admission is a no-op.
    pub fn insert(&mut self, observer: ActorRef<Notice<S>>) -> bool {
        match self.observers.entry(observer.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(observer);
                true
            }
        }
    }

    pub fn remove(&mut self, id: ActorId) -> Option<ActorRef<Notice<S>>> {
        self.observers.remove(&id)
    }

    /// Fan a notice out to every observer. A failed send is dropped here;
    /// removal happens when the host reports the observer terminated.
    pub fn gossip(&self, notice: &Notice<S>) {
        for observer in self.observers.values() {
            if observer.send(notice.clone()).is_err() {
                log::trace!(target: "fsm", "observer {} is gone, dropping a notice", observer.id());
            }
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.observers.len()
    }
}
