//! Actor identity and mailbox addresses.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel as chan;
use thiserror::Error;

/// Process-global id counter.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one actor for the lifetime of the process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorId(u64);

impl ActorId {
    /// Allocate a fresh id.
    pub fn fresh() -> Self {
        ActorId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The address could not be delivered to: the receive half was dropped.
#[derive(Debug, Error)]
#[error("actor {0} is disconnected")]
pub struct Disconnected(pub ActorId);

/// The send half of an actor mailbox.
///
/// Clones address the same mailbox. Refs compare and hash by [`ActorId`]
/// only, so they can key observer sets.
#[derive(Debug)]
pub struct ActorRef<T> {
    id: ActorId,
    tx: chan::Sender<T>,
}

impl<T> ActorRef<T> {
    /// The id of the actor behind this address.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Deliver a message to the mailbox.
    pub fn send(&self, message: T) -> Result<(), Disconnected> {
        self.tx.send(message).map_err(|_| Disconnected(self.id))
    }
}

impl<T> Clone for ActorRef<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<T> PartialEq for ActorRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ActorRef<T> {}

impl<T> Hash for ActorRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Create an unbounded mailbox, returning the address and the receive
/// half. Delivery through the address is FIFO.
pub fn mailbox<T>() -> (ActorRef<T>, chan::Receiver<T>) {
    let (tx, rx) = chan::unbounded();
    (
        ActorRef {
            id: ActorId::fresh(),
            tx,
        },
        rx,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fifo_delivery() {
        let (addr, rx) = mailbox();

        for n in 0..8 {
            addr.send(n).unwrap();
        }
        assert_eq!(rx.try_iter().collect::<Vec<i32>>(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_eq_by_id() {
        let (a, _rx_a) = mailbox::<()>();
        let (b, _rx_b) = mailbox::<()>();

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_disconnected() {
        let (addr, rx) = mailbox::<u8>();
        drop(rx);

        let err = addr.send(1).unwrap_err();
        assert_eq!(err.0, addr.id());
    }
}
