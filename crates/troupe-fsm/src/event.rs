//! Messages crossing the machine's mailbox and the events handed to
//! handlers.
use std::fmt;

use troupe::{ActorId, ActorRef};

use crate::timers::{Generation, TimerFired};
use crate::Behavior;

/// One unit of mailbox delivery: a message plus the reply target supplied
/// by whoever sent it.
pub struct Envelope<P: Behavior> {
    pub message: Message<P>,
    /// Where replies produced while handling this message go.
    pub sender: Option<ActorRef<P::Reply>>,
}

impl<P: Behavior> Envelope<P> {
    /// An envelope without a reply target.
    pub fn of(message: Message<P>) -> Self {
        Self {
            message,
            sender: None,
        }
    }
}

/// Everything the machine's mailbox accepts.
pub enum Message<P: Behavior> {
    /// A user event for the current state's handler.
    User(P::Event),
    /// Admit a transition observer; it is sent the current state as a
    /// baseline.
    Subscribe(ActorRef<Notice<P::State>>),
    /// Remove a transition observer.
    Unsubscribe(ActorRef<Notice<P::State>>),
    /// Alternate admission channel, with [`Message::Subscribe`] semantics.
    Listen(ActorRef<Notice<P::State>>),
    /// Alternate removal channel, with [`Message::Unsubscribe`] semantics.
    Deafen(ActorRef<Notice<P::State>>),
    /// A watched observer terminated; drop it from the listener set.
    ObserverTerminated(ActorId),
    /// A named timer fired. Posted by the scheduler task; admission
    /// checked against the timer table.
    TimerFired(TimerFired<P::Event>),
    /// The state-entry timeout elapsed. Posted by the scheduler task;
    /// admission checked against the current generation.
    StateTimeout(Generation),
}

/// What a state handler is invoked with: a message payload, or the
/// state-entry timeout sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload<E> {
    /// A payload sent by a peer or carried by a named timer.
    Message(E),
    /// The state-entry timeout elapsed with no intervening activity.
    StateTimeout,
}

impl<E> EventPayload<E> {
    /// The message payload, unless this is a state timeout.
    pub fn message(&self) -> Option<&E> {
        match self {
            Self::Message(event) => Some(event),
            Self::StateTimeout => None,
        }
    }

    /// Whether this is the state-entry timeout sentinel.
    pub fn is_state_timeout(&self) -> bool {
        matches!(self, Self::StateTimeout)
    }
}

/// The immutable pair presented to a state handler.
pub struct Event<P: Behavior> {
    /// The triggering payload.
    pub payload: EventPayload<P::Event>,
    /// The machine's state data at dispatch time.
    pub data: P::Data,
}

impl<P: Behavior> fmt::Debug for Event<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("payload", &self.payload)
            .field("data", &self.data)
            .finish()
    }
}

/// What transition observers receive: the baseline once at admission,
/// then one notice per real state change, in kernel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice<S> {
    /// The machine's state at admission time.
    CurrentState {
        /// The machine that emitted the notice.
        source: ActorId,
        state: S,
    },
    /// A real state change. Self-loops are not transitions and are never
    /// gossiped.
    Transition {
        source: ActorId,
        from: S,
        to: S,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_payload_accessors() {
        let payload = EventPayload::Message("ping");
        assert_eq!(payload.message(), Some(&"ping"));
        assert!(!payload.is_state_timeout());

        let timeout = EventPayload::<&str>::StateTimeout;
        assert_eq!(timeout.message(), None);
        assert!(timeout.is_state_timeout());
    }
}
