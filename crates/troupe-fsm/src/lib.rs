//! A finite-state-machine engine for actors.
//!
//! A machine is written as one handler function per state. Handlers
//! receive the triggering event together with the current state data and
//! return a [`Transition`] descriptor saying where to go next, built with
//! the constructors on [`Ctx`] and refined with the descriptor's builder
//! methods. Around that core the engine provides named timers with
//! generation admission, per-state inactivity timeouts, transition
//! observers, and a controlled termination protocol.
//!
//! The engine does not own a thread or a mailbox. A host — any type
//! implementing [`ActorContext`] — delivers one [`Envelope`] at a time to
//! [`Fsm::receive`] and supplies the scheduler timers run on. All machine
//! state is confined to that serialized context.
//!
//! ```
//! use troupe_fsm::{Behavior, Fsm};
//! use troupe_testkit::Rig;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Door {
//!     Open,
//!     Closed,
//! }
//!
//! #[derive(Debug)]
//! enum Cmd {
//!     Push,
//! }
//!
//! struct DoorFsm;
//!
//! impl Behavior for DoorFsm {
//!     type State = Door;
//!     type Data = u32;
//!     type Event = Cmd;
//!     type Reply = ();
//! }
//!
//! let mut fsm = Fsm::<DoorFsm>::new();
//! fsm.when(Door::Closed, |event, ctx| match event.payload.message()? {
//!     Cmd::Push => Some(ctx.goto(Door::Open).using(ctx.state_data() + 1)),
//! });
//! fsm.when(Door::Open, |event, ctx| match event.payload.message()? {
//!     Cmd::Push => Some(ctx.goto(Door::Closed)),
//! });
//! fsm.start_with(Door::Closed, 0);
//!
//! let mut rig = Rig::start(fsm).unwrap();
//! rig.send(Cmd::Push);
//! rig.run().unwrap();
//!
//! assert_eq!(*rig.fsm().state_name(), Door::Open);
//! assert_eq!(*rig.fsm().state_data(), 1);
//! ```
pub mod event;
pub mod handlers;
mod listeners;
pub mod machine;
pub mod state;
pub mod timers;

use std::fmt::Debug;
use std::hash::Hash;

pub use event::{Envelope, Event, EventPayload, Message, Notice};
pub use handlers::{transform, StateHandler, Transform};
pub use machine::{ActorContext, Ctx, Error, Fsm};
pub use state::{AccessError, Reason, StopEvent, Transition, UnknownState, INFINITE};
pub use timers::{Generation, TimerFired};

/// Bundles the user types one machine is generic over.
pub trait Behavior {
    /// State names: the handler registry key, compared by value.
    type State: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    /// State data, carried by value alongside the current state.
    type Data: Clone + Debug + Send + 'static;
    /// User event payloads dispatched to state handlers.
    type Event: Debug + Send + 'static;
    /// Reply payloads delivered back to a message's sender.
    type Reply: Send + 'static;
}
