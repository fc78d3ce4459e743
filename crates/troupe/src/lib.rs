//! Building blocks for single-threaded actors: typed mailbox addresses,
//! cancellation tokens and task schedulers. Higher layers (such as the
//! `troupe-fsm` engine) consume these without caring which scheduler or
//! runtime drives them.
pub mod actor;
pub mod cancel;
pub mod scheduler;

pub use actor::{mailbox, ActorId, ActorRef, Disconnected};
pub use cancel::CancelToken;
pub use scheduler::{ManualScheduler, Scheduler, Task, ThreadScheduler};
