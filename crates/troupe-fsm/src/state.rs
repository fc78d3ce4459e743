//! Transition descriptors and termination values.
use std::error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::Behavior;

/// The sentinel accepted by [`Transition::for_max`] meaning "no timeout".
pub const INFINITE: Duration = Duration::MAX;

/// Why a machine terminated.
#[derive(Debug, Clone)]
pub enum Reason {
    /// Orderly termination requested by a handler.
    Normal,
    /// Termination imposed by the host.
    Shutdown,
    /// Termination caused by an error condition.
    Failure(Arc<dyn error::Error + Send + Sync>),
}

impl Reason {
    /// Wrap an error value as a failure reason.
    pub fn failure(cause: impl error::Error + Send + Sync + 'static) -> Self {
        Self::Failure(Arc::new(cause))
    }
}

/// Failure causes compare by display form. Equality on reasons exists for
/// descriptor comparison in logs and tests.
impl PartialEq for Reason {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Normal, Self::Normal) | (Self::Shutdown, Self::Shutdown) => true,
            (Self::Failure(a), Self::Failure(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

impl Eq for Reason {}

/// Cause recorded when a handler targets a state with no registered
/// handler.
#[derive(Debug, Error)]
#[error("next state {0:?} does not exist")]
pub struct UnknownState<S: fmt::Debug>(pub S);

/// Next-state data was read outside a transition.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("state data of the next state is only available during a transition")]
pub struct AccessError;

/// Handed to the termination finalizer, exactly once.
pub struct StopEvent<P: Behavior> {
    /// Why the machine stopped.
    pub reason: Reason,
    /// The state the machine terminated in.
    pub state: P::State,
    /// The state data at termination.
    pub data: P::Data,
}

impl<P: Behavior> fmt::Debug for StopEvent<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopEvent")
            .field("reason", &self.reason)
            .field("state", &self.state)
            .field("data", &self.data)
            .finish()
    }
}

/// What a handler returns: the state to settle in next, plus the effects
/// to apply on the way there.
///
/// Descriptors are produced by the constructors on [`Ctx`](crate::Ctx)
/// (`goto`, `stay`, `stop`) and refined with the builder methods below.
/// The kernel treats the result as immutable.
pub struct Transition<P: Behavior> {
    pub(crate) state: P::State,
    pub(crate) data: P::Data,
    pub(crate) timeout: Option<Duration>,
    pub(crate) stop_reason: Option<Reason>,
    pub(crate) replies: Vec<P::Reply>,
}

impl<P: Behavior> Transition<P> {
    pub(crate) fn to(state: P::State, data: P::Data) -> Self {
        Self {
            state,
            data,
            timeout: None,
            stop_reason: None,
            replies: Vec::new(),
        }
    }

    /// Replace the state data carried into the next state.
    pub fn using(mut self, data: P::Data) -> Self {
        self.data = data;
        self
    }

    /// Bound the next state's inactivity window, overriding the state's
    /// default timeout. Passing [`INFINITE`] clears the override.
    pub fn for_max(mut self, timeout: Duration) -> Self {
        self.timeout = (timeout < INFINITE).then_some(timeout);
        self
    }

    /// Queue a reply to the sender of the message being handled. Replies
    /// are delivered in the order they were queued, before any transition
    /// is gossiped.
    pub fn replying(mut self, reply: P::Reply) -> Self {
        self.replies.push(reply);
        self
    }

    /// Mark the descriptor as terminating the machine.
    pub fn with_stop_reason(mut self, reason: Reason) -> Self {
        self.stop_reason = Some(reason);
        self
    }

    /// The target state name.
    pub fn state(&self) -> &P::State {
        &self.state
    }

    /// The state data carried by the descriptor.
    pub fn data(&self) -> &P::Data {
        &self.data
    }

    /// The per-transition timeout override, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The stop reason, when the descriptor terminates the machine.
    pub fn stop_reason(&self) -> Option<&Reason> {
        self.stop_reason.as_ref()
    }

    /// A copy without the replies, which are not cloneable and are
    /// consumed at delivery.
    pub(crate) fn replicate(&self) -> Self {
        Self {
            state: self.state.clone(),
            data: self.data.clone(),
            timeout: self.timeout,
            stop_reason: self.stop_reason.clone(),
            replies: Vec::new(),
        }
    }
}

impl<P: Behavior> fmt::Debug for Transition<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("state", &self.state)
            .field("data", &self.data)
            .field("timeout", &self.timeout)
            .field("stop_reason", &self.stop_reason)
            .field("replies", &self.replies.len())
            .finish()
    }
}

/// Structural equality across all five fields.
impl<P: Behavior> PartialEq for Transition<P>
where
    P::Data: PartialEq,
    P::Reply: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
            && self.data == other.data
            && self.timeout == other.timeout
            && self.stop_reason == other.stop_reason
            && self.replies == other.replies
    }
}

impl<P: Behavior> Eq for Transition<P>
where
    P::Data: Eq,
    P::Reply: Eq,
{
}
