//! Per-state handler storage and composition.
use std::collections::HashMap;

use crate::event::Event;
use crate::machine::Ctx;
use crate::state::Transition;
use crate::Behavior;

/// A state handler: consumes an event and returns the transition to
/// apply, or `None` to decline — falling through to a chained handler and
/// finally to the unhandled-event handler.
pub type StateHandler<P> =
    Box<dyn FnMut(&Event<P>, &mut Ctx<'_, P>) -> Option<Transition<P>> + Send>;

/// The composed handler for every registered state, plus the user
/// unhandled-event handler.
pub(crate) struct HandlerTable<P: Behavior> {
    states: HashMap<P::State, StateHandler<P>>,
    unhandled: Option<StateHandler<P>>,
}

impl<P: Behavior + 'static> HandlerTable<P> {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            unhandled: None,
        }
    }

    /// Record a handler for `state`. Re-registration chains: the existing
    /// handler keeps precedence and the new one is consulted only when it
    /// declines.
    pub fn register(&mut self, state: P::State, handler: StateHandler<P>) {
        match self.states.remove(&state) {
            None => {
                self.states.insert(state, handler);
            }
            Some(mut first) => {
                let mut second = handler;
                self.states.insert(
                    state,
                    Box::new(move |event, ctx| first(event, ctx).or_else(|| second(event, ctx))),
                );
            }
        }
    }

    /// Replace the user unhandled-event handler. The built-in fallback
    /// (warn and stay) still applies when the replacement declines.
    pub fn set_unhandled(&mut self, handler: StateHandler<P>) {
        self.unhandled = Some(handler);
    }

    pub fn contains(&self, state: &P::State) -> bool {
        self.states.contains_key(state)
    }

    pub fn state_handler(&mut self, state: &P::State) -> Option<&mut StateHandler<P>> {
        self.states.get_mut(state)
    }

    pub fn unhandled_handler(&mut self) -> Option<&mut StateHandler<P>> {
        self.unhandled.as_mut()
    }
}

/// Post-process a handler's descriptors: `transform(handler).using(wrap)`
/// yields a handler that pipes every descriptor `handler` produces
/// through `wrap` before the kernel applies it.
pub fn transform<H>(handler: H) -> Transform<H> {
    Transform { handler }
}

/// Intermediate value of [`transform`]; finished with
/// [`Transform::using`].
pub struct Transform<H> {
    handler: H,
}

impl<H> Transform<H> {
    /// Compose with `wrap`.
    pub fn using<P, W>(
        self,
        mut wrap: W,
    ) -> impl FnMut(&Event<P>, &mut Ctx<'_, P>) -> Option<Transition<P>> + Send
    where
        P: Behavior,
        H: FnMut(&Event<P>, &mut Ctx<'_, P>) -> Option<Transition<P>> + Send,
        W: FnMut(Transition<P>) -> Transition<P> + Send,
    {
        let mut handler = self.handler;
        move |event, ctx| handler(event, ctx).map(&mut wrap)
    }
}
