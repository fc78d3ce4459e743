//! The machine kernel: message classification, handler dispatch,
//! transitions and termination.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use troupe::{ActorId, ActorRef, CancelToken, Scheduler};

use crate::event::{Envelope, Event, EventPayload, Message, Notice};
use crate::handlers::HandlerTable;
use crate::listeners::Listeners;
use crate::state::{AccessError, Reason, StopEvent, Transition, UnknownState, INFINITE};
use crate::timers::{Generation, TimerFired, TimerTable};
use crate::Behavior;

/// Engine misuse errors. An unknown target state is *not* one of these:
/// it is recovered internally by terminating with [`Reason::Failure`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// [`Fsm::initialize`] was called without a preceding
    /// [`Fsm::start_with`].
    #[error("start_with must be called before initialize")]
    NoInitialState,
    /// A message was delivered before [`Fsm::initialize`].
    #[error("the machine is not initialized")]
    NotInitialized,
}

/// The abstract host surface the engine consumes: whatever runtime owns
/// the mailbox implements this. The host must deliver envelopes one at a
/// time; all machine state is confined to that serialized context.
pub trait ActorContext<P: Behavior> {
    /// The machine's own address, for scheduler tasks to post back into.
    fn self_ref(&self) -> &ActorRef<Envelope<P>>;

    /// The scheduler timers and state-entry timeouts run on.
    fn scheduler(&mut self) -> &mut dyn Scheduler;

    /// Ask the host to deliver [`Message::ObserverTerminated`] when
    /// `observer` dies.
    fn watch(&mut self, observer: &ActorRef<Notice<P::State>>);

    /// Undo a previous [`ActorContext::watch`].
    fn unwatch(&mut self, observer: &ActorRef<Notice<P::State>>);

    /// Request the host to stop this actor. The host's post-stop path
    /// should call [`Fsm::post_stop`].
    fn stop(&mut self);
}

/// Where an event came from; used for logging and the rolling trace.
enum Source {
    Sender(Option<ActorId>),
    Timer(String),
    StateTimeout,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender(Some(id)) => write!(f, "{id}"),
            Self::Sender(None) => write!(f, "anonymous"),
            Self::Timer(name) => write!(f, "timer '{name}'"),
            Self::StateTimeout => write!(f, "state timeout"),
        }
    }
}

/// The mutable heart of a machine: everything handlers may touch while
/// the handler table is borrowed for dispatch.
struct Core<P: Behavior> {
    current: Option<Transition<P>>,
    /// Set only while transition hooks run.
    next_data: Option<P::Data>,
    timers: TimerTable,
    /// Per-state default inactivity timeouts.
    timeouts: HashMap<P::State, Duration>,
    listeners: Listeners<P::State>,
    /// Stamp carried by state-timeout markers; bumped on every user or
    /// admitted timer message, which invalidates markers still in flight.
    generation: Generation,
    /// Cancels the pending state-entry timeout, when one is armed.
    timeout_token: Option<CancelToken>,
    debug: bool,
    /// Ring of recent event descriptions, kept when `log_depth > 0`.
    trace: VecDeque<String>,
    log_depth: usize,
    initialized: bool,
}

impl<P: Behavior> Core<P> {
    fn new() -> Self {
        Self {
            current: None,
            next_data: None,
            timers: TimerTable::new(),
            timeouts: HashMap::new(),
            listeners: Listeners::new(),
            generation: Generation::default(),
            timeout_token: None,
            debug: false,
            trace: VecDeque::new(),
            log_depth: 0,
            initialized: false,
        }
    }

    fn current(&self) -> &Transition<P> {
        self.current
            .as_ref()
            .expect("start_with must be called before the machine runs")
    }

    fn cancel_state_timeout(&mut self) {
        if let Some(token) = self.timeout_token.take() {
            token.cancel();
        }
    }
}

/// The machine view handed to state handlers, transition hooks and the
/// finalizer: accessors, descriptor constructors and timer operations.
pub struct Ctx<'a, P: Behavior> {
    core: &'a mut Core<P>,
    host: &'a mut dyn ActorContext<P>,
}

impl<'a, P: Behavior + 'static> Ctx<'a, P> {
    /// The current state name.
    pub fn state_name(&self) -> &P::State {
        self.core.current().state()
    }

    /// The current state data.
    pub fn state_data(&self) -> &P::Data {
        self.core.current().data()
    }

    /// The data the machine is transitioning to. Only available inside a
    /// transition hook.
    pub fn next_state_data(&self) -> Result<&P::Data, AccessError> {
        self.core.next_data.as_ref().ok_or(AccessError)
    }

    /// A descriptor targeting `state`, carrying the current data.
    pub fn goto(&self, state: P::State) -> Transition<P> {
        Transition::to(state, self.state_data().clone())
    }

    /// A descriptor that stays in the current state.
    pub fn stay(&self) -> Transition<P> {
        self.goto(self.state_name().clone())
    }

    /// A descriptor terminating the machine with [`Reason::Normal`].
    pub fn stop(&self) -> Transition<P> {
        self.stop_with(Reason::Normal)
    }

    /// A descriptor terminating the machine with `reason`.
    pub fn stop_with(&self, reason: Reason) -> Transition<P> {
        self.stay().with_stop_reason(reason)
    }

    /// A descriptor terminating the machine with `reason`, replacing the
    /// state data first.
    pub fn stop_using(&self, reason: Reason, data: P::Data) -> Transition<P> {
        self.stay().using(data).with_stop_reason(reason)
    }

    /// Arm (or re-arm) the one-shot timer `name` to deliver `event` after
    /// `delay`.
    pub fn set_timer(&mut self, name: impl Into<String>, event: P::Event, delay: Duration)
    where
        P::Event: Clone,
    {
        self.set_timer_inner(name.into(), event, delay, false)
    }

    /// Arm (or re-arm) `name` to deliver `event` every `every`, starting
    /// after one full period.
    pub fn set_periodic_timer(&mut self, name: impl Into<String>, event: P::Event, every: Duration)
    where
        P::Event: Clone,
    {
        self.set_timer_inner(name.into(), event, every, true)
    }

    fn set_timer_inner(&mut self, name: String, event: P::Event, delay: Duration, repeat: bool)
    where
        P::Event: Clone,
    {
        if self.core.debug {
            log::debug!(
                target: "fsm",
                "setting {} timer '{name}' for {delay:?}",
                if repeat { "repeating" } else { "one-shot" },
            );
        }
        let self_ref = self.host.self_ref().clone();
        self.core
            .timers
            .set(name, event, delay, repeat, self.host.scheduler(), &self_ref);
    }

    /// Cancel the timer `name`. Idempotent; a firing already enqueued is
    /// refused admission and never reaches handler code.
    pub fn cancel_timer(&mut self, name: &str) {
        let cancelled = self.core.timers.cancel(name);
        if cancelled && self.core.debug {
            log::debug!(target: "fsm", "cancelled timer '{name}'");
        }
    }

    /// Whether `name` has a live entry. A one-shot stays active until its
    /// firing is processed.
    pub fn is_timer_active(&self, name: &str) -> bool {
        self.core.timers.is_active(name)
    }

    /// Set or clear the default inactivity timeout of `state`. Safe to
    /// call for the current state; the new value applies from the next
    /// transition on.
    pub fn set_state_timeout(&mut self, state: P::State, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => {
                self.core.timeouts.insert(state, timeout);
            }
            None => {
                self.core.timeouts.remove(&state);
            }
        }
    }
}

/// A finite-state machine driven by a host mailbox.
///
/// Wiring happens up front: register handlers with [`Fsm::when`], choose
/// the initial state with [`Fsm::start_with`], then commit with
/// [`Fsm::initialize`]. After that the host feeds every delivery to
/// [`Fsm::receive`].
pub struct Fsm<P: Behavior> {
    handlers: HandlerTable<P>,
    /// Transition hooks, run in registration order on real changes.
    hooks: Vec<Box<dyn FnMut(&mut Ctx<'_, P>, &P::State, &P::State) + Send>>,
    /// The termination finalizer, run exactly once.
    finalizer: Option<Box<dyn FnMut(&mut Ctx<'_, P>, StopEvent<P>) + Send>>,
    core: Core<P>,
}

impl<P: Behavior + 'static> Default for Fsm<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Behavior + 'static> Fsm<P> {
    pub fn new() -> Self {
        Self {
            handlers: HandlerTable::new(),
            hooks: Vec::new(),
            finalizer: None,
            core: Core::new(),
        }
    }

    /// Register `handler` for `state`. Repeated registrations chain: the
    /// earlier handler keeps precedence and later ones are consulted only
    /// when it declines.
    pub fn when<H>(&mut self, state: P::State, handler: H) -> &mut Self
    where
        H: FnMut(&Event<P>, &mut Ctx<'_, P>) -> Option<Transition<P>> + Send + 'static,
    {
        self.handlers.register(state, Box::new(handler));
        self
    }

    /// Like [`Fsm::when`], also recording `timeout` as the state's
    /// default inactivity timeout. The first timeout registered for a
    /// state wins; later registrations keep it. Use
    /// [`Fsm::set_state_timeout`] to override explicitly.
    pub fn when_for<H>(&mut self, state: P::State, timeout: Duration, handler: H) -> &mut Self
    where
        H: FnMut(&Event<P>, &mut Ctx<'_, P>) -> Option<Transition<P>> + Send + 'static,
    {
        self.core.timeouts.entry(state.clone()).or_insert(timeout);
        self.when(state, handler)
    }

    /// Replace the unhandled-event handler, consulted when the state
    /// handler declines an event. The built-in fallback (log a warning,
    /// stay) still applies when the replacement declines too.
    pub fn when_unhandled<H>(&mut self, handler: H) -> &mut Self
    where
        H: FnMut(&Event<P>, &mut Ctx<'_, P>) -> Option<Transition<P>> + Send + 'static,
    {
        self.handlers.set_unhandled(Box::new(handler));
        self
    }

    /// Choose the initial state and data. Takes effect at
    /// [`Fsm::initialize`].
    pub fn start_with(&mut self, state: P::State, data: P::Data) -> &mut Self {
        self.core.current = Some(Transition::to(state, data));
        self
    }

    /// Like [`Fsm::start_with`], with an initial inactivity timeout
    /// override.
    pub fn start_with_for(&mut self, state: P::State, data: P::Data, timeout: Duration) -> &mut Self {
        self.core.current = Some(Transition::to(state, data).for_max(timeout));
        self
    }

    /// Append a transition hook; hooks run in registration order on real
    /// state changes only, before observers are gossiped.
    pub fn on_transition<H>(&mut self, hook: H) -> &mut Self
    where
        H: FnMut(&mut Ctx<'_, P>, &P::State, &P::State) + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Install the termination finalizer, invoked exactly once with the
    /// stop event.
    pub fn on_termination<F>(&mut self, finalizer: F) -> &mut Self
    where
        F: FnMut(&mut Ctx<'_, P>, StopEvent<P>) + Send + 'static,
    {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Set or clear a state's default inactivity timeout.
    pub fn set_state_timeout(&mut self, state: P::State, timeout: Option<Duration>) -> &mut Self {
        match timeout {
            Some(timeout) => {
                self.core.timeouts.insert(state, timeout);
            }
            None => {
                self.core.timeouts.remove(&state);
            }
        }
        self
    }

    /// Log every processed message, transition, timer operation and
    /// subscription under target `"fsm"`.
    pub fn debug_events(&mut self, enabled: bool) -> &mut Self {
        self.core.debug = enabled;
        self
    }

    /// Keep a rolling trace of the last `depth` processed events, flushed
    /// to the log when the machine terminates with a failure. Zero
    /// disables the trace.
    pub fn log_depth(&mut self, depth: usize) -> &mut Self {
        self.core.log_depth = depth;
        self.core.trace.truncate(depth);
        self
    }

    /// The current state name.
    ///
    /// # Panics
    ///
    /// Panics when called before [`Fsm::start_with`].
    pub fn state_name(&self) -> &P::State {
        self.core.current().state()
    }

    /// The current state data.
    ///
    /// # Panics
    ///
    /// Panics when called before [`Fsm::start_with`].
    pub fn state_data(&self) -> &P::Data {
        self.core.current().data()
    }

    /// Whether the timer `name` has a live entry.
    pub fn is_timer_active(&self, name: &str) -> bool {
        self.core.timers.is_active(name)
    }

    /// Whether the termination sequence has run.
    pub fn is_terminated(&self) -> bool {
        self.core
            .current
            .as_ref()
            .is_some_and(|current| current.stop_reason().is_some())
    }

    /// Commit [`Fsm::start_with`] and arm the first state-entry timeout.
    ///
    /// Fails when no initial state was chosen. When the initial state has
    /// no registered handler the machine terminates with
    /// [`Reason::Failure`], exactly as it would on a bad transition.
    pub fn initialize(&mut self, host: &mut dyn ActorContext<P>) -> Result<(), Error> {
        let initial = match &self.core.current {
            Some(current) => current.replicate(),
            None => return Err(Error::NoInitialState),
        };
        self.core.initialized = true;
        self.make_transition(initial, None, host);
        Ok(())
    }

    /// Process one mailbox delivery.
    ///
    /// System messages (subscriptions, observer terminations, stale timer
    /// firings and stale timeout markers) are absorbed here; everything
    /// else is dispatched to the current state's handler and the
    /// resulting descriptor applied.
    pub fn receive(&mut self, envelope: Envelope<P>, host: &mut dyn ActorContext<P>) -> Result<(), Error> {
        if !self.core.initialized {
            return Err(Error::NotInitialized);
        }
        if self.is_terminated() {
            log::trace!(target: "fsm", "dropping a message delivered after termination");
            return Ok(());
        }
        let Envelope { message, sender } = envelope;
        match message {
            Message::StateTimeout(generation) => {
                if generation == self.core.generation {
                    self.core.timeout_token = None;
                    self.process_event(EventPayload::StateTimeout, None, Source::StateTimeout, host);
                } else {
                    log::trace!(target: "fsm", "dropping a stale state-timeout marker");
                }
            }
            Message::TimerFired(TimerFired {
                name,
                event,
                generation,
            }) => {
                if self.core.timers.admit(&name, generation) {
                    self.core.cancel_state_timeout();
                    self.core.generation.bump();
                    self.core.timers.consume_one_shot(&name);
                    if self.core.debug {
                        log::debug!(target: "fsm", "timer '{name}' fired");
                    }
                    self.process_event(EventPayload::Message(event), sender, Source::Timer(name), host);
                } else {
                    log::trace!(target: "fsm", "dropping a stale firing of timer '{name}'");
                }
            }
            Message::Subscribe(observer) | Message::Listen(observer) => {
                self.subscribe(observer, host);
            }
            Message::Unsubscribe(observer) | Message::Deafen(observer) => {
                self.unsubscribe(&observer, host);
            }
            Message::ObserverTerminated(id) => {
                if self.core.listeners.remove(id).is_some() && self.core.debug {
                    log::debug!(target: "fsm", "observer {id} terminated");
                }
            }
            Message::User(event) => {
                self.core.cancel_state_timeout();
                self.core.generation.bump();
                let source = Source::Sender(sender.as_ref().map(ActorRef::id));
                self.process_event(EventPayload::Message(event), sender, source, host);
            }
        }
        Ok(())
    }

    /// Host safety net: ensure the termination sequence ran, with
    /// [`Reason::Shutdown`] when nothing ran it before. Idempotent.
    pub fn post_stop(&mut self, host: &mut dyn ActorContext<P>) {
        let shutdown = match &self.core.current {
            Some(current) if current.stop_reason().is_none() => {
                current.replicate().with_stop_reason(Reason::Shutdown)
            }
            _ => return,
        };
        self.terminate(shutdown, host);
    }

    /// Dispatch an event to the current state's handler, falling through
    /// to the unhandled-event handler, and apply the result.
    fn process_event(
        &mut self,
        payload: EventPayload<P::Event>,
        sender: Option<ActorRef<P::Reply>>,
        source: Source,
        host: &mut dyn ActorContext<P>,
    ) {
        let state = self.state_name().clone();
        if self.core.debug {
            log::debug!(target: "fsm", "processing {payload:?} from {source}");
        }
        if self.core.log_depth > 0 {
            if self.core.trace.len() == self.core.log_depth {
                self.core.trace.pop_front();
            }
            self.core
                .trace
                .push_back(format!("{state:?} <- {payload:?} from {source}"));
        }
        let event = Event {
            payload,
            data: self.state_data().clone(),
        };
        let next = {
            let mut ctx = Ctx {
                core: &mut self.core,
                host: &mut *host,
            };
            let handled = match self.handlers.state_handler(&state) {
                Some(handler) => handler(&event, &mut ctx),
                None => None,
            };
            let handled = match handled {
                Some(next) => Some(next),
                None => match self.handlers.unhandled_handler() {
                    Some(handler) => handler(&event, &mut ctx),
                    None => None,
                },
            };
            match handled {
                Some(next) => next,
                None => {
                    log::warn!(
                        target: "fsm",
                        "unhandled event {:?} in state {state:?}",
                        event.payload,
                    );
                    ctx.stay()
                }
            }
        };
        self.apply(next, sender, host);
    }

    /// Apply a descriptor: terminate when it carries a stop reason,
    /// transition otherwise.
    fn apply(
        &mut self,
        mut next: Transition<P>,
        sender: Option<ActorRef<P::Reply>>,
        host: &mut dyn ActorContext<P>,
    ) {
        if next.stop_reason().is_some() {
            deliver_replies(&mut next, sender.as_ref());
            self.terminate(next, host);
            host.stop();
        } else {
            self.make_transition(next, sender, host);
        }
    }

    fn make_transition(
        &mut self,
        mut next: Transition<P>,
        sender: Option<ActorRef<P::Reply>>,
        host: &mut dyn ActorContext<P>,
    ) {
        if !self.handlers.contains(next.state()) {
            let current = self.core.current();
            let failed = Transition::to(current.state().clone(), current.data().clone())
                .with_stop_reason(Reason::failure(UnknownState(next.state().clone())));
            self.apply(failed, sender, host);
            return;
        }
        deliver_replies(&mut next, sender.as_ref());

        let from = self.state_name().clone();
        if from != *next.state() {
            let to = next.state().clone();
            self.core.next_data = Some(next.data().clone());
            let mut hooks = std::mem::take(&mut self.hooks);
            {
                let mut ctx = Ctx {
                    core: &mut self.core,
                    host: &mut *host,
                };
                for hook in hooks.iter_mut() {
                    hook(&mut ctx, &from, &to);
                }
            }
            self.hooks = hooks;
            if self.core.debug {
                log::debug!(target: "fsm", "transition {from:?} -> {to:?}");
            }
            self.core.listeners.gossip(&Notice::Transition {
                source: host.self_ref().id(),
                from: from.clone(),
                to,
            });
            self.core.next_data = None;
        }
        self.core.current = Some(next);
        self.arm_state_timeout(host);
    }

    /// Arm the state-entry timeout of the state just entered: the
    /// descriptor's override if set, else the state's default, else none.
    fn arm_state_timeout(&mut self, host: &mut dyn ActorContext<P>) {
        self.core.cancel_state_timeout();

        let current = self.core.current();
        let timeout = current
            .timeout()
            .or_else(|| self.core.timeouts.get(current.state()).copied());
        let Some(timeout) = timeout else {
            return;
        };
        if timeout >= INFINITE {
            return;
        }
        let token = CancelToken::new();
        let generation = self.core.generation;
        let self_ref = host.self_ref().clone();
        let task = Box::new(move || {
            if self_ref
                .send(Envelope::of(Message::StateTimeout(generation)))
                .is_err()
            {
                log::trace!(target: "fsm", "state-timeout marker fired for a dropped mailbox");
            }
        });
        host.scheduler().schedule_once(timeout, task, token.clone());
        self.core.timeout_token = Some(token);
    }

    /// The termination sequence. Runs at most once: a machine whose
    /// current state already carries a stop reason is left untouched.
    fn terminate(&mut self, next: Transition<P>, host: &mut dyn ActorContext<P>) {
        if self.is_terminated() {
            return;
        }
        let reason = next
            .stop_reason()
            .cloned()
            .expect("a terminating descriptor carries a reason");
        self.log_termination(&reason);
        self.core.cancel_state_timeout();
        self.core.timers.cancel_all();
        self.core.current = Some(next);

        let current = self.core.current();
        let stop_event = StopEvent {
            reason,
            state: current.state().clone(),
            data: current.data().clone(),
        };
        if let Some(mut finalizer) = self.finalizer.take() {
            let mut ctx = Ctx {
                core: &mut self.core,
                host: &mut *host,
            };
            finalizer(&mut ctx, stop_event);
            self.finalizer = Some(finalizer);
        }
    }

    /// Failures are logged at error level, with the cause chain and the
    /// rolling event trace; other reasons are not logged.
    fn log_termination(&mut self, reason: &Reason) {
        let Reason::Failure(cause) = reason else {
            return;
        };
        log::error!(target: "fsm", "terminating due to failure: {cause}");
        let mut source = cause.source();
        while let Some(cause) = source {
            log::error!(target: "fsm", "caused by: {cause}");
            source = cause.source();
        }
        for line in self.core.trace.drain(..) {
            log::error!(target: "fsm", "trace: {line}");
        }
    }

    fn subscribe(&mut self, observer: ActorRef<Notice<P::State>>, host: &mut dyn ActorContext<P>) {
        host.watch(&observer);
        if self.core.debug {
            log::debug!(target: "fsm", "observer {} subscribed", observer.id());
        }
        let baseline = Notice::CurrentState {
            source: host.self_ref().id(),
            state: self.state_name().clone(),
        };
        let target = observer.clone();
        self.core.listeners.insert(observer);
        if target.send(baseline).is_err() {
            log::trace!(target: "fsm", "observer {} is gone, dropping the baseline", target.id());
        }
    }

    fn unsubscribe(&mut self, observer: &ActorRef<Notice<P::State>>, host: &mut dyn ActorContext<P>) {
        host.unwatch(observer);
        if self.core.listeners.remove(observer.id()).is_some() && self.core.debug {
            log::debug!(target: "fsm", "observer {} unsubscribed", observer.id());
        }
    }
}

/// Deliver a descriptor's replies to the sender of the message that
/// produced it, in the order they were queued, before any transition is
/// gossiped.
fn deliver_replies<P: Behavior>(next: &mut Transition<P>, sender: Option<&ActorRef<P::Reply>>) {
    for reply in next.replies.drain(..) {
        match sender {
            Some(sender) => {
                if sender.send(reply).is_err() {
                    log::debug!(target: "fsm", "sender {} is gone, dropping a reply", sender.id());
                }
            }
            None => log::debug!(target: "fsm", "no sender to deliver a reply to"),
        }
    }
}
