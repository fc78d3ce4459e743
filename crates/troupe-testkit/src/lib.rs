//! A deterministic host harness for driving one machine in tests.
//!
//! [`Rig`] owns a machine, its mailbox and a virtual clock: tests post
//! messages, pump the mailbox with [`Rig::run`], and move time with
//! [`Rig::advance`]. Every interleaving is reproducible because nothing
//! runs on another thread. [`TestContext`] is the underlying
//! [`ActorContext`] implementation, usable on its own with any scheduler
//! (for example a wall-clock [`troupe::ThreadScheduler`] smoke test).
use std::collections::HashSet;
use std::time::Duration;

use crossbeam_channel as chan;
use troupe::{mailbox, ActorId, ActorRef, ManualScheduler, Scheduler};
use troupe_fsm::{ActorContext, Behavior, Envelope, Error, Fsm, Message, Notice};

/// Host state for one machine under test, generic over the scheduler.
pub struct TestContext<P: Behavior, S> {
    self_ref: ActorRef<Envelope<P>>,
    scheduler: S,
    watched: HashSet<ActorId>,
    stop_requested: bool,
}

impl<P: Behavior, S: Scheduler> TestContext<P, S> {
    pub fn new(self_ref: ActorRef<Envelope<P>>, scheduler: S) -> Self {
        Self {
            self_ref,
            scheduler,
            watched: HashSet::new(),
            stop_requested: false,
        }
    }

    /// Whether the machine asked the host to stop it.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Whether `id` is currently watched for lifecycle notifications.
    pub fn watching(&self, id: ActorId) -> bool {
        self.watched.contains(&id)
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }
}

impl<P: Behavior, S: Scheduler> ActorContext<P> for TestContext<P, S> {
    fn self_ref(&self) -> &ActorRef<Envelope<P>> {
        &self.self_ref
    }

    fn scheduler(&mut self) -> &mut dyn Scheduler {
        &mut self.scheduler
    }

    fn watch(&mut self, observer: &ActorRef<Notice<P::State>>) {
        self.watched.insert(observer.id());
    }

    fn unwatch(&mut self, observer: &ActorRef<Notice<P::State>>) {
        self.watched.remove(&observer.id());
    }

    fn stop(&mut self) {
        self.stop_requested = true;
    }
}

/// A machine wired to a mailbox and a virtual clock.
pub struct Rig<P: Behavior> {
    fsm: Fsm<P>,
    mailbox: chan::Receiver<Envelope<P>>,
    ctx: TestContext<P, ManualScheduler>,
    stopped: bool,
}

impl<P: Behavior + 'static> Rig<P> {
    /// Wire `fsm` to a fresh mailbox and run [`Fsm::initialize`].
    pub fn start(mut fsm: Fsm<P>) -> Result<Self, Error> {
        let (self_ref, mailbox) = mailbox();
        let mut ctx = TestContext::new(self_ref, ManualScheduler::new());
        fsm.initialize(&mut ctx)?;

        let mut rig = Self {
            fsm,
            mailbox,
            ctx,
            stopped: false,
        };
        // Initialization may already have stopped the machine (an initial
        // state without a handler).
        rig.run()?;
        Ok(rig)
    }

    /// The machine's address.
    pub fn self_ref(&self) -> &ActorRef<Envelope<P>> {
        self.ctx.self_ref()
    }

    /// Post a user event with no sender.
    pub fn send(&self, event: P::Event) {
        self.post(Envelope::of(Message::User(event)));
    }

    /// Post a user event carrying a reply target.
    pub fn send_from(&self, event: P::Event, sender: &ActorRef<P::Reply>) {
        self.post(Envelope {
            message: Message::User(event),
            sender: Some(sender.clone()),
        });
    }

    /// Post a subscription for `observer`.
    pub fn subscribe(&self, observer: &ActorRef<Notice<P::State>>) {
        self.post(Envelope::of(Message::Subscribe(observer.clone())));
    }

    pub fn unsubscribe(&self, observer: &ActorRef<Notice<P::State>>) {
        self.post(Envelope::of(Message::Unsubscribe(observer.clone())));
    }

    /// Post a subscription through the alternate admission channel.
    pub fn listen(&self, observer: &ActorRef<Notice<P::State>>) {
        self.post(Envelope::of(Message::Listen(observer.clone())));
    }

    pub fn deafen(&self, observer: &ActorRef<Notice<P::State>>) {
        self.post(Envelope::of(Message::Deafen(observer.clone())));
    }

    /// Report a watched observer as terminated, as a host would on a
    /// lifecycle notification. Unwatched ids are ignored.
    pub fn terminate_observer(&self, id: ActorId) {
        if self.ctx.watching(id) {
            self.post(Envelope::of(Message::ObserverTerminated(id)));
        }
    }

    fn post(&self, envelope: Envelope<P>) {
        self.ctx
            .self_ref()
            .send(envelope)
            .expect("the rig holds the receive half");
    }

    /// Drain the mailbox. Delivery stops once the machine asks the host
    /// to stop; the host then runs its post-stop hook.
    pub fn run(&mut self) -> Result<(), Error> {
        while !self.stopped && !self.ctx.stop_requested() {
            match self.mailbox.try_recv() {
                Ok(envelope) => self.fsm.receive(envelope, &mut self.ctx)?,
                Err(_) => break,
            }
        }
        if !self.stopped && self.ctx.stop_requested() {
            self.stopped = true;
            self.fsm.post_stop(&mut self.ctx);
        }
        Ok(())
    }

    /// Advance the virtual clock, then drain whatever fired.
    pub fn advance(&mut self, by: Duration) -> Result<(), Error> {
        self.ctx.scheduler_mut().advance(by);
        self.run()
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.ctx.scheduler.now()
    }

    /// Whether the host stopped the machine.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// The machine, for assertions.
    pub fn fsm(&self) -> &Fsm<P> {
        &self.fsm
    }

    pub fn fsm_mut(&mut self) -> &mut Fsm<P> {
        &mut self.fsm
    }
}

/// An observer mailbox for transition notices.
pub fn observer<S>() -> (ActorRef<Notice<S>>, chan::Receiver<Notice<S>>) {
    mailbox()
}

/// A reply mailbox posing as a message sender.
pub fn reply_probe<R>() -> (ActorRef<R>, chan::Receiver<R>) {
    mailbox()
}
