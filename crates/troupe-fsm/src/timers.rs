//! Named timers with generation admission.
//!
//! Every timer registration stamps a fresh generation from a per-table
//! monotonic counter. A delivered firing is honored only when its name is
//! still registered *and* its generation matches the live entry, so a
//! cancellation that overlaps an already-enqueued firing is never
//! observed by handler code.
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use troupe::{ActorRef, CancelToken, Scheduler};

use crate::event::{Envelope, Message};
use crate::Behavior;

/// Monotonic stamp distinguishing a live firing from a stale one.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Advance to the next generation, returning the new value.
    pub(crate) fn bump(&mut self) -> Generation {
        self.0 += 1;
        *self
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The record a timer task posts into the machine's mailbox when it
/// fires. The payload is dispatched only if the firing passes admission.
#[derive(Debug)]
pub struct TimerFired<E> {
    /// The timer's name.
    pub name: String,
    /// The payload to dispatch as a user event.
    pub event: E,
    /// The generation the timer was registered under.
    pub generation: Generation,
}

/// Bookkeeping for one named timer. Dropping the entry cancels the
/// scheduled task.
struct TimerEntry {
    generation: Generation,
    repeat: bool,
    token: CancelToken,
}

impl Drop for TimerEntry {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// The named-timer table of one machine.
pub(crate) struct TimerTable {
    entries: HashMap<String, TimerEntry>,
    generation: Generation,
}

impl TimerTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            generation: Generation::default(),
        }
    }

    /// Register `name`, replacing (and thereby cancelling) any previous
    /// timer under the same name. The scheduled task posts a
    /// [`TimerFired`] record into `self_ref`'s mailbox on every firing.
    pub fn set<P>(
        &mut self,
        name: String,
        event: P::Event,
        delay: Duration,
        repeat: bool,
        scheduler: &mut dyn Scheduler,
        self_ref: &ActorRef<Envelope<P>>,
    ) where
        P: Behavior + 'static,
        P::Event: Clone,
    {
        let generation = self.generation.bump();
        let token = CancelToken::new();
        let task = {
            let name = name.clone();
            let self_ref = self_ref.clone();
            Box::new(move || {
                let fired = TimerFired {
                    name: name.clone(),
                    event: event.clone(),
                    generation,
                };
                if self_ref.send(Envelope::of(Message::TimerFired(fired))).is_err() {
                    log::trace!(target: "fsm", "timer '{name}' fired for a dropped mailbox");
                }
            })
        };
        if repeat {
            scheduler.schedule_repeating(delay, delay, task, token.clone());
        } else {
            scheduler.schedule_once(delay, task, token.clone());
        }
        self.entries.insert(
            name,
            TimerEntry {
                generation,
                repeat,
                token,
            },
        );
    }

    /// Cancel `name`. Idempotent; a firing already in the mailbox will be
    /// refused admission.
    pub fn cancel(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// An entry exists: the timer is live, or a one-shot firing is
    /// enqueued but not yet processed.
    pub fn is_active(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Admission check for a delivered firing: the name must still be
    /// registered and the generation must match the live entry.
    pub fn admit(&self, name: &str, generation: Generation) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Remove an admitted one-shot entry before its payload is
    /// dispatched. Repeating entries stay registered.
    pub fn consume_one_shot(&mut self, name: &str) {
        if self.entries.get(name).is_some_and(|entry| !entry.repeat) {
            self.entries.remove(name);
        }
    }

    /// Cancel and clear every timer. Used at termination.
    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod test {
    use qcheck_macros::quickcheck;
    use troupe::{mailbox, ManualScheduler};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct On;

    struct Probe;

    impl Behavior for Probe {
        type State = On;
        type Data = ();
        type Event = u32;
        type Reply = ();
    }

    /// Pull every timer record the scheduler has posted so far.
    fn fired(rx: &crossbeam_channel::Receiver<Envelope<Probe>>) -> Vec<TimerFired<u32>> {
        rx.try_iter()
            .map(|envelope| match envelope.message {
                Message::TimerFired(fired) => fired,
                _ => panic!("only timer records are posted here"),
            })
            .collect()
    }

    #[quickcheck]
    fn prop_generations_strictly_increase(names: Vec<u8>) -> bool {
        let (addr, rx) = mailbox();
        let mut sched = ManualScheduler::new();
        let mut table = TimerTable::new();

        for name in &names {
            table.set::<Probe>(
                format!("t{name}"),
                0,
                Duration::from_millis(1),
                false,
                &mut sched,
                &addr,
            );
        }
        sched.advance(Duration::from_millis(2));

        // Replaced entries cancel their predecessors, so only the latest
        // registration per name fires; those still arrive in registration
        // order and must carry strictly increasing generations.
        let fired = fired(&rx);
        fired.windows(2).all(|pair| pair[0].generation < pair[1].generation)
            && fired.iter().all(|f| table.admit(&f.name, f.generation))
    }

    #[test]
    fn test_replacing_a_timer_cancels_the_previous_one() {
        let (addr, rx) = mailbox();
        let mut sched = ManualScheduler::new();
        let mut table = TimerTable::new();

        table.set::<Probe>("t".into(), 1, Duration::from_millis(10), false, &mut sched, &addr);
        table.set::<Probe>("t".into(), 2, Duration::from_millis(10), false, &mut sched, &addr);
        sched.advance(Duration::from_millis(20));

        let fired = fired(&rx);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event, 2);
        assert!(table.admit("t", fired[0].generation));
    }

    #[test]
    fn test_cancel_is_idempotent_and_revokes_admission() {
        let (addr, rx) = mailbox();
        let mut sched = ManualScheduler::new();
        let mut table = TimerTable::new();

        table.set::<Probe>("t".into(), 1, Duration::from_millis(1), true, &mut sched, &addr);
        sched.advance(Duration::from_millis(1));

        let fired_events = fired(&rx);
        assert_eq!(fired_events.len(), 1);
        assert!(table.is_active("t"));

        assert!(table.cancel("t"));
        assert!(!table.cancel("t"));
        assert!(!table.is_active("t"));
        assert!(!table.admit("t", fired_events[0].generation));

        // The entry's token was cancelled on drop: nothing fires anymore.
        sched.advance(Duration::from_millis(10));
        assert!(fired(&rx).is_empty());
    }

    #[test]
    fn test_one_shot_stays_active_until_consumed() {
        let (addr, rx) = mailbox();
        let mut sched = ManualScheduler::new();
        let mut table = TimerTable::new();

        table.set::<Probe>("t".into(), 1, Duration::from_millis(1), false, &mut sched, &addr);
        sched.advance(Duration::from_millis(1));

        // The firing sits in the mailbox; the entry is still there.
        assert!(table.is_active("t"));
        let fired = fired(&rx);
        assert!(table.admit("t", fired[0].generation));

        table.consume_one_shot("t");
        assert!(!table.is_active("t"));
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_consume_leaves_repeating_entries() {
        let (addr, _rx) = mailbox();
        let mut sched = ManualScheduler::new();
        let mut table = TimerTable::new();

        table.set::<Probe>("t".into(), 1, Duration::from_millis(1), true, &mut sched, &addr);
        table.consume_one_shot("t");
        assert!(table.is_active("t"));
    }
}
