//! Task scheduling for actor hosts.
//!
//! A scheduler runs deferred tasks whose only job is to post messages back
//! into a mailbox; tasks never touch actor state directly. Two
//! implementations are provided: [`ManualScheduler`] drives a virtual
//! clock for deterministic tests, [`ThreadScheduler`] keeps wall-clock
//! time on a dedicated timer thread.
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use crate::cancel::CancelToken;

/// Shortest accepted repeat interval. Guards against a zero period pinning
/// the clock in place.
const MIN_PERIOD: Duration = Duration::from_nanos(1);

/// Maximum amount of time the timer thread waits when nothing is queued.
const IDLE_WAIT: Duration = Duration::from_secs(60 * 60);

/// A deferred unit of work.
pub type Task = Box<dyn FnMut() + Send>;

/// Schedules tasks for later execution. A fired task is skipped when its
/// token was cancelled in the meantime.
pub trait Scheduler {
    /// Run `task` once after `delay`, unless `token` is cancelled first.
    fn schedule_once(&mut self, delay: Duration, task: Task, token: CancelToken);

    /// Run `task` after `initial`, then every `every`, until `token` is
    /// cancelled.
    fn schedule_repeating(&mut self, initial: Duration, every: Duration, task: Task, token: CancelToken);
}

/// One queued task.
struct Entry {
    task: Task,
    token: CancelToken,
    every: Option<Duration>,
}

/// Due-ordered task queue shared by both scheduler implementations. Keys
/// carry a sequence number so entries with equal deadlines fire FIFO.
struct Queue<T: Ord + Copy> {
    entries: BTreeMap<(T, u64), Entry>,
    seq: u64,
}

impl<T: Ord + Copy> Queue<T> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            seq: 0,
        }
    }

    fn insert(&mut self, due: T, entry: Entry) {
        self.seq += 1;
        self.entries.insert((due, self.seq), entry);
    }

    fn next_due(&self) -> Option<T> {
        self.entries.first_key_value().map(|(&(due, _), _)| due)
    }

    /// Pop the first entry due at or before `now`.
    fn pop_due(&mut self, now: T) -> Option<(T, Entry)> {
        let (due, _) = *self.entries.first_key_value()?.0;
        if due > now {
            return None;
        }
        self.entries
            .pop_first()
            .map(|((due, _), entry)| (due, entry))
    }
}

/// Virtual-clock scheduler for deterministic tests.
///
/// Nothing fires until [`ManualScheduler::advance`] moves the clock; due
/// entries then run in deadline order. The clock starts at zero.
pub struct ManualScheduler {
    now: Duration,
    queue: Queue<Duration>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            queue: Queue::new(),
        }
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Move the clock forward by `by`, running every due, uncancelled task
    /// in deadline order and re-queueing repeating entries.
    pub fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        while let Some((due, mut entry)) = self.queue.pop_due(target) {
            self.now = due;
            if entry.token.is_cancelled() {
                continue;
            }
            (entry.task)();
            if let Some(every) = entry.every {
                self.queue.insert(due + every, entry);
            }
        }
        self.now = target;
    }

    /// Number of queued (not yet fired) entries, cancelled ones included.
    pub fn pending(&self) -> usize {
        self.queue.entries.len()
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&mut self, delay: Duration, task: Task, token: CancelToken) {
        self.queue.insert(
            self.now + delay,
            Entry {
                task,
                token,
                every: None,
            },
        );
    }

    fn schedule_repeating(&mut self, initial: Duration, every: Duration, task: Task, token: CancelToken) {
        self.queue.insert(
            self.now + initial,
            Entry {
                task,
                token,
                every: Some(every.max(MIN_PERIOD)),
            },
        );
    }
}

/// What the handles send to the timer thread.
enum Request {
    Schedule { due: Instant, entry: Entry },
    Shutdown,
}

/// Wall-clock scheduler backed by a dedicated timer thread.
///
/// The thread sleeps until the next deadline, waking early when a new task
/// is scheduled. Dropping the scheduler shuts the thread down; queued
/// tasks are discarded.
pub struct ThreadScheduler {
    tx: chan::Sender<Request>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        let (tx, rx) = chan::unbounded();
        let handle = thread::Builder::new()
            .name("troupe-timer".to_owned())
            .spawn(move || Self::run(rx))
            .expect("timer thread can be spawned");

        Self {
            tx,
            handle: Some(handle),
        }
    }

    fn run(rx: chan::Receiver<Request>) {
        let mut queue: Queue<Instant> = Queue::new();
        loop {
            let now = Instant::now();
            while let Some((due, mut entry)) = queue.pop_due(now) {
                if entry.token.is_cancelled() {
                    continue;
                }
                (entry.task)();
                if let Some(every) = entry.every {
                    queue.insert(due + every, entry);
                }
            }
            let wait = queue
                .next_due()
                .map(|due| due.saturating_duration_since(now))
                .unwrap_or(IDLE_WAIT);

            match rx.recv_timeout(wait) {
                Ok(Request::Schedule { due, entry }) => queue.insert(due, entry),
                Ok(Request::Shutdown) | Err(chan::RecvTimeoutError::Disconnected) => break,
                Err(chan::RecvTimeoutError::Timeout) => continue,
            }
        }
    }

    fn submit(&self, due: Instant, entry: Entry) {
        if self.tx.send(Request::Schedule { due, entry }).is_err() {
            log::error!(target: "sched", "timer thread is gone, dropping a task");
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_once(&mut self, delay: Duration, task: Task, token: CancelToken) {
        self.submit(
            Instant::now() + delay,
            Entry {
                task,
                token,
                every: None,
            },
        );
    }

    fn schedule_repeating(&mut self, initial: Duration, every: Duration, task: Task, token: CancelToken) {
        self.submit(
            Instant::now() + initial,
            Entry {
                task,
                token,
                every: Some(every.max(MIN_PERIOD)),
            },
        );
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::actor::mailbox;

    fn post(addr: &crate::ActorRef<u32>, n: u32) -> Task {
        let addr = addr.clone();
        Box::new(move || addr.send(n).unwrap())
    }

    #[test]
    fn test_manual_fires_in_deadline_order() {
        let (addr, rx) = mailbox();
        let mut sched = ManualScheduler::new();

        sched.schedule_once(Duration::from_millis(30), post(&addr, 3), CancelToken::new());
        sched.schedule_once(Duration::from_millis(10), post(&addr, 1), CancelToken::new());
        sched.schedule_once(Duration::from_millis(10), post(&addr, 2), CancelToken::new());

        sched.advance(Duration::from_millis(5));
        assert!(rx.try_recv().is_err());

        sched.advance(Duration::from_millis(30));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_manual_skips_cancelled() {
        let (addr, rx) = mailbox();
        let mut sched = ManualScheduler::new();
        let token = CancelToken::new();

        sched.schedule_once(Duration::from_millis(10), post(&addr, 1), token.clone());
        token.cancel();
        sched.advance(Duration::from_millis(20));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_manual_repeats_until_cancelled() {
        let (addr, rx) = mailbox();
        let mut sched = ManualScheduler::new();
        let token = CancelToken::new();

        sched.schedule_repeating(
            Duration::from_millis(10),
            Duration::from_millis(10),
            post(&addr, 7),
            token.clone(),
        );

        sched.advance(Duration::from_millis(35));
        assert_eq!(rx.try_iter().count(), 3);

        token.cancel();
        sched.advance(Duration::from_millis(100));
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_thread_scheduler_smoke() {
        let (addr, rx) = mailbox();
        let mut sched = ThreadScheduler::new();

        sched.schedule_once(Duration::from_millis(10), post(&addr, 1), CancelToken::new());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));

        let token = CancelToken::new();
        sched.schedule_repeating(
            Duration::from_millis(5),
            Duration::from_millis(5),
            post(&addr, 2),
            token.clone(),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(2));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(2));
        token.cancel();
    }
}
