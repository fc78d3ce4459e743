//! Property tests for the kernel invariants.
use std::time::Duration;

use qcheck_macros::quickcheck;
use troupe_fsm::{Behavior, Fsm, Notice};
use troupe_testkit::{observer, reply_probe, Rig};

/// Hops between numbered states on demand.
struct Hopper;

impl Behavior for Hopper {
    type State = u8;
    type Data = ();
    type Event = u8;
    type Reply = ();
}

fn hopper(states: u8) -> Fsm<Hopper> {
    let mut fsm = Fsm::new();
    for state in 0..states {
        fsm.when(state, |event, ctx| {
            let target = *event.payload.message()?;
            Some(ctx.goto(target))
        });
    }
    fsm.start_with(0, ());
    fsm
}

/// Every observer receives exactly one baseline and the contiguous
/// suffix of the transition history starting at its subscribe point.
#[quickcheck]
fn prop_observers_see_a_contiguous_suffix(script: Vec<u8>, subscribe_at: usize) -> bool {
    const STATES: u8 = 4;
    let script: Vec<u8> = script.into_iter().map(|target| target % STATES).collect();
    let subscribe_at = subscribe_at % (script.len() + 1);

    let mut rig = Rig::start(hopper(STATES)).unwrap();
    let (obs, notices) = observer();
    let source = rig.self_ref().id();

    let mut expected = Vec::new();
    let mut state = 0u8;
    for (i, &target) in script.iter().enumerate() {
        if i == subscribe_at {
            expected.push(Notice::CurrentState { source, state });
        }
        if state != target {
            expected.push(Notice::Transition {
                source,
                from: state,
                to: target,
            });
        }
        state = target;
    }
    if subscribe_at == script.len() {
        expected.push(Notice::CurrentState { source, state });
    }

    for (i, &target) in script.iter().enumerate() {
        if i == subscribe_at {
            rig.subscribe(&obs);
        }
        rig.send(target);
    }
    if subscribe_at == script.len() {
        rig.subscribe(&obs);
    }
    rig.run().unwrap();

    notices.try_iter().collect::<Vec<_>>() == expected
}

/// Echoes a batch of replies back to the sender.
struct Echo;

impl Behavior for Echo {
    type State = u8;
    type Data = ();
    type Event = Vec<u16>;
    type Reply = u16;
}

/// The sender observes replies in exactly the order the handler queued
/// them.
#[quickcheck]
fn prop_replies_preserve_call_order(replies: Vec<u16>) -> bool {
    let mut fsm = Fsm::<Echo>::new();
    fsm.when(0, |event, ctx| {
        let batch = event.payload.message()?;
        let mut next = ctx.stay();
        for &reply in batch {
            next = next.replying(reply);
        }
        Some(next)
    });
    fsm.start_with(0, ());

    let mut rig = Rig::start(fsm).unwrap();
    let (sender, inbox) = reply_probe();
    rig.send_from(replies.clone(), &sender);
    rig.run().unwrap();

    inbox.try_iter().collect::<Vec<_>>() == replies
}

#[derive(Debug, Clone)]
enum TickerCmd {
    Start,
    Tick,
}

/// Counts timer ticks and cancels the timer at a chosen count.
struct Ticker;

impl Behavior for Ticker {
    type State = u8;
    type Data = u64;
    type Event = TickerCmd;
    type Reply = ();
}

/// However firings pile up in the mailbox, a cancelled timer's firings
/// never reach a handler: the tick count stops exactly at the cancel
/// point.
#[quickcheck]
fn prop_cancelled_timers_never_reach_handlers(cancel_after: u8, chunks: u8) -> bool {
    let cancel_after = u64::from(cancel_after % 5) + 1;

    let mut fsm = Fsm::<Ticker>::new();
    fsm.when(0, move |event, ctx| match event.payload.message()? {
        TickerCmd::Start => {
            ctx.set_periodic_timer("tick", TickerCmd::Tick, Duration::from_millis(10));
            Some(ctx.stay())
        }
        TickerCmd::Tick => {
            let seen = ctx.state_data() + 1;
            if seen == cancel_after {
                ctx.cancel_timer("tick");
            }
            Some(ctx.stay().using(seen))
        }
    });
    fsm.start_with(0, 0);

    let mut rig = Rig::start(fsm).unwrap();
    rig.send(TickerCmd::Start);
    rig.run().unwrap();

    // Advance in arbitrary chunks so a varying number of firings is
    // already queued whenever the mailbox is drained.
    for _ in 0..chunks % 8 {
        let step = Duration::from_millis(u64::from(fastrand::u8(1..40)));
        rig.advance(step).unwrap();
    }
    rig.advance(Duration::from_millis(400)).unwrap();

    *rig.fsm().state_data() == cancel_after
}

/// As long as user messages keep arriving within the timeout window, the
/// state-entry timeout never fires; once traffic stops it fires exactly
/// one window after the last message.
#[quickcheck]
fn prop_activity_defers_the_state_timeout(gaps: Vec<u8>) -> bool {
    const TIMEOUT: Duration = Duration::from_millis(50);
    let gaps: Vec<Duration> = gaps
        .into_iter()
        .take(16)
        .map(|gap| Duration::from_millis(u64::from(gap % 49) + 1))
        .collect();

    let mut fsm = Fsm::<Ticker>::new();
    fsm.when_for(0, TIMEOUT, |event, ctx| {
        if event.payload.is_state_timeout() {
            Some(ctx.goto(1))
        } else {
            Some(ctx.stay())
        }
    });
    fsm.when(1, |_event, ctx| Some(ctx.stay()));
    fsm.start_with(0, 0);

    let mut rig = Rig::start(fsm).unwrap();
    for gap in &gaps {
        rig.advance(*gap).unwrap();
        if *rig.fsm().state_name() == 1 {
            return false;
        }
        rig.send(TickerCmd::Tick);
        rig.run().unwrap();
    }

    // Silence from here on: one window after the last message it fires.
    rig.advance(TIMEOUT - Duration::from_millis(1)).unwrap();
    let premature = *rig.fsm().state_name() == 1;
    rig.advance(Duration::from_millis(1)).unwrap();

    !premature && *rig.fsm().state_name() == 1
}
