//! A wall-clock smoke test: the same machine the deterministic suite
//! drives, run over the thread scheduler with real time.
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use troupe::{mailbox, ThreadScheduler};
use troupe_fsm::{ActorContext as _, Behavior, Fsm, Reason};
use troupe_testkit::TestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum State {
    Running,
    Done,
}

#[derive(Debug, Clone)]
enum Cmd {
    Start,
    Tick,
}

struct Pinger;

impl Behavior for Pinger {
    type State = State;
    type Data = u32;
    type Event = Cmd;
    type Reply = ();
}

#[test_log::test]
fn test_wall_clock_timers_drive_the_machine() {
    let (self_ref, inbox) = mailbox();
    let mut ctx = TestContext::new(self_ref, ThreadScheduler::new());

    let (stops_tx, stops) = chan::unbounded();
    let mut fsm = Fsm::<Pinger>::new();
    fsm.when(State::Running, |event, ctx| match event.payload.message()? {
        Cmd::Start => {
            ctx.set_periodic_timer("tick", Cmd::Tick, Duration::from_millis(10));
            Some(ctx.stay())
        }
        Cmd::Tick => {
            let count = ctx.state_data() + 1;
            if count == 3 {
                ctx.cancel_timer("tick");
                Some(ctx.goto(State::Done).using(count))
            } else {
                Some(ctx.stay().using(count))
            }
        }
    });
    fsm.when_for(State::Done, Duration::from_millis(20), |event, ctx| {
        if event.payload.is_state_timeout() {
            Some(ctx.stop())
        } else {
            Some(ctx.stay())
        }
    });
    fsm.on_termination(move |_ctx, stop| stops_tx.send(stop).unwrap());
    fsm.start_with(State::Running, 0);
    fsm.initialize(&mut ctx).unwrap();

    let started = Instant::now();
    ctx.self_ref()
        .send(troupe_fsm::Envelope::of(troupe_fsm::Message::User(Cmd::Start)))
        .unwrap();

    loop {
        let envelope = inbox
            .recv_timeout(Duration::from_secs(5))
            .expect("the machine keeps making progress");
        fsm.receive(envelope, &mut ctx).unwrap();
        if ctx.stop_requested() {
            fsm.post_stop(&mut ctx);
            break;
        }
    }

    let stop = stops.try_recv().unwrap();
    assert_eq!(stop.reason, Reason::Normal);
    assert_eq!(stop.state, State::Done);
    assert_eq!(stop.data, 3);
    assert!(stops.try_recv().is_err(), "the finalizer runs exactly once");

    // Three 10ms ticks plus the 20ms idle window set a floor on elapsed
    // wall-clock time.
    assert!(started.elapsed() >= Duration::from_millis(40));
}
