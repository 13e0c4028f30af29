/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use script_scheduler::{
    BlockReason, Clock, EngineStatus, ExecutionContext, OriginFlags, ThreadType, TimerEvent,
    TimerEventId,
};

use crate::{Fixture, Log, Script};

fn event(log: &Log, name: &'static str, delay_ms: f64, repeating: bool) -> TimerEvent {
    let log = log.clone();
    TimerEvent::new(
        delay_ms,
        repeating,
        Box::new(move || Script::new(name, &log).boxed()),
    )
}

#[test]
fn test_zero_delay_fires_synchronously() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let timer = fixture
        .host
        .add_timer(document, event(&fixture.log, "timeout", 0.0, false))
        .unwrap();
    let runnable = fixture.host.runnable_threads(document);
    assert_eq!(runnable.len(), 1);
    assert_eq!(
        fixture.host.thread(runnable[0]).unwrap().thread_type(),
        ThreadType::Timeout
    );
    assert!(fixture.host.timers(document).unwrap().is_expired(timer));

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["timeout"]);
    let timers = fixture.host.timers(document).unwrap();
    assert!(!timers.is_expired(timer));
    assert!(!timers.is_waiting(timer));
}

#[test]
fn test_deactivated_timers_fire_asynchronously_after_activation() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    fixture.host.deactivate_timers(document).unwrap();
    fixture
        .host
        .add_timer(document, event(&fixture.log, "timeout", 0.0, false))
        .unwrap();
    assert!(fixture.host.runnable_threads(document).is_empty());
    assert_eq!(fixture.host.next_timer_deadline(), None);

    fixture.host.activate_timers(document).unwrap();
    assert!(fixture.host.runnable_threads(document).is_empty());

    assert_eq!(fixture.host.perform_pending_tasks(), 1);
    assert_eq!(fixture.host.runnable_threads(document).len(), 1);
    assert!(fixture.ran().is_empty());

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["timeout"]);
}

#[test]
fn test_timers_fire_in_due_order() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    for (name, delay) in [("c", 30.0), ("a", 10.0), ("b", 20.0)] {
        fixture
            .host
            .add_timer(document, event(&fixture.log, name, delay, false))
            .unwrap();
    }
    fixture.host.fire_due_timers().unwrap();
    assert!(fixture.host.runnable_threads(document).is_empty());

    fixture.clock.advance(Duration::from_millis(50));
    fixture.host.fire_due_timers().unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["a", "b", "c"]);
}

#[test]
fn test_interval_repeats_with_cumulative_delay() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let timer = fixture
        .host
        .add_timer(document, event(&fixture.log, "tick", 10.0, true))
        .unwrap();

    fixture.clock.advance(Duration::from_millis(10));
    fixture.host.fire_due_timers().unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["tick"]);

    let timers = fixture.host.timers(document).unwrap();
    assert!(timers.is_waiting(timer));
    assert_eq!(timers.cumulative_delay(timer), Some(Duration::from_millis(20)));

    fixture.clock.advance(Duration::from_millis(10));
    fixture.host.fire_due_timers().unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["tick", "tick"]);
    assert_eq!(
        fixture.host.timers(document).unwrap().cumulative_delay(timer),
        Some(Duration::from_millis(30))
    );
}

#[test]
fn test_zero_delay_interval_uses_minimum_repeat_delay() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let timer = fixture
        .host
        .add_timer(document, event(&fixture.log, "tick", 0.0, true))
        .unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["tick"]);

    let timers = fixture.host.timers(document).unwrap();
    assert!(timers.is_waiting(timer));
    assert_eq!(timers.cumulative_delay(timer), Some(Duration::from_millis(4)));

    fixture.clock.advance(Duration::from_millis(4));
    fixture.host.fire_due_timers().unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["tick", "tick"]);
}

#[test]
fn test_cancel_timeout_before_it_runs() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let spawned = fixture
        .host
        .add_timer(document, event(&fixture.log, "spawned", 0.0, false))
        .unwrap();
    let waiting = fixture
        .host
        .add_timer(document, event(&fixture.log, "waiting", 100.0, false))
        .unwrap();

    fixture.host.cancel_timeout(document, spawned).unwrap();
    fixture.host.cancel_timeout(document, waiting).unwrap();
    assert!(fixture.host.runnable_threads(document).is_empty());
    assert!(!fixture.host.timers(document).unwrap().has_waiting());

    fixture.clock.advance(Duration::from_millis(100));
    fixture.host.fire_due_timers().unwrap();
    fixture.run_until_idle();
    assert!(fixture.ran().is_empty());
}

#[test]
fn test_cancelled_interval_finishes_but_does_not_repeat() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let log = fixture.log.clone();
    let callback = move || -> Box<dyn ExecutionContext> {
        Script::new("tick", &log)
            .then(|scope| {
                scope.block(BlockReason::UserInteraction);
                Ok(EngineStatus::Blocked)
            })
            .boxed()
    };
    let timer = fixture
        .host
        .add_timer(document, TimerEvent::new(5.0, true, Box::new(callback)))
        .unwrap();
    fixture.clock.advance(Duration::from_millis(5));
    fixture.host.fire_due_timers().unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["tick"]);
    let thread = fixture.host.runnable_threads(document)[0];

    fixture.host.cancel_timeout(document, timer).unwrap();
    assert!(fixture.host.contains_thread(thread));

    fixture
        .host
        .unblock(thread, BlockReason::UserInteraction)
        .unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["tick", "tick"]);
    let timers = fixture.host.timers(document).unwrap();
    assert!(!timers.is_waiting(timer));
    assert!(!timers.is_expired(timer));
}

#[test]
fn test_cancel_all_timeouts() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let common = fixture.spawn(document, fixture.script("common").thread());
    fixture
        .host
        .add_timer(document, event(&fixture.log, "now", 0.0, false))
        .unwrap();
    fixture
        .host
        .add_timer(document, event(&fixture.log, "later", 20.0, true))
        .unwrap();
    assert_eq!(fixture.host.runnable_threads(document).len(), 2);

    fixture
        .host
        .cancel_all_timeouts(document, true, false)
        .unwrap();
    assert_eq!(fixture.host.runnable_threads(document), vec![common]);
    assert!(fixture.host.timers(document).unwrap().has_waiting());

    fixture
        .host
        .cancel_all_timeouts(document, false, true)
        .unwrap();
    assert!(!fixture.host.timers(document).unwrap().has_waiting());

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["common"]);
}

#[test]
fn test_suppressed_timers_fail_their_threads() {
    let mut fixture = Fixture::new();
    let (document, state) = fixture.document();
    state.timers_suppressed.set(true);

    let timer = fixture
        .host
        .add_timer(document, event(&fixture.log, "timeout", 0.0, true))
        .unwrap();
    fixture.run_until_idle();
    assert!(fixture.ran().is_empty());
    let timers = fixture.host.timers(document).unwrap();
    assert!(!timers.is_waiting(timer));
    assert!(!timers.is_expired(timer));
}

#[test]
fn test_waker_and_next_deadline() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();
    let started_at = fixture.clock.now();

    let timer = fixture
        .host
        .add_timer(
            document,
            event(&fixture.log, "timeout", 25.0, false).with_origin(OriginFlags::USER_REQUESTED),
        )
        .unwrap();
    assert_eq!(
        fixture.host.next_timer_deadline(),
        Some(started_at + Duration::from_millis(25))
    );
    assert_eq!(
        fixture.host.timers(document).unwrap().delay(timer),
        Some(Duration::from_millis(25))
    );

    let waker = fixture.host.waker();
    fixture.clock.advance(Duration::from_millis(25));
    waker.fire_timers(document);
    assert_eq!(fixture.host.perform_pending_tasks(), 1);

    let runnable = fixture.host.runnable_threads(document);
    assert_eq!(runnable.len(), 1);
    assert!(
        fixture
            .host
            .thread(runnable[0])
            .unwrap()
            .origin()
            .contains(OriginFlags::USER_REQUESTED)
    );
    assert_eq!(fixture.host.next_timer_deadline(), None);

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["timeout"]);
}

#[test]
fn test_remove_timer() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let timer = fixture
        .host
        .add_timer(document, event(&fixture.log, "timeout", 10.0, false))
        .unwrap();
    assert_eq!(fixture.host.remove_timer(document, timer), Ok(true));
    assert_eq!(fixture.host.remove_timer(document, timer), Ok(false));

    fixture.clock.advance(Duration::from_millis(10));
    fixture.host.fire_due_timers().unwrap();
    fixture.run_until_idle();
    assert!(fixture.ran().is_empty());
}

#[test]
fn test_script_clears_its_own_timeout() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let scheduled = Rc::new(Cell::new(None::<TimerEventId>));
    let (set, cleared) = (scheduled.clone(), scheduled.clone());
    let timeout = event(&fixture.log, "timeout", 10.0, false);
    let script = fixture
        .script("page")
        .then(move |scope| {
            set.set(Some(scope.add_timer(timeout)));
            Ok(EngineStatus::Suspended)
        })
        .then(move |scope| {
            if let Some(timer) = cleared.get() {
                scope.cancel_timeout(timer);
            }
            Ok(EngineStatus::Completed)
        });
    fixture.spawn(document, script.thread());

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["page", "page"]);
    let timer = scheduled.get().unwrap();
    let timers = fixture.host.timers(document).unwrap();
    assert!(!timers.is_waiting(timer));
    assert!(!timers.has_waiting());

    fixture.clock.advance(Duration::from_millis(10));
    fixture.host.fire_due_timers().unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["page", "page"]);
}

#[test]
fn test_script_timer_inherits_its_origin() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let scheduled = Rc::new(Cell::new(None::<TimerEventId>));
    let set = scheduled.clone();
    let timeout = event(&fixture.log, "timeout", 10.0, false);
    let script = fixture.script("click").then(move |scope| {
        set.set(Some(scope.add_timer(timeout)));
        Ok(EngineStatus::Completed)
    });
    let thread = script.thread().with_origin(OriginFlags::USER_REQUESTED);
    fixture.spawn(document, thread);

    fixture.run_until_idle();
    let timer = scheduled.get().unwrap();
    let timers = fixture.host.timers(document).unwrap();
    assert!(timers.is_waiting(timer));
    assert!(timers.origin(timer).contains(OriginFlags::USER_REQUESTED));

    fixture.clock.advance(Duration::from_millis(10));
    fixture.host.fire_due_timers().unwrap();
    let runnable = fixture.host.runnable_threads(document);
    assert_eq!(runnable.len(), 1);
    assert!(
        fixture
            .host
            .thread(runnable[0])
            .unwrap()
            .origin()
            .contains(OriginFlags::USER_REQUESTED)
    );

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["click", "timeout"]);
}

#[test]
fn test_script_zero_delay_timer_runs_after_it() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let timeout = event(&fixture.log, "timeout", 0.0, false);
    let script = fixture.script("page").then(move |scope| {
        scope.add_timer(timeout);
        Ok(EngineStatus::Completed)
    });
    fixture.spawn(document, script.thread());

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["page", "timeout"]);
}
