/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use script_scheduler::{BlockReason, Dependency, ThreadSignal, ThreadState};

use crate::{Fixture, recorded};

#[test]
fn test_foreign_interrupt_blocks_its_target() {
    let mut fixture = Fixture::new();
    let (first, _) = fixture.document();
    let (second, _) = fixture.document();

    let a = fixture.spawn(first, fixture.script("a").thread());
    let b = fixture.spawn_interrupting(second, fixture.script("b").thread(), a);

    assert_eq!(fixture.host.runnable_threads(first), vec![a]);
    assert_eq!(fixture.host.runnable_threads(second), vec![b]);
    assert_eq!(
        fixture.host.thread_state(a),
        Some(ThreadState::Blocked {
            reason: BlockReason::ForeignThread,
            started: false,
        })
    );
    let edges = fixture.host.dependencies();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].waiter, a);
    assert_eq!(edges[0].on, b);
    assert_eq!(
        edges[0].kind,
        Dependency::ForeignBlock {
            interrupt: true,
            blocking_scheduler: second,
        }
    );
    assert_eq!(fixture.host.thread(b).unwrap().interrupted_thread(), Some(a));

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["b", "a"]);
    assert!(fixture.host.dependencies().is_empty());
}

#[test]
fn test_cancelling_foreign_target_cancels_its_interrupter() {
    let mut fixture = Fixture::new();
    let (first, _) = fixture.document();
    let (second, _) = fixture.document();

    let (a, a_signals) = recorded(fixture.script("a").thread());
    let (b, b_signals) = recorded(fixture.script("b").thread());
    let a = fixture.spawn(first, a);
    fixture.spawn_interrupting(second, b, a);

    fixture.host.cancel(a).unwrap();
    assert_eq!(*a_signals.borrow(), vec![ThreadSignal::Cancelled]);
    assert_eq!(*b_signals.borrow(), vec![ThreadSignal::Cancelled]);
    assert!(fixture.host.runnable_threads(second).is_empty());

    fixture.run_until_idle();
    assert!(fixture.ran().is_empty());
}

#[test]
fn test_cancelling_foreign_interrupter_releases_its_target() {
    let mut fixture = Fixture::new();
    let (first, _) = fixture.document();
    let (second, _) = fixture.document();

    let a = fixture.spawn(first, fixture.script("a").thread());
    let b = fixture.spawn_interrupting(second, fixture.script("b").thread(), a);

    fixture.host.cancel(b).unwrap();
    assert_eq!(fixture.host.thread_state(a), Some(ThreadState::Created));
    assert_eq!(fixture.host.thread(a).unwrap().interrupted_count(), 0);

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["a"]);
}

#[test]
fn test_specific_block_takes_over_foreign_wait() {
    let mut fixture = Fixture::new();
    let (first, _) = fixture.document();
    let (second, _) = fixture.document();

    let a = fixture.spawn(first, fixture.script("a").thread());
    fixture.spawn_interrupting(second, fixture.script("b").thread(), a);

    // Lifting the specific reason while the foreign thread is still queued
    // brings the foreign wait back.
    fixture.host.block(a, BlockReason::UserInteraction).unwrap();
    fixture.host.unblock(a, BlockReason::UserInteraction).unwrap();
    assert_eq!(
        fixture.host.thread_state(a).and_then(|state| state.block_reason()),
        Some(BlockReason::ForeignThread)
    );

    // Releasing the foreign wait leaves a specific reason in place.
    fixture.host.block(a, BlockReason::UserInteraction).unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["b"]);
    assert_eq!(
        fixture.host.thread_state(a).and_then(|state| state.block_reason()),
        Some(BlockReason::UserInteraction)
    );

    fixture.host.unblock(a, BlockReason::UserInteraction).unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["b", "a"]);
}

#[test]
fn test_serialized_threads_across_schedulers() {
    let mut fixture = Fixture::new();
    let (first, _) = fixture.document();
    let (second, _) = fixture.document();

    let a = fixture.spawn(first, fixture.script("a").thread());
    let b = fixture.spawn(second, fixture.script("b").thread());
    fixture.host.serialize_threads(a, b).unwrap();

    let edges = fixture.host.dependencies();
    assert_eq!(edges.len(), 1);
    assert_eq!(
        edges[0].kind,
        Dependency::ForeignBlock {
            interrupt: false,
            blocking_scheduler: first,
        }
    );
    assert_eq!(
        fixture.host.thread_state(b).and_then(|state| state.block_reason()),
        Some(BlockReason::ForeignThread)
    );

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["a", "b"]);
}

#[test]
fn test_serializing_within_one_scheduler_adds_nothing() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let a = fixture.spawn(document, fixture.script("a").thread());
    let b = fixture.spawn(document, fixture.script("b").thread());
    fixture.host.serialize_threads(a, b).unwrap();
    assert!(fixture.host.dependencies().is_empty());
}

#[test]
fn test_foreign_interrupt_is_queued_before_local_waiter() {
    let mut fixture = Fixture::new();
    let (first, _) = fixture.document();
    let (second, _) = fixture.document();

    let a = fixture.spawn(first, fixture.script("a").thread());
    fixture.spawn(second, fixture.script("b").thread());
    let b = fixture.host.runnable_threads(second)[0];
    let x = fixture.spawn_interrupting(second, fixture.script("x").thread(), a);
    assert_eq!(fixture.host.runnable_threads(second), vec![b, x]);

    // `y` interrupts `b`, which is ahead of `x`, which `a` waits for. Queued
    // after `a`, `y` could never run.
    let y = fixture.spawn_interrupting(first, fixture.script("y").thread(), b);
    assert_eq!(fixture.host.runnable_threads(first), vec![y, a]);
    assert_eq!(fixture.host.thread(y).unwrap().interrupted_thread(), Some(b));

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["y", "b", "x", "a"]);
    assert_eq!(fixture.host.thread_count(), 0);
}

#[cfg(feature = "deadlock_detection")]
#[test]
fn test_find_deadlock() {
    let mut fixture = Fixture::new();
    let (first, _) = fixture.document();
    let (second, _) = fixture.document();

    let a = fixture.spawn(first, fixture.script("a").thread());
    let b = fixture.spawn(second, fixture.script("b").thread());
    fixture.host.serialize_threads(a, b).unwrap();
    assert_eq!(fixture.host.find_deadlock(), None);

    fixture.host.serialize_threads(b, a).unwrap();
    let cycle = fixture.host.find_deadlock().unwrap();
    assert!(cycle.contains(&a));
    assert!(cycle.contains(&b));
}
