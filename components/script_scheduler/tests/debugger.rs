/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use script_scheduler::{
    BlockReason, DebuggerAction, DebuggerEvent, DebuggerListener, EngineStatus, SchedulerId,
    ScriptSource, ScriptThread, ThreadId, ThreadType,
};

use crate::Fixture;

/// Pauses every thread the first time it is entered.
#[derive(Default)]
struct PauseOnEntry {
    paused: Vec<ThreadId>,
}

impl DebuggerListener for PauseOnEntry {
    fn enter_context(&mut self, _scheduler: SchedulerId, thread: ThreadId) -> DebuggerAction {
        if self.paused.contains(&thread) {
            return DebuggerAction::Continue;
        }
        self.paused.push(thread);
        DebuggerAction::Pause
    }
}

#[test]
fn test_thread_lifecycle_events() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();
    let (sender, receiver) = crossbeam_channel::unbounded();
    fixture.host.set_debugger(Some(Box::new(sender)));

    let a = fixture.spawn(document, fixture.script("a").thread());
    fixture.run_until_idle();

    let events: Vec<DebuggerEvent> = receiver.try_iter().collect();
    assert_eq!(
        events,
        vec![
            DebuggerEvent::NewContext(document, a, ThreadType::Common),
            DebuggerEvent::EnterContext(document, a),
            DebuggerEvent::LeaveContext(document, a),
            DebuggerEvent::DestroyContext(document, a),
        ]
    );
}

#[test]
fn test_debugger_pauses_thread_on_entry() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();
    fixture
        .host
        .set_debugger(Some(Box::new(PauseOnEntry::default())));

    let a = fixture.spawn(document, fixture.script("a").thread());
    fixture.run_until_idle();
    assert!(fixture.ran().is_empty());
    assert_eq!(
        fixture.host.thread_state(a).and_then(|state| state.block_reason()),
        Some(BlockReason::Debugger)
    );

    fixture.host.unblock(a, BlockReason::Debugger).unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["a"]);
    assert!(!fixture.host.contains_thread(a));
}

#[test]
fn test_debugger_eval_is_not_paused() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();
    fixture
        .host
        .set_debugger(Some(Box::new(PauseOnEntry::default())));

    let eval = ScriptThread::debugger_eval(Some(fixture.script("eval").boxed()));
    fixture.spawn(document, eval);
    fixture.spawn(document, ScriptThread::debugger_eval(None));
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["eval"]);
    assert_eq!(fixture.host.thread_count(), 0);
}

#[test]
fn test_new_script_is_reported() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();
    let (sender, receiver) = crossbeam_channel::unbounded();
    fixture.host.set_debugger(Some(Box::new(sender)));

    let script = fixture.script("loader").then(|scope| {
        scope.report_new_script(ScriptSource {
            url: Some("https://example.com/app.js".to_owned()),
            text: "run()".to_owned(),
        });
        Ok(EngineStatus::Completed)
    });
    fixture.spawn(document, script.thread());
    fixture.run_until_idle();

    let sources: Vec<ScriptSource> = receiver
        .try_iter()
        .filter_map(|event| match event {
            DebuggerEvent::NewScript(scheduler, source) => {
                assert_eq!(scheduler, document);
                Some(source)
            },
            _ => None,
        })
        .collect();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].url.as_deref(), Some("https://example.com/app.js"));
    assert_eq!(sources[0].text, "run()");
}

#[test]
fn test_migration_is_reported() {
    let mut fixture = Fixture::new();
    let (source, _) = fixture.document();
    let (destination, _) = fixture.document();
    let (sender, receiver) = crossbeam_channel::unbounded();
    fixture.host.set_debugger(Some(Box::new(sender)));

    let a = fixture.spawn(source, fixture.script("a").thread());
    fixture.host.migrate(a, destination).unwrap();

    let migrated: Vec<DebuggerEvent> = receiver
        .try_iter()
        .filter(|event| matches!(event, DebuggerEvent::ThreadMigrated { .. }))
        .collect();
    assert_eq!(
        migrated,
        vec![DebuggerEvent::ThreadMigrated {
            thread: a,
            from: source,
            to: destination,
        }]
    );
}

#[test]
fn test_removing_the_debugger() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();
    let (sender, receiver) = crossbeam_channel::unbounded();
    fixture.host.set_debugger(Some(Box::new(sender)));
    fixture.host.set_debugger(None);

    fixture.spawn(document, fixture.script("a").thread());
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["a"]);
    assert!(receiver.try_recv().is_err());
}
