/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::rc::Rc;

use script_scheduler::{
    BlockReason, DebuggerEvent, EvaluationScope, Fallible, JavascriptUrlDelegate,
    JavascriptUrlThread, OriginFlags, ScriptThread, SharedThreadInfo, ThreadSignal, ThreadType,
};

use crate::{Fixture, recorded};

const URL: &str = "javascript:'hello'";

/// Records what a `javascript:` load was asked to do.
#[derive(Default)]
struct UrlLoad {
    events: Rc<RefCell<Vec<String>>>,
    block_before_evaluate: bool,
}

impl JavascriptUrlDelegate for UrlLoad {
    fn before_evaluate(
        &mut self,
        _url: &str,
        _source: &mut Option<String>,
        scope: &mut EvaluationScope,
    ) -> Fallible<()> {
        if std::mem::take(&mut self.block_before_evaluate) {
            scope.block(BlockReason::DocumentWrite);
        }
        Ok(())
    }

    fn write_document(&mut self, result: &str) -> Fallible<()> {
        self.events.borrow_mut().push(format!("write_document {result}"));
        Ok(())
    }

    fn write_url(&mut self, result: &str) -> Fallible<()> {
        self.events.borrow_mut().push(format!("write_url {result}"));
        Ok(())
    }

    fn no_content(&mut self) {
        self.events.borrow_mut().push("no_content".to_owned());
    }

    fn post_url_messages(&mut self, failed: bool, cancelled: bool) -> Fallible<()> {
        self.events
            .borrow_mut()
            .push(format!("post failed={failed} cancelled={cancelled}"));
        Ok(())
    }
}

fn url_load() -> (Box<UrlLoad>, Rc<RefCell<Vec<String>>>) {
    let load = Box::new(UrlLoad::default());
    let events = load.events.clone();
    (load, events)
}

#[test]
fn test_javascript_url_writes_result_to_document() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let (load, events) = url_load();
    let script = fixture.script("url").returning("hello");
    let thread = JavascriptUrlThread::new(URL, "'hello'", script.boxed(), load)
        .write_result_to_document();
    let (thread, signals) = recorded(ScriptThread::javascript_url(thread));
    let thread = fixture.spawn(document, thread);
    assert_eq!(
        fixture.host.thread(thread).unwrap().thread_type(),
        ThreadType::JavascriptUrl
    );

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["url"]);
    assert_eq!(*events.borrow(), vec!["write_document hello"]);
    assert_eq!(*signals.borrow(), vec![ThreadSignal::Finished]);
}

#[test]
fn test_javascript_url_writes_result_to_url() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let (load, events) = url_load();
    let script = fixture.script("url").returning("hello");
    let thread =
        JavascriptUrlThread::new(URL, "'hello'", script.boxed(), load).write_result_to_url();
    fixture.spawn(document, ScriptThread::javascript_url(thread));

    fixture.run_until_idle();
    assert_eq!(
        *events.borrow(),
        vec!["write_url hello", "post failed=false cancelled=false"]
    );
}

#[test]
fn test_javascript_url_without_result_has_no_content() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let (load, events) = url_load();
    let script = fixture.script("url");
    let thread = JavascriptUrlThread::new(URL, "void 0", script.boxed(), load)
        .write_result_to_document();
    fixture.spawn(document, ScriptThread::javascript_url(thread));

    fixture.run_until_idle();
    assert_eq!(*events.borrow(), vec!["no_content"]);
}

#[test]
fn test_javascript_url_syntax_error() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();
    let (sender, receiver) = crossbeam_channel::unbounded();
    fixture.host.set_debugger(Some(Box::new(sender)));

    let (load, events) = url_load();
    let script = fixture.script("url").with_syntax_error();
    let thread =
        JavascriptUrlThread::new(URL, "'hello", script.boxed(), load).write_result_to_url();
    let (thread, signals) = recorded(ScriptThread::javascript_url(thread));
    fixture.spawn(document, thread);

    fixture.run_until_idle();
    assert!(fixture.ran().is_empty());
    assert_eq!(*signals.borrow(), vec![ThreadSignal::Failed]);
    assert_eq!(*events.borrow(), vec!["post failed=true cancelled=false"]);

    let error = receiver
        .try_iter()
        .find_map(|event| match event {
            DebuggerEvent::ParseError(scheduler, error) => Some((scheduler, error)),
            _ => None,
        })
        .unwrap();
    assert_eq!(error.0, document);
    assert_eq!(error.1.url.as_deref(), Some(URL));
    assert_eq!(error.1.line, 1);
}

#[test]
fn test_cancelled_javascript_url_posts_once() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let (load, events) = url_load();
    let script = fixture.script("url").returning("hello");
    let thread = JavascriptUrlThread::new(URL, "'hello'", script.boxed(), load)
        .write_result_to_document()
        .write_result_to_url();
    let thread = fixture.spawn(document, ScriptThread::javascript_url(thread));

    fixture.host.cancel(thread).unwrap();
    assert_eq!(
        *events.borrow(),
        vec!["post failed=false cancelled=true", "no_content"]
    );

    fixture.run_until_idle();
    assert!(fixture.ran().is_empty());
    assert_eq!(events.borrow().len(), 2);
}

#[test]
fn test_javascript_url_blocked_before_evaluation() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let load = Box::new(UrlLoad {
        block_before_evaluate: true,
        ..UrlLoad::default()
    });
    let events = load.events.clone();
    let script = fixture.script("url").returning("hello");
    let thread = JavascriptUrlThread::new(URL, "'hello'", script.boxed(), load)
        .write_result_to_document();
    let thread = fixture.spawn(document, ScriptThread::javascript_url(thread));

    fixture.run_until_idle();
    assert!(fixture.ran().is_empty());
    assert_eq!(
        fixture.host.thread_state(thread).and_then(|state| state.block_reason()),
        Some(BlockReason::DocumentWrite)
    );

    fixture
        .host
        .unblock(thread, BlockReason::DocumentWrite)
        .unwrap();
    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["url"]);
    assert_eq!(*events.borrow(), vec!["write_document hello"]);
}

#[test]
fn test_history_navigation_applies_its_delta() {
    let mut fixture = Fixture::new();
    let (document, state) = fixture.document();

    state.pending_history_delta.set(2);
    let thread = ScriptThread::history_navigation(2).with_origin(OriginFlags::USER_REQUESTED);
    fixture.spawn(document, thread);

    fixture.run_until_idle();
    assert_eq!(*state.navigated.borrow(), vec![2]);
    assert_eq!(state.pending_history_delta.get(), 0);
}

#[test]
fn test_cancelled_history_navigation_restores_pending_delta() {
    let mut fixture = Fixture::new();
    let (document, state) = fixture.document();

    state.pending_history_delta.set(-1);
    let thread = fixture.spawn(document, ScriptThread::history_navigation(-1));
    fixture.host.cancel(thread).unwrap();

    fixture.run_until_idle();
    assert!(state.navigated.borrow().is_empty());
    assert_eq!(state.pending_history_delta.get(), 0);
}

#[test]
fn test_inline_scripts_give_back_their_insertion_count() {
    let mut fixture = Fixture::new();
    let (document, _) = fixture.document();

    let shared = SharedThreadInfo::new();
    for name in ["first", "second"] {
        let thread = ScriptThread::inline_script(fixture.script(name).boxed(), shared.clone());
        fixture.spawn(document, thread);
    }
    assert_eq!(shared.inserted_by_parser_count(), 2);

    fixture.run_until_idle();
    assert_eq!(fixture.ran(), vec!["first", "second"]);
    assert_eq!(shared.inserted_by_parser_count(), 0);
}
