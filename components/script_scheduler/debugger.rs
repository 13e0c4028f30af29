/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Hooks for a script debugger backend.
//!
//! The host works without a listener. With one installed it hears about every
//! thread entering and leaving execution and may pause a thread on entry; a
//! paused thread is blocked with
//! [`BlockReason::Debugger`](crate::BlockReason::Debugger) until the debugger
//! unblocks it.

use crossbeam_channel::Sender;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::arena::ThreadId;
use crate::engine::{ParseError, ScriptSource};
use crate::scheduler::SchedulerId;
use crate::thread::ThreadType;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DebuggerAction {
    Continue,
    Pause,
}

pub trait DebuggerListener {
    /// A thread was enqueued.
    fn new_context(&mut self, _scheduler: SchedulerId, _thread: ThreadId, _thread_type: ThreadType) {
    }

    /// A thread is about to execute.
    fn enter_context(&mut self, _scheduler: SchedulerId, _thread: ThreadId) -> DebuggerAction {
        DebuggerAction::Continue
    }

    fn leave_context(&mut self, _scheduler: SchedulerId, _thread: ThreadId) {}

    /// A thread was destroyed.
    fn destroy_context(&mut self, _scheduler: SchedulerId, _thread: ThreadId) {}

    fn new_script(&mut self, _scheduler: SchedulerId, _source: &ScriptSource) {}

    fn parse_error(&mut self, _scheduler: SchedulerId, _error: &ParseError) {}

    fn thread_migrated(&mut self, _thread: ThreadId, _from: SchedulerId, _to: SchedulerId) {}
}

/// Lifecycle messages for a debugger living on another thread.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum DebuggerEvent {
    NewContext(SchedulerId, ThreadId, ThreadType),
    EnterContext(SchedulerId, ThreadId),
    LeaveContext(SchedulerId, ThreadId),
    DestroyContext(SchedulerId, ThreadId),
    NewScript(SchedulerId, ScriptSource),
    ParseError(SchedulerId, ParseError),
    ThreadMigrated {
        thread: ThreadId,
        from: SchedulerId,
        to: SchedulerId,
    },
}

/// Forwards every notification. A remote debugger cannot pause threads
/// synchronously; it blocks them through the host instead.
impl DebuggerListener for Sender<DebuggerEvent> {
    fn new_context(&mut self, scheduler: SchedulerId, thread: ThreadId, thread_type: ThreadType) {
        send(self, DebuggerEvent::NewContext(scheduler, thread, thread_type));
    }

    fn enter_context(&mut self, scheduler: SchedulerId, thread: ThreadId) -> DebuggerAction {
        send(self, DebuggerEvent::EnterContext(scheduler, thread));
        DebuggerAction::Continue
    }

    fn leave_context(&mut self, scheduler: SchedulerId, thread: ThreadId) {
        send(self, DebuggerEvent::LeaveContext(scheduler, thread));
    }

    fn destroy_context(&mut self, scheduler: SchedulerId, thread: ThreadId) {
        send(self, DebuggerEvent::DestroyContext(scheduler, thread));
    }

    fn new_script(&mut self, scheduler: SchedulerId, source: &ScriptSource) {
        send(self, DebuggerEvent::NewScript(scheduler, source.clone()));
    }

    fn parse_error(&mut self, scheduler: SchedulerId, error: &ParseError) {
        send(self, DebuggerEvent::ParseError(scheduler, error.clone()));
    }

    fn thread_migrated(&mut self, thread: ThreadId, from: SchedulerId, to: SchedulerId) {
        send(self, DebuggerEvent::ThreadMigrated { thread, from, to });
    }
}

fn send(sender: &Sender<DebuggerEvent>, event: DebuggerEvent) {
    if let Err(error) = sender.send(event) {
        warn!("Debugger went away: {error}");
    }
}
