/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The seam between the scheduler and the language engine.
//!
//! The scheduler never looks inside an execution context. It asks it to push
//! its program once and then to advance until it yields, blocks, completes or
//! fails. Anything the running script wants from the scheduler (blocking,
//! spawning threads, timers, teardown actions) is recorded on the
//! [`EvaluationScope`] and applied once the step has returned, while the
//! scheduler is still the active caller.

use serde::{Deserialize, Serialize};

use crate::arena::ThreadId;
use crate::clock::{Clock, Timeslice};
use crate::error::OutOfMemory;
use crate::scheduler::SchedulerId;
use crate::terminating::TerminatingAction;
use crate::thread::{BlockReason, ScriptThread};
use crate::timers::{TimerEvent, TimerEventId, TimerIds};

/// How far one call to [`ExecutionContext::resume`] got.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineStatus {
    /// The program ran to its end.
    Completed,
    /// The program threw or hit a runtime error.
    Failed,
    /// The time slice ran out; calling `resume` again continues where it left
    /// off.
    Suspended,
    /// The program is waiting on something outside the engine. Unless the
    /// scope was explicitly blocked this is treated like `Suspended`.
    Blocked,
}

/// Outcome of compiling source text.
#[derive(Clone, Debug, PartialEq)]
pub enum CompileResult {
    Compiled,
    SyntaxError(ParseError),
}

/// A script handed to the engine, as reported to the debugger.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ScriptSource {
    pub url: Option<String>,
    pub text: String,
}

/// A compile error, as reported to the debugger.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ParseError {
    pub url: Option<String>,
    pub line: u32,
    pub message: String,
}

/// One resumable unit of program execution.
pub trait ExecutionContext {
    /// Push the program or callable. Called once, before the first `resume`.
    fn push_program(&mut self) -> Result<(), OutOfMemory> {
        Ok(())
    }

    /// Advance execution. Long running programs poll
    /// [`EvaluationScope::out_of_time`] and return `Suspended` when it is set.
    fn resume(&mut self, scope: &mut EvaluationScope) -> Result<EngineStatus, OutOfMemory>;

    /// Compile source text as this context's program. Used by threads that
    /// only learn their source when they start running.
    fn compile(&mut self, _source: &str) -> Result<CompileResult, OutOfMemory> {
        Ok(CompileResult::Compiled)
    }

    /// The string value the program completed with, if any.
    fn returned_value(&self) -> Option<String> {
        None
    }

    /// The context now belongs to `scheduler`.
    fn migrated(&mut self, _scheduler: SchedulerId) {}
}

/// Work the running thread asked for, applied after its step returns.
pub(crate) enum ThreadRequest {
    Spawn {
        thread: ScriptThread,
        interrupt_current: bool,
    },
    Cancel(ThreadId),
    ExecuteNow(ScriptThread),
    AddTimer(TimerEventId, TimerEvent),
    CancelTimeout(TimerEventId),
    AddTerminatingAction(TerminatingAction),
    TerminateChildren,
    NewScript(ScriptSource),
    ParseError(ParseError),
}

/// What a running thread can see of, and ask from, its scheduler.
pub struct EvaluationScope<'a> {
    thread: ThreadId,
    scheduler: SchedulerId,
    clock: &'a dyn Clock,
    timeslice: Timeslice,
    timer_ids: TimerIds,
    block: Option<BlockReason>,
    requests: Vec<ThreadRequest>,
}

impl<'a> EvaluationScope<'a> {
    pub(crate) fn new(
        thread: ThreadId,
        scheduler: SchedulerId,
        clock: &'a dyn Clock,
        timeslice: Timeslice,
        timer_ids: TimerIds,
    ) -> EvaluationScope<'a> {
        EvaluationScope {
            thread,
            scheduler,
            clock,
            timeslice,
            timer_ids,
            block: None,
            requests: Vec::new(),
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn scheduler(&self) -> SchedulerId {
        self.scheduler
    }

    /// The time budget predicate.
    pub fn out_of_time(&self) -> bool {
        self.timeslice.is_expired_at(self.clock.now())
    }

    /// Block the running thread once this step returns. It stays ineligible
    /// until unblocked with the same reason.
    pub fn block(&mut self, reason: BlockReason) {
        debug_assert!(self.block.is_none(), "Thread blocked twice in one step");
        self.block = Some(reason);
    }

    pub fn block_requested(&self) -> Option<BlockReason> {
        self.block
    }

    /// Enqueue a new thread at the end of this scheduler's list.
    pub fn spawn(&mut self, thread: ScriptThread) {
        self.requests.push(ThreadRequest::Spawn {
            thread,
            interrupt_current: false,
        });
    }

    /// Enqueue a new thread that must finish before the running thread
    /// continues.
    pub fn spawn_interrupting(&mut self, thread: ScriptThread) {
        self.requests.push(ThreadRequest::Spawn {
            thread,
            interrupt_current: true,
        });
    }

    pub fn cancel(&mut self, thread: ThreadId) {
        self.requests.push(ThreadRequest::Cancel(thread));
    }

    /// Run a new thread to completion in front of the running thread as soon
    /// as this step returns, in a time slice of its own, the way a synchronous
    /// event dispatch does. If it blocks instead, it stays queued in front.
    pub fn execute_now(&mut self, thread: ScriptThread) {
        self.requests.push(ThreadRequest::ExecuteNow(thread));
    }

    /// Queue a timer event on this scheduler's manager, as `setTimeout` and
    /// `setInterval` do. The event carries the running thread's origin. The
    /// id is valid right away; the event is queued once the step returns.
    pub fn add_timer(&mut self, event: TimerEvent) -> TimerEventId {
        let id = self.timer_ids.next();
        self.requests.push(ThreadRequest::AddTimer(id, event));
        id
    }

    pub fn cancel_timeout(&mut self, timer: TimerEventId) {
        self.requests.push(ThreadRequest::CancelTimeout(timer));
    }

    pub fn add_terminating_action(&mut self, action: TerminatingAction) {
        self.requests.push(ThreadRequest::AddTerminatingAction(action));
    }

    pub fn report_new_script(&mut self, source: ScriptSource) {
        self.requests.push(ThreadRequest::NewScript(source));
    }

    pub fn report_parse_error(&mut self, error: ParseError) {
        self.requests.push(ThreadRequest::ParseError(error));
    }

    pub(crate) fn terminate_children(&mut self) {
        self.requests.push(ThreadRequest::TerminateChildren);
    }

    pub(crate) fn now(&self) -> std::time::Instant {
        self.clock.now()
    }

    pub(crate) fn take_block(&mut self) -> Option<BlockReason> {
        self.block.take()
    }

    pub(crate) fn into_requests(self) -> Vec<ThreadRequest> {
        self.requests
    }
}
