/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Script threads: resumable units of program execution that the scheduler
//! multiplexes onto the one real call stack.
//!
//! A thread's progress is a single [`ThreadState`]. Every transition is a
//! total function from one state to the next, so combinations such as
//! "blocked and already signalled" cannot be represented.

use std::cell::Cell;
use std::rc::Rc;

use bitflags::bitflags;
use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strum::IntoStaticStr;

use crate::arena::ThreadId;
use crate::delegate::DocumentDelegate;
use crate::engine::{EngineStatus, EvaluationScope, ExecutionContext};
use crate::error::{Fallible, OutOfMemory, SchedulerError};
use crate::javascript_url::JavascriptUrlThread;
use crate::scheduler::SchedulerId;
use crate::terminating::TerminatingThread;
use crate::timers::{TimerEventId, TimerManager};

/// The closed set of thread variants, as used by `cancel_all`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoStaticStr, PartialEq, Serialize)]
pub enum ThreadType {
    Common,
    Empty,
    Event,
    Timeout,
    InlineScript,
    JavascriptUrl,
    HistoryNavigation,
    DebuggerEval,
    Terminating,
}

/// Why a thread was explicitly taken out of eligibility.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoStaticStr, PartialEq, Serialize)]
pub enum BlockReason {
    /// The engine reported the thread blocked without saying why.
    Unspecified,
    /// Waiting for data written by `document.write` to be parsed.
    DocumentWrite,
    /// The document this thread writes into is being replaced.
    DocumentReplaced,
    /// An alert, confirm or prompt dialog is open.
    UserInteraction,
    /// A terminating thread waiting for the teardown of child documents.
    TerminatingChildren,
    /// A suspended sub-operation is being restarted.
    Restarting,
    /// Waiting on a thread owned by another scheduler.
    ForeignThread,
    /// Waiting for a network load.
    WaitingForUrl,
    /// Waiting for a parser-inserted inline script.
    InlineScript,
    /// Waiting for an external script to load.
    ExternalScript,
    /// Paused by the debugger.
    Debugger,
}

/// Notifications delivered to a thread's listeners.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoStaticStr, PartialEq, Serialize)]
pub enum ThreadSignal {
    /// Informational: the owning scheduler started terminating.
    SchedulerTerminated,
    Cancelled,
    Finished,
    Failed,
}

impl ThreadSignal {
    /// Every thread receives exactly one terminal signal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ThreadSignal::SchedulerTerminated)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Not yet evaluated.
    Created,
    /// Started, and eligible to continue.
    Running,
    /// Yielded because its time slice ran out. Eligible, but the run loop
    /// returns to the host before continuing it.
    Suspended,
    /// Ineligible until unblocked with the same reason.
    Blocked { reason: BlockReason, started: bool },
    /// Done executing, waiting for its terminal signal.
    Completed { failed: bool },
    /// Received its terminal signal; only waiting to be unlinked.
    Signalled(ThreadSignal),
}

/// Result of one evaluation step of a thread variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Step {
    Done { failed: bool },
    Suspend,
    Block,
    Continue,
}

impl From<EngineStatus> for Step {
    fn from(status: EngineStatus) -> Step {
        match status {
            EngineStatus::Completed => Step::Done { failed: false },
            EngineStatus::Failed => Step::Done { failed: true },
            EngineStatus::Suspended => Step::Suspend,
            EngineStatus::Blocked => Step::Block,
        }
    }
}

impl ThreadState {
    pub fn is_started(&self) -> bool {
        match *self {
            ThreadState::Created => false,
            ThreadState::Blocked { started, .. } => started,
            _ => true,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            ThreadState::Completed { .. } | ThreadState::Signalled(_)
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ThreadState::Completed { failed: true } |
                ThreadState::Signalled(ThreadSignal::Failed | ThreadSignal::Cancelled)
        )
    }

    pub fn is_signalled(&self) -> bool {
        matches!(self, ThreadState::Signalled(_))
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        match *self {
            ThreadState::Blocked { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Entering an evaluation step.
    pub(crate) fn resume(self) -> ThreadState {
        match self {
            ThreadState::Created | ThreadState::Suspended => ThreadState::Running,
            state => state,
        }
    }

    /// Leaving an evaluation step. An explicit block wins over everything but
    /// completion.
    pub(crate) fn after_step(self, step: Step, block: Option<BlockReason>) -> ThreadState {
        match (step, block) {
            (Step::Done { failed }, _) => ThreadState::Completed { failed },
            (_, Some(reason)) => ThreadState::Blocked {
                reason,
                started: true,
            },
            (Step::Suspend, None) | (Step::Block, None) => ThreadState::Suspended,
            (Step::Continue, None) => self,
        }
    }

    /// Cooperative yield requested from outside the step.
    pub(crate) fn suspend(self) -> ThreadState {
        match self {
            ThreadState::Running => ThreadState::Suspended,
            state => state,
        }
    }

    pub(crate) fn block(self, reason: BlockReason) -> Fallible<ThreadState> {
        match self {
            ThreadState::Created => Ok(ThreadState::Blocked {
                reason,
                started: false,
            }),
            ThreadState::Running | ThreadState::Suspended => Ok(ThreadState::Blocked {
                reason,
                started: true,
            }),
            ThreadState::Blocked { reason: current, .. } => {
                Err(SchedulerError::AlreadyBlocked(current))
            },
            ThreadState::Completed { .. } | ThreadState::Signalled(_) => {
                Err(SchedulerError::InvalidState)
            },
        }
    }

    pub(crate) fn unblock(self, reason: BlockReason) -> Fallible<ThreadState> {
        match self {
            ThreadState::Blocked {
                reason: blocked_with,
                started,
            } => {
                if blocked_with != reason {
                    return Err(SchedulerError::BlockReasonMismatch {
                        blocked_with,
                        unblocked_with: reason,
                    });
                }
                Ok(if started {
                    ThreadState::Running
                } else {
                    ThreadState::Created
                })
            },
            _ => Err(SchedulerError::NotBlocked),
        }
    }

    pub(crate) fn signal(self, signal: ThreadSignal) -> ThreadState {
        if signal.is_terminal() {
            ThreadState::Signalled(signal)
        } else {
            self
        }
    }
}

bitflags! {
    /// Where a thread came from. Copied into threads that interrupt it, so
    /// that work spawned on behalf of a user action keeps its privileges.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct OriginFlags: u8 {
        const USER_REQUESTED = 1 << 0;
        const OPEN_IN_NEW_WINDOW = 1 << 1;
        const OPEN_IN_BACKGROUND = 1 << 2;
        const HAS_OPENED_NEW_WINDOW = 1 << 3;
        const HAS_OPENED_URL = 1 << 4;
    }
}

/// State shared between a document-generating script and the threads its
/// output creates, used to detect scripts that keep writing scripts.
#[derive(Debug, Default)]
pub struct SharedThreadInfo {
    inserted_by_parser_count: Cell<u32>,
    has_reported_recursion_error: Cell<bool>,
}

impl SharedThreadInfo {
    pub fn new() -> Rc<SharedThreadInfo> {
        Rc::new(SharedThreadInfo::default())
    }

    pub fn inserted_by_parser_count(&self) -> u32 {
        self.inserted_by_parser_count.get()
    }

    pub fn increment_inserted_by_parser(&self) {
        self.inserted_by_parser_count
            .set(self.inserted_by_parser_count.get() + 1);
    }

    pub fn has_reported_recursion_error(&self) -> bool {
        self.has_reported_recursion_error.get()
    }

    /// Returns true the first time it is called.
    pub(crate) fn report_recursion_error(&self) -> bool {
        !self.has_reported_recursion_error.replace(true)
    }
}

/// Observer of a thread's signals. Listeners are dropped once the terminal
/// signal has been delivered.
pub trait ThreadListener {
    fn signal(&mut self, thread: ThreadId, signal: ThreadSignal) -> Result<(), OutOfMemory>;
}

impl<F> ThreadListener for F
where
    F: FnMut(ThreadId, ThreadSignal),
{
    fn signal(&mut self, thread: ThreadId, signal: ThreadSignal) -> Result<(), OutOfMemory> {
        self(thread, signal);
        Ok(())
    }
}

/// A pending sub-operation (a modal dialog, a synchronous load) that has to be
/// told when its thread dies before the operation completes.
pub trait Restartable {
    fn thread_cancelled(&mut self, thread: ThreadId);
}

/// Identifies who pushed a restart object.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RestartTag(pub u32);

struct RestartEntry {
    tag: RestartTag,
    object: Box<dyn Restartable>,
}

/// An execution context plus whether its program has been pushed yet.
pub(crate) struct ScriptRun {
    context: Box<dyn ExecutionContext>,
    pushed: bool,
}

impl ScriptRun {
    pub(crate) fn new(context: Box<dyn ExecutionContext>) -> ScriptRun {
        ScriptRun {
            context,
            pushed: false,
        }
    }

    pub(crate) fn step(&mut self, scope: &mut EvaluationScope) -> Fallible<EngineStatus> {
        if !self.pushed {
            self.context.push_program()?;
            self.pushed = true;
        }
        Ok(self.context.resume(scope)?)
    }

    pub(crate) fn context(&mut self) -> &mut dyn ExecutionContext {
        &mut *self.context
    }
}

pub(crate) struct TimeoutThread {
    pub(crate) timer: TimerEventId,
    run: ScriptRun,
}

/// A script inserted by the parser. Dropping it gives back its slot in the
/// shared insertion count.
pub(crate) struct InlineScriptThread {
    run: ScriptRun,
    shared: Rc<SharedThreadInfo>,
}

impl Drop for InlineScriptThread {
    fn drop(&mut self) {
        let count = self.shared.inserted_by_parser_count.get();
        if count > 0 && !self.shared.has_reported_recursion_error() {
            self.shared.inserted_by_parser_count.set(count - 1);
        }
    }
}

pub(crate) struct HistoryNavigationThread {
    pub(crate) delta: i32,
}

/// Variant specific data and behaviour.
pub(crate) enum ThreadKind {
    Common(ScriptRun),
    Empty,
    Event(ScriptRun),
    Timeout(TimeoutThread),
    InlineScript(InlineScriptThread),
    JavascriptUrl(Box<JavascriptUrlThread>),
    HistoryNavigation(HistoryNavigationThread),
    DebuggerEval(Option<ScriptRun>),
    Terminating(TerminatingThread),
}

/// What a thread may touch of its scheduler while it evaluates.
pub(crate) struct ThreadEnvironment<'a> {
    pub(crate) delegate: &'a mut dyn DocumentDelegate,
    pub(crate) timers: &'a mut TimerManager,
    /// The scheduler has child schedulers that teardown must wait for.
    pub(crate) has_children: bool,
    /// The scheduler is draining or its document is no longer current.
    pub(crate) document_busy: bool,
}

pub struct ScriptThread {
    pub(crate) kind: ThreadKind,
    pub(crate) state: ThreadState,
    pub(crate) scheduler: Option<SchedulerId>,
    /// The thread this one interrupts: it must finish (or be cancelled)
    /// before that thread resumes.
    pub(crate) interrupted: Option<ThreadId>,
    /// How many threads interrupt this one.
    pub(crate) interrupted_count: u32,
    pub(crate) recursion_depth: u32,
    soft_interrupt: bool,
    sync: bool,
    origin: OriginFlags,
    shared_info: Rc<SharedThreadInfo>,
    listeners: SmallVec<[Box<dyn ThreadListener>; 2]>,
    restart_stack: Vec<RestartEntry>,
}

impl ScriptThread {
    fn new(kind: ThreadKind) -> ScriptThread {
        ScriptThread {
            kind,
            state: ThreadState::Created,
            scheduler: None,
            interrupted: None,
            interrupted_count: 0,
            recursion_depth: 0,
            soft_interrupt: false,
            sync: false,
            origin: OriginFlags::empty(),
            shared_info: SharedThreadInfo::new(),
            listeners: SmallVec::new(),
            restart_stack: Vec::new(),
        }
    }

    /// A plain script: push the program and run it.
    pub fn common(context: Box<dyn ExecutionContext>) -> ScriptThread {
        ScriptThread::new(ThreadKind::Common(ScriptRun::new(context)))
    }

    /// A thread with nothing to do. Useful as a placeholder that other
    /// threads can be ordered against.
    pub fn empty() -> ScriptThread {
        ScriptThread::new(ThreadKind::Empty)
    }

    /// An event handler invocation.
    pub fn event(context: Box<dyn ExecutionContext>) -> ScriptThread {
        ScriptThread::new(ThreadKind::Event(ScriptRun::new(context)))
    }

    /// A script generated by the document itself. Counts against `shared`'s
    /// insertion count until dropped.
    pub fn inline_script(
        context: Box<dyn ExecutionContext>,
        shared: Rc<SharedThreadInfo>,
    ) -> ScriptThread {
        shared.increment_inserted_by_parser();
        let mut thread = ScriptThread::new(ThreadKind::InlineScript(InlineScriptThread {
            run: ScriptRun::new(context),
            shared: shared.clone(),
        }));
        thread.shared_info = shared;
        thread
    }

    pub fn javascript_url(url_thread: JavascriptUrlThread) -> ScriptThread {
        ScriptThread::new(ThreadKind::JavascriptUrl(Box::new(url_thread)))
    }

    /// Moves `delta` steps through session history in one step. The creator
    /// is expected to have added `delta` to the pending history delta; the
    /// thread takes it back out whether it runs or is cancelled.
    pub fn history_navigation(delta: i32) -> ScriptThread {
        ScriptThread::new(ThreadKind::HistoryNavigation(HistoryNavigationThread {
            delta,
        }))
    }

    /// Code evaluated on behalf of the debugger. Never offered to the
    /// debugger for pausing; without a context it completes immediately.
    pub fn debugger_eval(context: Option<Box<dyn ExecutionContext>>) -> ScriptThread {
        ScriptThread::new(ThreadKind::DebuggerEval(context.map(ScriptRun::new)))
    }

    pub(crate) fn timeout(timer: TimerEventId, context: Box<dyn ExecutionContext>) -> ScriptThread {
        ScriptThread::new(ThreadKind::Timeout(TimeoutThread {
            timer,
            run: ScriptRun::new(context),
        }))
    }

    pub(crate) fn terminating() -> ScriptThread {
        ScriptThread::new(ThreadKind::Terminating(TerminatingThread::new()))
    }

    pub fn with_origin(mut self, origin: OriginFlags) -> ScriptThread {
        self.origin = origin;
        self
    }

    pub fn with_shared_info(mut self, shared: Rc<SharedThreadInfo>) -> ScriptThread {
        self.shared_info = shared;
        self
    }

    /// Mark the interrupt relationship this thread will form as soft:
    /// cancelling the interrupted thread clears the relationship instead of
    /// cancelling this thread too.
    pub fn soft_interrupt(mut self) -> ScriptThread {
        self.soft_interrupt = true;
        self
    }

    /// Make the run loop return to the host as soon as this thread has
    /// completed.
    pub fn sync(mut self) -> ScriptThread {
        self.sync = true;
        self
    }

    pub fn with_listener(mut self, listener: Box<dyn ThreadListener>) -> ScriptThread {
        self.add_listener(listener);
        self
    }

    pub fn add_listener(&mut self, listener: Box<dyn ThreadListener>) {
        debug_assert!(!self.state.is_signalled());
        self.listeners.push(listener);
    }

    pub fn thread_type(&self) -> ThreadType {
        match self.kind {
            ThreadKind::Common(_) => ThreadType::Common,
            ThreadKind::Empty => ThreadType::Empty,
            ThreadKind::Event(_) => ThreadType::Event,
            ThreadKind::Timeout(_) => ThreadType::Timeout,
            ThreadKind::InlineScript(_) => ThreadType::InlineScript,
            ThreadKind::JavascriptUrl(_) => ThreadType::JavascriptUrl,
            ThreadKind::HistoryNavigation(_) => ThreadType::HistoryNavigation,
            ThreadKind::DebuggerEval(_) => ThreadType::DebuggerEval,
            ThreadKind::Terminating(_) => ThreadType::Terminating,
        }
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn scheduler(&self) -> Option<SchedulerId> {
        self.scheduler
    }

    pub fn interrupted_thread(&self) -> Option<ThreadId> {
        self.interrupted
    }

    pub fn interrupted_count(&self) -> u32 {
        self.interrupted_count
    }

    pub fn recursion_depth(&self) -> u32 {
        self.recursion_depth
    }

    pub fn is_soft_interrupt(&self) -> bool {
        self.soft_interrupt
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    pub fn origin(&self) -> OriginFlags {
        self.origin
    }

    pub fn shared_info(&self) -> &Rc<SharedThreadInfo> {
        &self.shared_info
    }

    /// Inherit the origin and shared info of the thread being interrupted.
    pub(crate) fn use_origin_info(&mut self, origin: OriginFlags, shared: &Rc<SharedThreadInfo>) {
        self.origin |= origin;
        if !Rc::ptr_eq(&self.shared_info, shared) {
            self.shared_info = shared.clone();
        }
    }

    pub(crate) fn terminating_thread(&self) -> Option<&TerminatingThread> {
        match &self.kind {
            ThreadKind::Terminating(terminating) => Some(terminating),
            _ => None,
        }
    }

    pub(crate) fn terminating_thread_mut(&mut self) -> Option<&mut TerminatingThread> {
        match &mut self.kind {
            ThreadKind::Terminating(terminating) => Some(terminating),
            _ => None,
        }
    }

    pub(crate) fn history_delta(&self) -> Option<i32> {
        match &self.kind {
            ThreadKind::HistoryNavigation(navigation) => Some(navigation.delta),
            _ => None,
        }
    }

    pub(crate) fn timer_event(&self) -> Option<TimerEventId> {
        match &self.kind {
            ThreadKind::Timeout(timeout) => Some(timeout.timer),
            _ => None,
        }
    }

    pub(crate) fn context_mut(&mut self) -> Option<&mut dyn ExecutionContext> {
        match &mut self.kind {
            ThreadKind::Common(run) |
            ThreadKind::Event(run) |
            ThreadKind::DebuggerEval(Some(run)) => Some(run.context()),
            ThreadKind::Timeout(timeout) => Some(timeout.run.context()),
            ThreadKind::InlineScript(inline) => Some(inline.run.context()),
            ThreadKind::JavascriptUrl(url_thread) => Some(url_thread.context()),
            ThreadKind::Empty |
            ThreadKind::HistoryNavigation(_) |
            ThreadKind::DebuggerEval(None) |
            ThreadKind::Terminating(_) => None,
        }
    }

    /// Push a restart object. The topmost entry is popped again by the
    /// operation that pushed it, using the same tag.
    pub fn push_restart_object(&mut self, tag: RestartTag, object: Box<dyn Restartable>) {
        self.restart_stack.push(RestartEntry { tag, object });
    }

    /// Pop the topmost restart object if it was pushed with `tag`.
    pub fn pop_restart_object(&mut self, tag: RestartTag) -> Option<Box<dyn Restartable>> {
        match self.restart_stack.last() {
            Some(entry) if entry.tag == tag => self.restart_stack.pop().map(|entry| entry.object),
            _ => None,
        }
    }

    pub fn has_restart_objects(&self) -> bool {
        !self.restart_stack.is_empty()
    }

    /// Run one evaluation step.
    pub(crate) fn evaluate(
        &mut self,
        env: &mut ThreadEnvironment,
        scope: &mut EvaluationScope,
    ) -> Fallible<()> {
        let started = self.state.is_started();
        self.state = self.state.resume();

        let step = match &mut self.kind {
            ThreadKind::Common(run) | ThreadKind::Event(run) => run.step(scope).map(Step::from),
            ThreadKind::Empty | ThreadKind::DebuggerEval(None) => Ok(Step::Done { failed: false }),
            ThreadKind::DebuggerEval(Some(run)) => run.step(scope).map(Step::from),
            ThreadKind::InlineScript(inline) => inline.run.step(scope).map(Step::from),
            ThreadKind::Timeout(timeout) => {
                if !started {
                    if env.delegate.timers_suppressed() {
                        debug!("Timers suppressed, failing timeout thread");
                        self.state = ThreadState::Completed { failed: true };
                        return Ok(());
                    }
                    env.timers.set_next_timeout(timeout.timer, scope.now());
                }
                timeout.run.step(scope).map(Step::from)
            },
            ThreadKind::JavascriptUrl(url_thread) => url_thread.evaluate(env, scope),
            ThreadKind::HistoryNavigation(navigation) => {
                let user_requested = self.origin.contains(OriginFlags::USER_REQUESTED);
                env.delegate
                    .navigate_history(navigation.delta, user_requested);
                env.delegate.add_pending_history_delta(-navigation.delta);
                Ok(Step::Done { failed: false })
            },
            ThreadKind::Terminating(terminating) => terminating.evaluate(started, env, scope),
        };

        match step {
            Ok(step) => {
                self.state = self.state.after_step(step, scope.take_block());
                Ok(())
            },
            Err(error) => {
                self.state = ThreadState::Completed { failed: true };
                Err(error)
            },
        }
    }

    /// Deliver `signal`. Every listener is called even if one of them runs out
    /// of memory; the exhaustion is reported afterwards.
    pub(crate) fn signal(&mut self, id: ThreadId, signal: ThreadSignal) -> Fallible<()> {
        debug_assert!(
            !(signal.is_terminal() && self.state.is_signalled()),
            "Thread signalled twice"
        );

        let mut result = Ok(());

        if matches!(signal, ThreadSignal::Failed | ThreadSignal::Cancelled) {
            while let Some(mut entry) = self.restart_stack.pop() {
                entry.object.thread_cancelled(id);
            }
        }

        if let ThreadKind::JavascriptUrl(url_thread) = &mut self.kind {
            if let Err(error) = url_thread.signalled(signal) {
                result = Err(error);
            }
        }

        for listener in self.listeners.iter_mut() {
            if listener.signal(id, signal).is_err() {
                result = Err(SchedulerError::OutOfMemory);
            }
        }

        self.state = self.state.signal(signal);
        if signal.is_terminal() {
            self.listeners.clear();
        }

        result
    }
}
