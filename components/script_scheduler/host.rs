/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The scheduler host: every scheduler, every thread and the continuation
//! queue that drives them.
//!
//! Nothing here runs on its own. The embedder calls
//! [`SchedulerHost::perform_pending_tasks`] from its event loop, which runs
//! posted scheduler slices and fires elapsed timers, and sleeps until
//! [`SchedulerHost::next_timer_deadline`] when there is nothing to do.
//!
//! A slice runs the head of one scheduler's runnable list until the list is
//! empty, the head is blocked, the time budget is spent or the head yields.
//! Whatever is left is continued from a new [`HostTask::Run`] so that the
//! embedder's other work gets a turn in between.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::arena::{Arena, ThreadId};
use crate::clock::{Clock, SystemClock, Timeslice};
use crate::debugger::{DebuggerAction, DebuggerListener};
use crate::delegate::DocumentDelegate;
use crate::dependency::{Dependency, DependencyGraph, WaitFor};
use crate::engine::{EvaluationScope, ParseError, ScriptSource, ThreadRequest};
use crate::error::{Fallible, SchedulerError};
use crate::prefs::SchedulerPrefs;
use crate::scheduler::{ErrorHandlerKind, SchedulerId, ThreadScheduler};
use crate::terminating::{ActionFlags, TerminatingAction, TerminatingActionType};
use crate::thread::{
    BlockReason, RestartTag, Restartable, ScriptThread, ThreadEnvironment, ThreadListener,
    ThreadSignal, ThreadState, ThreadType,
};
use crate::timers::{TimerEvent, TimerEventId, TimerManager};

/// Continuations posted by the schedulers to themselves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostTask {
    /// Run a slice of the scheduler's runnable list.
    Run(SchedulerId),
    /// Spawn threads for the scheduler's elapsed timer events.
    FireTimers(SchedulerId),
}

/// A handle that other OS threads can use to wake the host, for example a
/// timer thread sleeping until the next deadline.
#[derive(Clone)]
pub struct HostWaker {
    sender: Sender<HostTask>,
}

impl HostWaker {
    pub fn fire_timers(&self, scheduler: SchedulerId) {
        if let Err(error) = self.sender.send(HostTask::FireTimers(scheduler)) {
            warn!("Scheduler host went away: {error}");
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    Accepted(ThreadId),
    Rejected(RejectReason),
}

impl EnqueueOutcome {
    pub fn accepted(&self) -> Option<ThreadId> {
        match *self {
            EnqueueOutcome::Accepted(thread) => Some(thread),
            EnqueueOutcome::Rejected(_) => None,
        }
    }
}

/// Why a scheduler refused a thread. The thread is dropped without being
/// signalled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    Terminated,
    Disabled,
    NotCurrentDocument,
    Draining,
}

pub struct SchedulerHost {
    prefs: SchedulerPrefs,
    clock: Box<dyn Clock>,
    threads: Arena<ScriptThread>,
    schedulers: FxHashMap<SchedulerId, ThreadScheduler>,
    next_scheduler_id: SchedulerId,
    dependencies: DependencyGraph,
    debugger: Option<Box<dyn DebuggerListener>>,
    task_sender: Sender<HostTask>,
    task_receiver: Receiver<HostTask>,
}

impl SchedulerHost {
    pub fn new(prefs: SchedulerPrefs) -> SchedulerHost {
        SchedulerHost::with_clock(prefs, Box::new(SystemClock))
    }

    pub fn with_clock(prefs: SchedulerPrefs, clock: Box<dyn Clock>) -> SchedulerHost {
        let (task_sender, task_receiver) = crossbeam_channel::unbounded();
        SchedulerHost {
            prefs,
            clock,
            threads: Arena::default(),
            schedulers: FxHashMap::default(),
            next_scheduler_id: SchedulerId(1),
            dependencies: DependencyGraph::default(),
            debugger: None,
            task_sender,
            task_receiver,
        }
    }

    pub fn prefs(&self) -> &SchedulerPrefs {
        &self.prefs
    }

    pub fn waker(&self) -> HostWaker {
        HostWaker {
            sender: self.task_sender.clone(),
        }
    }

    pub fn set_debugger(&mut self, debugger: Option<Box<dyn DebuggerListener>>) {
        self.debugger = debugger;
    }

    // Lookups.

    fn scheduler(&self, scheduler: SchedulerId) -> Fallible<&ThreadScheduler> {
        self.schedulers
            .get(&scheduler)
            .ok_or(SchedulerError::NoSuchScheduler)
    }

    fn scheduler_mut(&mut self, scheduler: SchedulerId) -> Fallible<&mut ThreadScheduler> {
        self.schedulers
            .get_mut(&scheduler)
            .ok_or(SchedulerError::NoSuchScheduler)
    }

    fn thread_ref(&self, thread: ThreadId) -> Fallible<&ScriptThread> {
        self.threads.get(thread).ok_or(SchedulerError::NoSuchThread)
    }

    fn thread_mut(&mut self, thread: ThreadId) -> Fallible<&mut ScriptThread> {
        self.threads
            .get_mut(thread)
            .ok_or(SchedulerError::NoSuchThread)
    }

    pub fn thread(&self, thread: ThreadId) -> Option<&ScriptThread> {
        self.threads.get(thread)
    }

    pub fn thread_state(&self, thread: ThreadId) -> Option<ThreadState> {
        self.threads.get(thread).map(ScriptThread::state)
    }

    pub fn contains_thread(&self, thread: ThreadId) -> bool {
        self.threads.contains(thread)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// The runnable list of `scheduler`, head first.
    pub fn runnable_threads(&self, scheduler: SchedulerId) -> Vec<ThreadId> {
        self.schedulers
            .get(&scheduler)
            .map(|scheduler| scheduler.runnable.clone())
            .unwrap_or_default()
    }

    pub fn timers(&self, scheduler: SchedulerId) -> Option<&TimerManager> {
        self.schedulers
            .get(&scheduler)
            .map(|scheduler| &scheduler.timers)
    }

    pub fn dependencies(&self) -> &[WaitFor] {
        self.dependencies.edges()
    }

    pub fn is_draining(&self, scheduler: SchedulerId) -> bool {
        self.schedulers
            .get(&scheduler)
            .is_some_and(|scheduler| scheduler.draining)
    }

    pub fn is_terminated(&self, scheduler: SchedulerId) -> bool {
        self.schedulers
            .get(&scheduler)
            .is_some_and(|scheduler| scheduler.terminated)
    }

    pub fn is_active(&self, scheduler: SchedulerId) -> bool {
        self.schedulers
            .get(&scheduler)
            .is_some_and(|scheduler| scheduler.active)
    }

    /// The run loop of `scheduler` is executing, possibly from underneath a
    /// nested wait.
    pub fn is_present_on_the_stack(&self, scheduler: SchedulerId) -> bool {
        self.schedulers
            .get(&scheduler)
            .is_some_and(ThreadScheduler::is_present_on_the_stack)
    }

    pub fn last_error(&self, scheduler: SchedulerId) -> Option<SchedulerError> {
        self.schedulers
            .get(&scheduler)
            .and_then(|scheduler| scheduler.last_error)
    }

    // Scheduler lifecycle.

    pub fn create_scheduler(&mut self, delegate: Box<dyn DocumentDelegate>) -> SchedulerId {
        self.insert_scheduler(None, delegate)
    }

    /// A scheduler for a document nested in `parent`'s. Tearing down the
    /// parent tears down its children first.
    pub fn create_child_scheduler(
        &mut self,
        parent: SchedulerId,
        delegate: Box<dyn DocumentDelegate>,
    ) -> Fallible<SchedulerId> {
        self.scheduler(parent)?;
        let id = self.insert_scheduler(Some(parent), delegate);
        self.scheduler_mut(parent)?.children.push(id);
        Ok(id)
    }

    fn insert_scheduler(
        &mut self,
        parent: Option<SchedulerId>,
        delegate: Box<dyn DocumentDelegate>,
    ) -> SchedulerId {
        let id = self.next_scheduler_id;
        self.next_scheduler_id = id.next();
        let timers = TimerManager::new(
            self.prefs.minimum_repeat_delay(),
            self.prefs.maximum_delay(),
        );
        self.schedulers
            .insert(id, ThreadScheduler::new(parent, timers, delegate));
        debug!("Created scheduler {id}");
        id
    }

    /// Cancel everything `scheduler` still holds and forget it. Children are
    /// orphaned, not destroyed.
    pub fn destroy_scheduler(&mut self, scheduler: SchedulerId) -> Fallible<()> {
        if self.scheduler(scheduler)?.is_present_on_the_stack() {
            return Err(SchedulerError::InvalidState);
        }
        self.remove_threads(scheduler, true, true);

        let Some(removed) = self.schedulers.remove(&scheduler) else {
            return Err(SchedulerError::NoSuchScheduler);
        };
        for child in removed.children.iter() {
            if let Some(child) = self.schedulers.get_mut(child) {
                child.parent = None;
            }
        }
        if let Some(parent) = removed
            .parent
            .and_then(|parent| self.schedulers.get_mut(&parent))
        {
            parent.children.retain(|child| *child != scheduler);
        }
        debug!("Destroyed scheduler {scheduler}");
        Ok(())
    }

    /// Make a terminated scheduler accept threads again and restart its
    /// timers.
    pub fn activate(&mut self, scheduler: SchedulerId) -> Fallible<()> {
        let now = self.clock.now();
        let state = self.scheduler_mut(scheduler)?;
        state.reset();
        state.terminated = false;
        if state.timers.activate(now) {
            self.post(HostTask::FireTimers(scheduler));
        }
        Ok(())
    }

    /// Drop every thread. With `terminating` set the scheduler refuses new
    /// threads until [`SchedulerHost::activate`]d; with `is_final` its timer
    /// events are discarded too. Timers are deactivated either way.
    pub fn remove_threads(&mut self, scheduler: SchedulerId, terminating: bool, is_final: bool) {
        let Some(state) = self.schedulers.get_mut(&scheduler) else {
            return;
        };
        if state.removing_threads {
            return;
        }
        state.removing_threads = true;

        if terminating {
            state.terminated = true;
            if state.is_present_on_the_stack() && state.current.is_some() {
                // The running thread cannot be destroyed under the run loop.
                state.remove_all = true;
                self.suspend_active_task(scheduler);
            } else {
                while let Some(first) = self.schedulers.get(&scheduler).and_then(ThreadScheduler::first) {
                    if let Err(error) = self.signal_thread(first, ThreadSignal::Cancelled) {
                        debug!("Ignoring {error} while removing thread {first}");
                    }
                    if let Some(state) = self.schedulers.get_mut(&scheduler) {
                        state.unlink(first);
                    }
                    self.destroy_thread(first);
                }
                if let Some(state) = self.schedulers.get_mut(&scheduler) {
                    state.current = None;
                    state.posted_run = false;
                }
            }
        }

        if let Some(state) = self.schedulers.get_mut(&scheduler) {
            if is_final {
                state.timers.remove_all();
            }
            state.timers.deactivate();
            state.removing_threads = false;
        }
    }

    pub fn set_paused(&mut self, scheduler: SchedulerId, paused: bool) -> Fallible<()> {
        self.scheduler_mut(scheduler)?.paused = paused;
        if !paused {
            self.post_run(scheduler);
        }
        Ok(())
    }

    /// Post a run continuation if the scheduler has work it could do now, for
    /// example after the delegate stopped reporting itself paused.
    pub fn resume_if_needed(&mut self, scheduler: SchedulerId) {
        self.post_run(scheduler);
    }

    /// The thread that script running right now belongs to.
    pub fn current_thread(&self, scheduler: SchedulerId) -> Option<ThreadId> {
        let state = self.schedulers.get(&scheduler)?;
        state
            .override_current
            .or(state.current)
            .or_else(|| state.first())
    }

    /// Report `thread` as the current thread until reset with `None`. Returns
    /// the previous override.
    pub fn set_override_current_thread(
        &mut self,
        scheduler: SchedulerId,
        thread: Option<ThreadId>,
    ) -> Fallible<Option<ThreadId>> {
        let state = self.scheduler_mut(scheduler)?;
        Ok(std::mem::replace(&mut state.override_current, thread))
    }

    /// The thread an error handler should interrupt.
    pub fn error_handler_interrupt_thread(
        &self,
        scheduler: SchedulerId,
        kind: ErrorHandlerKind,
    ) -> Option<ThreadId> {
        match kind {
            ErrorHandlerKind::Compilation => self
                .schedulers
                .get(&scheduler)?
                .error_handler_interrupt
                .or_else(|| self.current_thread(scheduler)),
            ErrorHandlerKind::Runtime => self.current_thread(scheduler),
        }
    }

    pub fn set_error_handler_interrupt_thread(
        &mut self,
        scheduler: SchedulerId,
        thread: ThreadId,
    ) -> Fallible<()> {
        self.scheduler_mut(scheduler)?.error_handler_interrupt = Some(thread);
        Ok(())
    }

    pub fn reset_error_handler_interrupt_thread(&mut self, scheduler: SchedulerId) -> Fallible<()> {
        self.scheduler_mut(scheduler)?.error_handler_interrupt = None;
        Ok(())
    }

    // Thread level operations.

    pub fn add_listener(&mut self, thread: ThreadId, listener: Box<dyn ThreadListener>) -> Fallible<()> {
        let thread = self.thread_mut(thread)?;
        if thread.state.is_signalled() {
            return Err(SchedulerError::InvalidState);
        }
        thread.add_listener(listener);
        Ok(())
    }

    pub fn push_restart_object(
        &mut self,
        thread: ThreadId,
        tag: RestartTag,
        object: Box<dyn Restartable>,
    ) -> Fallible<()> {
        self.thread_mut(thread)?.push_restart_object(tag, object);
        Ok(())
    }

    pub fn pop_restart_object(
        &mut self,
        thread: ThreadId,
        tag: RestartTag,
    ) -> Fallible<Option<Box<dyn Restartable>>> {
        Ok(self.thread_mut(thread)?.pop_restart_object(tag))
    }

    /// Hand `thread` to `scheduler`. With `interrupt` set the thread has to
    /// finish before `interrupt` continues; `interrupt` may belong to another
    /// scheduler.
    pub fn enqueue(
        &mut self,
        scheduler: SchedulerId,
        thread: ScriptThread,
        interrupt: Option<ThreadId>,
    ) -> Fallible<EnqueueOutcome> {
        let id = self.threads.insert(thread);
        let outcome = self.enqueue_thread(scheduler, id, interrupt);
        if !matches!(outcome, Ok(EnqueueOutcome::Accepted(_))) {
            self.discard_thread(scheduler, id);
        }
        outcome
    }

    /// Drop a thread that was refused, without signalling it.
    fn discard_thread(&mut self, scheduler: SchedulerId, id: ThreadId) {
        if let Some(state) = self.schedulers.get_mut(&scheduler) {
            if state.unlink(id) && state.current == Some(id) {
                state.current = state.first();
            }
        }
        self.set_interrupted(id, None);
        self.threads.remove(id);
    }

    fn enqueue_thread(
        &mut self,
        scheduler: SchedulerId,
        id: ThreadId,
        mut interrupt: Option<ThreadId>,
    ) -> Fallible<EnqueueOutcome> {
        let state = self.scheduler(scheduler)?;
        if state.terminated {
            return Ok(EnqueueOutcome::Rejected(RejectReason::Terminated));
        }
        if !state.delegate.is_enabled() {
            return Ok(EnqueueOutcome::Rejected(RejectReason::Disabled));
        }
        if interrupt.is_none() && !state.delegate.is_current_document() {
            return Ok(EnqueueOutcome::Rejected(RejectReason::NotCurrentDocument));
        }

        let thread = self.thread_ref(id)?;
        if interrupt.is_none() && state.draining {
            // Events for a document still waiting on a load may run during
            // teardown, ahead of the waiting thread.
            let waiting_for_url = state.last().filter(|&last| {
                self.threads.get(last).is_some_and(|last| {
                    last.state.block_reason() == Some(BlockReason::WaitingForUrl)
                })
            });
            match (thread.thread_type(), waiting_for_url) {
                (ThreadType::Event, Some(last)) => interrupt = Some(last),
                _ => return Ok(EnqueueOutcome::Rejected(RejectReason::Draining)),
            }
        }
        if thread.scheduler.is_some_and(|owner| owner != scheduler) {
            return Err(SchedulerError::WrongScheduler);
        }

        match interrupt {
            Some(target) => {
                let target_thread = self.thread_ref(target)?;
                if target_thread.recursion_depth >= self.prefs.max_recursion_depth {
                    if target_thread.shared_info().report_recursion_error() {
                        warn!(
                            "Script thread recursion limit of {} exceeded",
                            self.prefs.max_recursion_depth
                        );
                    }
                    return Err(SchedulerError::RecursionLimitExceeded);
                }
                let origin = target_thread.origin();
                let shared = target_thread.shared_info().clone();
                let target_scheduler = target_thread.scheduler;
                self.thread_mut(id)?.use_origin_info(origin, &shared);

                if target_scheduler != Some(scheduler) {
                    return self.enqueue_foreign_interrupt(scheduler, id, target);
                }

                let state = self.scheduler_mut(scheduler)?;
                let interrupts_running = state.active && state.current == Some(target);
                state.insert_before(id, target);
                if interrupts_running {
                    self.suspend_active_task(scheduler);
                }
                self.set_interrupted(id, Some(target));
            },
            None => self.scheduler_mut(scheduler)?.append(id),
        }

        let thread = self.thread_mut(id)?;
        thread.scheduler = Some(scheduler);
        let thread_type = thread.thread_type();
        debug!("Enqueued {thread_type:?} thread {id} in {scheduler}");
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.new_context(scheduler, id, thread_type);
        }

        if thread_type == ThreadType::Terminating {
            self.terminate(scheduler)?;
        }

        let state = self.scheduler_mut(scheduler)?;
        if !state.active {
            state.current = state.first();
            self.post_run(scheduler);
        }
        self.check_deadlocks();
        Ok(EnqueueOutcome::Accepted(id))
    }

    /// `target` lives in another scheduler. The new thread is queued locally,
    /// ahead of any local thread that is itself waiting on `target`, and
    /// `target` is blocked until the new thread is signalled.
    fn enqueue_foreign_interrupt(
        &mut self,
        scheduler: SchedulerId,
        id: ThreadId,
        target: ThreadId,
    ) -> Fallible<EnqueueOutcome> {
        let local = self.local_interrupt_thread(scheduler, target, 0);
        let outcome = self.enqueue_thread(scheduler, id, local)?;
        if let EnqueueOutcome::Accepted(_) = outcome {
            self.add_foreign_block(id, target, true)?;
            self.set_interrupted(id, Some(target));
            self.check_deadlocks();
        }
        Ok(outcome)
    }

    /// The earliest thread of `scheduler` that the foreign thread `target`,
    /// or anything queued after it, is interrupting on behalf of.
    fn local_interrupt_thread(
        &self,
        scheduler: SchedulerId,
        target: ThreadId,
        depth: u32,
    ) -> Option<ThreadId> {
        if depth > self.prefs.max_recursion_depth {
            return None;
        }
        let owner = self.threads.get(target)?.scheduler?;
        let local_list = self.schedulers.get(&scheduler)?;
        let foreign_list = &self.schedulers.get(&owner)?.runnable;
        let start = foreign_list.iter().position(|&id| id == target)?;

        let mut best: Option<(usize, ThreadId)> = None;
        for &candidate in &foreign_list[start..] {
            let Some(interrupted) = self.threads.get(candidate).and_then(|thread| thread.interrupted)
            else {
                continue;
            };
            let Some(interrupted_scheduler) =
                self.threads.get(interrupted).and_then(|thread| thread.scheduler)
            else {
                continue;
            };
            if interrupted_scheduler == owner {
                continue;
            }
            let local = if interrupted_scheduler == scheduler {
                Some(interrupted)
            } else {
                self.local_interrupt_thread(scheduler, interrupted, depth + 1)
            };
            if let Some(local) = local {
                if let Some(position) = local_list.position(local) {
                    if best.is_none_or(|(best_position, _)| position < best_position) {
                        best = Some((position, local));
                    }
                }
            }
        }
        best.map(|(_, thread)| thread)
    }

    /// `blocked` may not continue until `blocking`, owned by another
    /// scheduler, has been signalled.
    fn add_foreign_block(
        &mut self,
        blocking: ThreadId,
        blocked: ThreadId,
        interrupt: bool,
    ) -> Fallible<()> {
        let blocking_scheduler = self
            .thread_ref(blocking)?
            .scheduler
            .ok_or(SchedulerError::InvalidState)?;
        let thread = self.thread_mut(blocked)?;
        if thread.state.block_reason().is_none() && !thread.state.is_completed() {
            thread.state = thread.state.block(BlockReason::ForeignThread)?;
        }
        self.dependencies.add(WaitFor {
            waiter: blocked,
            on: blocking,
            kind: Dependency::ForeignBlock {
                interrupt,
                blocking_scheduler,
            },
        });
        debug!("Thread {blocked} waits for foreign thread {blocking}");
        Ok(())
    }

    /// Order `last` after `first` when they live in different schedulers.
    /// Within one scheduler the runnable list already orders them.
    pub fn serialize_threads(&mut self, first: ThreadId, last: ThreadId) -> Fallible<()> {
        let first_scheduler = self.thread_ref(first)?.scheduler;
        let last_scheduler = self.thread_ref(last)?.scheduler;
        if first_scheduler != last_scheduler {
            self.add_foreign_block(first, last, false)?;
            self.check_deadlocks();
        }
        Ok(())
    }

    fn set_interrupted(&mut self, id: ThreadId, target: Option<ThreadId>) {
        let Some(thread) = self.threads.get_mut(id) else {
            return;
        };
        if thread.interrupted == target {
            return;
        }
        let previous = std::mem::replace(&mut thread.interrupted, target);
        if let Some(previous) = previous.and_then(|previous| self.threads.get_mut(previous)) {
            previous.interrupted_count = previous.interrupted_count.saturating_sub(1);
        }
        let Some(target) = target.and_then(|target| self.threads.get_mut(target)) else {
            return;
        };
        target.interrupted_count += 1;
        let depth = target.recursion_depth + 1;
        if let Some(thread) = self.threads.get_mut(id) {
            thread.recursion_depth = depth;
        }
    }

    pub fn block(&mut self, thread: ThreadId, reason: BlockReason) -> Fallible<()> {
        self.block_thread(thread, reason)
    }

    fn block_thread(&mut self, id: ThreadId, reason: BlockReason) -> Fallible<()> {
        let thread = self.thread_mut(id)?;
        thread.state = match thread.state {
            // A specific reason replaces the generic foreign wait; the foreign
            // wait comes back once the specific one is lifted.
            ThreadState::Blocked {
                reason: BlockReason::ForeignThread,
                started,
            } => ThreadState::Blocked { reason, started },
            state => state.block(reason)?,
        };
        debug!("Blocked thread {id} ({reason:?})");
        Ok(())
    }

    pub fn unblock(&mut self, thread: ThreadId, reason: BlockReason) -> Fallible<()> {
        self.unblock_thread(thread, reason)
    }

    fn unblock_thread(&mut self, id: ThreadId, reason: BlockReason) -> Fallible<()> {
        let foreign = self.dependencies.foreign_blockers(id) > 0;
        let thread = self.thread_mut(id)?;
        let state = thread.state.unblock(reason).inspect_err(|error| {
            warn!("Cannot unblock thread {id}: {error}");
        })?;
        if foreign && reason != BlockReason::ForeignThread {
            thread.state = ThreadState::Blocked {
                reason: BlockReason::ForeignThread,
                started: state.is_started(),
            };
            return Ok(());
        }
        thread.state = state;
        debug!("Unblocked thread {id} ({reason:?})");

        if let Some(scheduler) = thread.scheduler {
            if self.schedulers.get(&scheduler).and_then(ThreadScheduler::first) == Some(id) {
                self.post_run(scheduler);
            }
        }
        Ok(())
    }

    pub fn cancel(&mut self, thread: ThreadId) -> Fallible<()> {
        let scheduler = self
            .thread_ref(thread)?
            .scheduler
            .ok_or(SchedulerError::InvalidState)?;
        self.cancel_thread(scheduler, thread)
    }

    /// Cancel every thread of `thread_type`. Every match is cancelled even if
    /// one of them runs out of memory.
    pub fn cancel_all(&mut self, scheduler: SchedulerId, thread_type: ThreadType) -> Fallible<()> {
        let mut result = Ok(());
        for id in self.scheduler(scheduler)?.runnable.clone() {
            let matches = self
                .threads
                .get(id)
                .is_some_and(|thread| thread.thread_type() == thread_type);
            if matches {
                if let Err(error) = self.cancel_thread(scheduler, id) {
                    if error.is_out_of_memory() {
                        result = Err(error);
                    }
                }
            }
        }
        result
    }

    fn cancel_thread(&mut self, scheduler: SchedulerId, id: ThreadId) -> Fallible<()> {
        if self.scheduler(scheduler)?.removing_threads {
            return Ok(());
        }
        let mut result = self.signal_thread(id, ThreadSignal::Cancelled);

        // Threads queued in front of this one on its behalf go with it,
        // unless their interrupt is soft.
        let mut predecessor = self.scheduler(scheduler)?.predecessor(id);
        while let Some(candidate) = predecessor {
            if self.threads.get(id).is_none_or(|thread| thread.interrupted_count == 0) {
                break;
            }
            let Some(thread) = self.threads.get(candidate) else {
                break;
            };
            if thread.interrupted == Some(id) {
                if !thread.state.is_signalled() {
                    if thread.is_soft_interrupt() {
                        self.set_interrupted(candidate, None);
                    } else if let Err(error) = self.cancel_thread(scheduler, candidate) {
                        if error.is_out_of_memory() {
                            result = Err(error);
                        }
                    }
                    predecessor = self.scheduler(scheduler)?.predecessor(id);
                    continue;
                }
                self.set_interrupted(candidate, None);
            }
            predecessor = self.scheduler(scheduler)?.predecessor(candidate);
        }

        let state = self.scheduler_mut(scheduler)?;
        if state.active && state.current == Some(id) {
            // Removed by the run loop once the step has returned.
            self.suspend_active_task(scheduler);
        } else {
            state.unlink(id);
            if state.current == Some(id) {
                state.current = state.first();
                self.post_run(scheduler);
            }
            self.destroy_thread(id);
        }

        let state = self.scheduler_mut(scheduler)?;
        if state.is_empty() {
            state.delegate.scheduler_resting();
        }
        result
    }

    /// Move `thread`, and every thread it transitively interrupts in its
    /// current scheduler, to `destination`.
    pub fn migrate(&mut self, thread: ThreadId, destination: SchedulerId) -> Fallible<()> {
        let source = self
            .thread_ref(thread)?
            .scheduler
            .ok_or(SchedulerError::InvalidState)?;
        self.scheduler(destination)?;
        if source == destination {
            return Ok(());
        }

        let state = self.scheduler_mut(source)?;
        if state.current == Some(thread) {
            state.current = None;
            if let Some(migrating) = self.threads.get_mut(thread) {
                migrating.state = migrating.state.suspend();
            }
        }

        let mut next = Some(thread);
        while let Some(id) = next {
            let Some(migrating) = self.threads.get_mut(id) else {
                break;
            };
            next = migrating.interrupted;
            if migrating.scheduler != Some(source) {
                continue;
            }
            migrating.scheduler = Some(destination);
            if let Some(context) = migrating.context_mut() {
                context.migrated(destination);
            }
            let is_terminating = migrating.thread_type() == ThreadType::Terminating;
            self.release_interrupters(source, id)?;
            self.scheduler_mut(source)?.unlink(id);

            if let Some(interrupted) = next {
                // Anything else still interrupting the same thread would be
                // left with nothing to precede.
                loop {
                    let sibling = self.scheduler(source)?.runnable.iter().copied().find(|&sibling| {
                        self.threads.get(sibling).is_some_and(|sibling| {
                            sibling.interrupted == Some(interrupted) && !sibling.state.is_signalled()
                        })
                    });
                    let Some(sibling) = sibling else {
                        break;
                    };
                    self.cancel_thread(source, sibling)?;
                }
            }

            let destination_terminating = self.terminating_thread(destination);
            let state = self.scheduler_mut(destination)?;
            match destination_terminating {
                Some(terminating) if !is_terminating => state.insert_before(id, terminating),
                _ => state.append(id),
            }
            debug!("Migrated thread {id} from {source} to {destination}");
            if let Some(debugger) = self.debugger.as_mut() {
                debugger.thread_migrated(id, source, destination);
            }
        }

        if let Some(terminating) = self.terminating_thread(source) {
            if self.terminating_thread(destination).is_none() {
                self.migrate(terminating, destination)?;
            }
        }

        self.post_run(destination);
        self.post_run(source);
        Ok(())
    }

    /// Threads left in `source` that interrupt `id` can no longer precede it.
    /// They are cancelled, except soft interrupts, which only lose the edge.
    fn release_interrupters(&mut self, source: SchedulerId, id: ThreadId) -> Fallible<()> {
        loop {
            let interrupter = self.scheduler(source)?.runnable.iter().copied().find(|&candidate| {
                candidate != id &&
                    self.threads
                        .get(candidate)
                        .is_some_and(|thread| thread.interrupted == Some(id))
            });
            let Some(interrupter) = interrupter else {
                return Ok(());
            };
            let thread = self.thread_ref(interrupter)?;
            if !thread.state.is_signalled() && !thread.is_soft_interrupt() {
                self.cancel_thread(source, interrupter)?;
            }
            if self
                .threads
                .get(interrupter)
                .is_some_and(|thread| thread.interrupted == Some(id))
            {
                self.set_interrupted(interrupter, None);
            }
        }
    }

    fn suspend_active_task(&mut self, scheduler: SchedulerId) {
        let Some(current) = self
            .schedulers
            .get(&scheduler)
            .and_then(|scheduler| scheduler.current)
        else {
            return;
        };
        if let Some(thread) = self.threads.get_mut(current) {
            thread.state = thread.state.suspend();
        }
    }

    fn destroy_thread(&mut self, id: ThreadId) {
        self.set_interrupted(id, None);
        let Some(thread) = self.threads.remove(id) else {
            return;
        };
        debug_assert!(
            thread.state.is_signalled(),
            "Destroying thread {id} before its terminal signal"
        );
        if let Some(scheduler) = thread.scheduler {
            if let Some(state) = self.schedulers.get_mut(&scheduler) {
                if state.override_current == Some(id) {
                    state.override_current = None;
                }
                if state.error_handler_interrupt == Some(id) {
                    state.error_handler_interrupt = None;
                }
            }
            if let Some(debugger) = self.debugger.as_mut() {
                debugger.destroy_context(scheduler, id);
            }
        }
    }

    /// Deliver `signal` to `id` and everything that depends on it. A terminal
    /// signal is only ever delivered once.
    fn signal_thread(&mut self, id: ThreadId, signal: ThreadSignal) -> Fallible<()> {
        let thread = self.thread_mut(id)?;
        if signal.is_terminal() && thread.state.is_signalled() {
            return Ok(());
        }
        debug!("Signalling thread {id}: {signal:?}");
        let mut result = thread.signal(id, signal);
        if !signal.is_terminal() {
            return result;
        }

        let scheduler = thread.scheduler;
        let timer = thread.timer_event();
        let history_delta = thread.history_delta();
        let ends_document = thread
            .terminating_thread()
            .map(|terminating| terminating.actions().last().is_some_and(TerminatingAction::is_final));

        if let Some(scheduler) = scheduler {
            let now = self.clock.now();
            if let Some(state) = self.schedulers.get_mut(&scheduler) {
                if let (Some(delta), ThreadSignal::Cancelled) = (history_delta, signal) {
                    state.delegate.add_pending_history_delta(-delta);
                }
                if ends_document.is_some() {
                    state.reset();
                }
                if let Some(timer) = timer {
                    match signal {
                        ThreadSignal::Finished | ThreadSignal::Failed => {
                            if !state.timers.repeat(timer) {
                                state.timers.remove_expired(timer);
                            } else if state.timers.next_due().is_some_and(|due| due <= now) {
                                self.post(HostTask::FireTimers(scheduler));
                            }
                        },
                        _ => {
                            state.timers.remove_expired(timer);
                        },
                    }
                }
            }
            if signal == ThreadSignal::Finished && ends_document == Some(true) {
                debug!("Teardown of {scheduler} complete");
                self.remove_threads(scheduler, true, true);
            }
        }

        if let Err(error) = self.release_dependencies(id, signal) {
            result = Err(error);
        }
        result
    }

    /// Drop the wait-for edges of a thread that got its terminal signal.
    fn release_dependencies(&mut self, id: ThreadId, signal: ThreadSignal) -> Fallible<()> {
        let mut result = Ok(());

        for edge in self.dependencies.take_waiting_on(id) {
            match edge.kind {
                Dependency::ForeignBlock { interrupt, .. } => {
                    if interrupt {
                        self.set_interrupted(id, None);
                    }
                    let still_blocked = self.dependencies.foreign_blockers(edge.waiter) > 0;
                    let waiting = self.threads.get(edge.waiter).is_some_and(|waiter| {
                        waiter.state.block_reason() == Some(BlockReason::ForeignThread)
                    });
                    if !still_blocked && waiting {
                        self.unblock_thread(edge.waiter, BlockReason::ForeignThread)?;
                    }
                },
                Dependency::TerminatingChild => {
                    let last_child = self
                        .threads
                        .get_mut(edge.waiter)
                        .and_then(ScriptThread::terminating_thread_mut)
                        .is_some_and(|terminating| terminating.child_terminated());
                    let waiting = self.threads.get(edge.waiter).is_some_and(|waiter| {
                        waiter.state.block_reason() == Some(BlockReason::TerminatingChildren)
                    });
                    if last_child && waiting {
                        self.unblock_thread(edge.waiter, BlockReason::TerminatingChildren)?;
                    }
                },
            }
        }

        for edge in self.dependencies.take_waited_by(id) {
            let Dependency::ForeignBlock {
                interrupt: true,
                blocking_scheduler,
            } = edge.kind
            else {
                continue;
            };
            self.set_interrupted(edge.on, None);
            if signal != ThreadSignal::Cancelled {
                continue;
            }
            let still_there = self.threads.get(edge.on).is_some_and(|blocking| {
                blocking.scheduler == Some(blocking_scheduler) && !blocking.state.is_signalled()
            });
            if still_there {
                if let Err(error) = self.cancel_thread(blocking_scheduler, edge.on) {
                    if error.is_out_of_memory() {
                        result = Err(error);
                    }
                }
            }
        }

        result
    }

    // Teardown.

    /// Start tearing down `scheduler`'s document with the default final
    /// action.
    pub fn begin_termination(&mut self, scheduler: SchedulerId) -> Fallible<()> {
        self.enqueue_terminating_action(scheduler, TerminatingAction::default_final(), None, None)
    }

    /// Add `action` to the scheduler's terminating thread, creating the
    /// thread if there is none. The thread interrupts `interrupt` if given
    /// and runs after `blocking` if given.
    pub fn enqueue_terminating_action(
        &mut self,
        scheduler: SchedulerId,
        action: TerminatingAction,
        mut interrupt: Option<ThreadId>,
        blocking: Option<ThreadId>,
    ) -> Fallible<()> {
        let state = self.scheduler(scheduler)?;
        if state.terminated {
            return Ok(());
        }
        let draining = state.draining;

        if let Some(target) = interrupt {
            let foreign = self
                .threads
                .get(target)
                .is_some_and(|target| target.scheduler != Some(scheduler));
            if foreign && self.local_interrupt_thread(scheduler, target, 0).is_some() {
                interrupt = None;
            }
        }

        let mut terminating = None;
        if draining {
            terminating = self.terminating_thread(scheduler);
            if let Some(existing) = terminating {
                let thread = self.thread_ref(existing)?;
                let Some(actions) = thread.terminating_thread() else {
                    return Err(SchedulerError::InvalidState);
                };
                if !actions.test_action(action.is_conditional()) {
                    debug!("Dropping {:?} terminating action", action.action_type());
                    return Ok(());
                }
                let misplaced = (interrupt.is_some() &&
                    thread.state.block_reason() == Some(BlockReason::ForeignThread)) ||
                    (blocking.is_some() && thread.interrupted.is_some());
                if misplaced && !thread.state.is_started() {
                    self.cancel_thread(scheduler, existing)?;
                    terminating = None;
                }
            }
        }

        let terminating = match terminating {
            Some(terminating) => terminating,
            None => match self.enqueue(scheduler, ScriptThread::terminating(), interrupt)? {
                EnqueueOutcome::Accepted(terminating) => terminating,
                EnqueueOutcome::Rejected(reason) => {
                    debug!("Terminating thread rejected by {scheduler}: {reason:?}");
                    return Ok(());
                },
            },
        };

        if let Some(blocking) = blocking {
            self.serialize_threads(blocking, terminating)?;
        }

        let busy = self.is_busy(scheduler, terminating);
        self.thread_mut(terminating)?
            .terminating_thread_mut()
            .ok_or(SchedulerError::InvalidState)?
            .add_action(action, busy);
        Ok(())
    }

    /// Whether adding an action, conditional or not, would have an effect.
    pub fn test_terminating_action(&self, scheduler: SchedulerId, conditional: bool) -> bool {
        match self
            .terminating_thread(scheduler)
            .and_then(|terminating| self.threads.get(terminating))
            .and_then(ScriptThread::terminating_thread)
        {
            Some(terminating) => terminating.test_action(conditional),
            None => self
                .schedulers
                .get(&scheduler)
                .is_some_and(|scheduler| !scheduler.terminated),
        }
    }

    pub fn remove_terminating_action(
        &mut self,
        scheduler: SchedulerId,
        action_type: TerminatingActionType,
    ) -> bool {
        let Some(terminating) = self.terminating_thread(scheduler) else {
            return false;
        };
        let busy = self.is_busy(scheduler, terminating);
        self.threads
            .get_mut(terminating)
            .and_then(ScriptThread::terminating_thread_mut)
            .is_some_and(|actions| actions.remove_action(action_type, busy))
    }

    /// The action types queued on the scheduler's terminating thread.
    pub fn terminating_actions(&self, scheduler: SchedulerId) -> Vec<TerminatingActionType> {
        self.terminating_thread(scheduler)
            .and_then(|terminating| self.threads.get(terminating))
            .and_then(ScriptThread::terminating_thread)
            .map(|terminating| terminating.actions().map(TerminatingAction::action_type).collect())
            .unwrap_or_default()
    }

    pub fn terminating_thread(&self, scheduler: SchedulerId) -> Option<ThreadId> {
        self.schedulers
            .get(&scheduler)?
            .runnable
            .iter()
            .rev()
            .copied()
            .find(|&id| {
                self.threads
                    .get(id)
                    .is_some_and(|thread| thread.thread_type() == ThreadType::Terminating)
            })
    }

    /// `parent` may not dispatch its unload event before `child`, the
    /// terminating thread of a child document, is signalled.
    pub fn notice_terminating_child(&mut self, parent: ThreadId, child: ThreadId) -> Fallible<()> {
        self.thread_ref(child)?;
        let first = self
            .thread_mut(parent)?
            .terminating_thread_mut()
            .ok_or(SchedulerError::InvalidState)?
            .child_noticed();
        self.dependencies.add(WaitFor {
            waiter: parent,
            on: child,
            kind: Dependency::TerminatingChild,
        });
        if first {
            if let Err(error) = self.block_thread(parent, BlockReason::TerminatingChildren) {
                warn!("Terminating thread {parent} cannot wait for children: {error}");
            }
        }
        self.check_deadlocks();
        Ok(())
    }

    /// Enqueued with a terminating thread: tell every thread and stop taking
    /// ordinary work.
    fn terminate(&mut self, scheduler: SchedulerId) -> Fallible<()> {
        let mut result = Ok(());
        for id in self.scheduler(scheduler)?.runnable.clone() {
            if let Err(error) = self.signal_thread(id, ThreadSignal::SchedulerTerminated) {
                result = Err(error);
            }
        }
        if let Err(error) = result {
            self.handle_error(scheduler);
            return Err(error);
        }
        let state = self.scheduler_mut(scheduler)?;
        if !state.is_empty() {
            state.draining = true;
        }
        Ok(())
    }

    fn terminate_children(&mut self, scheduler: SchedulerId, terminating: ThreadId) -> Fallible<()> {
        for child in self.scheduler(scheduler)?.children.clone() {
            let action = TerminatingAction::new(
                TerminatingActionType::TerminatedByParent,
                ActionFlags::FINAL | ActionFlags::SEND_UNLOAD,
            );
            self.enqueue_terminating_action(child, action, None, None)?;
            let child_terminating = self.terminating_thread(child).filter(|&id| {
                self.threads
                    .get(id)
                    .is_some_and(|thread| !thread.state.is_signalled())
            });
            if let Some(child_terminating) = child_terminating {
                self.notice_terminating_child(terminating, child_terminating)?;
            }
        }
        Ok(())
    }

    fn is_busy(&self, scheduler: SchedulerId, thread: ThreadId) -> bool {
        self.schedulers
            .get(&scheduler)
            .is_some_and(|scheduler| scheduler.active && scheduler.current == Some(thread))
    }

    // Timers.

    /// Queue a timer event. An event that is due immediately fires right
    /// away if the manager is active.
    pub fn add_timer(&mut self, scheduler: SchedulerId, event: TimerEvent) -> Fallible<TimerEventId> {
        let now = self.clock.now();
        let timers = &mut self.scheduler_mut(scheduler)?.timers;
        let id = timers.add(event, now);
        self.fire_if_next(scheduler, id)?;
        Ok(id)
    }

    /// Queue an event a running thread asked for under an id it already has.
    fn add_requested_timer(
        &mut self,
        scheduler: SchedulerId,
        id: TimerEventId,
        event: TimerEvent,
    ) -> Fallible<()> {
        let now = self.clock.now();
        self.scheduler_mut(scheduler)?
            .timers
            .add_with_id(event, id, now);
        self.fire_if_next(scheduler, id)
    }

    fn fire_if_next(&mut self, scheduler: SchedulerId, id: TimerEventId) -> Fallible<()> {
        let timers = &self.scheduler(scheduler)?.timers;
        if timers.is_active() && timers.is_next(id) {
            self.fire_timers(scheduler)?;
        }
        Ok(())
    }

    pub fn remove_timer(&mut self, scheduler: SchedulerId, timer: TimerEventId) -> Fallible<bool> {
        Ok(self.scheduler_mut(scheduler)?.timers.remove(timer))
    }

    pub fn deactivate_timers(&mut self, scheduler: SchedulerId) -> Fallible<()> {
        self.scheduler_mut(scheduler)?.timers.deactivate();
        Ok(())
    }

    /// Resume firing. Events that elapsed meanwhile fire from a posted
    /// continuation, not from this call.
    pub fn activate_timers(&mut self, scheduler: SchedulerId) -> Fallible<()> {
        let now = self.clock.now();
        if self.scheduler_mut(scheduler)?.timers.activate(now) {
            self.post(HostTask::FireTimers(scheduler));
        }
        Ok(())
    }

    /// Clear a timeout by id. A thread already running for it finishes but
    /// does not repeat; one that has not started yet is cancelled.
    pub fn cancel_timeout(&mut self, scheduler: SchedulerId, timer: TimerEventId) -> Fallible<()> {
        let spawned = self.scheduler(scheduler)?.runnable.iter().copied().find(|&id| {
            self.threads
                .get(id)
                .is_some_and(|thread| thread.timer_event() == Some(timer))
        });
        let Some(id) = spawned else {
            self.scheduler_mut(scheduler)?.timers.remove(timer);
            return Ok(());
        };
        let started = self.thread_ref(id)?.state.is_started();
        let timers = &mut self.scheduler_mut(scheduler)?.timers;
        if started {
            timers.stop_repeating(timer);
            Ok(())
        } else {
            timers.remove_expired(timer);
            self.cancel_thread(scheduler, id)
        }
    }

    pub fn cancel_all_timeouts(
        &mut self,
        scheduler: SchedulerId,
        cancel_runnable: bool,
        cancel_waiting: bool,
    ) -> Fallible<()> {
        let mut result = Ok(());
        if cancel_runnable {
            for id in self.scheduler(scheduler)?.runnable.clone() {
                let Some(thread) = self.threads.get(id) else {
                    continue;
                };
                let Some(timer) = thread.timer_event() else {
                    continue;
                };
                if thread.state.is_started() {
                    self.scheduler_mut(scheduler)?.timers.stop_repeating(timer);
                } else if let Err(error) = self.cancel_thread(scheduler, id) {
                    if error.is_out_of_memory() {
                        result = Err(error);
                    }
                }
            }
        }
        if cancel_waiting {
            self.scheduler_mut(scheduler)?.timers.remove_all();
        }
        result
    }

    /// Spawn timeout threads for `scheduler`'s elapsed events.
    fn fire_timers(&mut self, scheduler: SchedulerId) -> Fallible<()> {
        let now = self.clock.now();
        let due = self.scheduler_mut(scheduler)?.timers.take_due(now);
        let mut result = Ok(());

        for timer in due {
            let timers = &mut self.scheduler_mut(scheduler)?.timers;
            let context = match timers.instantiate(timer) {
                Some(Ok(context)) => context,
                Some(Err(error)) => {
                    timers.remove_expired(timer);
                    result = Err(error.into());
                    continue;
                },
                None => continue,
            };
            let origin = timers.origin(timer);
            debug!("Timer {timer:?} fired in {scheduler}");

            let thread = ScriptThread::timeout(timer, context).with_origin(origin);
            match self.enqueue(scheduler, thread, None) {
                Ok(EnqueueOutcome::Accepted(_)) => {},
                Ok(EnqueueOutcome::Rejected(reason)) => {
                    debug!("Timeout thread rejected: {reason:?}");
                    self.scheduler_mut(scheduler)?.timers.remove_expired(timer);
                },
                Err(error) => {
                    self.scheduler_mut(scheduler)?.timers.remove_expired(timer);
                    if error.is_out_of_memory() {
                        result = Err(error);
                    }
                },
            }
        }
        result
    }

    /// Fire the elapsed events of every scheduler.
    pub fn fire_due_timers(&mut self) -> Fallible<()> {
        let mut schedulers: Vec<_> = self.schedulers.keys().copied().collect();
        schedulers.sort();
        let mut result = Ok(());
        for scheduler in schedulers {
            if let Err(error) = self.fire_timers(scheduler) {
                result = Err(error);
            }
        }
        result
    }

    /// The earliest time any active timer manager has an event due.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.schedulers
            .values()
            .filter_map(|scheduler| scheduler.timers.next_due())
            .min()
    }

    // Running.

    fn post(&self, task: HostTask) {
        if let Err(error) = self.task_sender.send(task) {
            warn!("Failed to post {task:?}: {error}");
        }
    }

    fn is_paused(&self, scheduler: &ThreadScheduler) -> bool {
        scheduler.paused || scheduler.delegate.is_paused()
    }

    fn head_blocked(&self, scheduler: &ThreadScheduler) -> bool {
        scheduler
            .first()
            .and_then(|first| self.threads.get(first))
            .is_some_and(|first| first.state.block_reason().is_some())
    }

    /// Post one run continuation, unless one is pending or there is nothing
    /// that could run.
    fn post_run(&mut self, scheduler: SchedulerId) {
        let Some(state) = self.schedulers.get(&scheduler) else {
            return;
        };
        if state.terminated ||
            state.posted_run ||
            state.is_empty() ||
            self.head_blocked(state) ||
            state.active ||
            self.is_paused(state)
        {
            return;
        }
        if let Some(state) = self.schedulers.get_mut(&scheduler) {
            state.posted_run = true;
        }
        self.post(HostTask::Run(scheduler));
    }

    /// Perform every task posted so far. Tasks posted while performing them
    /// are left for the next call. Returns how many tasks were performed.
    pub fn perform_pending_tasks(&mut self) -> usize {
        let tasks: Vec<_> = self.task_receiver.try_iter().collect();
        let performed = tasks.len();
        for task in tasks {
            self.perform_task(task);
        }
        performed
    }

    fn perform_task(&mut self, task: HostTask) {
        let (scheduler, result) = match task {
            HostTask::Run(scheduler) => {
                let Some(state) = self.schedulers.get_mut(&scheduler) else {
                    return;
                };
                if !state.posted_run {
                    return;
                }
                state.posted_run = false;
                (scheduler, self.run_now(scheduler))
            },
            HostTask::FireTimers(scheduler) => {
                if !self.schedulers.contains_key(&scheduler) {
                    return;
                }
                (scheduler, self.fire_timers(scheduler))
            },
        };
        match result {
            Ok(()) => {},
            Err(SchedulerError::OutOfMemory) => {
                warn!("Out of memory while running {scheduler}");
                if let Some(state) = self.schedulers.get_mut(&scheduler) {
                    state.delegate.low_memory();
                }
            },
            Err(error) => warn!("{task:?} failed: {error}"),
        }
    }

    /// Run threads from the head of the runnable list until it is empty, the
    /// head blocks or yields, or the time slice runs out.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            name = "SchedulerHost::run_now",
            skip_all,
            fields(servo_profiling = true),
            level = "trace",
        )
    )]
    fn run_now(&mut self, scheduler: SchedulerId) -> Fallible<()> {
        let state = self.scheduler(scheduler)?;
        if state.active {
            return Err(SchedulerError::ReentrantRun);
        }
        if !state.delegate.is_enabled() {
            self.remove_threads(scheduler, true, false);
            return self.activate(scheduler);
        }
        if self.is_paused(state) {
            return Ok(());
        }
        if !state.delegate.is_current_document() {
            self.remove_threads(scheduler, true, false);
            return Ok(());
        }

        let timeslice = Timeslice::new(self.clock.now(), self.prefs.timeslice());
        let state = self.scheduler_mut(scheduler)?;
        state.current = state.first();
        state.active = true;

        let mut result = Ok(());
        let mut suspend = false;
        loop {
            let Some(state) = self.schedulers.get(&scheduler) else {
                break;
            };
            if suspend ||
                state.remove_all ||
                result.is_err() ||
                self.head_blocked(state) ||
                timeslice.is_expired_at(self.clock.now())
            {
                break;
            }
            let Some(current) = state.first() else {
                break;
            };
            let step = self.run_current(scheduler, current, timeslice, &mut result);
            suspend = step.suspend;
        }

        let Some(state) = self.schedulers.get_mut(&scheduler) else {
            return result;
        };
        state.active = false;
        state.current = state.first();
        if state.remove_all {
            state.remove_all = false;
            self.remove_threads(scheduler, true, false);
        }

        match result {
            Ok(()) => {
                self.post_run(scheduler);
                Ok(())
            },
            Err(error) => {
                self.handle_error(scheduler);
                Err(error)
            },
        }
    }

    /// Evaluate the head thread once, then signal and unlink it if it is done.
    fn run_current(
        &mut self,
        scheduler: SchedulerId,
        current: ThreadId,
        timeslice: Timeslice,
        result: &mut Fallible<()>,
    ) -> RanThread {
        let mut ran = RanThread::default();
        if let Some(state) = self.schedulers.get_mut(&scheduler) {
            state.current = Some(current);
        }

        let completed = self
            .threads
            .get(current)
            .is_some_and(|thread| thread.state.is_completed());
        if !completed {
            if let Err(error) = self.evaluate_thread(scheduler, current, timeslice) {
                *result = Err(error);
            }
        }

        let Some(thread) = self.threads.get(current) else {
            ran.removed = true;
            return ran;
        };
        ran.suspend = thread.state == ThreadState::Suspended;
        if !thread.state.is_completed() && result.is_ok() {
            return ran;
        }

        if !thread.state.is_signalled() {
            let signal = if thread.state.is_failed() || result.is_err() {
                ThreadSignal::Failed
            } else {
                ThreadSignal::Finished
            };
            if let (Err(error), Some(state)) = (&result, self.schedulers.get_mut(&scheduler)) {
                state.last_error = Some(*error);
            }
            ran.signalled = true;
            if let Err(error) = self.signal_thread(current, signal) {
                if error.is_out_of_memory() {
                    *result = Err(error);
                }
            }
        }
        if self.threads.get(current).is_some_and(ScriptThread::is_sync) {
            ran.suspend = true;
        }

        let Some(state) = self.schedulers.get_mut(&scheduler) else {
            return ran;
        };
        // Something queued in front of the thread while it ran gets to go
        // first; the thread is removed once it is back at the head.
        if state.predecessor(current).is_none() && state.contains(current) {
            state.unlink(current);
            if state.current == Some(current) {
                state.current = None;
            }
            let resting = state.is_empty();
            self.destroy_thread(current);
            ran.removed = true;
            if resting {
                if let Some(state) = self.schedulers.get_mut(&scheduler) {
                    state.delegate.scheduler_resting();
                }
            }
        }
        ran
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            name = "SchedulerHost::evaluate_thread",
            skip_all,
            fields(servo_profiling = true),
            level = "trace",
        )
    )]
    fn evaluate_thread(
        &mut self,
        scheduler: SchedulerId,
        id: ThreadId,
        timeslice: Timeslice,
    ) -> Fallible<()> {
        let thread_type = self.thread_ref(id)?.thread_type();
        let debuggable = thread_type != ThreadType::DebuggerEval;
        if debuggable {
            if let Some(debugger) = self.debugger.as_mut() {
                if debugger.enter_context(scheduler, id) == DebuggerAction::Pause {
                    debug!("Debugger paused thread {id}");
                    return self.block_thread(id, BlockReason::Debugger);
                }
            }
        }

        let state = self
            .schedulers
            .get_mut(&scheduler)
            .ok_or(SchedulerError::NoSuchScheduler)?;
        let thread = self
            .threads
            .get_mut(id)
            .ok_or(SchedulerError::NoSuchThread)?;
        let document_busy = state.draining || !state.delegate.is_current_document();
        let has_children = !state.children.is_empty();
        let timer_ids = state.timers.ids();
        let mut env = ThreadEnvironment {
            delegate: &mut *state.delegate,
            timers: &mut state.timers,
            has_children,
            document_busy,
        };
        let mut scope = EvaluationScope::new(id, scheduler, &*self.clock, timeslice, timer_ids);
        let result = thread.evaluate(&mut env, &mut scope);
        let requests = scope.into_requests();

        if debuggable {
            if let Some(debugger) = self.debugger.as_mut() {
                debugger.leave_context(scheduler, id);
            }
        }
        let applied = self.apply_requests(scheduler, id, requests);
        result.and(applied)
    }

    /// Carry out what the thread asked for during its step. Only resource
    /// exhaustion is returned; anything else is logged.
    fn apply_requests(
        &mut self,
        scheduler: SchedulerId,
        current: ThreadId,
        requests: Vec<ThreadRequest>,
    ) -> Fallible<()> {
        let mut result = Ok(());
        for request in requests {
            let applied = match request {
                ThreadRequest::Spawn {
                    thread,
                    interrupt_current,
                } => {
                    let interrupt = interrupt_current.then_some(current);
                    self.enqueue(scheduler, thread, interrupt).map(|outcome| {
                        if let EnqueueOutcome::Rejected(reason) = outcome {
                            debug!("Thread spawned by {current} rejected: {reason:?}");
                        }
                    })
                },
                ThreadRequest::Cancel(thread) => self.cancel(thread),
                ThreadRequest::ExecuteNow(thread) => self.execute_now(scheduler, current, thread),
                ThreadRequest::AddTimer(timer, mut event) => {
                    if let Some(thread) = self.threads.get(current) {
                        event.inherit_origin(thread.origin());
                    }
                    self.add_requested_timer(scheduler, timer, event)
                },
                ThreadRequest::CancelTimeout(timer) => self.cancel_timeout(scheduler, timer),
                ThreadRequest::AddTerminatingAction(action) => {
                    self.enqueue_terminating_action(scheduler, action, None, None)
                },
                ThreadRequest::TerminateChildren => self.terminate_children(scheduler, current),
                ThreadRequest::NewScript(source) => {
                    self.report_new_script(scheduler, &source);
                    Ok(())
                },
                ThreadRequest::ParseError(error) => {
                    self.report_parse_error(scheduler, &error);
                    Ok(())
                },
            };
            match applied {
                Ok(()) => {},
                Err(SchedulerError::OutOfMemory) => result = Err(SchedulerError::OutOfMemory),
                Err(error) => warn!("Request from thread {current} failed: {error}"),
            }
        }
        result
    }

    fn execute_now(
        &mut self,
        scheduler: SchedulerId,
        current: ThreadId,
        thread: ScriptThread,
    ) -> Fallible<()> {
        match self.enqueue(scheduler, thread, Some(current))? {
            EnqueueOutcome::Accepted(id) => {
                let timeslice = self.prefs.timeslice();
                self.execute_thread(scheduler, id, timeslice, true)
            },
            EnqueueOutcome::Rejected(reason) => {
                debug!("Thread executed by {current} rejected: {reason:?}");
                Ok(())
            },
        }
    }

    /// After a slice failed: if the run loop is not on the stack, every
    /// thread is cancelled and removed and every timer event dropped.
    fn handle_error(&mut self, scheduler: SchedulerId) {
        let Some(state) = self.schedulers.get(&scheduler) else {
            return;
        };
        if state.active {
            return;
        }
        while let Some(first) = self.schedulers.get(&scheduler).and_then(ThreadScheduler::first) {
            let signalled = self
                .threads
                .get(first)
                .is_none_or(|thread| thread.state.is_signalled());
            if signalled {
                if let Some(state) = self.schedulers.get_mut(&scheduler) {
                    state.unlink(first);
                }
                self.destroy_thread(first);
            } else if let Err(error) = self.signal_thread(first, ThreadSignal::Cancelled) {
                debug!("Ignoring {error} while recovering {scheduler}");
            }
        }
        if let Some(state) = self.schedulers.get_mut(&scheduler) {
            state.timers.remove_all();
            state.active = false;
            state.posted_run = false;
            state.current = None;
        }
    }

    /// Move `thread` to the head of its scheduler and run it right now, on
    /// the caller's stack. Threads it spawns in front of itself run too.
    ///
    /// Succeeds once the thread finished, or if it is still unfinished but
    /// `leave_alive` is set. An unfinished thread is otherwise cancelled, and
    /// `ThreadKilled` is returned; also when something else cancelled it.
    pub fn execute_thread(
        &mut self,
        scheduler: SchedulerId,
        thread: ThreadId,
        timeslice: Duration,
        leave_alive: bool,
    ) -> Fallible<()> {
        let executed = self.thread_ref(thread)?;
        if executed.scheduler != Some(scheduler) {
            return Err(SchedulerError::WrongScheduler);
        }
        if executed.state.is_signalled() {
            return Err(SchedulerError::ThreadKilled);
        }
        let killed = Rc::new(Cell::new(false));
        let killed_by_signal = killed.clone();
        self.thread_mut(thread)?
            .add_listener(Box::new(move |_: ThreadId, signal: ThreadSignal| {
                if signal.is_terminal() {
                    killed_by_signal.set(true);
                }
            }));

        let state = self.scheduler_mut(scheduler)?;
        if state.current == Some(thread) {
            state.current = None;
        }
        state.unlink(thread);
        let previous_active = state.active;
        let previous_current = state.current;
        state.insert_front(thread);
        state.active = true;
        state.current = Some(thread);

        let timeslice = Timeslice::new(self.clock.now(), timeslice);
        let mut result = Ok(());
        let mut main = Some(thread);
        loop {
            let Some(state) = self.schedulers.get(&scheduler) else {
                break;
            };
            if killed.get() ||
                state.remove_all ||
                result.is_err() ||
                self.head_blocked(state) ||
                timeslice.is_expired_at(self.clock.now())
            {
                break;
            }
            let Some(current) = state.first() else {
                break;
            };
            let executing_main = main == Some(current);
            let ran = self.run_current(scheduler, current, timeslice, &mut result);
            if executing_main {
                if ran.signalled {
                    // Finished by the loop itself, not killed.
                    killed.set(false);
                }
                if ran.removed {
                    main = None;
                    break;
                }
            }
        }

        if let Some(main_thread) = main {
            if killed.get() || !leave_alive {
                if result.is_ok() {
                    result = Err(SchedulerError::ThreadKilled);
                }
                if !killed.get() {
                    if let Some(state) = self.schedulers.get_mut(&scheduler) {
                        state.current = None;
                    }
                    if let Err(error) = self.cancel_thread(scheduler, main_thread) {
                        if error.is_out_of_memory() {
                            result = Err(error);
                        }
                    }
                }
            }
        }

        let Some(state) = self.schedulers.get_mut(&scheduler) else {
            return result;
        };
        state.active = previous_active;
        state.current = previous_current
            .filter(|&previous| state.contains(previous))
            .or_else(|| state.first());
        if !state.active && state.remove_all {
            state.remove_all = false;
            self.remove_threads(scheduler, true, false);
        }
        self.post_run(scheduler);
        result
    }

    /// Pump posted tasks and elapsed timers until `thread` gets its terminal
    /// signal, nothing is left to do, or `max_pumps` rounds have passed.
    /// Returns the signal, if one arrived.
    pub fn run_until_signalled(
        &mut self,
        thread: ThreadId,
        max_pumps: usize,
    ) -> Fallible<Option<ThreadSignal>> {
        let waited = self.thread_mut(thread)?;
        if let ThreadState::Signalled(signal) = waited.state {
            return Ok(Some(signal));
        }
        let scheduler = waited.scheduler.ok_or(SchedulerError::InvalidState)?;
        let signalled = Rc::new(Cell::new(None));
        let sink = signalled.clone();
        waited.add_listener(Box::new(move |_: ThreadId, signal: ThreadSignal| {
            if signal.is_terminal() {
                sink.set(Some(signal));
            }
        }));

        let state = self.scheduler_mut(scheduler)?;
        let was_active = state.active;
        state.nested_count += 1;
        state.active = false;
        self.post_run(scheduler);

        let mut result = Ok(());
        for _ in 0..max_pumps {
            if signalled.get().is_some() {
                break;
            }
            if self.perform_pending_tasks() == 0 {
                if let Err(error) = self.fire_due_timers() {
                    result = Err(error);
                    break;
                }
                if self.task_receiver.is_empty() {
                    break;
                }
            }
        }

        if let Some(state) = self.schedulers.get_mut(&scheduler) {
            state.nested_count -= 1;
            state.active = was_active;
            if !state.is_present_on_the_stack() && state.remove_all {
                state.remove_all = false;
                self.remove_threads(scheduler, true, false);
            }
        }
        result.map(|()| signalled.get())
    }

    // Debugger.

    pub fn report_new_script(&mut self, scheduler: SchedulerId, source: &ScriptSource) {
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.new_script(scheduler, source);
        }
    }

    pub fn report_parse_error(&mut self, scheduler: SchedulerId, error: &ParseError) {
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.parse_error(scheduler, error);
        }
    }

    // Deadlocks.

    #[cfg(feature = "deadlock_detection")]
    fn check_deadlocks(&self) {
        if !self.prefs.deadlock_check_on_enqueue {
            return;
        }
        if let Some(cycle) = self.find_deadlock() {
            warn!("Script threads deadlocked: {cycle:?}");
        }
    }

    #[cfg(not(feature = "deadlock_detection"))]
    fn check_deadlocks(&self) {}

    /// Search for threads that wait for each other, through list order,
    /// interrupts and wait-for edges. Returns one cycle, in wait order.
    #[cfg(feature = "deadlock_detection")]
    pub fn find_deadlock(&self) -> Option<Vec<ThreadId>> {
        let mut successors: FxHashMap<ThreadId, Vec<ThreadId>> = FxHashMap::default();
        for scheduler in self.schedulers.values() {
            for pair in scheduler.runnable.windows(2) {
                successors.entry(pair[1]).or_default().push(pair[0]);
            }
        }
        for (id, thread) in self.threads.iter() {
            if let Some(target) = thread.interrupted {
                successors.entry(target).or_default().push(id);
            }
        }
        for edge in self.dependencies.edges() {
            successors.entry(edge.waiter).or_default().push(edge.on);
        }
        crate::dependency::deadlock::find_cycle(&successors)
    }
}

/// What happened to the head thread in one iteration of a run loop.
#[derive(Default)]
struct RanThread {
    suspend: bool,
    signalled: bool,
    removed: bool,
}
