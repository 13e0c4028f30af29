/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-document scheduler state.
//!
//! A [`ThreadScheduler`] only holds data: its ordered runnable list, the
//! currently executing thread and its lifecycle flags. Everything that needs
//! to look at threads or at other schedulers lives on
//! [`SchedulerHost`](crate::SchedulerHost).

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::arena::ThreadId;
use crate::delegate::DocumentDelegate;
use crate::error::SchedulerError;
use crate::timers::TimerManager;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct SchedulerId(pub(crate) u32);

impl SchedulerId {
    pub(crate) fn next(&self) -> SchedulerId {
        SchedulerId(self.0 + 1)
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Which kind of error the error handler interrupt thread was set up for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorHandlerKind {
    Compilation,
    Runtime,
}

pub(crate) struct ThreadScheduler {
    pub(crate) parent: Option<SchedulerId>,
    pub(crate) children: SmallVec<[SchedulerId; 4]>,

    pub(crate) runnable: Vec<ThreadId>,
    /// The thread the run loop is working on.
    pub(crate) current: Option<ThreadId>,
    /// Reported as the current thread instead of `current` while set.
    pub(crate) override_current: Option<ThreadId>,
    /// Thread that compilation error handlers interrupt.
    pub(crate) error_handler_interrupt: Option<ThreadId>,

    /// The run loop is on the stack.
    pub(crate) active: bool,
    /// Termination has started; only teardown related work is accepted.
    pub(crate) draining: bool,
    pub(crate) terminated: bool,
    pub(crate) removing_threads: bool,
    pub(crate) posted_run: bool,
    /// Every thread is to be removed once the run loop returns.
    pub(crate) remove_all: bool,
    pub(crate) paused: bool,
    /// Nested waits on a thread of this scheduler.
    pub(crate) nested_count: u32,

    pub(crate) timers: TimerManager,
    pub(crate) delegate: Box<dyn DocumentDelegate>,
    pub(crate) last_error: Option<SchedulerError>,
}

impl ThreadScheduler {
    pub(crate) fn new(
        parent: Option<SchedulerId>,
        timers: TimerManager,
        delegate: Box<dyn DocumentDelegate>,
    ) -> ThreadScheduler {
        ThreadScheduler {
            parent,
            children: SmallVec::new(),
            runnable: Vec::new(),
            current: None,
            override_current: None,
            error_handler_interrupt: None,
            active: false,
            draining: false,
            terminated: false,
            removing_threads: false,
            posted_run: false,
            remove_all: false,
            paused: false,
            nested_count: 0,
            timers,
            delegate,
            last_error: None,
        }
    }

    pub(crate) fn position(&self, thread: ThreadId) -> Option<usize> {
        self.runnable.iter().position(|&id| id == thread)
    }

    pub(crate) fn contains(&self, thread: ThreadId) -> bool {
        self.position(thread).is_some()
    }

    pub(crate) fn first(&self) -> Option<ThreadId> {
        self.runnable.first().copied()
    }

    pub(crate) fn last(&self) -> Option<ThreadId> {
        self.runnable.last().copied()
    }

    pub(crate) fn predecessor(&self, thread: ThreadId) -> Option<ThreadId> {
        match self.position(thread)? {
            0 => None,
            index => Some(self.runnable[index - 1]),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.runnable.is_empty()
    }

    /// Insert `thread` immediately before `before`, or at the end if `before`
    /// is not in the list.
    pub(crate) fn insert_before(&mut self, thread: ThreadId, before: ThreadId) {
        match self.position(before) {
            Some(index) => self.runnable.insert(index, thread),
            None => self.runnable.push(thread),
        }
    }

    pub(crate) fn insert_front(&mut self, thread: ThreadId) {
        self.runnable.insert(0, thread);
    }

    pub(crate) fn append(&mut self, thread: ThreadId) {
        self.runnable.push(thread);
    }

    pub(crate) fn unlink(&mut self, thread: ThreadId) -> bool {
        match self.position(thread) {
            Some(index) => {
                self.runnable.remove(index);
                true
            },
            None => false,
        }
    }

    pub(crate) fn is_present_on_the_stack(&self) -> bool {
        self.active || self.nested_count > 0
    }

    /// Teardown finished or was cancelled; the scheduler accepts work again.
    pub(crate) fn reset(&mut self) {
        self.draining = false;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::arena::Arena;
    use crate::delegate::DefaultDocumentDelegate;

    fn scheduler() -> ThreadScheduler {
        ThreadScheduler::new(
            None,
            TimerManager::new(Duration::from_millis(4), Duration::from_secs(1)),
            Box::new(DefaultDocumentDelegate),
        )
    }

    #[test]
    fn test_list_ordering() {
        let mut arena = Arena::default();
        let (a, b, c) = (arena.insert(()), arena.insert(()), arena.insert(()));

        let mut scheduler = scheduler();
        scheduler.append(a);
        scheduler.insert_before(b, a);
        scheduler.insert_front(c);
        assert_eq!(scheduler.runnable, vec![c, b, a]);
        assert_eq!(scheduler.predecessor(a), Some(b));
        assert_eq!(scheduler.predecessor(c), None);

        assert!(scheduler.unlink(b));
        assert!(!scheduler.unlink(b));
        assert_eq!(scheduler.first(), Some(c));
        assert_eq!(scheduler.last(), Some(a));
    }
}
