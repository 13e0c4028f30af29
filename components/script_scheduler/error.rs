/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt;

use crate::thread::BlockReason;

/// The errors that scheduler operations can produce.
///
/// Script level failures (an uncaught exception, a compile error) are not
/// errors at this layer; they complete the thread with a failed flag and
/// travel the ordinary signal path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulerError {
    /// Resource exhaustion. Always propagated to the host, which raises a
    /// low-memory condition.
    OutOfMemory,
    /// `unblock` on a thread that is not blocked.
    NotBlocked,
    /// `block` on a thread that is already blocked, with the reason it is
    /// currently blocked for.
    AlreadyBlocked(BlockReason),
    /// `unblock` with a different reason than the one used to block.
    BlockReasonMismatch {
        blocked_with: BlockReason,
        unblocked_with: BlockReason,
    },
    /// The thread handle does not refer to a live thread.
    NoSuchThread,
    /// The scheduler handle does not refer to a live scheduler.
    NoSuchScheduler,
    /// The thread already belongs to a different scheduler.
    WrongScheduler,
    /// Interrupting the requested thread would exceed the recursion limit.
    RecursionLimitExceeded,
    /// The run loop was entered while it was already running.
    ReentrantRun,
    /// The thread is in a state that does not allow the operation.
    InvalidState,
    /// A thread run through `execute_thread` did not finish, either because
    /// something else cancelled it or because it was not left alive.
    ThreadKilled,
}

/// Shorthand for results of scheduler operations.
pub type Fallible<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn is_out_of_memory(&self) -> bool {
        *self == SchedulerError::OutOfMemory
    }
}

impl std::error::Error for SchedulerError {}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::SchedulerError::*;
        match *self {
            OutOfMemory => write!(f, "Out of memory"),
            NotBlocked => write!(f, "Thread is not blocked"),
            AlreadyBlocked(reason) => write!(f, "Thread is already blocked ({:?})", reason),
            BlockReasonMismatch {
                blocked_with,
                unblocked_with,
            } => write!(
                f,
                "Thread blocked with {:?} cannot be unblocked with {:?}",
                blocked_with, unblocked_with
            ),
            NoSuchThread => write!(f, "No such thread"),
            NoSuchScheduler => write!(f, "No such scheduler"),
            WrongScheduler => write!(f, "Thread belongs to another scheduler"),
            RecursionLimitExceeded => {
                write!(f, "Maximum script thread recursion depth exceeded")
            },
            ReentrantRun => write!(f, "Scheduler run loop entered recursively"),
            InvalidState => write!(f, "Operation not valid in the thread's current state"),
            ThreadKilled => write!(f, "Thread did not run to completion"),
        }
    }
}

/// Raised by an execution context when it runs out of memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutOfMemory;

impl From<OutOfMemory> for SchedulerError {
    fn from(_: OutOfMemory) -> Self {
        SchedulerError::OutOfMemory
    }
}
