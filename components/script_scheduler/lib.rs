/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Cooperative scheduling of script threads.
//!
//! A script thread is a resumable unit of program execution: a page script,
//! an event handler, a timeout, a `javascript:` URL, the teardown of a
//! document. Each document owns a scheduler with an ordered list of runnable
//! threads, and the [`SchedulerHost`] multiplexes all of them onto the one
//! real call stack, running the head of a list until it completes, blocks or
//! runs out of time.
//!
//! Threads can interrupt other threads, including threads of another
//! document, can be blocked and unblocked for a reason, cancelled, and moved
//! between schedulers. Each scheduler also owns a [`TimerManager`] and, while
//! its document is torn down, one terminating thread that runs the unload
//! sequence.

#![deny(unsafe_code)]

mod arena;
mod clock;
mod debugger;
mod delegate;
mod dependency;
mod engine;
mod error;
mod host;
mod javascript_url;
mod prefs;
mod scheduler;
mod terminating;
mod thread;
mod timers;

pub use crate::arena::ThreadId;
pub use crate::clock::{Clock, ManualClock, SystemClock, Timeslice};
pub use crate::debugger::{DebuggerAction, DebuggerEvent, DebuggerListener};
pub use crate::delegate::{DefaultDocumentDelegate, DocumentDelegate};
pub use crate::dependency::{Dependency, WaitFor};
pub use crate::engine::{
    CompileResult, EngineStatus, EvaluationScope, ExecutionContext, ParseError, ScriptSource,
};
pub use crate::error::{Fallible, OutOfMemory, SchedulerError};
pub use crate::host::{EnqueueOutcome, HostTask, HostWaker, RejectReason, SchedulerHost};
pub use crate::javascript_url::{JavascriptUrlDelegate, JavascriptUrlThread, UrlState};
pub use crate::prefs::SchedulerPrefs;
pub use crate::scheduler::{ErrorHandlerKind, SchedulerId};
pub use crate::terminating::{
    ActionFlags, TerminatingAction, TerminatingActionType, TerminatingHooks, UnloadDecision,
};
pub use crate::thread::{
    BlockReason, OriginFlags, RestartTag, Restartable, ScriptThread, SharedThreadInfo,
    ThreadListener, ThreadSignal, ThreadState, ThreadType,
};
pub use crate::timers::{TimerCallback, TimerEvent, TimerEventId, TimerManager};
