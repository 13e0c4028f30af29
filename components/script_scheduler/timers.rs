/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Delayed and repeating callbacks that become script threads when due.
//!
//! Every scheduler owns one [`TimerManager`]. An event waits in a time ordered
//! queue until it is due, then moves to the expired set while the thread it
//! spawned runs. A repeating event goes back into the queue once its thread
//! has finished.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::engine::ExecutionContext;
use crate::error::OutOfMemory;
use crate::thread::OriginFlags;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TimerEventId(pub u32);

/// Produces the execution context for one firing of an event.
pub trait TimerCallback {
    fn instantiate(&mut self) -> Result<Box<dyn ExecutionContext>, OutOfMemory>;
}

impl<F> TimerCallback for F
where
    F: FnMut() -> Box<dyn ExecutionContext>,
{
    fn instantiate(&mut self) -> Result<Box<dyn ExecutionContext>, OutOfMemory> {
        Ok(self())
    }
}

pub struct TimerEvent {
    id: TimerEventId,
    /// Requested delay in milliseconds, before clamping.
    requested_ms: f64,
    delay: Duration,
    repeating: bool,
    stopped: bool,
    due: Instant,
    /// Sum of the delays of every firing in a repeat chain.
    cumulative_delay: Duration,
    /// Computed when the spawned thread starts; a repeat fires at this time.
    next_due: Option<Instant>,
    origin: OriginFlags,
    callback: Box<dyn TimerCallback>,
}

impl TimerEvent {
    pub fn new(delay_ms: f64, repeating: bool, callback: Box<dyn TimerCallback>) -> TimerEvent {
        TimerEvent {
            id: TimerEventId(0),
            requested_ms: delay_ms,
            delay: Duration::ZERO,
            repeating,
            stopped: false,
            due: Instant::now(),
            cumulative_delay: Duration::ZERO,
            next_due: None,
            origin: OriginFlags::empty(),
            callback,
        }
    }

    pub fn with_origin(mut self, origin: OriginFlags) -> TimerEvent {
        self.origin = origin;
        self
    }

    pub(crate) fn inherit_origin(&mut self, origin: OriginFlags) {
        self.origin |= origin;
    }
}

/// Hands out event ids for one manager. Running scripts get their ids from a
/// clone before the event itself reaches the manager.
#[derive(Clone)]
pub(crate) struct TimerIds(Rc<Cell<u32>>);

impl TimerIds {
    fn new() -> TimerIds {
        TimerIds(Rc::new(Cell::new(1)))
    }

    pub(crate) fn next(&self) -> TimerEventId {
        let id = self.0.get();
        self.0.set(id + 1);
        TimerEventId(id)
    }
}

fn clamp_delay(delay_ms: f64, maximum: Duration) -> Duration {
    if delay_ms.is_nan() || delay_ms <= 0.0 {
        return Duration::ZERO;
    }
    let maximum_ms = maximum.as_secs_f64() * 1000.0;
    if delay_ms >= maximum_ms {
        return maximum;
    }
    Duration::from_secs_f64(delay_ms / 1000.0)
}

pub struct TimerManager {
    /// Sorted in reverse, the next event to fire is at the back.
    waiting: VecDeque<TimerEvent>,
    expired: Vec<TimerEvent>,
    active: bool,
    ids: TimerIds,
    minimum_repeat_delay: Duration,
    maximum_delay: Duration,
}

impl TimerManager {
    pub fn new(minimum_repeat_delay: Duration, maximum_delay: Duration) -> TimerManager {
        TimerManager {
            waiting: VecDeque::new(),
            expired: Vec::new(),
            active: true,
            ids: TimerIds::new(),
            minimum_repeat_delay,
            maximum_delay,
        }
    }

    fn insert_waiting(&mut self, event: TimerEvent) {
        let insertion_index = self
            .waiting
            .binary_search_by(|probe| {
                (probe.due, probe.id)
                    .cmp(&(event.due, event.id))
                    .reverse()
            })
            .unwrap_or_else(|index| index);
        self.waiting.insert(insertion_index, event);
    }

    /// Queue `event` to fire at `now` plus its clamped delay.
    pub fn add(&mut self, event: TimerEvent, now: Instant) -> TimerEventId {
        let id = self.ids.next();
        self.add_with_id(event, id, now);
        id
    }

    /// Queue `event` under an id taken from [`TimerManager::ids`] earlier.
    pub(crate) fn add_with_id(&mut self, mut event: TimerEvent, id: TimerEventId, now: Instant) {
        event.id = id;
        event.delay = clamp_delay(event.requested_ms, self.maximum_delay);
        event.due = now + event.delay;
        event.cumulative_delay = event.delay;
        debug!(
            "Adding timer {:?} due in {:?} (repeating: {})",
            id, event.delay, event.repeating
        );
        self.insert_waiting(event);
    }

    pub(crate) fn ids(&self) -> TimerIds {
        self.ids.clone()
    }

    /// Whether `id` is the next event to fire.
    pub fn is_next(&self, id: TimerEventId) -> bool {
        self.waiting.back().is_some_and(|event| event.id == id)
    }

    /// Move every waiting event due at `now` to the expired set, returning
    /// them in firing order. Nothing fires while deactivated.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerEventId> {
        let mut due = Vec::new();
        if !self.active {
            return due;
        }
        while self.waiting.back().is_some_and(|event| event.due <= now) {
            let Some(event) = self.waiting.pop_back() else {
                break;
            };
            due.push(event.id);
            self.expired.push(event);
        }
        due
    }

    fn expired_mut(&mut self, id: TimerEventId) -> Option<&mut TimerEvent> {
        self.expired.iter_mut().find(|event| event.id == id)
    }

    fn find(&self, id: TimerEventId) -> Option<&TimerEvent> {
        self.waiting
            .iter()
            .chain(self.expired.iter())
            .find(|event| event.id == id)
    }

    /// Create the context for the thread an expired event spawns.
    pub(crate) fn instantiate(
        &mut self,
        id: TimerEventId,
    ) -> Option<Result<Box<dyn ExecutionContext>, OutOfMemory>> {
        self.expired_mut(id).map(|event| event.callback.instantiate())
    }

    pub fn origin(&self, id: TimerEventId) -> OriginFlags {
        self.find(id)
            .map(|event| event.origin)
            .unwrap_or_default()
    }

    /// Called when the thread spawned by an expired event starts. The next
    /// firing of a repeating event is measured from here; a zero delay
    /// becomes the minimum repeat delay.
    pub fn set_next_timeout(&mut self, id: TimerEventId, now: Instant) {
        let minimum = self.minimum_repeat_delay;
        if let Some(event) = self.expired_mut(id) {
            if event.repeating {
                let delay = if event.delay.is_zero() {
                    minimum
                } else {
                    event.delay
                };
                event.next_due = Some(now + delay);
            }
        }
    }

    /// Re-queue an expired repeating event. Returns false, leaving the event
    /// where it is, if it is not eligible to repeat.
    pub fn repeat(&mut self, id: TimerEventId) -> bool {
        let Some(index) = self.expired.iter().position(|event| event.id == id) else {
            return false;
        };
        let event = &self.expired[index];
        if !event.repeating || event.stopped || event.next_due.is_none() {
            return false;
        }

        let mut event = self.expired.swap_remove(index);
        let delay = if event.delay.is_zero() {
            self.minimum_repeat_delay
        } else {
            event.delay
        };
        event.cumulative_delay += delay;
        if let Some(next_due) = event.next_due.take() {
            event.due = next_due;
        }
        self.insert_waiting(event);
        true
    }

    /// Remove a waiting or expired event.
    pub fn remove(&mut self, id: TimerEventId) -> bool {
        if let Some(index) = self.waiting.iter().position(|event| event.id == id) {
            self.waiting.remove(index);
            return true;
        }
        self.remove_expired(id)
    }

    pub fn remove_expired(&mut self, id: TimerEventId) -> bool {
        match self.expired.iter().position(|event| event.id == id) {
            Some(index) => {
                self.expired.swap_remove(index);
                true
            },
            None => false,
        }
    }

    /// Let the current firing finish but never re-queue the event.
    pub fn stop_repeating(&mut self, id: TimerEventId) {
        if let Some(event) = self.expired_mut(id) {
            event.stopped = true;
        }
    }

    pub fn remove_all(&mut self) {
        self.waiting.clear();
        self.expired.clear();
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Resume firing. Returns whether events already elapsed at `now`; the
    /// caller fires those asynchronously.
    pub fn activate(&mut self, now: Instant) -> bool {
        if self.active {
            warn!("Activating an active timer manager");
        }
        self.active = true;
        self.waiting.back().is_some_and(|event| event.due <= now)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// When the next event is due, if any is waiting and firing is enabled.
    pub fn next_due(&self) -> Option<Instant> {
        if !self.active {
            return None;
        }
        self.waiting.back().map(|event| event.due)
    }

    pub fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    pub fn is_waiting(&self, id: TimerEventId) -> bool {
        self.waiting.iter().any(|event| event.id == id)
    }

    pub fn is_expired(&self, id: TimerEventId) -> bool {
        self.expired.iter().any(|event| event.id == id)
    }

    pub fn waiting_ids(&self) -> Vec<TimerEventId> {
        self.waiting.iter().rev().map(|event| event.id).collect()
    }

    pub fn cumulative_delay(&self, id: TimerEventId) -> Option<Duration> {
        self.find(id).map(|event| event.cumulative_delay)
    }

    pub fn delay(&self, id: TimerEventId) -> Option<Duration> {
        self.find(id).map(|event| event.delay)
    }
}
