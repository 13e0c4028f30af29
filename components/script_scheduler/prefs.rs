/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Tunables for the scheduler. Created once by the embedder and handed to the
//! [`SchedulerHost`](crate::SchedulerHost); there is no global copy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerPrefs {
    /// How long one run loop slice may execute script before yielding back to
    /// the host, in milliseconds.
    pub timeslice_ms: u64,

    /// The deepest chain of interrupting threads that is accepted. Interrupting
    /// a thread that is already this deep fails.
    pub max_recursion_depth: u32,

    /// Repeating timers asking for a zero or negative delay are re-queued with
    /// this delay instead, so an interval can never spin the event loop.
    pub timers_minimum_repeat_delay_ms: u64,

    /// Upper bound for any requested timer delay.
    pub timers_maximum_delay_ms: u64,

    /// Run the deadlock detector after every change to the dependency graph.
    /// Only has an effect when built with the `deadlock_detection` feature.
    pub deadlock_check_on_enqueue: bool,
}

impl Default for SchedulerPrefs {
    fn default() -> Self {
        SchedulerPrefs {
            timeslice_ms: 100,
            max_recursion_depth: 100,
            timers_minimum_repeat_delay_ms: 4,
            timers_maximum_delay_ms: i32::MAX as u64,
            deadlock_check_on_enqueue: true,
        }
    }
}

impl SchedulerPrefs {
    /// Parse preferences from a JSON object. Missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<SchedulerPrefs, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms)
    }

    pub fn minimum_repeat_delay(&self) -> Duration {
        Duration::from_millis(self.timers_minimum_repeat_delay_ms)
    }

    pub fn maximum_delay(&self) -> Duration {
        Duration::from_millis(self.timers_maximum_delay_ms)
    }
}
