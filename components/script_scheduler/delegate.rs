/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use crate::engine::EvaluationScope;
use crate::error::Fallible;

/// The document a scheduler runs scripts for.
///
/// Every method has a default matching an ordinary, current, scriptable
/// document without unload listeners.
pub trait DocumentDelegate {
    /// Scripting is enabled for the document.
    fn is_enabled(&self) -> bool {
        true
    }

    /// The document is still the one shown by its browsing context.
    fn is_current_document(&self) -> bool {
        true
    }

    /// Script execution is paused, for example while a modal dialog of
    /// another document is open.
    fn is_paused(&self) -> bool {
        false
    }

    fn timers_suppressed(&self) -> bool {
        false
    }

    fn has_unload_listener(&self) -> bool {
        false
    }

    /// Fire the unload event. Listeners are run by spawning an interrupting
    /// event thread through `scope`.
    fn dispatch_unload(&mut self, _scope: &mut EvaluationScope) -> Fallible<()> {
        Ok(())
    }

    /// The runnable list became empty after a cancellation.
    fn scheduler_resting(&mut self) {}

    /// Walk session history by `delta` entries.
    fn navigate_history(&mut self, _delta: i32, _user_requested: bool) {}

    /// Adjust the history delta that queued navigations will apply.
    fn add_pending_history_delta(&mut self, _delta: i32) {}

    /// A run continuation failed with resource exhaustion.
    fn low_memory(&mut self) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDocumentDelegate;

impl DocumentDelegate for DefaultDocumentDelegate {}
