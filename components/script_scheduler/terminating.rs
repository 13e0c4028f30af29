/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Document teardown.
//!
//! A scheduler that starts terminating gets one terminating thread, kept at
//! the end of its runnable list. The thread carries an ordered list of
//! [`TerminatingAction`]s: every action gets to run before the unload event
//! is dispatched and again afterwards. The last action decides whether an
//! unload event is sent at all.

use bitflags::bitflags;
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::engine::EvaluationScope;
use crate::error::Fallible;
use crate::thread::{Step, ThreadEnvironment};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ActionFlags: u8 {
        /// The action ends the life of the document. Further actions are
        /// placed before it.
        const FINAL = 1 << 0;
        /// The action may be superseded by a later one while the thread is
        /// idle.
        const CONDITIONAL = 1 << 1;
        /// Dispatch an unload event, if the document listens for one.
        const SEND_UNLOAD = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoStaticStr, PartialEq, Serialize)]
pub enum TerminatingActionType {
    Generic,
    /// Added to a child document's terminating thread when its parent is torn
    /// down.
    TerminatedByParent,
    OpenUrl,
    HistoryWalk,
    WindowClose,
    ReplaceDocument,
}

/// Whether the unload event should still be dispatched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnloadDecision {
    Proceed,
    CancelUnload,
}

/// The work an action does around the unload event. Hooks may block the
/// terminating thread through the scope, which delays the unload event until
/// it is unblocked.
pub trait TerminatingHooks {
    fn before_unload(
        &mut self,
        _scope: &mut EvaluationScope,
        _sending_unload: bool,
    ) -> Fallible<UnloadDecision> {
        Ok(UnloadDecision::Proceed)
    }

    fn after_unload(&mut self, _scope: &mut EvaluationScope) -> Fallible<()> {
        Ok(())
    }
}

pub struct TerminatingAction {
    action_type: TerminatingActionType,
    flags: ActionFlags,
    hooks: Option<Box<dyn TerminatingHooks>>,
}

impl TerminatingAction {
    pub fn new(action_type: TerminatingActionType, flags: ActionFlags) -> TerminatingAction {
        TerminatingAction {
            action_type,
            flags,
            hooks: None,
        }
    }

    /// The action a scheduler gets when nobody asked for anything specific:
    /// final, unconditional, with an unload event.
    pub fn default_final() -> TerminatingAction {
        TerminatingAction::new(
            TerminatingActionType::Generic,
            ActionFlags::FINAL | ActionFlags::SEND_UNLOAD,
        )
    }

    pub fn with_hooks(mut self, hooks: Box<dyn TerminatingHooks>) -> TerminatingAction {
        self.hooks = Some(hooks);
        self
    }

    pub fn action_type(&self) -> TerminatingActionType {
        self.action_type
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(ActionFlags::FINAL)
    }

    pub fn is_conditional(&self) -> bool {
        self.flags.contains(ActionFlags::CONDITIONAL)
    }

    pub fn sends_unload(&self) -> bool {
        self.flags.contains(ActionFlags::SEND_UNLOAD)
    }
}

pub(crate) struct TerminatingThread {
    actions: Vec<TerminatingAction>,
    /// Child threads noticed but not yet terminated.
    children: u32,
    delayed_unload: bool,
    children_terminated: bool,
}

impl TerminatingThread {
    pub(crate) fn new() -> TerminatingThread {
        TerminatingThread {
            actions: Vec::new(),
            children: 0,
            delayed_unload: false,
            children_terminated: false,
        }
    }

    pub(crate) fn actions(&self) -> impl Iterator<Item = &TerminatingAction> {
        self.actions.iter()
    }

    /// Merge `action` into the list. `busy` is set while this thread is the
    /// one executing, in which case nothing already in the list is dropped.
    pub(crate) fn add_action(&mut self, action: TerminatingAction, busy: bool) {
        let Some(last) = self.actions.last() else {
            self.actions.push(action);
            return;
        };

        if last.is_final() {
            if !last.is_conditional() || action.is_conditional() {
                debug!(
                    "Dropping {:?} terminating action, list already ends in a final one",
                    action.action_type
                );
                return;
            }
            if action.is_final() {
                if !busy {
                    self.actions.pop();
                }
                self.actions.push(action);
            } else {
                let index = self.actions.len() - 1;
                self.actions.insert(index, action);
            }
            return;
        }

        if last.is_conditional() && !busy {
            self.actions.pop();
        }
        self.actions.push(action);
    }

    /// Whether an action would be kept by `add_action`. Only a trailing final
    /// action drops newcomers, so the newcomer's own finality does not matter.
    pub(crate) fn test_action(&self, conditional: bool) -> bool {
        match self.actions.last() {
            Some(last) => !(last.is_final() && (!last.is_conditional() || conditional)),
            None => true,
        }
    }

    /// Remove the last action of `action_type`. Returns whether one was
    /// removed; nothing is removed while the thread is executing.
    pub(crate) fn remove_action(&mut self, action_type: TerminatingActionType, busy: bool) -> bool {
        if busy {
            return false;
        }
        match self
            .actions
            .iter()
            .rposition(|action| action.action_type == action_type)
        {
            Some(index) => {
                self.actions.remove(index);
                true
            },
            None => false,
        }
    }

    /// Returns true when this is the first outstanding child, meaning the
    /// thread has to block until the children are gone.
    pub(crate) fn child_noticed(&mut self) -> bool {
        self.children += 1;
        self.children == 1
    }

    /// Returns true when the last outstanding child terminated.
    pub(crate) fn child_terminated(&mut self) -> bool {
        debug_assert!(self.children > 0);
        self.children = self.children.saturating_sub(1);
        self.children == 0
    }

    pub(crate) fn evaluate(
        &mut self,
        started: bool,
        env: &mut ThreadEnvironment,
        scope: &mut EvaluationScope,
    ) -> Fallible<Step> {
        if !started {
            let send_unload = self
                .actions
                .last()
                .is_some_and(|action| action.sends_unload()) &&
                env.delegate.has_unload_listener();

            let mut cancel_unload = false;
            for action in self.actions.iter_mut() {
                if let Some(hooks) = action.hooks.as_mut() {
                    if hooks.before_unload(scope, send_unload)? == UnloadDecision::CancelUnload {
                        cancel_unload = true;
                    }
                }
            }

            if send_unload {
                if scope.block_requested().is_some() {
                    self.delayed_unload = true;
                } else if !cancel_unload {
                    return self.send_unload(env, scope);
                }
            }

            if scope.block_requested().is_some() {
                return Ok(Step::Block);
            }
        }

        if self.delayed_unload {
            self.delayed_unload = false;
            return self.send_unload(env, scope);
        }

        for action in self.actions.iter_mut() {
            if let Some(hooks) = action.hooks.as_mut() {
                hooks.after_unload(scope)?;
            }
        }

        Ok(Step::Done { failed: false })
    }

    fn send_unload(
        &mut self,
        env: &mut ThreadEnvironment,
        scope: &mut EvaluationScope,
    ) -> Fallible<Step> {
        if !self.children_terminated {
            self.children_terminated = true;
            if env.has_children {
                // Children are torn down once this step returns; the unload
                // event waits until they are gone.
                scope.terminate_children();
                self.delayed_unload = true;
                return Ok(Step::Continue);
            }
        }

        if scope.block_requested().is_some() {
            self.delayed_unload = true;
        } else {
            debug!("Dispatching unload event");
            env.delegate.dispatch_unload(scope)?;
        }
        Ok(Step::Continue)
    }
}
