/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Threads evaluating `javascript:` URLs.
//!
//! Evaluation goes through a fixed sequence of states. Each state has one
//! handler that either advances to the next state or stops the step, so a
//! thread that is suspended or blocked picks up exactly where it left off.

use log::debug;

use crate::engine::{CompileResult, EngineStatus, EvaluationScope, ExecutionContext, ParseError};
use crate::error::Fallible;
use crate::thread::{ScriptRun, Step, ThreadEnvironment, ThreadSignal};

/// The document side of a `javascript:` URL load.
pub trait JavascriptUrlDelegate {
    /// Runs before the source is compiled. Extensions may rewrite the source
    /// or block the thread through the scope.
    fn before_evaluate(
        &mut self,
        _url: &str,
        _source: &mut Option<String>,
        _scope: &mut EvaluationScope,
    ) -> Fallible<()> {
        Ok(())
    }

    /// Runs after successful evaluation. Extensions may replace the result or
    /// block the thread.
    fn after_evaluate(
        &mut self,
        _url: &str,
        _result: &mut Option<String>,
        _scope: &mut EvaluationScope,
    ) -> Fallible<()> {
        Ok(())
    }

    /// Replace the document with the string the URL evaluated to.
    fn write_document(&mut self, _result: &str) -> Fallible<()> {
        Ok(())
    }

    /// Deliver the result as the URL's response body.
    fn write_url(&mut self, _result: &str) -> Fallible<()> {
        Ok(())
    }

    /// The URL produced nothing to show; the load ends as "no content".
    fn no_content(&mut self) {}

    /// Tell the URL's consumers that the load is over.
    fn post_url_messages(&mut self, _failed: bool, _cancelled: bool) -> Fallible<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UrlState {
    Initial,
    SetProgram,
    Evaluate,
    NotifyExtensions,
    HandleResult,
    Done,
}

/// What a state handler asks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Transition {
    Advance(UrlState),
    Suspend,
    /// Stop this step and continue from the given state once unblocked.
    Block(UrlState),
    Done { failed: bool },
}

pub struct JavascriptUrlThread {
    url: String,
    source: Option<String>,
    run: ScriptRun,
    state: UrlState,
    result: Option<String>,
    write_result_to_document: bool,
    write_result_to_url: bool,
    messages_posted: bool,
    delegate: Box<dyn JavascriptUrlDelegate>,
}

impl JavascriptUrlThread {
    pub fn new(
        url: impl Into<String>,
        source: impl Into<String>,
        context: Box<dyn ExecutionContext>,
        delegate: Box<dyn JavascriptUrlDelegate>,
    ) -> JavascriptUrlThread {
        JavascriptUrlThread {
            url: url.into(),
            source: Some(source.into()),
            run: ScriptRun::new(context),
            state: UrlState::Initial,
            result: None,
            write_result_to_document: false,
            write_result_to_url: false,
            messages_posted: false,
            delegate,
        }
    }

    /// Replace the current document with the result, as a navigation to the
    /// URL would.
    pub fn write_result_to_document(mut self) -> JavascriptUrlThread {
        self.write_result_to_document = true;
        self
    }

    pub fn write_result_to_url(mut self) -> JavascriptUrlThread {
        self.write_result_to_url = true;
        self
    }

    pub fn state(&self) -> UrlState {
        self.state
    }

    pub(crate) fn context(&mut self) -> &mut dyn ExecutionContext {
        self.run.context()
    }

    pub(crate) fn evaluate(
        &mut self,
        env: &mut ThreadEnvironment,
        scope: &mut EvaluationScope,
    ) -> Fallible<Step> {
        loop {
            let transition = match self.state {
                UrlState::Initial => self.initial(scope)?,
                UrlState::SetProgram => self.set_program(scope)?,
                UrlState::Evaluate => self.evaluate_program(scope)?,
                UrlState::NotifyExtensions => self.notify_extensions(scope)?,
                UrlState::HandleResult => self.handle_result(env)?,
                UrlState::Done => Transition::Done { failed: false },
            };

            match transition {
                Transition::Advance(state) => self.state = state,
                Transition::Suspend => return Ok(Step::Suspend),
                Transition::Block(resume_at) => {
                    self.state = resume_at;
                    return Ok(Step::Block);
                },
                Transition::Done { failed } => {
                    self.state = UrlState::Done;
                    if self.write_result_to_url {
                        self.messages_posted = true;
                        self.delegate.post_url_messages(failed, false)?;
                    }
                    return Ok(Step::Done { failed });
                },
            }
        }
    }

    fn initial(&mut self, scope: &mut EvaluationScope) -> Fallible<Transition> {
        self.delegate
            .before_evaluate(&self.url, &mut self.source, scope)?;
        if scope.block_requested().is_some() {
            return Ok(Transition::Block(UrlState::SetProgram));
        }
        Ok(Transition::Advance(UrlState::SetProgram))
    }

    fn set_program(&mut self, scope: &mut EvaluationScope) -> Fallible<Transition> {
        let Some(source) = self.source.as_deref() else {
            return Ok(Transition::Advance(UrlState::Evaluate));
        };
        match self.run.context().compile(source)? {
            CompileResult::Compiled => Ok(Transition::Advance(UrlState::Evaluate)),
            CompileResult::SyntaxError(error) => {
                debug!("Syntax error in {}: {}", self.url, error.message);
                scope.report_parse_error(ParseError {
                    url: error.url.or_else(|| Some(self.url.clone())),
                    ..error
                });
                Ok(Transition::Done { failed: true })
            },
        }
    }

    fn evaluate_program(&mut self, scope: &mut EvaluationScope) -> Fallible<Transition> {
        Ok(match self.run.step(scope)? {
            EngineStatus::Completed => {
                self.result = self.run.context().returned_value();
                Transition::Advance(UrlState::NotifyExtensions)
            },
            EngineStatus::Failed => Transition::Done { failed: true },
            EngineStatus::Suspended => Transition::Suspend,
            EngineStatus::Blocked => Transition::Block(UrlState::Evaluate),
        })
    }

    fn notify_extensions(&mut self, scope: &mut EvaluationScope) -> Fallible<Transition> {
        self.delegate
            .after_evaluate(&self.url, &mut self.result, scope)?;
        if scope.block_requested().is_some() {
            return Ok(Transition::Block(UrlState::HandleResult));
        }
        Ok(Transition::Advance(UrlState::HandleResult))
    }

    fn handle_result(&mut self, env: &mut ThreadEnvironment) -> Fallible<Transition> {
        match self.result.as_deref() {
            Some(result) => {
                if self.write_result_to_document {
                    self.write_result_to_document = false;
                    if env.document_busy {
                        debug!("Not writing result of {}, document is busy", self.url);
                    } else {
                        self.delegate.write_document(result)?;
                    }
                }
                if self.write_result_to_url {
                    self.delegate.write_url(result)?;
                }
            },
            None => {
                if self.write_result_to_document {
                    self.write_result_to_document = false;
                    self.delegate.no_content();
                }
            },
        }
        Ok(Transition::Done { failed: false })
    }

    pub(crate) fn signalled(&mut self, signal: ThreadSignal) -> Fallible<()> {
        let failed = signal == ThreadSignal::Failed;
        let cancelled = signal == ThreadSignal::Cancelled;

        let mut result = Ok(());
        if (failed || cancelled) && !self.messages_posted {
            self.messages_posted = true;
            result = self.delegate.post_url_messages(failed, cancelled);
        }

        if signal.is_terminal() && self.write_result_to_document {
            self.write_result_to_document = false;
            self.delegate.no_content();
        }

        result
    }
}
