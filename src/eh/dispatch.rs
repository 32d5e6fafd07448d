//! Two-pass exception dispatch over a walked stack.
//!
//! # Overview
//!
//! [`Dispatcher::dispatch`] runs one complete dispatch with the operations of
//! [`ThreadExceptionState`]:
//!
//! 1. Raise a tracker and deliver the first chance
//! 2. First pass: search frames leaf to root, running filters as needed
//! 3. Second pass: unwind frames up to the handler, running finally and fault
//!    funclets, then the catch
//! 4. Pop the finished trackers and report where execution resumes
//!
//! Control transfer into funclets belongs to the platform and is abstracted
//! by [`FuncletInvoker`]. Funclets may raise nested exceptions through the
//! thread state they are handed; a nested exception that leaves its funclet
//! ends the outer dispatch. A nested exception leaving a filter counts as a
//! rejection, unless its catch lies further out and popped the outer tracker.

use std::collections::HashMap;

use log::debug;

use crate::{
    eh::{
        chain::{code_address, FirstPassOutcome, FuncletCall, ThreadExceptionState},
        clause::{ExceptionClause, TypeToken},
        frame::{CrawlFrame, FuncletKind, MethodId, StackFrame},
        tracker::{ExceptionRecord, TrackerId},
    },
    gc::ObjectRef,
    Result,
};

/// Where a dispatch ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// A catch ran; execution continues at `resume_pc` in the frame identified
    /// by `resume_frame` (its caller SP).
    Handled {
        /// Address execution resumes at.
        resume_pc: usize,
        /// Caller SP of the frame execution resumes in.
        resume_frame: StackFrame,
    },
    /// No frame catches the exception.
    Unhandled,
}

/// What a funclet did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncletOutcome {
    /// A finally or fault funclet returned.
    Completed,
    /// A filter returned its verdict.
    FilterVerdict(bool),
    /// A catch funclet returned the address to resume at.
    ResumeAt(usize),
    /// A nested exception left the funclet and was dispatched to this result.
    Escaped(DispatchResult),
}

/// The platform side of funclet invocation.
pub trait FuncletInvoker {
    /// Where the funclet's frame will be called from.
    fn funclet_caller_sp(&self, call: &FuncletCall) -> StackFrame;

    /// Runs a funclet.
    ///
    /// The thread state is handed through so the funclet can raise and
    /// dispatch nested exceptions.
    fn invoke(&mut self, state: &mut ThreadExceptionState, call: &FuncletCall) -> FuncletOutcome;
}

/// How the first pass ended.
enum Search {
    Handler(usize),
    Unhandled,
    Escaped(DispatchResult),
}

/// Exception clauses of the methods on the stack.
pub trait ClauseSource {
    /// The clauses of `frame`'s method, innermost first.
    fn clauses(&self, frame: &CrawlFrame) -> &[ExceptionClause];
}

impl ClauseSource for HashMap<MethodId, Vec<ExceptionClause>> {
    fn clauses(&self, frame: &CrawlFrame) -> &[ExceptionClause] {
        self.get(&frame.method).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Drives complete two-pass dispatches.
#[derive(Clone, Copy, Debug, Default)]
pub struct Dispatcher;

impl Dispatcher {
    /// Dispatches one exception.
    ///
    /// # Arguments
    ///
    /// * `state` - The raising thread's exception state
    /// * `record` - The exception record
    /// * `throwable` - The thrown object
    /// * `frames` - The stack at the raise point, leaf first
    /// * `clauses` - Exception clauses per frame
    /// * `matches` - Decides whether the exception is of a catch clause's type
    /// * `invoker` - Runs funclets
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TrackerAllocationFailed`] if no tracker could be
    /// allocated, or [`crate::Error::InvalidTracker`] if a funclet released the
    /// dispatching tracker without reporting [`FuncletOutcome::Escaped`].
    pub fn dispatch(
        state: &mut ThreadExceptionState,
        record: ExceptionRecord,
        throwable: ObjectRef,
        frames: &[CrawlFrame],
        clauses: &dyn ClauseSource,
        matches: &mut dyn FnMut(TypeToken) -> bool,
        invoker: &mut dyn FuncletInvoker,
    ) -> Result<DispatchResult> {
        let id = state.try_raise(record, 0, throwable)?;
        state.mark_first_chance_delivered(id)?;

        let handler_index = match Self::first_pass(state, id, frames, clauses, matches, invoker)? {
            Search::Handler(index) => index,
            Search::Unhandled => {
                state.first_pass_unhandled(id)?;
                debug!("{}: exception {:#x} is unhandled", state.thread(), record.code);
                return Ok(DispatchResult::Unhandled);
            }
            Search::Escaped(result) => return Ok(result),
        };

        state.begin_second_pass(id)?;
        let mut resume_pc = None;
        for frame in &frames[..=handler_index] {
            let calls = state.second_pass_frame(id, frame, clauses.clauses(frame))?;
            for call in calls {
                let call = call.with_caller_sp(invoker.funclet_caller_sp(&call));
                state.begin_funclet(id, &call)?;
                let outcome = invoker.invoke(state, &call);
                if let FuncletOutcome::Escaped(result) = outcome {
                    debug!(
                        "{}: nested exception left funclet {:#x} of tracker {}",
                        state.thread(),
                        call.handler_pc,
                        id
                    );
                    return Ok(result);
                }
                state.end_funclet(id)?;

                if call.kind == FuncletKind::Catch {
                    if let FuncletOutcome::ResumeAt(pc) = outcome {
                        resume_pc = Some(pc);
                    }
                }
            }
        }

        let handler_frame = &frames[handler_index];
        let tracker = state.tracker(id)?;
        let resume_pc = resume_pc.unwrap_or_else(|| {
            tracker
                .clause_for_catch()
                .map_or(handler_frame.method_start, |clause| {
                    code_address(handler_frame, clause.handler_end())
                })
        });
        state.complete_catch(id, handler_frame.caller_sp)?;

        debug!(
            "{}: exception {:#x} handled, resuming at {:#x} in {}",
            state.thread(),
            record.code,
            resume_pc,
            handler_frame.sp
        );
        Ok(DispatchResult::Handled {
            resume_pc,
            resume_frame: handler_frame.caller_sp,
        })
    }

    fn first_pass(
        state: &mut ThreadExceptionState,
        id: TrackerId,
        frames: &[CrawlFrame],
        clauses: &dyn ClauseSource,
        matches: &mut dyn FnMut(TypeToken) -> bool,
        invoker: &mut dyn FuncletInvoker,
    ) -> Result<Search> {
        for (index, frame) in frames.iter().enumerate() {
            let frame_clauses = clauses.clauses(frame);
            let mut outcome = state.first_pass_frame(id, frame, frame_clauses, matches)?;
            loop {
                match outcome {
                    FirstPassOutcome::ContinueSearch => break,
                    FirstPassOutcome::HandlerFound { .. } => return Ok(Search::Handler(index)),
                    FirstPassOutcome::InvokeFilter { clause_index } => {
                        let call = FuncletCall::filter(frame, clause_index, &frame_clauses[clause_index]);
                        let call = call.with_caller_sp(invoker.funclet_caller_sp(&call));
                        state.begin_funclet(id, &call)?;
                        let verdict = invoker.invoke(state, &call);
                        if let FuncletOutcome::Escaped(result) = verdict {
                            if !state.contains(id) {
                                debug!(
                                    "{}: nested exception left filter {:#x} and popped tracker {}",
                                    state.thread(),
                                    call.handler_pc,
                                    id
                                );
                                return Ok(Search::Escaped(result));
                            }
                        }
                        state.end_funclet(id)?;
                        let accepted = verdict == FuncletOutcome::FilterVerdict(true);
                        outcome = state.filter_result(id, frame, frame_clauses, clause_index, accepted, matches)?;
                    }
                }
            }
        }
        Ok(Search::Unhandled)
    }
}
