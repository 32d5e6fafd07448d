//! The per-thread chain of exception trackers.
//!
//! # Overview
//!
//! [`ThreadExceptionState`] is the exception-handling half of a runtime thread.
//! It owns the head of the thread's tracker chain and drives each tracker
//! through both dispatch passes:
//!
//! 1. **First pass** - [`first_pass_frame`](ThreadExceptionState::first_pass_frame)
//!    is called for each frame from the leaf up until a catch or an accepting
//!    filter is found. Filters run between
//!    [`begin_funclet`](ThreadExceptionState::begin_funclet) and
//!    [`end_funclet`](ThreadExceptionState::end_funclet).
//! 2. **Second pass** - [`second_pass_frame`](ThreadExceptionState::second_pass_frame)
//!    is called for the same frames again. It records the unwound stack range,
//!    collapses an older tracker whose frames are being unwound, and returns the
//!    finally, fault and catch funclets to run in that frame.
//!
//! # Nested Exceptions
//!
//! An exception raised inside a funclet gets a new tracker in front of the one
//! that called the funclet. When the new exception's second pass reaches the
//! older tracker's frames, the older tracker is folded into the newer one and
//! freed. The newer tracker keeps enough of the old funclet's bookkeeping that
//! a GC stack walk can still find the old funclet's parent frame, see
//! [`find_parent_stack_frame_for_stack_walk`](ThreadExceptionState::find_parent_stack_frame_for_stack_walk).
//!
//! The newer tracker also remembers the range the older one unwound. Finally
//! and fault clauses of frames in that range have already run and are not
//! returned again; in the frame whose funclet was interrupted, only clauses
//! after the interrupted one are.

use std::{process, sync::Arc};

use log::{debug, error, trace};

use crate::{
    eh::{
        allocator::{TrackerAllocator, TrackerChain, TrackerMemoryType},
        clause::{EhClauseInfo, EnclosingClauseInfo, ExceptionClause, TypeToken},
        frame::{CrawlFrame, FuncletKind, StackFrame},
        tracker::{
            ExceptionFlags, ExceptionPointers, ExceptionRecord, ExceptionTracker, ThreadId,
            TrackerId, TrackerState, UnwindStatus,
        },
    },
    gc::ObjectRef,
    Error, Result,
};

/// What the first pass decided for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirstPassOutcome {
    /// No clause of this frame catches; continue with the caller.
    ContinueSearch,
    /// The filter of this clause must run before the search can continue.
    InvokeFilter {
        /// Index of the filter clause within the frame's clauses.
        clause_index: usize,
    },
    /// This clause catches the exception.
    HandlerFound {
        /// Index of the catching clause within the frame's clauses.
        clause_index: usize,
    },
}

/// How a stack walk should continue after reporting a funclet frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentFrame {
    /// Report the following frames normally.
    NoSkip,
    /// The parent is not known yet; skip exactly the next frame.
    SkipOne,
    /// Skip frames until the one whose caller SP is this frame; it is the parent.
    SkipTo(StackFrame),
}

/// One funclet invocation requested by a dispatch pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FuncletCall {
    /// The kind of funclet.
    pub kind: FuncletKind,
    /// Index of the clause in the parent frame's clause list.
    pub clause_index: usize,
    /// Entry address of the funclet.
    pub handler_pc: usize,
    /// The frame owning the clause.
    pub parent: CrawlFrame,
    /// Stack pointer of the funclet's caller, where the funclet frame will sit.
    pub caller_sp: StackFrame,
}

/// Address of the code `offset` bytes into `frame`'s method.
///
/// # Panics
///
/// Panics with a contract violation if the address does not fit a `usize`.
pub(crate) fn code_address(frame: &CrawlFrame, offset: u32) -> usize {
    let address = usize::try_from(offset)
        .ok()
        .and_then(|offset| frame.method_start.checked_add(offset));
    match address {
        Some(address) => address,
        None => contract_violation!(
            "code offset {:#x} overflows method at {:#x}",
            offset,
            frame.method_start
        ),
    }
}

impl FuncletCall {
    /// The filter funclet of a filter clause.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation if the funclet address overflows.
    #[must_use]
    pub fn filter(parent: &CrawlFrame, clause_index: usize, clause: &ExceptionClause) -> Self {
        let offset = clause.filter_offset().unwrap_or_else(|| clause.handler_offset());
        FuncletCall {
            kind: FuncletKind::Filter,
            clause_index,
            handler_pc: code_address(parent, offset),
            parent: *parent,
            caller_sp: StackFrame::NULL,
        }
    }

    /// The handler funclet of a clause.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation if the funclet address overflows.
    #[must_use]
    pub fn handler(parent: &CrawlFrame, clause_index: usize, clause: &ExceptionClause) -> Self {
        FuncletCall {
            kind: clause.handler_kind(),
            clause_index,
            handler_pc: code_address(parent, clause.handler_offset()),
            parent: *parent,
            caller_sp: StackFrame::NULL,
        }
    }

    /// Sets where the funclet frame's caller sits.
    #[must_use]
    pub fn with_caller_sp(mut self, caller_sp: StackFrame) -> Self {
        self.caller_sp = caller_sp;
        self
    }
}

/// Exception-dispatch state of one thread.
///
/// Only the owning thread uses its state. Trackers live in a
/// [`TrackerAllocator`] shared by all threads.
#[derive(Debug)]
pub struct ThreadExceptionState {
    allocator: Arc<TrackerAllocator>,
    thread: ThreadId,
    current: Option<TrackerId>,
}

impl ThreadExceptionState {
    /// Creates the state of a thread with no exception in flight.
    ///
    /// # Arguments
    ///
    /// * `allocator` - The shared tracker slab
    /// * `thread` - The owning thread
    #[must_use]
    pub fn new(allocator: Arc<TrackerAllocator>, thread: ThreadId) -> Self {
        ThreadExceptionState {
            allocator,
            thread,
            current: None,
        }
    }

    /// The owning thread.
    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// The newest tracker.
    #[must_use]
    pub fn current(&self) -> Option<TrackerId> {
        self.current
    }

    /// The tracker slab.
    #[must_use]
    pub fn allocator(&self) -> &Arc<TrackerAllocator> {
        &self.allocator
    }

    /// A copy of one tracker.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live or belongs
    /// to another thread.
    pub fn tracker(&self, id: TrackerId) -> Result<ExceptionTracker> {
        self.read(id, ExceptionTracker::clone)
    }

    /// Ids of the chain, newest first.
    #[must_use]
    pub fn trackers(&self) -> Vec<TrackerId> {
        self.walk(|chain| chain.map(|(id, _)| id).collect())
    }

    /// Whether `id` is in this thread's chain.
    #[must_use]
    pub fn contains(&self, id: TrackerId) -> bool {
        self.walk(|chain| chain.any(|(link, _)| link == id))
    }

    fn read<R>(&self, id: TrackerId, f: impl FnOnce(&ExceptionTracker) -> R) -> Result<R> {
        let thread = self.thread;
        self.allocator
            .with_tracker(id, |t| (t.owner == Some(thread)).then(|| f(t)))?
            .ok_or(Error::InvalidTracker(id))
    }

    fn update<R>(&self, id: TrackerId, f: impl FnOnce(&mut ExceptionTracker) -> R) -> Result<R> {
        let thread = self.thread;
        self.allocator
            .with_tracker_mut(id, |t| (t.owner == Some(thread)).then(|| f(t)))?
            .ok_or(Error::InvalidTracker(id))
    }

    fn member<R>(&self, id: TrackerId, f: impl FnOnce(&ExceptionTracker) -> R) -> R {
        match self.read(id, f) {
            Ok(result) => result,
            Err(e) => contract_violation!("tracker chain of {} is broken: {}", self.thread, e),
        }
    }

    fn walk<R>(&self, f: impl FnOnce(&mut TrackerChain<'_>) -> R) -> R {
        match self.allocator.with_chain(self.current, self.thread, f) {
            Ok(result) => result,
            Err(e) => contract_violation!("tracker chain of {} is broken: {}", self.thread, e),
        }
    }

    fn release(&self, id: TrackerId) {
        let result = self
            .update(id, |t| t.transition(TrackerState::Destroyed))
            .and_then(|()| self.allocator.free_tracker_memory(id, TrackerMemoryType::Both));
        if let Err(e) = result {
            contract_violation!("releasing tracker {} of {}: {}", id, self.thread, e);
        }
    }

    /// Creates the tracker for a newly raised exception.
    ///
    /// # Panics
    ///
    /// Does not return if tracker memory cannot be obtained: the failure is
    /// logged and the process aborts, since dispatch cannot continue without a
    /// tracker. Use [`try_raise`](Self::try_raise) to handle the failure.
    pub fn raise(&mut self, record: ExceptionRecord, context: usize, throwable: ObjectRef) -> TrackerId {
        match self.try_raise(record, context, throwable) {
            Ok(id) => id,
            Err(e) => {
                error!("{}: cannot track exception {:#x}: {}", self.thread, record.code, e);
                process::abort()
            }
        }
    }

    /// Creates the tracker for a newly raised exception.
    ///
    /// The tracker becomes the head of the chain. It is flagged as thrown by the
    /// runtime for managed exception codes and as rethrown if an older tracker is
    /// already unwinding the same object.
    ///
    /// # Arguments
    ///
    /// * `record` - The platform exception record
    /// * `context` - Address of the register context
    /// * `throwable` - The thrown object
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TrackerAllocationFailed`] if the slab is exhausted.
    pub fn try_raise(
        &mut self,
        record: ExceptionRecord,
        context: usize,
        throwable: ObjectRef,
    ) -> Result<TrackerId> {
        let rethrown = !throwable.is_null()
            && self.walk(|chain| {
                chain.any(|(_, t)| {
                    t.flags.contains(ExceptionFlags::UNWIND_HAS_STARTED) && t.throwable == throwable
                })
            });

        let id = self.allocator.get_tracker_memory(self.thread)?;
        let previous = self.current;
        self.update(id, |t| {
            t.previous = previous;
            t.throwable = throwable;
            t.pointers = ExceptionPointers { record, context };
            t.exception_code = record.code;
            t.flags.set(ExceptionFlags::WAS_THROWN_BY_US, record.is_clr());
            t.flags.set(ExceptionFlags::IS_RETHROWN, rethrown);
        })?;
        self.current = Some(id);

        debug!(
            "{}: exception {:#x} raised, tracker {} (previous {:?}, rethrown {})",
            self.thread, record.code, id, previous, rethrown
        );
        Ok(id)
    }

    /// Records that the first-chance notification was sent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live or belongs
    /// to another thread.
    pub fn mark_first_chance_delivered(&mut self, id: TrackerId) -> Result<()> {
        self.update(id, |t| t.delivered_first_chance = true)
    }

    /// Whether the first-chance notification was sent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live or belongs
    /// to another thread.
    pub fn delivered_first_chance(&self, id: TrackerId) -> Result<bool> {
        self.read(id, |t| t.delivered_first_chance)
    }

    /// Examines one frame during the first pass.
    ///
    /// Catching clauses whose try region covers the frame's offset are examined
    /// in order. A catch whose type `matches` accepts ends the pass; a filter
    /// must be run by the caller, who reports its verdict through
    /// [`filter_result`](Self::filter_result).
    ///
    /// # Arguments
    ///
    /// * `id` - The tracker searching
    /// * `frame` - The frame to examine
    /// * `clauses` - The frame's clauses, innermost first
    /// * `matches` - Decides whether the exception is of a catch clause's type
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation if the tracker already finished its
    /// first pass.
    pub fn first_pass_frame(
        &mut self,
        id: TrackerId,
        frame: &CrawlFrame,
        clauses: &[ExceptionClause],
        matches: &mut dyn FnMut(TypeToken) -> bool,
    ) -> Result<FirstPassOutcome> {
        self.update(id, |t| {
            match t.state {
                TrackerState::Created => {
                    t.transition(TrackerState::FirstPassScanning);
                    t.first_pass_topmost_frame = frame.sp;
                }
                TrackerState::FirstPassScanning => {}
                state => contract_violation!("tracker {} scanning {} in state {}", id, frame.sp, state),
            }
            t.scanned_range.include(frame.sp);
        })?;
        self.search_clauses(id, frame, clauses, 0, matches)
    }

    /// Reports the verdict of a filter funclet and continues the search.
    ///
    /// An accepting filter makes its clause the handler. A rejecting filter
    /// resumes the search with the next clause of the same frame.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation if `clause_index` is not a filter clause.
    pub fn filter_result(
        &mut self,
        id: TrackerId,
        frame: &CrawlFrame,
        clauses: &[ExceptionClause],
        clause_index: usize,
        accepted: bool,
        matches: &mut dyn FnMut(TypeToken) -> bool,
    ) -> Result<FirstPassOutcome> {
        let Some(clause) = clauses.get(clause_index).filter(|c| c.filter_offset().is_some()) else {
            contract_violation!("clause {} of {} is not a filter", clause_index, frame.sp);
        };

        trace!(
            "{}: filter {} in {} {}",
            self.thread,
            clause_index,
            frame.sp,
            if accepted { "accepted" } else { "rejected" }
        );
        if accepted {
            self.record_handler(id, frame, clause_index, clause)?;
            return Ok(FirstPassOutcome::HandlerFound { clause_index });
        }
        self.search_clauses(id, frame, clauses, clause_index + 1, matches)
    }

    fn search_clauses(
        &self,
        id: TrackerId,
        frame: &CrawlFrame,
        clauses: &[ExceptionClause],
        from: usize,
        matches: &mut dyn FnMut(TypeToken) -> bool,
    ) -> Result<FirstPassOutcome> {
        for (clause_index, clause) in clauses.iter().enumerate().skip(from) {
            if !clause.is_catching() || !clause.is_in_try(frame.offset) {
                continue;
            }
            match clause {
                ExceptionClause::Filter { .. } => {
                    return Ok(FirstPassOutcome::InvokeFilter { clause_index });
                }
                ExceptionClause::Catch { catch_type, .. } if matches(*catch_type) => {
                    self.record_handler(id, frame, clause_index, clause)?;
                    return Ok(FirstPassOutcome::HandlerFound { clause_index });
                }
                _ => {}
            }
        }

        trace!("{}: tracker {} found no handler in {}", self.thread, id, frame.sp);
        Ok(FirstPassOutcome::ContinueSearch)
    }

    fn record_handler(
        &self,
        id: TrackerId,
        frame: &CrawlFrame,
        clause_index: usize,
        clause: &ExceptionClause,
    ) -> Result<()> {
        let catch_to_call_pc = code_address(frame, clause.handler_offset());
        self.update(id, |t| {
            t.transition(TrackerState::FirstPassComplete);
            t.unwind_status = UnwindStatus::FirstPassComplete;
            t.catch_clause_index = Some(clause_index);
            t.clause_for_catch = Some(clause.clone());
            t.establisher_of_handler_frame = frame.sp;
            t.caller_of_handler_frame = frame.caller_sp;
            t.catch_to_call_pc = catch_to_call_pc;
        })?;

        debug!(
            "{}: tracker {} found handler {} in {}",
            self.thread, id, clause_index, frame.sp
        );
        Ok(())
    }

    /// Ends a first pass that found no handler and removes the tracker.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation if `id` is not the newest tracker.
    pub fn first_pass_unhandled(&mut self, id: TrackerId) -> Result<()> {
        let previous = self.read(id, |t| t.previous)?;
        if self.current != Some(id) {
            contract_violation!("unhandled tracker {} is not the newest of {}", id, self.thread);
        }

        self.current = previous;
        self.release(id);
        debug!("{}: tracker {} unhandled", self.thread, id);
        Ok(())
    }

    /// Starts the second pass.
    ///
    /// The scanned range is emptied and rebuilt from the frames the second pass
    /// unwinds.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live.
    pub fn begin_second_pass(&mut self, id: TrackerId) -> Result<()> {
        self.update(id, |t| {
            t.transition(TrackerState::SecondPassUnwinding);
            t.flags.insert(ExceptionFlags::UNWIND_HAS_STARTED);
            t.scanned_range.reset();
        })
    }

    /// Unwinds one frame during the second pass.
    ///
    /// Extends the tracker's range to the frame, collapses the previous tracker
    /// if the frame reaches its range, and returns the funclets to run in this
    /// frame: covering finally and fault clauses innermost first, then the
    /// catch if this is the handler frame.
    ///
    /// Finally and fault clauses are not returned for frames a collapsed
    /// tracker already unwound. In the frame whose funclet a collapsed tracker
    /// was running, clauses up to and including that funclet's are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation outside the second pass.
    pub fn second_pass_frame(
        &mut self,
        id: TrackerId,
        frame: &CrawlFrame,
        clauses: &[ExceptionClause],
    ) -> Result<Vec<FuncletCall>> {
        let (previous, is_handler_frame, catch_index) = self.update(id, |t| {
            if !t.is_in_second_pass() {
                contract_violation!("tracker {} unwinding {} in state {}", id, frame.sp, t.state);
            }
            if t.scanned_range.is_empty() {
                t.scanned_range.init(frame.sp);
            } else if frame.sp > t.scanned_range.upper_bound() {
                t.scanned_range.extend_upper_bound(frame.sp);
            }
            t.current_establisher = frame.sp;
            (
                t.previous,
                t.establisher_of_handler_frame == frame.sp,
                t.catch_clause_index,
            )
        })?;

        if let Some(previous) = previous {
            self.collapse_if_superseded(id, previous, frame.sp)?;
        }
        let (already_run, fully_unwound) = self.read(id, |t| {
            let already_run = t
                .collapsed_funclets
                .iter()
                .filter(|(establisher, _)| *establisher == frame.sp)
                .map(|&(_, clause_index)| clause_index)
                .max();
            let fully_unwound = already_run.is_none()
                && !t.collapsed_range.is_empty()
                && t.collapsed_range.contains(frame.sp);
            (already_run, fully_unwound)
        })?;

        let mut calls = Vec::new();
        for (clause_index, clause) in clauses.iter().enumerate() {
            if already_run.is_some_and(|last| clause_index <= last) {
                continue;
            }
            if is_handler_frame && catch_index == Some(clause_index) {
                calls.push(FuncletCall::handler(frame, clause_index, clause));
                break;
            }
            if !fully_unwound && clause.is_termination_handler() && clause.is_in_try(frame.offset) {
                calls.push(FuncletCall::handler(frame, clause_index, clause));
            }
        }

        self.update(id, |t| t.last_unwound_establisher = frame.sp)?;
        trace!(
            "{}: tracker {} unwinding {} runs {} funclets",
            self.thread,
            id,
            frame.sp,
            calls.len()
        );
        Ok(calls)
    }

    fn collapse_if_superseded(&mut self, id: TrackerId, previous_id: TrackerId, sf: StackFrame) -> Result<()> {
        let previous = self.member(previous_id, |t| {
            (t.is_in_second_pass() && t.scanned_range.is_superseded_by(sf)).then(|| t.clone())
        });
        let Some(previous) = previous else {
            return Ok(());
        };

        let interrupted = Self::interrupted_funclet(&previous.clause_info);
        self.update(id, |t| {
            t.scanned_range.combine_with(sf, &previous.scanned_range);
            t.collapsed_range
                .combine_with(previous.scanned_range.lower_bound(), &previous.scanned_range);
            t.collapsed_funclets
                .extend(previous.collapsed_funclets.iter().copied().chain(interrupted));
            t.collapsed_clause_caller = previous.clause_info.caller_sp;
            t.enclosing_clause_of_collapsed = previous.enclosing_clause_for_gc;
            t.previous = previous.previous;
        })?;
        self.release(previous_id);

        debug!(
            "{}: tracker {} collapsed superseded tracker {} at {}",
            self.thread, id, previous_id, sf
        );
        if cfg!(debug_assertions) {
            self.assert_chain_ordered();
        }
        Ok(())
    }

    fn interrupted_funclet(info: &EhClauseInfo) -> Option<(StackFrame, usize)> {
        if info.establisher.is_null() {
            return None;
        }
        info.clause_index.map(|clause_index| (info.establisher, clause_index))
    }

    /// Records that a funclet is about to run for tracker `id`.
    ///
    /// The enclosing frame for GC reporting is the parent frame's caller, unless
    /// the parent is itself a funclet; then it is that funclet's own parent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live.
    pub fn begin_funclet(&mut self, id: TrackerId, call: &FuncletCall) -> Result<()> {
        let parent = &call.parent;
        let (gc_caller, fixup) = if parent.is_funclet() {
            match self.find_parent_stack_frame_for_stack_walk(parent, true) {
                ParentFrame::SkipTo(target) => (target, true),
                _ => (parent.caller_sp, false),
            }
        } else {
            (parent.caller_sp, false)
        };

        self.update(id, |t| {
            t.clause_info = EhClauseInfo {
                kind: Some(call.kind),
                handler_pc: call.handler_pc,
                establisher: parent.sp,
                caller_sp: call.caller_sp,
                clause_index: Some(call.clause_index),
            };
            t.enclosing_clause = EnclosingClauseInfo::new(parent.is_funclet(), parent.offset, parent.caller_sp);
            t.enclosing_clause_for_gc =
                EnclosingClauseInfo::new(parent.is_funclet() && !fixup, parent.offset, gc_caller);
            t.fixup_caller_sp_for_gc = fixup;
        })?;

        trace!(
            "{}: tracker {} enters {} funclet {:#x} for {}",
            self.thread,
            id,
            call.kind,
            call.handler_pc,
            parent.sp
        );
        Ok(())
    }

    /// Records that the running funclet returned.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live.
    pub fn end_funclet(&mut self, id: TrackerId) -> Result<()> {
        self.update(id, |t| {
            t.clause_info.reset();
            t.enclosing_clause = EnclosingClauseInfo::default();
            t.enclosing_clause_for_gc = EnclosingClauseInfo::default();
            t.fixup_caller_sp_for_gc = false;
        })
    }

    /// Finishes dispatch after the catch funclet returned.
    ///
    /// Records the resume frame and pops every tracker whose range ends below
    /// it, the catching tracker included.
    ///
    /// # Arguments
    ///
    /// * `id` - The catching tracker
    /// * `resume_frame` - Caller SP of the frame execution resumes in
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation if the tracker has no catch clause or
    /// survives the pop.
    pub fn complete_catch(&mut self, id: TrackerId, resume_frame: StackFrame) -> Result<UnwindStatus> {
        self.update(id, |t| {
            if t.catch_clause_index.is_none() {
                contract_violation!("tracker {} completed a catch it never found", id);
            }
            t.resume_frame = resume_frame;
            t.unwind_status = UnwindStatus::SecondPassComplete;
        })?;

        self.pop_trackers(resume_frame, false);
        if self.contains(id) {
            contract_violation!("catching tracker {} survived the pop to {}", id, resume_frame);
        }
        Ok(UnwindStatus::SecondPassComplete)
    }

    /// Pops trackers whose ranges end below `resume_frame`.
    ///
    /// Starting from the newest, a tracker is popped if its upper bound is
    /// below `resume_frame`, or equal to it when `pop_when_equal` is set. The
    /// first tracker that does not qualify ends the walk, and so does a tracker
    /// still in its first pass with nothing scanned. A tracker popped before
    /// its second pass started has its dispatch abandoned.
    ///
    /// # Returns
    ///
    /// The number of trackers popped.
    pub fn pop_trackers(&mut self, resume_frame: StackFrame, pop_when_equal: bool) -> usize {
        let mut popped = 0;
        while let Some(id) = self.current {
            let (pending, high, previous) = self.member(id, |t| {
                (
                    t.is_in_first_pass() && t.scanned_range.is_empty(),
                    t.scanned_range.upper_bound(),
                    t.previous,
                )
            });
            if pending {
                break;
            }

            if high < resume_frame || (pop_when_equal && high == resume_frame) {
                self.current = previous;
                self.release(id);
                popped += 1;
            } else {
                break;
            }
        }

        if popped > 0 {
            debug!(
                "{}: popped {} trackers below {}",
                self.thread, popped, resume_frame
            );
        }
        popped
    }

    /// Pops trackers whose ranges end below the stack pointer `sp`.
    pub fn pop_trackers_below_sp(&mut self, sp: usize) -> usize {
        self.pop_trackers(StackFrame::new(sp), false)
    }

    /// Whether tracker `id` has unwound the region holding `frame`'s caller.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTracker`] if `id` is not live or belongs
    /// to another thread.
    pub fn is_in_stack_region_unwound_by(&self, frame: &CrawlFrame, id: TrackerId) -> Result<bool> {
        self.read(id, |t| {
            !t.scanned_range.is_empty() && t.scanned_range.contains(frame.caller_sp)
        })
    }

    /// [`is_in_stack_region_unwound_by`](Self::is_in_stack_region_unwound_by)
    /// for the newest tracker.
    #[must_use]
    pub fn is_in_stack_region_unwound_by_current_exception(&self, frame: &CrawlFrame) -> bool {
        self.current.is_some_and(|id| {
            self.member(id, |t| {
                !t.scanned_range.is_empty() && t.scanned_range.contains(frame.caller_sp)
            })
        })
    }

    /// Whether any tracker in its second pass has unwound `frame`.
    ///
    /// A funclet that a tracker is currently running is not unwound by that
    /// tracker, even though its frame lies inside the tracker's range.
    #[must_use]
    pub fn has_frame_been_unwound_by_any_active_exception(&self, frame: &CrawlFrame) -> bool {
        self.walk(|chain| {
            chain.any(|(_, t)| {
                if !t.is_in_second_pass() || t.scanned_range.is_empty() {
                    return false;
                }
                if frame.is_funclet() && frame.caller_sp == t.clause_info.caller_sp {
                    return false;
                }
                t.scanned_range.contains(frame.sp)
            })
        })
    }

    /// Decides how a stack walk continues after reporting `frame`.
    ///
    /// A funclet is reported in place of its parent frame, so the walk must
    /// skip to the parent. Trackers are searched newest first for the one that
    /// invoked the funclet, either directly or through a tracker it collapsed.
    ///
    /// # Arguments
    ///
    /// * `frame` - The frame just reported
    /// * `for_gc` - Whether the walk reports GC roots; filters are only
    ///   skipped for GC walks
    #[must_use]
    pub fn find_parent_stack_frame_for_stack_walk(&self, frame: &CrawlFrame, for_gc: bool) -> ParentFrame {
        if !frame.is_funclet() || (frame.is_filter_funclet() && !for_gc) {
            return ParentFrame::NoSkip;
        }

        let target = frame.frame_for_parent_check();
        let found = self.walk(|chain| {
            chain.find_map(|(_, tracker)| {
                let running_filter = tracker.clause_info.kind == Some(FuncletKind::Filter);
                if tracker.scanned_range.is_empty() && !running_filter {
                    return None;
                }

                if !tracker.clause_info.caller_sp.is_null() && target == tracker.clause_info.caller_sp {
                    let enclosing = if for_gc {
                        tracker.enclosing_clause_for_gc
                    } else {
                        tracker.enclosing_clause
                    };
                    return Some(Self::skip_to(enclosing.caller_sp));
                }
                if !tracker.collapsed_clause_caller.is_null() && target == tracker.collapsed_clause_caller {
                    return Some(Self::skip_to(tracker.enclosing_clause_of_collapsed.caller_sp));
                }
                None
            })
        });
        found.unwrap_or(ParentFrame::NoSkip)
    }

    fn skip_to(caller_sp: StackFrame) -> ParentFrame {
        if caller_sp.is_null() {
            ParentFrame::SkipOne
        } else {
            ParentFrame::SkipTo(caller_sp)
        }
    }

    /// The parent frame and the parent's code offset of a running funclet.
    ///
    /// Unlike [`find_parent_stack_frame_for_stack_walk`](Self::find_parent_stack_frame_for_stack_walk)
    /// this answers for filters regardless of the walk kind.
    #[must_use]
    pub fn find_parent_stack_frame_ex(&self, frame: &CrawlFrame) -> Option<(StackFrame, u32)> {
        if !frame.is_funclet() {
            return None;
        }
        let enclosing = self.walk(|chain| {
            chain
                .find(|(_, t)| t.clause_info.is_in_funclet() && frame.caller_sp == t.clause_info.caller_sp)
                .map(|(_, t)| t.enclosing_clause)
        })?;
        (!enclosing.caller_sp.is_null()).then_some((enclosing.caller_sp, enclosing.offset))
    }

    /// Checks that the ranges of second-pass trackers are consistent, disjoint
    /// and ordered newest (lowest) first.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation if they are not.
    pub fn assert_chain_ordered(&self) {
        let ranges: Vec<_> = self.walk(|chain| {
            chain
                .filter(|(_, t)| t.is_in_second_pass() && !t.scanned_range.is_empty())
                .map(|(id, t)| (id, t.scanned_range))
                .collect()
        });

        for (id, range) in &ranges {
            if !range.is_consistent() {
                contract_violation!("tracker {} has inconsistent range {}", id, range);
            }
        }
        for pair in ranges.windows(2) {
            let ((newer, newer_range), (older, older_range)) = (&pair[0], &pair[1]);
            if !newer_range.is_disjoint_with_and_lower_than(older_range) {
                contract_violation!(
                    "tracker {} range {} overlaps older tracker {} range {}",
                    newer,
                    newer_range,
                    older,
                    older_range
                );
            }
        }
    }
}

impl Drop for ThreadExceptionState {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let mut next = self.current.take();
        while let Some(id) = next {
            next = self.allocator.with_tracker(id, |t| t.previous).ok().flatten();
            if self
                .allocator
                .free_tracker_memory(id, TrackerMemoryType::Both)
                .is_ok()
            {
                debug!("{}: released tracker {} at thread exit", self.thread, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::TrackerAllocatorConfig, eh::frame::MethodId};

    const M: MethodId = MethodId(1);
    const G: MethodId = MethodId(2);

    fn state() -> ThreadExceptionState {
        let allocator = Arc::new(TrackerAllocator::new(TrackerAllocatorConfig::testing()));
        ThreadExceptionState::new(allocator, ThreadId::new(1))
    }

    fn finally(try_offset: u32, try_length: u32, handler_offset: u32) -> ExceptionClause {
        ExceptionClause::Finally {
            try_offset,
            try_length,
            handler_offset,
            handler_length: 0x10,
        }
    }

    fn catch(try_offset: u32, try_length: u32, handler_offset: u32, token: u32) -> ExceptionClause {
        ExceptionClause::Catch {
            try_offset,
            try_length,
            handler_offset,
            handler_length: 0x10,
            catch_type: TypeToken(token),
        }
    }

    fn catch_all(_: TypeToken) -> bool {
        true
    }

    fn raise(state: &mut ThreadExceptionState, throwable: usize) -> TrackerId {
        state.raise(ExceptionRecord::clr(0x4000), 0, ObjectRef::new(throwable))
    }

    /// Drives `id` to its second pass with the handler in `frame`.
    fn enter_second_pass(state: &mut ThreadExceptionState, id: TrackerId, frame: &CrawlFrame) {
        let clauses = [catch(0, 0x100, 0x100, 1)];
        let outcome = state
            .first_pass_frame(id, frame, &clauses, &mut catch_all)
            .unwrap();
        assert_eq!(outcome, FirstPassOutcome::HandlerFound { clause_index: 0 });
        state.begin_second_pass(id).unwrap();
    }

    #[test]
    fn test_raise_links_chain() -> Result<()> {
        let mut state = state();
        let first = raise(&mut state, 0x5000);
        let second = raise(&mut state, 0x6000);

        assert_eq!(state.current(), Some(second));
        assert_eq!(state.trackers(), vec![second, first]);
        let tracker = state.tracker(second)?;
        assert_eq!(tracker.previous(), Some(first));
        assert!(tracker.flags().contains(ExceptionFlags::WAS_THROWN_BY_US));
        assert!(!tracker.flags().contains(ExceptionFlags::IS_RETHROWN));

        state.mark_first_chance_delivered(second)?;
        assert!(state.delivered_first_chance(second)?);
        assert!(!state.delivered_first_chance(first)?);
        Ok(())
    }

    #[test]
    fn test_rethrow_is_flagged() -> Result<()> {
        let mut state = state();
        let frame = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let first = raise(&mut state, 0x5000);
        enter_second_pass(&mut state, first, &frame);

        let platform = ExceptionRecord {
            code: 0xC000_0005,
            ..ExceptionRecord::default()
        };
        let second = state.raise(platform, 0, ObjectRef::new(0x5000));
        let flags = state.tracker(second)?.flags();
        assert!(flags.contains(ExceptionFlags::IS_RETHROWN));
        assert!(!flags.contains(ExceptionFlags::WAS_THROWN_BY_US));
        Ok(())
    }

    #[test]
    fn test_first_pass_finds_typed_catch() -> Result<()> {
        let mut state = state();
        let id = raise(&mut state, 0x5000);
        let leaf = CrawlFrame::method(0x800, 0x900, G, 0x2000, 0x08);
        let handler = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let clauses = [
            finally(0, 0x20, 0x40),
            catch(0, 0x20, 0x60, 7),
            catch(0, 0x20, 0x80, 9),
        ];

        let outcome = state.first_pass_frame(id, &leaf, &[], &mut catch_all)?;
        assert_eq!(outcome, FirstPassOutcome::ContinueSearch);
        let outcome = state.first_pass_frame(id, &handler, &clauses, &mut |t| t == TypeToken(9))?;
        assert_eq!(outcome, FirstPassOutcome::HandlerFound { clause_index: 2 });

        let tracker = state.tracker(id)?;
        assert_eq!(tracker.state(), TrackerState::FirstPassComplete);
        assert_eq!(tracker.unwind_status(), UnwindStatus::FirstPassComplete);
        assert_eq!(tracker.first_pass_topmost_frame(), StackFrame::new(0x800));
        assert_eq!(tracker.catch_to_call_pc(), 0x4080);
        assert_eq!(tracker.establisher_of_handler_frame(), StackFrame::new(0x1000));
        assert_eq!(tracker.caller_of_handler_frame(), StackFrame::new(0x1100));
        assert_eq!(tracker.clause_for_catch(), Some(&clauses[2]));
        Ok(())
    }

    #[test]
    fn test_rejected_filter_continues_with_next_clause() -> Result<()> {
        let mut state = state();
        let id = raise(&mut state, 0x5000);
        let frame = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let clauses = [
            ExceptionClause::Filter {
                try_offset: 0,
                try_length: 0x20,
                handler_offset: 0x40,
                handler_length: 0x10,
                filter_offset: 0x30,
            },
            catch(0, 0x20, 0x60, 1),
        ];

        let outcome = state.first_pass_frame(id, &frame, &clauses, &mut catch_all)?;
        assert_eq!(outcome, FirstPassOutcome::InvokeFilter { clause_index: 0 });

        let call = FuncletCall::filter(&frame, 0, &clauses[0]).with_caller_sp(StackFrame::new(0x700));
        assert_eq!(call.handler_pc, 0x4030);
        state.begin_funclet(id, &call)?;
        let filter_frame = CrawlFrame::funclet(0x680, 0x700, M, FuncletKind::Filter);
        assert_eq!(
            state.find_parent_stack_frame_for_stack_walk(&filter_frame, false),
            ParentFrame::NoSkip
        );
        assert_eq!(
            state.find_parent_stack_frame_for_stack_walk(&filter_frame, true),
            ParentFrame::SkipTo(StackFrame::new(0x1100))
        );
        assert_eq!(
            state.find_parent_stack_frame_ex(&filter_frame),
            Some((StackFrame::new(0x1100), 0x10))
        );
        state.end_funclet(id)?;

        let outcome = state.filter_result(id, &frame, &clauses, 0, false, &mut catch_all)?;
        assert_eq!(outcome, FirstPassOutcome::HandlerFound { clause_index: 1 });
        Ok(())
    }

    #[test]
    fn test_accepted_filter_becomes_handler() -> Result<()> {
        let mut state = state();
        let id = raise(&mut state, 0x5000);
        let frame = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let clauses = [ExceptionClause::Filter {
            try_offset: 0,
            try_length: 0x20,
            handler_offset: 0x40,
            handler_length: 0x10,
            filter_offset: 0x30,
        }];

        state.first_pass_frame(id, &frame, &clauses, &mut catch_all)?;
        let outcome = state.filter_result(id, &frame, &clauses, 0, true, &mut catch_all)?;
        assert_eq!(outcome, FirstPassOutcome::HandlerFound { clause_index: 0 });
        assert_eq!(state.tracker(id)?.catch_to_call_pc(), 0x4040);
        Ok(())
    }

    #[test]
    fn test_unhandled_removes_tracker() -> Result<()> {
        let mut state = state();
        let outer = raise(&mut state, 0x5000);
        let id = raise(&mut state, 0x6000);
        let frame = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);

        state.first_pass_frame(id, &frame, &[], &mut catch_all)?;
        state.first_pass_unhandled(id)?;
        assert_eq!(state.current(), Some(outer));
        assert!(matches!(state.tracker(id), Err(Error::InvalidTracker(_))));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "Invalid tracker transition from Created to SecondPassUnwinding")]
    fn test_second_pass_requires_handler() {
        let mut state = state();
        let id = raise(&mut state, 0x5000);
        state.begin_second_pass(id).unwrap();
    }

    #[test]
    fn test_second_pass_orders_funclets() -> Result<()> {
        let mut state = state();
        let id = raise(&mut state, 0x5000);
        let leaf = CrawlFrame::method(0x800, 0x900, G, 0x2000, 0x08);
        let handler = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let leaf_clauses = [finally(0, 0x10, 0x40), finally(0x20, 0x10, 0x50)];
        let handler_clauses = [
            finally(0, 0x20, 0x40),
            ExceptionClause::Fault {
                try_offset: 0,
                try_length: 0x20,
                handler_offset: 0x50,
                handler_length: 0x10,
            },
            catch(0, 0x30, 0x60, 1),
            finally(0, 0x40, 0x80),
        ];

        state.first_pass_frame(id, &leaf, &leaf_clauses, &mut catch_all)?;
        state.first_pass_frame(id, &handler, &handler_clauses, &mut catch_all)?;
        state.begin_second_pass(id)?;
        assert!(state.tracker(id)?.scanned_range().is_empty());

        let calls = state.second_pass_frame(id, &leaf, &leaf_clauses)?;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].handler_pc, 0x2040);

        let calls = state.second_pass_frame(id, &handler, &handler_clauses)?;
        let kinds: Vec<_> = calls.iter().map(|c| (c.kind, c.clause_index)).collect();
        assert_eq!(
            kinds,
            vec![
                (FuncletKind::FaultFinally, 0),
                (FuncletKind::FaultFinally, 1),
                (FuncletKind::Catch, 2)
            ]
        );

        let tracker = state.tracker(id)?;
        assert_eq!(tracker.scanned_range().lower_bound(), StackFrame::new(0x800));
        assert_eq!(tracker.scanned_range().upper_bound(), StackFrame::new(0x1000));
        assert_eq!(tracker.last_unwound_establisher(), StackFrame::new(0x1000));
        assert!(tracker.flags().contains(ExceptionFlags::UNWIND_HAS_STARTED));

        let status = state.complete_catch(id, handler.caller_sp)?;
        assert_eq!(status, UnwindStatus::SecondPassComplete);
        assert_eq!(state.current(), None);
        assert_eq!(state.allocator().live_trackers(), 0);
        Ok(())
    }

    #[test]
    fn test_nested_collapse_reports_collapsed_funclet_parent() -> Result<()> {
        let mut state = state();

        // A is thrown in M and runs M's finally F1 during its second pass.
        let m = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let m_clauses = [finally(0, 0x20, 0x40)];
        let c = CrawlFrame::method(0x1100, 0x1200, MethodId(3), 0x6000, 0x10);
        let c_clauses = [catch(0, 0x20, 0x40, 1)];
        let a = raise(&mut state, 0x5000);
        state.first_pass_frame(a, &m, &m_clauses, &mut catch_all)?;
        state.first_pass_frame(a, &c, &c_clauses, &mut catch_all)?;
        state.begin_second_pass(a)?;
        let calls = state.second_pass_frame(a, &m, &m_clauses)?;
        assert_eq!(calls.len(), 1);
        state.begin_funclet(a, &calls[0].with_caller_sp(StackFrame::new(0x900)))?;

        // B is thrown in G, called from F1, and unwinds G, F1, then M.
        let g = CrawlFrame::method(0x700, 0x800, G, 0x2000, 0x08);
        let f1 = CrawlFrame::funclet(0x800, 0x900, M, FuncletKind::FaultFinally).at(0x40);
        let b = raise(&mut state, 0x6000);
        state.first_pass_frame(b, &g, &[], &mut catch_all)?;
        state.first_pass_frame(b, &f1, &[], &mut catch_all)?;
        state.first_pass_frame(b, &m, &m_clauses, &mut catch_all)?;
        state.first_pass_frame(b, &c, &c_clauses, &mut catch_all)?;
        state.begin_second_pass(b)?;

        state.second_pass_frame(b, &g, &[])?;
        state.second_pass_frame(b, &f1, &[])?;
        assert_eq!(state.trackers(), vec![b, a]);
        assert_eq!(
            state.find_parent_stack_frame_for_stack_walk(&f1, true),
            ParentFrame::SkipTo(StackFrame::new(0x1100))
        );

        // M's finally is already running as F1 and is not invoked again.
        let calls = state.second_pass_frame(b, &m, &m_clauses)?;
        assert!(calls.is_empty());
        assert_eq!(state.trackers(), vec![b]);
        assert!(matches!(state.tracker(a), Err(Error::InvalidTracker(_))));

        let tracker = state.tracker(b)?;
        assert_eq!(tracker.collapsed_clause_caller(), StackFrame::new(0x900));
        assert_eq!(
            tracker.enclosing_clause_of_collapsed().caller_sp,
            StackFrame::new(0x1100)
        );
        assert!(tracker.scanned_range().contains(StackFrame::new(0x700)));
        assert!(tracker.scanned_range().contains(StackFrame::new(0x1000)));

        // A GC walk still meets F1 and must report M as its parent.
        assert_eq!(
            state.find_parent_stack_frame_for_stack_walk(&f1, true),
            ParentFrame::SkipTo(StackFrame::new(0x1100))
        );
        assert!(state.has_frame_been_unwound_by_any_active_exception(&f1));
        state.assert_chain_ordered();
        Ok(())
    }

    #[test]
    fn test_collapse_skips_frames_already_unwound() -> Result<()> {
        let mut state = state();
        let l = CrawlFrame::method(0x900, 0x1000, G, 0x2000, 0x10);
        let l_clauses = [finally(0, 0x20, 0x40)];
        let m = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let m_clauses = [finally(0, 0x20, 0x40), finally(0, 0x30, 0x60)];
        let h = CrawlFrame::method(0x1100, 0x1200, MethodId(3), 0x6000, 0x10);
        let h_clauses = [catch(0, 0x20, 0x80, 1)];

        // A is thrown in L, runs L's finally, then enters M's first finally.
        let a = raise(&mut state, 0x5000);
        for (frame, clauses) in [(&l, &l_clauses[..]), (&m, &m_clauses[..]), (&h, &h_clauses[..])] {
            state.first_pass_frame(a, frame, clauses, &mut catch_all)?;
        }
        state.begin_second_pass(a)?;
        let calls = state.second_pass_frame(a, &l, &l_clauses)?;
        assert_eq!(calls.len(), 1);
        state.begin_funclet(a, &calls[0].with_caller_sp(StackFrame::new(0x800)))?;
        state.end_funclet(a)?;
        let calls = state.second_pass_frame(a, &m, &m_clauses)?;
        assert_eq!(calls.len(), 2);
        state.begin_funclet(a, &calls[0].with_caller_sp(StackFrame::new(0x800)))?;

        // B is thrown by that finally and walks L and M again on its way to H.
        let f = CrawlFrame::funclet(0x700, 0x800, M, FuncletKind::FaultFinally).at(0x40);
        let b = raise(&mut state, 0x6000);
        for (frame, clauses) in [(&f, &[][..]), (&l, &l_clauses[..]), (&m, &m_clauses[..]), (&h, &h_clauses[..])] {
            state.first_pass_frame(b, frame, clauses, &mut catch_all)?;
        }
        state.begin_second_pass(b)?;
        assert!(state.second_pass_frame(b, &f, &[])?.is_empty());

        assert!(state.second_pass_frame(b, &l, &l_clauses)?.is_empty());
        assert_eq!(state.trackers(), vec![b]);
        let tracker = state.tracker(b)?;
        assert_eq!(tracker.collapsed_range().lower_bound(), StackFrame::new(0x900));
        assert_eq!(tracker.collapsed_range().upper_bound(), StackFrame::new(0x1000));
        assert_eq!(tracker.collapsed_funclets(), &[(StackFrame::new(0x1000), 0)]);

        // Only the finally A had not reached yet runs in M.
        let calls = state.second_pass_frame(b, &m, &m_clauses)?;
        let runs: Vec<_> = calls.iter().map(|c| (c.kind, c.clause_index, c.handler_pc)).collect();
        assert_eq!(runs, vec![(FuncletKind::FaultFinally, 1, 0x4060)]);

        let calls = state.second_pass_frame(b, &h, &h_clauses)?;
        let runs: Vec<_> = calls.iter().map(|c| (c.kind, c.handler_pc)).collect();
        assert_eq!(runs, vec![(FuncletKind::Catch, 0x6080)]);

        state.complete_catch(b, h.caller_sp)?;
        assert_eq!(state.allocator().live_trackers(), 0);
        Ok(())
    }

    #[test]
    fn test_pop_abandons_tracker_before_second_pass() -> Result<()> {
        let mut state = state();
        let frame = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let id = raise(&mut state, 0x5000);
        state.first_pass_frame(id, &frame, &[catch(0, 0x20, 0x40, 1)], &mut catch_all)?;
        assert_eq!(state.tracker(id)?.state(), TrackerState::FirstPassComplete);

        assert_eq!(state.pop_trackers(StackFrame::new(0x2000), false), 1);
        assert_eq!(state.current(), None);
        assert_eq!(state.allocator().live_trackers(), 0);
        Ok(())
    }

    #[test]
    fn test_tracker_of_another_thread_is_rejected() -> Result<()> {
        let allocator = Arc::new(TrackerAllocator::new(TrackerAllocatorConfig::testing()));
        let mut mine = ThreadExceptionState::new(Arc::clone(&allocator), ThreadId::new(1));
        let mut theirs = ThreadExceptionState::new(Arc::clone(&allocator), ThreadId::new(2));
        let id = raise(&mut theirs, 0x5000);

        assert!(matches!(
            mine.mark_first_chance_delivered(id),
            Err(Error::InvalidTracker(rejected)) if rejected == id
        ));
        assert!(matches!(mine.tracker(id), Err(Error::InvalidTracker(_))));
        assert!(!mine.contains(id));
        assert!(!theirs.delivered_first_chance(id)?);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "overflows method")]
    fn test_funclet_address_overflow_panics() {
        let frame = CrawlFrame::method(0x1000, 0x1100, M, usize::MAX - 0x10, 0x10);
        let _ = FuncletCall::handler(&frame, 0, &finally(0, 0x20, 0x40));
    }

    #[test]
    fn test_parent_resolution_outcomes() -> Result<()> {
        let mut state = state();
        let method = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let orphan = CrawlFrame::funclet(0x500, 0x600, M, FuncletKind::FaultFinally);
        assert_eq!(
            state.find_parent_stack_frame_for_stack_walk(&method, true),
            ParentFrame::NoSkip
        );
        assert_eq!(
            state.find_parent_stack_frame_for_stack_walk(&orphan, true),
            ParentFrame::NoSkip
        );

        let id = raise(&mut state, 0x5000);
        enter_second_pass(&mut state, id, &method);
        state.second_pass_frame(id, &method, &[])?;

        let clause = finally(0, 0x20, 0x40);
        let funclet = CrawlFrame::funclet(0x800, 0x900, M, FuncletKind::FaultFinally);

        // The parent's caller is not known yet.
        let unknown_parent = CrawlFrame::method(0x1000, 0, M, 0x4000, 0x10);
        let call = FuncletCall::handler(&unknown_parent, 0, &clause).with_caller_sp(StackFrame::new(0x900));
        state.begin_funclet(id, &call)?;
        assert_eq!(
            state.find_parent_stack_frame_for_stack_walk(&funclet, false),
            ParentFrame::SkipOne
        );
        state.end_funclet(id)?;

        let call = FuncletCall::handler(&method, 0, &clause).with_caller_sp(StackFrame::new(0x900));
        state.begin_funclet(id, &call)?;
        assert_eq!(
            state.find_parent_stack_frame_for_stack_walk(&funclet, false),
            ParentFrame::SkipTo(StackFrame::new(0x1100))
        );
        assert_eq!(
            state.find_parent_stack_frame_for_stack_walk(&orphan, false),
            ParentFrame::NoSkip
        );
        Ok(())
    }

    #[test]
    fn test_pop_trackers_boundaries() -> Result<()> {
        let mut state = state();
        let upper = CrawlFrame::method(0x2000, 0x2100, M, 0x4000, 0x10);
        let lower = CrawlFrame::method(0x1000, 0x1100, G, 0x2000, 0x10);

        let old = raise(&mut state, 0x5000);
        enter_second_pass(&mut state, old, &upper);
        state.second_pass_frame(old, &upper, &[])?;
        let new = raise(&mut state, 0x6000);
        enter_second_pass(&mut state, new, &lower);
        state.second_pass_frame(new, &lower, &[])?;

        assert_eq!(state.pop_trackers(StackFrame::new(0x1000), false), 0);
        assert_eq!(state.pop_trackers(StackFrame::new(0x1000), true), 1);
        assert_eq!(state.trackers(), vec![old]);

        let pending = raise(&mut state, 0x7000);
        assert_eq!(state.pop_trackers_below_sp(0x3000), 0);
        assert_eq!(state.trackers(), vec![pending, old]);

        state.first_pass_frame(pending, &lower, &[], &mut catch_all)?;
        assert_eq!(state.pop_trackers_below_sp(0x3000), 2);
        assert_eq!(state.current(), None);
        Ok(())
    }

    #[test]
    fn test_unwound_region_queries() -> Result<()> {
        let mut state = state();
        let leaf = CrawlFrame::method(0x800, 0x1000, G, 0x2000, 0x10);
        let handler = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let above = CrawlFrame::method(0x1100, 0x1200, M, 0x4000, 0x10);

        let id = raise(&mut state, 0x5000);
        enter_second_pass(&mut state, id, &handler);
        assert!(!state.is_in_stack_region_unwound_by_current_exception(&leaf));
        state.second_pass_frame(id, &leaf, &[])?;
        state.second_pass_frame(id, &handler, &[])?;

        assert!(state.is_in_stack_region_unwound_by(&leaf, id)?);
        assert!(state.is_in_stack_region_unwound_by_current_exception(&leaf));
        assert!(!state.is_in_stack_region_unwound_by(&handler, id)?);
        assert!(state.has_frame_been_unwound_by_any_active_exception(&leaf));
        assert!(!state.has_frame_been_unwound_by_any_active_exception(&above));
        Ok(())
    }

    #[test]
    fn test_drop_releases_trackers() {
        let allocator = Arc::new(TrackerAllocator::new(TrackerAllocatorConfig::testing()));
        {
            let mut state = ThreadExceptionState::new(Arc::clone(&allocator), ThreadId::new(4));
            raise(&mut state, 0x5000);
            raise(&mut state, 0x6000);
            assert_eq!(allocator.live_trackers(), 2);
        }
        assert_eq!(allocator.live_trackers(), 0);
    }
}
