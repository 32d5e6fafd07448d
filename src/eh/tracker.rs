//! The per-dispatch exception tracker and its state machine.
//!
//! One [`ExceptionTracker`] exists for every exception a thread is currently
//! dispatching. It lives in a slot of the [`TrackerAllocator`](crate::eh::TrackerAllocator)
//! and is addressed through a [`TrackerId`]. Trackers of one thread form a
//! LIFO chain through their `previous` link, newest first.
//!
//! # State Machine
//!
//! ```text
//! Created ──► FirstPassScanning ──► FirstPassComplete ──► SecondPassUnwinding
//!    │               │                     │                      │
//!    └───────────────┴──────────┬──────────┴──────────────────────┘
//!                               ▼
//!                           Destroyed
//! ```
//!
//! A tracker leaves `FirstPassComplete` for `Destroyed` only when its dispatch
//! is abandoned and the tracker is popped before its second pass starts.
//! Every transition goes through [`ExceptionTracker::transition`], which
//! rejects edges not shown above.

use std::fmt;

use bitflags::bitflags;
use strum::Display;

use crate::{
    eh::{
        clause::{EhClauseInfo, EnclosingClauseInfo, ExceptionClause},
        frame::StackFrame,
        range::StackRange,
    },
    gc::ObjectRef,
    Error, Result,
};

/// Exception code the runtime raises managed exceptions with.
pub const CLR_EXCEPTION_CODE: u32 = 0xE043_4352;

/// Identity of a thread that owns trackers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Creates a thread id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        ThreadId(id)
    }

    /// The numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {}", self.0)
    }
}

/// Handle to a tracker: a page index, a slot index within that page, and the
/// slot's generation when the tracker was allocated.
///
/// Freeing a tracker retires its id. The slot's next tracker gets a new
/// generation, so a retired id never reaches it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId {
    page: u32,
    slot: u32,
    generation: u32,
}

impl TrackerId {
    /// Returns `None` if the page or slot index does not fit the id.
    pub(crate) fn new(page: usize, slot: usize, generation: u32) -> Option<Self> {
        Some(TrackerId {
            page: u32::try_from(page).ok()?,
            slot: u32::try_from(slot).ok()?,
            generation,
        })
    }

    /// Index of the page holding the tracker.
    #[must_use]
    pub fn page(self) -> usize {
        self.page as usize
    }

    /// Index of the slot within its page.
    #[must_use]
    pub fn slot(self) -> usize {
        self.slot as usize
    }

    /// How many times the slot had been handed out when this id was issued.
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.page, self.slot, self.generation)
    }
}

/// Lifecycle of a tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display)]
pub enum TrackerState {
    /// Allocated on first chance, no frame examined yet.
    #[default]
    Created,
    /// The first pass is looking for a handler.
    FirstPassScanning,
    /// The first pass found a handler.
    FirstPassComplete,
    /// The second pass is unwinding towards the handler.
    SecondPassUnwinding,
    /// Finished, unhandled, collapsed or popped. The slot is about to be freed.
    Destroyed,
}

impl TrackerState {
    /// Returns `true` if the state machine allows moving from `self` to `to`.
    #[must_use]
    pub fn can_transition_to(self, to: TrackerState) -> bool {
        use TrackerState::*;
        matches!(
            (self, to),
            (Created, FirstPassScanning)
                | (Created, Destroyed)
                | (FirstPassScanning, FirstPassComplete)
                | (FirstPassScanning, Destroyed)
                | (FirstPassComplete, SecondPassUnwinding)
                | (FirstPassComplete, Destroyed)
                | (SecondPassUnwinding, Destroyed)
        )
    }

    /// Returns `true` before the second pass starts.
    #[must_use]
    pub fn is_first_pass(self) -> bool {
        matches!(
            self,
            TrackerState::Created | TrackerState::FirstPassScanning | TrackerState::FirstPassComplete
        )
    }
}

/// Progress of an unwind as reported to the platform unwinder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display)]
pub enum UnwindStatus {
    /// No handler decision yet.
    #[default]
    UnwindPending,
    /// The first pass located a handler.
    FirstPassComplete,
    /// The catch funclet returned and the stack is unwound to the resume frame.
    SecondPassComplete,
}

bitflags! {
    /// Per-exception facts recorded during dispatch.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ExceptionFlags: u32 {
        /// The second pass has started.
        const UNWIND_HAS_STARTED = 0x1;
        /// The throwable was already being unwound by an older tracker.
        const IS_RETHROWN = 0x2;
        /// Raised by the runtime rather than by the platform.
        const WAS_THROWN_BY_US = 0x4;
    }
}

/// The platform's record of a raised exception.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// Exception code.
    pub code: u32,
    /// Faulting or raising address.
    pub address: usize,
    /// Platform exception flags.
    pub flags: u32,
}

impl ExceptionRecord {
    /// A record for a managed exception raised by the runtime.
    #[must_use]
    pub fn clr(address: usize) -> Self {
        ExceptionRecord {
            code: CLR_EXCEPTION_CODE,
            address,
            flags: 0,
        }
    }

    /// Returns `true` if the runtime raised this exception.
    #[must_use]
    pub fn is_clr(&self) -> bool {
        self.code == CLR_EXCEPTION_CODE
    }
}

/// Exception record plus the address of the register context it was raised in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExceptionPointers {
    /// The exception record.
    pub record: ExceptionRecord,
    /// Address of the context record.
    pub context: usize,
}

/// The dispatch record for one in-flight exception.
///
/// A tracker with no owner is a free slot.
#[derive(Clone, Debug, Default)]
pub struct ExceptionTracker {
    pub(crate) previous: Option<TrackerId>,
    pub(crate) owner: Option<ThreadId>,
    pub(crate) state: TrackerState,
    pub(crate) unwind_status: UnwindStatus,
    pub(crate) throwable: ObjectRef,
    pub(crate) pointers: ExceptionPointers,
    pub(crate) exception_code: u32,
    pub(crate) clause_info: EhClauseInfo,
    pub(crate) flags: ExceptionFlags,
    pub(crate) delivered_first_chance: bool,
    pub(crate) scanned_range: StackRange,
    pub(crate) first_pass_topmost_frame: StackFrame,
    pub(crate) catch_to_call_pc: usize,
    pub(crate) catch_clause_index: Option<usize>,
    pub(crate) clause_for_catch: Option<ExceptionClause>,
    pub(crate) establisher_of_handler_frame: StackFrame,
    pub(crate) caller_of_handler_frame: StackFrame,
    pub(crate) resume_frame: StackFrame,
    pub(crate) enclosing_clause: EnclosingClauseInfo,
    pub(crate) enclosing_clause_for_gc: EnclosingClauseInfo,
    pub(crate) fixup_caller_sp_for_gc: bool,
    pub(crate) current_establisher: StackFrame,
    pub(crate) last_unwound_establisher: StackFrame,
    pub(crate) collapsed_clause_caller: StackFrame,
    pub(crate) enclosing_clause_of_collapsed: EnclosingClauseInfo,
    pub(crate) collapsed_range: StackRange,
    pub(crate) collapsed_funclets: Vec<(StackFrame, usize)>,
}

impl ExceptionTracker {
    /// A fresh tracker owned by `owner`.
    pub(crate) fn new(owner: ThreadId) -> Self {
        ExceptionTracker {
            owner: Some(owner),
            ..ExceptionTracker::default()
        }
    }

    /// Moves to `to` if the state machine allows it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] for an edge the state machine lacks.
    pub fn try_transition(&mut self, to: TrackerState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    /// Moves to `to`.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation for an edge the state machine lacks.
    pub fn transition(&mut self, to: TrackerState) {
        if let Err(e) = self.try_transition(to) {
            contract_violation!("{}", e);
        }
    }

    /// Returns `true` while the slot holds a tracker.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.owner.is_some()
    }

    /// Returns `true` before the second pass starts.
    #[must_use]
    pub fn is_in_first_pass(&self) -> bool {
        self.state.is_first_pass()
    }

    /// Returns `true` during the second pass.
    #[must_use]
    pub fn is_in_second_pass(&self) -> bool {
        self.state == TrackerState::SecondPassUnwinding
    }

    /// The next older tracker of the same thread.
    #[must_use]
    pub fn previous(&self) -> Option<TrackerId> {
        self.previous
    }

    /// The owning thread, `None` for a free slot.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Unwind progress.
    #[must_use]
    pub fn unwind_status(&self) -> UnwindStatus {
        self.unwind_status
    }

    /// The thrown object.
    #[must_use]
    pub fn throwable(&self) -> ObjectRef {
        self.throwable
    }

    /// Record and context of the exception.
    #[must_use]
    pub fn pointers(&self) -> &ExceptionPointers {
        &self.pointers
    }

    /// The exception code.
    #[must_use]
    pub fn exception_code(&self) -> u32 {
        self.exception_code
    }

    /// The funclet currently running for this exception.
    #[must_use]
    pub fn clause_info(&self) -> &EhClauseInfo {
        &self.clause_info
    }

    /// Recorded dispatch facts.
    #[must_use]
    pub fn flags(&self) -> ExceptionFlags {
        self.flags
    }

    /// Whether first-chance notification was delivered.
    #[must_use]
    pub fn delivered_first_chance(&self) -> bool {
        self.delivered_first_chance
    }

    /// Frames scanned by the first pass or unwound by the second.
    #[must_use]
    pub fn scanned_range(&self) -> StackRange {
        self.scanned_range
    }

    /// The leaf-most frame the first pass examined.
    #[must_use]
    pub fn first_pass_topmost_frame(&self) -> StackFrame {
        self.first_pass_topmost_frame
    }

    /// Address of the catch funclet the second pass will call.
    #[must_use]
    pub fn catch_to_call_pc(&self) -> usize {
        self.catch_to_call_pc
    }

    /// Index of the catching clause within its method.
    #[must_use]
    pub fn catch_clause_index(&self) -> Option<usize> {
        self.catch_clause_index
    }

    /// The catching clause.
    #[must_use]
    pub fn clause_for_catch(&self) -> Option<&ExceptionClause> {
        self.clause_for_catch.as_ref()
    }

    /// Stack pointer of the frame holding the catch.
    #[must_use]
    pub fn establisher_of_handler_frame(&self) -> StackFrame {
        self.establisher_of_handler_frame
    }

    /// Caller SP of the frame holding the catch.
    #[must_use]
    pub fn caller_of_handler_frame(&self) -> StackFrame {
        self.caller_of_handler_frame
    }

    /// Frame execution resumes in after the catch.
    #[must_use]
    pub fn resume_frame(&self) -> StackFrame {
        self.resume_frame
    }

    /// The frame enclosing the running funclet.
    #[must_use]
    pub fn enclosing_clause(&self) -> &EnclosingClauseInfo {
        &self.enclosing_clause
    }

    /// The frame enclosing the running funclet, as a GC stack walk reports it.
    #[must_use]
    pub fn enclosing_clause_for_gc(&self) -> &EnclosingClauseInfo {
        &self.enclosing_clause_for_gc
    }

    /// Whether the GC enclosing frame was taken from a parent funclet's parent.
    #[must_use]
    pub fn fixup_caller_sp_for_gc(&self) -> bool {
        self.fixup_caller_sp_for_gc
    }

    /// Establisher of the frame being unwound.
    #[must_use]
    pub fn current_establisher(&self) -> StackFrame {
        self.current_establisher
    }

    /// Establisher of the last fully unwound frame.
    #[must_use]
    pub fn last_unwound_establisher(&self) -> StackFrame {
        self.last_unwound_establisher
    }

    /// Funclet caller SP inherited from a collapsed tracker.
    #[must_use]
    pub fn collapsed_clause_caller(&self) -> StackFrame {
        self.collapsed_clause_caller
    }

    /// Enclosing frame of the collapsed tracker's funclet.
    #[must_use]
    pub fn enclosing_clause_of_collapsed(&self) -> &EnclosingClauseInfo {
        &self.enclosing_clause_of_collapsed
    }

    /// Frames already unwound by the trackers this one collapsed.
    #[must_use]
    pub fn collapsed_range(&self) -> StackRange {
        self.collapsed_range
    }

    /// Funclets the collapsed trackers were running when they were collapsed,
    /// as the establisher frame and the clause index within it.
    ///
    /// Clauses of that frame up to and including the index have been dispatched.
    #[must_use]
    pub fn collapsed_funclets(&self) -> &[(StackFrame, usize)] {
        &self.collapsed_funclets
    }
}
