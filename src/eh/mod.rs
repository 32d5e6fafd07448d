//! Exception dispatch bookkeeping.
//!
//! Every exception a thread dispatches is tracked by an [`ExceptionTracker`]
//! from its first chance until the catch returns or the exception goes
//! unhandled. Trackers record which frames the dispatch has scanned and
//! unwound and which funclet is running, so that nested exceptions can be
//! unwound correctly and GC stack walks can report funclets in place of their
//! parent frames.
//!
//! # Architecture
//!
//! - [`frame`] - Stack frame identities and crawl frames
//! - [`range`] - [`StackRange`], the frames a tracker has covered
//! - [`clause`] - Exception clauses and running-funclet records
//! - [`tracker`] - [`ExceptionTracker`] and its state machine
//! - [`allocator`] - [`TrackerAllocator`], the paged tracker slab
//! - [`chain`] - [`ThreadExceptionState`], a thread's tracker chain and both passes
//! - [`walk`] - [`FuncletAwareWalk`], stack walks that skip to funclet parents
//! - [`dispatch`] - [`Dispatcher`], a complete two-pass dispatch
//!
//! # Concurrency
//!
//! A [`ThreadExceptionState`] is used only by its thread. The allocator is
//! shared by all threads through an `Arc` and serializes access with a mutex.

pub mod allocator;
pub mod chain;
pub mod clause;
pub mod dispatch;
pub mod frame;
pub mod range;
pub mod tracker;
pub mod walk;

pub use allocator::{TrackerAllocator, TrackerMemoryType};
pub use chain::{FirstPassOutcome, FuncletCall, ParentFrame, ThreadExceptionState};
pub use clause::{EhClauseInfo, EnclosingClauseInfo, ExceptionClause, TypeToken};
pub use dispatch::{ClauseSource, DispatchResult, Dispatcher, FuncletInvoker, FuncletOutcome};
pub use frame::{CrawlFrame, FrameKind, FuncletKind, MethodId, StackFrame};
pub use range::StackRange;
pub use tracker::{
    ExceptionFlags, ExceptionPointers, ExceptionRecord, ExceptionTracker, ThreadId, TrackerId,
    TrackerState, UnwindStatus, CLR_EXCEPTION_CODE,
};
pub use walk::{is_unwound_to_target_parent_frame, FuncletAwareWalk, WalkedFrame};
