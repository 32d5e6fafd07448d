//! # rootwalk Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the rootwalk library. Import this module to get quick access to the essential
//! types for handle scanning and exception tracking.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all rootwalk operations
pub use crate::Error;

/// The result type used throughout rootwalk
pub use crate::Result;

// ================================================================================================
// Configuration
// ================================================================================================

/// Runtime, scan and allocator configuration
pub use crate::config::{RootwalkConfig, ScanConfig, TrackerAllocatorConfig};

// ================================================================================================
// Garbage Collector - Handle Scanning
// ================================================================================================

/// The scan coordinator driven by the collector
pub use crate::gc::GcScan;

/// Collaborators supplied by the embedder
pub use crate::gc::{ExecutionEnvironment, GcHeap, HandleTable};

/// Object references, scan contexts and handle descriptions
pub use crate::gc::{
    HandleId, HandleInfo, HandleScanFn, HandleType, ObjectRef, PromoteFlags, PromoteFn,
    ScanContext,
};

/// Built-in handle storage
pub use crate::gc::InMemoryHandleTable;

/// Dependent-handle promotion fixpoint
pub use crate::gc::{drive_to_fixpoint, DependentHandleRescans, DhContext, FixpointSummary, RescanPass};

/// Runtime structure validity
pub use crate::gc::{InvalidationGuard, GC_RUNTIME_STRUCTURES};

// ================================================================================================
// Exception Handling - Trackers
// ================================================================================================

/// Exception trackers and their identities
pub use crate::eh::{
    ExceptionFlags, ExceptionRecord, ExceptionTracker, ThreadId, TrackerId, TrackerState,
    UnwindStatus,
};

/// Tracker storage
pub use crate::eh::{TrackerAllocator, TrackerMemoryType};

/// Per-thread tracker chain
pub use crate::eh::{FirstPassOutcome, FuncletCall, ParentFrame, ThreadExceptionState};

// ================================================================================================
// Exception Handling - Frames and Dispatch
// ================================================================================================

/// Stack frames and ranges
pub use crate::eh::{CrawlFrame, FrameKind, FuncletKind, MethodId, StackFrame, StackRange};

/// Exception clauses
pub use crate::eh::{ExceptionClause, TypeToken};

/// Funclet-aware stack walking
pub use crate::eh::{FuncletAwareWalk, WalkedFrame};

/// Two-pass dispatch
pub use crate::eh::{ClauseSource, DispatchResult, Dispatcher, FuncletInvoker, FuncletOutcome};
