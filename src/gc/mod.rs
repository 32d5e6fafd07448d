//! Garbage-collector root scanning.
//!
//! This module contains everything the collector calls to discover and update
//! references held outside the heap: stack roots (through the execution
//! environment), strong, pinned and weak handles, and dependent handles.
//!
//! # Architecture
//!
//! - [`types`] - Object references, scan contexts, promote flags and handle kinds
//! - [`collaborators`] - Traits for the execution environment, handle table and heap
//! - [`scan`] - [`GcScan`], the coordinator the collector drives phase by phase
//! - [`dependent`] - The dependent-handle promotion fixpoint
//! - [`validity`] - The process-wide "runtime structures valid" counter
//! - [`table`] - [`InMemoryHandleTable`], a complete handle table
//!
//! # Concurrency
//!
//! Each collector worker brings its own [`ScanContext`] and gets its own
//! [`DhContext`]; no scan state is shared between workers. Handle storage is
//! shared, and the in-memory table partitions it per worker. The validity
//! counter is the only state shared with arbitrary threads and is lock-free.

pub mod collaborators;
pub mod dependent;
pub mod scan;
pub mod table;
pub mod types;
pub mod validity;

pub use collaborators::{ExecutionEnvironment, GcHeap, HandleTable};
pub use dependent::{drive_to_fixpoint, DependentHandleRescans, DhContext, DhContexts, FixpointSummary, RescanPass};
pub use scan::GcScan;
pub use table::InMemoryHandleTable;
pub use types::{HandleId, HandleInfo, HandleScanFn, HandleType, ObjectRef, PromoteFlags, PromoteFn, ScanContext};
pub use validity::{InvalidationGuard, StructureValidity, GC_RUNTIME_STRUCTURES};
