// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # rootwalk
//!
//! Runtime-side root scanning and exception dispatch bookkeeping for a
//! tracing, generational garbage collector.
//!
//! The crate covers the two places where a managed runtime has to tell its
//! collector about references that do not live in the heap:
//!
//! - **Handles.** [`gc::GcScan`] drives the handle table through each phase of
//!   a collection: marking strong and pinned handles, clearing weak handles
//!   whose referents died, relocating handle referents, aging handles, and
//!   promoting dependent-handle secondaries until a fixpoint is reached.
//! - **Exceptions in flight.** [`eh::ThreadExceptionState`] keeps one
//!   [`eh::ExceptionTracker`] per exception a thread is dispatching, runs the
//!   two-pass search and unwind over a thread's frames, and answers the
//!   questions a GC stack walk has to ask while funclets are running: which
//!   frames have already been unwound, and which parent frame a funclet
//!   reports for.
//!
//! # Architecture
//!
//! - [`gc`] - Handle scanning coordinator, dependent-handle fixpoint, in-memory handle table
//! - [`eh`] - Exception trackers, their slab allocator, the tracker chain and funclet-aware walks
//! - [`config`] - Scan and allocator configuration
//! - [`prelude`] - Re-exports of the commonly used types
//!
//! The collector itself, the execution engine's stack walker and the object
//! heap are collaborators supplied by the embedder through the traits in
//! [`gc::collaborators`] and [`eh::dispatch`].
//!
//! # Quick Start
//!
//! ## Marking handles
//!
//! ```rust
//! use rootwalk::prelude::*;
//!
//! struct NoRoots;
//! impl ExecutionEnvironment for NoRoots {
//!     fn scan_roots(&self, _: &PromoteFn<'_>, _: u32, _: u32, _: &ScanContext) {}
//!     fn sync_block_cache_weak_ptr_scan(&self, _: &mut dyn FnMut(&mut ObjectRef)) {}
//!     fn sync_block_cache_demote(&self, _: u32) {}
//!     fn sync_block_cache_promotions_granted(&self, _: u32) {}
//! }
//!
//! struct EverythingLive;
//! impl GcHeap for EverythingLive {
//!     fn is_promoted(&self, obj: ObjectRef) -> bool {
//!         !obj.is_null()
//!     }
//! }
//!
//! let table = InMemoryHandleTable::new(1);
//! let handle = table.create_handle(HandleType::Strong, ObjectRef::new(0x1000));
//!
//! let marked = std::sync::Mutex::new(Vec::new());
//! let promote = |slot: &mut ObjectRef, _: &ScanContext, _: PromoteFlags| {
//!     marked.lock().unwrap().push(*slot);
//! };
//!
//! let gc = GcScan::new(&NoRoots, &table, &EverythingLive, ScanConfig::new());
//! gc.scan_handles(&promote, 2, 2, &ScanContext::default());
//!
//! assert_eq!(*marked.lock().unwrap(), vec![ObjectRef::new(0x1000)]);
//! assert_eq!(table.referent(handle)?, ObjectRef::new(0x1000));
//! # Ok::<(), rootwalk::Error>(())
//! ```
//!
//! ## Tracking an exception
//!
//! ```rust
//! use std::sync::Arc;
//! use rootwalk::prelude::*;
//!
//! let allocator = Arc::new(TrackerAllocator::new(TrackerAllocatorConfig::new()));
//! let mut state = ThreadExceptionState::new(allocator.clone(), ThreadId::new(7));
//!
//! let id = state.try_raise(ExceptionRecord::clr(0x4000), 0, ObjectRef::new(0x9000))?;
//! assert_eq!(state.current(), Some(id));
//! assert_eq!(state.tracker(id)?.state(), TrackerState::Created);
//!
//! // No frame handles it: the tracker is released.
//! state.first_pass_unhandled(id)?;
//! assert_eq!(state.current(), None);
//! assert_eq!(allocator.live_trackers(), 0);
//! # Ok::<(), rootwalk::Error>(())
//! ```
//!
//! # Error Handling
//!
//! Operations that can fail because of their input return [`Result`]. Broken
//! internal invariants (an invalid tracker state transition, a tracker freed
//! twice, an unordered tracker chain) are contract violations and panic with a
//! message naming the source location.
//!
//! # Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) facade: phase
//! boundaries and tracker lifecycle at `debug`, per-frame decisions at `trace`,
//! allocator back-off at `warn`. Install any logger to see them.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// This module provides a curated selection of the most frequently used types
/// from across the rootwalk library, allowing for convenient glob imports.
///
/// # Examples
///
/// ```rust
/// use rootwalk::prelude::*;
///
/// let table = InMemoryHandleTable::new(4);
/// let id = table.create_dependent(ObjectRef::new(0x1000), ObjectRef::new(0x2000));
/// assert_eq!(table.handle_type(id)?, HandleType::Dependent);
/// # Ok::<(), rootwalk::Error>(())
/// ```
pub mod prelude;

pub mod config;

pub mod eh;
pub mod gc;

/// `rootwalk` Result type.
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always
/// the crate's [`Error`] enum. This is used consistently throughout the crate
/// for all fallible operations.
///
/// # Examples
///
/// ```rust
/// use rootwalk::{Result, gc::{HandleId, InMemoryHandleTable}};
///
/// fn referent_addr(table: &InMemoryHandleTable, id: HandleId) -> Result<usize> {
///     Ok(table.referent(id)?.addr())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `rootwalk` Error type.
///
/// The main error type for all operations in this crate. Provides detailed error
/// information for tracker allocation, tracker lookup, state transitions and
/// handle lookup.
///
/// # Examples
///
/// ```rust
/// use rootwalk::{Error, gc::{HandleId, InMemoryHandleTable}};
///
/// let table = InMemoryHandleTable::new(1);
/// match table.referent(HandleId::new(0, 42)) {
///     Err(Error::HandleNotFound(id)) => assert_eq!(id, HandleId::new(0, 42)),
///     other => panic!("unexpected {other:?}"),
/// }
/// ```
pub use error::Error;
