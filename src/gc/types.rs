//! Core value types shared by the scan coordinator, the dependent-handle
//! protocol and handle table implementations.

use std::fmt;

use bitflags::bitflags;
use strum::{Display, EnumCount, EnumIter};

/// An object address as seen by the collector.
///
/// The collector owns object layout; to this crate a reference is an opaque
/// word that may be null. Promotion callbacks rewrite it in place during the
/// relocation phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// The null reference.
    pub const NULL: ObjectRef = ObjectRef(0);

    /// Creates a reference from a raw address.
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        ObjectRef(addr)
    }

    /// Returns the raw address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Returns `true` for the null reference.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Flags passed to the promote callback alongside each slot
    pub struct PromoteFlags: u32 {
        /// The slot may point into the interior of an object
        const INTERIOR = 0x1;
        /// The object must not be moved by this collection
        const PINNED = 0x2;
    }
}

/// Per-worker context for one collection phase.
///
/// Owned by the collector and passed by reference into every scan. Nothing in
/// this crate keeps a `ScanContext` beyond the phase it was handed in for,
/// except [`DhContext`](crate::gc::DhContext), which copies it for the
/// duration of the dependent-handle rescan loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanContext {
    /// Index of the worker thread running this scan.
    pub thread_number: usize,
    /// Number of workers participating in the collection.
    pub thread_count: usize,
    /// `true` in the mark phase, `false` in the relocate phase.
    pub promotion: bool,
    /// Set when the scan runs concurrently with the application.
    pub concurrent: bool,
}

impl ScanContext {
    /// Context for worker `thread_number` of `thread_count` in the mark phase.
    #[must_use]
    pub fn new(thread_number: usize, thread_count: usize) -> Self {
        ScanContext {
            thread_number,
            thread_count: thread_count.max(1),
            promotion: true,
            concurrent: false,
        }
    }

    /// Switches the context to the relocate phase.
    #[must_use]
    pub fn relocating(mut self) -> Self {
        self.promotion = false;
        self
    }

    /// Marks the context as belonging to a concurrent scan.
    #[must_use]
    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    /// Returns `true` for worker 0.
    #[must_use]
    pub fn is_first_worker(&self) -> bool {
        self.thread_number == 0
    }
}

impl Default for ScanContext {
    fn default() -> Self {
        ScanContext::new(0, 1)
    }
}

/// The promote callback.
///
/// Invoked once per discovered reference. In the mark phase the implementation
/// marks the referent reachable. In the relocate phase it rewrites the slot to
/// the object's new address. It runs on collector workers and must tolerate
/// concurrent calls for different slots. The callback may borrow the
/// collector's heap for `'a`.
pub type PromoteFn<'a> = dyn Fn(&mut ObjectRef, &ScanContext, PromoteFlags) + Sync + 'a;

/// The handle-scan callback used by profilers and tracing.
///
/// Observes each handle without mutating it.
pub type HandleScanFn<'f> = dyn FnMut(&HandleInfo) + 'f;

/// Kinds of handle the handle table stores.
///
/// Each scan operation covers a fixed subset of these kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumCount)]
pub enum HandleType {
    /// Cleared as soon as the referent is unreachable, before finalization.
    WeakShort,
    /// Cleared only once the referent is unreachable after finalization.
    WeakLong,
    /// Keeps its referent alive.
    Strong,
    /// Keeps its referent alive and prevents it from moving.
    Pinned,
    /// Strong while the extra info word (the reference count) is non-zero, weak otherwise.
    RefCounted,
    /// Primary/secondary pair: the secondary lives exactly as long as the primary.
    Dependent,
    /// Pinned for the lifetime of an asynchronous I/O operation.
    AsyncPinned,
    /// Strong handle whose retained size is reported to the host.
    SizedRef,
    /// Weak handle that also tracks an interior pointer into its referent.
    WeakInteriorPointer,
}

impl HandleType {
    /// Kinds whose referent is held strongly.
    pub const STRONG: &'static [HandleType] = &[
        HandleType::Strong,
        HandleType::RefCounted,
        HandleType::SizedRef,
    ];

    /// Kinds that pin their referent.
    pub const PINNING: &'static [HandleType] = &[HandleType::Pinned, HandleType::AsyncPinned];

    /// Returns `true` for kinds that never keep their referent alive on their own.
    #[must_use]
    pub fn is_weak(self) -> bool {
        matches!(
            self,
            HandleType::WeakShort | HandleType::WeakLong | HandleType::WeakInteriorPointer
        )
    }
}

/// Identity of a handle in a handle table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId {
    /// Storage segment the handle lives in.
    pub segment: u32,
    /// Index inside the segment.
    pub index: u32,
}

impl HandleId {
    /// Creates a handle id.
    #[must_use]
    pub const fn new(segment: u32, index: u32) -> Self {
        HandleId { segment, index }
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.index)
    }
}

/// What a handle-scan callback observes for one handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleInfo {
    /// The handle.
    pub handle: HandleId,
    /// Its kind.
    pub handle_type: HandleType,
    /// The current referent (the primary, for dependent handles).
    pub referent: ObjectRef,
    /// The extra info word: secondary for dependent handles, reference count,
    /// interior pointer or retained size for the kinds that carry one.
    pub extra: usize,
}
