//! Dependent-handle promotion protocol.
//!
//! A dependent handle keeps its secondary alive exactly as long as its primary is
//! reachable. The collector cannot know which primaries are reachable until its
//! own marking settles, and promoting a secondary can make further primaries
//! reachable, so promotion is a fixpoint iteration.
//!
//! # Protocol
//!
//! 1. **Initial scan** - [`DhContext::bind`] records the promote callback and
//!    generation bounds for the worker, then one promotion pass runs
//! 2. **Query** - [`DhContext::unpromoted_primaries`] tells the collector whether
//!    any primary is still unmarked; `false` means no rescan can help
//! 3. **Rescan** - another promotion pass after the collector has drained its
//!    mark stack; returns whether any secondary was promoted
//!
//! [`DependentHandleRescans`] packages steps 2 and 3 as an iterator: each item is
//! one rescan pass, and the iterator ends once nothing is pending or two passes
//! in a row made no progress.
//!
//! # Monotonicity
//!
//! Promotion only ever adds to the promoted set. A primary cleared concurrently
//! stops its handle from promoting anything further; it never demotes a
//! secondary that was already promoted.

use std::{iter::FusedIterator, ops::DerefMut};

use dashmap::{mapref::one::RefMut, DashMap};
use log::trace;

use crate::gc::{
    collaborators::{GcHeap, HandleTable},
    types::{ObjectRef, PromoteFlags, PromoteFn, ScanContext},
};

/// Number of consecutive passes without any promotion or mark progress after
/// which the rescan loop is considered settled.
pub const QUIET_PASSES_TO_SETTLE: u32 = 2;

/// Per-worker state of the dependent-handle protocol for one collection.
///
/// Created lazily the first time a worker scans dependent handles, rebound by
/// every initial scan.
#[derive(Clone)]
pub struct DhContext<'h> {
    promote: Option<&'h PromoteFn<'h>>,
    condemned: u32,
    max_gen: u32,
    sc: ScanContext,
    unpromoted_primaries: bool,
    promoted: bool,
}

impl<'h> DhContext<'h> {
    /// Creates an unbound context for the worker described by `sc`.
    #[must_use]
    pub fn new(sc: ScanContext) -> Self {
        DhContext {
            promote: None,
            condemned: 0,
            max_gen: 0,
            sc,
            unpromoted_primaries: false,
            promoted: false,
        }
    }

    /// Binds the promote callback and generation bounds, and resets both flags.
    ///
    /// # Arguments
    ///
    /// * `promote` - Callback used to promote secondaries
    /// * `condemned` - Highest generation being collected
    /// * `max_gen` - Oldest generation of the heap
    /// * `sc` - The worker's scan context, copied into the context
    pub fn bind(&mut self, promote: &'h PromoteFn<'h>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.promote = Some(promote);
        self.condemned = condemned;
        self.max_gen = max_gen;
        self.sc = *sc;
        self.unpromoted_primaries = false;
        self.promoted = false;
    }

    /// Returns `true` once [`bind`](Self::bind) has been called.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.promote.is_some()
    }

    /// Highest generation being collected.
    #[must_use]
    pub fn condemned(&self) -> u32 {
        self.condemned
    }

    /// Oldest generation of the heap.
    #[must_use]
    pub fn max_gen(&self) -> u32 {
        self.max_gen
    }

    /// The scan context captured at bind time.
    #[must_use]
    pub fn scan_context(&self) -> &ScanContext {
        &self.sc
    }

    /// `true` if the last sweep saw a live handle whose primary is not yet promoted.
    #[must_use]
    pub fn unpromoted_primaries(&self) -> bool {
        self.unpromoted_primaries
    }

    /// `true` if the last pass promoted at least one secondary.
    #[must_use]
    pub fn promoted(&self) -> bool {
        self.promoted
    }

    /// Resets both flags before a sweep over the handle table.
    pub fn begin_sweep(&mut self) {
        self.unpromoted_primaries = false;
        self.promoted = false;
    }

    /// Records the outcome of a complete promotion pass.
    pub fn finish_pass(&mut self, any_promotions: bool) {
        self.promoted = any_promotions;
    }

    /// Applies the promotion rule to one dependent handle.
    ///
    /// If the primary is promoted and the secondary is not, the secondary is
    /// handed to the promote callback and `promoted` is set. If the primary is
    /// live but not yet promoted, `unpromoted_primaries` is set. Null primaries
    /// are ignored.
    ///
    /// # Panics
    ///
    /// Panics if the context has not been bound.
    pub fn promote_dependent(&mut self, primary: &ObjectRef, secondary: &mut ObjectRef, heap: &dyn GcHeap) {
        let Some(promote) = self.promote else {
            contract_violation!("dependent handle scanned through an unbound context");
        };

        if primary.is_null() {
            return;
        }

        if heap.is_promoted(*primary) {
            if !secondary.is_null() && !heap.is_promoted(*secondary) {
                promote(secondary, &self.sc, PromoteFlags::empty());
                self.promoted = true;
            }
        } else {
            self.unpromoted_primaries = true;
        }
    }
}

impl std::fmt::Debug for DhContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhContext")
            .field("bound", &self.is_bound())
            .field("condemned", &self.condemned)
            .field("max_gen", &self.max_gen)
            .field("thread_number", &self.sc.thread_number)
            .field("unpromoted_primaries", &self.unpromoted_primaries)
            .field("promoted", &self.promoted)
            .finish()
    }
}

/// The dependent-handle contexts of all workers, keyed by worker number.
///
/// Workers look up their own entry concurrently; no entry is shared between
/// workers.
#[derive(Debug, Default)]
pub struct DhContexts<'h> {
    contexts: DashMap<usize, DhContext<'h>>,
}

impl<'h> DhContexts<'h> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        DhContexts {
            contexts: DashMap::new(),
        }
    }

    /// Returns the context for `sc`'s worker, creating it on first use.
    pub fn get_or_create(&self, sc: &ScanContext) -> RefMut<'_, usize, DhContext<'h>> {
        self.contexts
            .entry(sc.thread_number)
            .or_insert_with(|| DhContext::new(*sc))
    }

    /// Returns the context for `sc`'s worker if it exists.
    pub fn get(&self, sc: &ScanContext) -> Option<RefMut<'_, usize, DhContext<'h>>> {
        self.contexts.get_mut(&sc.thread_number)
    }

    /// Number of workers that have a context.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns `true` if no worker has a context yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// Outcome of one rescan pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RescanPass {
    /// 1-based number of this rescan.
    pub index: usize,
    /// The collector's mark step marked something before this pass.
    pub marked: bool,
    /// This pass promoted at least one secondary.
    pub promoted: bool,
    /// Live primaries were still unpromoted at the end of this pass.
    pub unpromoted_primaries: bool,
}

/// Iterator over dependent-handle rescan passes.
///
/// Each call to `next` first runs the collector's mark step (draining whatever
/// the previous pass promoted) and then one promotion pass. Iteration stops when
/// no unpromoted primaries remain or after [`QUIET_PASSES_TO_SETTLE`] consecutive
/// passes in which neither the mark step nor the promotion pass made progress.
///
/// # Example
///
/// ```rust,ignore
/// let mut dh = DhContext::new(sc);
/// table.scan_dependent_handles_for_promotion({ dh.bind(&promote, 1, 2, &sc); &mut dh }, &heap);
///
/// let summary = drive_to_fixpoint(DependentHandleRescans::new(&mut dh, &table, &heap, || heap.drain()));
/// assert!(summary.settled);
/// ```
pub struct DependentHandleRescans<'c, D, H: ?Sized, M> {
    dh: D,
    table: &'c H,
    heap: &'c dyn GcHeap,
    mark: M,
    index: usize,
    quiet: u32,
    finished: bool,
}

impl<'c, 'h, D, H, M> DependentHandleRescans<'c, D, H, M>
where
    D: DerefMut<Target = DhContext<'h>>,
    H: HandleTable + ?Sized,
    M: FnMut() -> bool,
{
    /// Creates the iterator over a context that has already run its initial scan.
    ///
    /// # Arguments
    ///
    /// * `dh` - The bound context (a `&mut DhContext` or a map guard)
    /// * `table` - Handle storage to sweep
    /// * `heap` - Liveness oracle
    /// * `mark` - The collector's mark step; returns `true` if it marked anything
    ///
    /// # Panics
    ///
    /// Panics if `dh` has not been bound.
    pub fn new(dh: D, table: &'c H, heap: &'c dyn GcHeap, mark: M) -> Self {
        if !dh.is_bound() {
            contract_violation!("dependent-handle rescans started before the initial scan");
        }
        DependentHandleRescans {
            dh,
            table,
            heap,
            mark,
            index: 0,
            quiet: 0,
            finished: false,
        }
    }

    /// Returns `true` if iteration ended because two passes in a row made no progress
    /// or nothing was pending.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl<'h, D, H, M> Iterator for DependentHandleRescans<'_, D, H, M>
where
    D: DerefMut<Target = DhContext<'h>>,
    H: HandleTable + ?Sized,
    M: FnMut() -> bool,
{
    type Item = RescanPass;

    fn next(&mut self) -> Option<RescanPass> {
        if self.finished || !self.dh.unpromoted_primaries() {
            self.finished = true;
            return None;
        }

        let marked = (self.mark)();
        let promoted = self
            .table
            .scan_dependent_handles_for_promotion(&mut *self.dh, self.heap);
        self.index += 1;

        if promoted || marked {
            self.quiet = 0;
        } else {
            self.quiet += 1;
            if self.quiet >= QUIET_PASSES_TO_SETTLE {
                self.finished = true;
            }
        }

        let pass = RescanPass {
            index: self.index,
            marked,
            promoted,
            unpromoted_primaries: self.dh.unpromoted_primaries(),
        };
        trace!(
            "dependent handle rescan {} on worker {}: promoted={} marked={} pending={}",
            pass.index,
            self.dh.scan_context().thread_number,
            pass.promoted,
            pass.marked,
            pass.unpromoted_primaries
        );
        Some(pass)
    }
}

impl<'h, D, H, M> FusedIterator for DependentHandleRescans<'_, D, H, M>
where
    D: DerefMut<Target = DhContext<'h>>,
    H: HandleTable + ?Sized,
    M: FnMut() -> bool,
{
}

/// Totals of a completed rescan loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixpointSummary {
    /// Number of rescan passes run.
    pub passes: usize,
    /// Number of passes that promoted at least one secondary.
    pub promoting_passes: usize,
    /// Live primaries were still unpromoted when the loop settled.
    pub unpromoted_primaries: bool,
}

/// Runs rescans until the iterator is exhausted.
pub fn drive_to_fixpoint<I>(rescans: I) -> FixpointSummary
where
    I: IntoIterator<Item = RescanPass>,
{
    rescans
        .into_iter()
        .fold(FixpointSummary::default(), |mut summary, pass| {
            summary.passes += 1;
            if pass.promoted {
                summary.promoting_passes += 1;
            }
            summary.unpromoted_primaries = pass.unpromoted_primaries;
            summary
        })
}
