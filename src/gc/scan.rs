//! The handle scan coordinator.
//!
//! [`GcScan`] is the entry point the collector calls at fixed points of its
//! phase state machine. It holds no scan state of its own apart from the
//! per-worker dependent-handle contexts; every operation sequences calls into
//! the [`ExecutionEnvironment`], the [`HandleTable`] and the [`GcHeap`].
//!
//! # Phase Ordering
//!
//! A collection drives the coordinator in this order:
//!
//! 1. [`GcScan::scan_roots`] and [`GcScan::scan_handles`] with `sc.promotion` set
//! 2. [`GcScan::dh_initial_scan`], then rescans until the dependent handles settle
//! 3. [`GcScan::short_weak_ptr_scan`], finalization, then [`GcScan::weak_ptr_scan`]
//!    and [`GcScan::weak_ptr_scan_by_single_thread`]
//! 4. [`GcScan::demote`] or [`GcScan::promotions_granted`]
//! 5. [`GcScan::scan_roots`] and [`GcScan::scan_handles`] with `sc.promotion` cleared
//!    to relocate
//!
//! Weak clearing must not start before promotion has finished for every
//! condemned generation; relocation must not start before the dependent-handle
//! rescans have settled.
//!
//! # Example
//!
//! ```rust,ignore
//! let gc = GcScan::new(&env, &handles, &heap, ScanConfig::default());
//! let sc = ScanContext::new(0, 1);
//!
//! gc.scan_roots(&promote, condemned, max_gen, &sc);
//! gc.scan_handles(&promote, condemned, max_gen, &sc);
//! gc.dh_initial_scan(&promote, condemned, max_gen, &sc);
//! let summary = drive_to_fixpoint(gc.dh_rescans(&sc, || collector.drain_mark_stack()));
//! gc.short_weak_ptr_scan(condemned, max_gen, &sc);
//! gc.weak_ptr_scan(condemned, max_gen, &sc);
//! ```

use dashmap::mapref::one::RefMut;
use log::debug;

use crate::gc::{
    collaborators::{ExecutionEnvironment, GcHeap, HandleTable},
    dependent::{DependentHandleRescans, DhContext, DhContexts},
    types::{HandleScanFn, ObjectRef, PromoteFn, ScanContext},
    validity::{InvalidationGuard, GC_RUNTIME_STRUCTURES},
};
use crate::config::ScanConfig;

/// Coordinates root and handle scanning for one collector.
///
/// # Type Parameters
///
/// * `E` - The execution environment collaborator
/// * `H` - The handle table collaborator
/// * `G` - The heap's liveness oracle
pub struct GcScan<'a, E: ?Sized, H: ?Sized, G> {
    env: &'a E,
    handles: &'a H,
    heap: &'a G,
    config: ScanConfig,
    dependent: DhContexts<'a>,
}

impl<'a, E, H, G> GcScan<'a, E, H, G>
where
    E: ExecutionEnvironment + ?Sized,
    H: HandleTable + ?Sized,
    G: GcHeap,
{
    /// Creates a coordinator over the given collaborators.
    #[must_use]
    pub fn new(env: &'a E, handles: &'a H, heap: &'a G, config: ScanConfig) -> Self {
        GcScan {
            env,
            handles,
            heap,
            config,
            dependent: DhContexts::new(),
        }
    }

    /// The coordinator's configuration.
    #[must_use]
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// One scan context per configured worker, worker 0 first.
    ///
    /// Workstation collection has a single worker; server collection has
    /// [`ScanConfig::workers`] of them, each sweeping its own handle segments.
    pub fn worker_contexts(&self) -> impl Iterator<Item = ScanContext> + '_ {
        let workers = if self.config.server_gc { self.config.workers.max(1) } else { 1 };
        (0..workers).map(move |worker| ScanContext::new(worker, workers))
    }

    /// Enumerates stack and register roots through the execution environment.
    ///
    /// `promote` marks in the mark phase and relocates in the relocate phase,
    /// as selected by `sc.promotion`.
    pub fn scan_roots(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.env.scan_roots(promote, condemned, max_gen, sc);
    }

    /// Scans strong and pinning handles (mark phase) or updates every handle
    /// referent to its new address (relocate phase).
    ///
    /// The relocate phase runs in a fixed order: normal handles, pinned
    /// handles, dependent secondaries, then weak interior pointers, which are
    /// adjusted by the distance their referent moved.
    pub fn scan_handles(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        if sc.promotion {
            debug!(
                "worker {}: tracing handle roots for gen {} (max {})",
                sc.thread_number, condemned, max_gen
            );
            self.handles.trace_pinning_roots(promote, condemned, max_gen, sc);
            self.handles.trace_normal_roots(promote, condemned, max_gen, sc);
        } else {
            debug!(
                "worker {}: relocating handles for gen {} (max {})",
                sc.thread_number, condemned, max_gen
            );
            self.handles.update_pointers(promote, condemned, max_gen, sc);
            self.handles.update_pinned_pointers(promote, condemned, max_gen, sc);
            self.handles
                .scan_dependent_handles_for_relocation(promote, condemned, max_gen, sc);
            self.handles
                .scan_weak_interior_pointers_for_relocation(promote, condemned, max_gen, sc);
        }

        if self.config.verify_after_scan {
            self.verify_handle_table(condemned, max_gen, sc);
        }
    }

    /// Promotes sized-ref handle referents.
    pub fn scan_sized_refs(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.handles.scan_sized_refs(promote, condemned, max_gen, sc);
    }

    /// Clears long weak handles whose referent died, then dependent handles
    /// whose primary died.
    ///
    /// Only valid once promotion has finished for every condemned generation.
    pub fn weak_ptr_scan(&self, condemned: u32, max_gen: u32, sc: &ScanContext) {
        debug!("worker {}: clearing dead long weak and dependent handles", sc.thread_number);
        self.handles.check_reachable(self.heap, condemned, max_gen, sc);
        self.handles
            .scan_dependent_handles_for_clearing(self.heap, condemned, max_gen, sc);
    }

    /// Clears dead entries of the sync-block cache. Runs on one thread only.
    pub fn weak_ptr_scan_by_single_thread(&self, _condemned: u32, _max_gen: u32, _sc: &ScanContext) {
        let heap = self.heap;
        self.env.sync_block_cache_weak_ptr_scan(&mut |slot: &mut ObjectRef| {
            if !slot.is_null() && !heap.is_promoted(*slot) {
                *slot = ObjectRef::NULL;
            }
        });
    }

    /// Clears short weak handles whose referent died.
    pub fn short_weak_ptr_scan(&self, condemned: u32, max_gen: u32, sc: &ScanContext) {
        debug!("worker {}: clearing dead short weak handles", sc.thread_number);
        self.handles.check_alive(self.heap, condemned, max_gen, sc);
    }

    /// Rejuvenates the worker's handles and demotes the sync-block cache.
    ///
    /// The sync-block cache is shared, so under server GC only worker 0 touches it.
    pub fn demote(&self, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.handles.rejuvenate_handles(condemned, max_gen, sc);
        if self.owns_shared_caches(sc) {
            self.env.sync_block_cache_demote(max_gen);
        }
    }

    /// Ages the worker's handles and promotes the sync-block cache.
    ///
    /// The sync-block cache is shared, so under server GC only worker 0 touches it.
    pub fn promotions_granted(&self, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.handles.age_handles(condemned, max_gen, sc);
        if self.owns_shared_caches(sc) {
            self.env.sync_block_cache_promotions_granted(max_gen);
        }
    }

    fn owns_shared_caches(&self, sc: &ScanContext) -> bool {
        !self.config.server_gc || sc.is_first_worker()
    }

    /// Reports every single-referent handle to a profiler callback.
    pub fn scan_handles_for_profiler(&self, max_gen: u32, sc: &ScanContext, f: &mut HandleScanFn<'_>) {
        self.handles.scan_handles_for_profiler(max_gen, sc, f);
    }

    /// Reports every dependent handle to a profiler callback.
    pub fn scan_dependent_handles_for_profiler(&self, max_gen: u32, sc: &ScanContext, f: &mut HandleScanFn<'_>) {
        self.handles.scan_dependent_handles_for_profiler(max_gen, sc, f);
    }

    /// Asks the handle table to verify itself.
    ///
    /// # Panics
    ///
    /// Panics if the table reports corruption.
    pub fn verify_handle_table(&self, condemned: u32, max_gen: u32, sc: &ScanContext) {
        if !self.handles.verify(condemned, max_gen, sc) {
            contract_violation!(
                "handle table failed verification on worker {} (gen {} of {})",
                sc.thread_number,
                condemned,
                max_gen
            );
        }
    }

    /// Binds the worker's dependent-handle context and runs the first promotion pass.
    ///
    /// Returns whether any secondary was promoted.
    pub fn dh_initial_scan(&self, promote: &'a PromoteFn<'a>, condemned: u32, max_gen: u32, sc: &ScanContext) -> bool {
        let mut dh = self.dependent.get_or_create(sc);
        dh.bind(promote, condemned, max_gen, sc);
        let promoted = self
            .handles
            .scan_dependent_handles_for_promotion(&mut dh, self.heap);
        debug!(
            "worker {}: initial dependent handle scan promoted={} pending={}",
            sc.thread_number,
            promoted,
            dh.unpromoted_primaries()
        );
        promoted
    }

    /// Returns `true` if the worker's last promotion pass left live primaries unpromoted.
    ///
    /// `false` means further rescans cannot promote anything.
    #[must_use]
    pub fn dh_unpromoted_handles_exist(&self, sc: &ScanContext) -> bool {
        self.dependent
            .get(sc)
            .is_some_and(|dh| dh.unpromoted_primaries())
    }

    /// Runs one more promotion pass for the worker. Returns whether anything was promoted.
    ///
    /// # Panics
    ///
    /// Panics if [`dh_initial_scan`](Self::dh_initial_scan) has not run for this worker.
    pub fn dh_rescan(&self, sc: &ScanContext) -> bool {
        let Some(mut dh) = self.dependent.get(sc) else {
            contract_violation!("dependent handle rescan on worker {} before the initial scan", sc.thread_number);
        };
        self.handles
            .scan_dependent_handles_for_promotion(&mut dh, self.heap)
    }

    /// Returns the rescan loop for the worker as an iterator.
    ///
    /// `mark` is the collector's own mark step, run before every pass.
    ///
    /// # Panics
    ///
    /// Panics if [`dh_initial_scan`](Self::dh_initial_scan) has not run for this worker.
    pub fn dh_rescans<M>(
        &self,
        sc: &ScanContext,
        mark: M,
    ) -> DependentHandleRescans<'_, RefMut<'_, usize, DhContext<'a>>, H, M>
    where
        M: FnMut() -> bool,
    {
        let Some(dh) = self.dependent.get(sc) else {
            contract_violation!("dependent handle rescans on worker {} before the initial scan", sc.thread_number);
        };
        DependentHandleRescans::new(dh, self.handles, self.heap, mark)
    }

    /// The per-worker dependent-handle contexts.
    #[must_use]
    pub fn dh_contexts(&self) -> &DhContexts<'a> {
        &self.dependent
    }

    /// Returns `true` when no caller has suspended GC runtime structure validity.
    #[must_use]
    pub fn runtime_structures_valid() -> bool {
        GC_RUNTIME_STRUCTURES.is_valid()
    }

    /// Suspends GC runtime structure validity until the guard is dropped.
    #[must_use = "validity is restored as soon as the guard is dropped"]
    pub fn suspend_runtime_structures() -> InvalidationGuard<'static> {
        GC_RUNTIME_STRUCTURES.invalidate()
    }
}
