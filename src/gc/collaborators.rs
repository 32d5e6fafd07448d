//! Collaborator traits the scan coordinator drives.
//!
//! # Overview
//!
//! The coordinator never owns roots or handles. It sequences calls into three
//! collaborators supplied by the runtime:
//!
//! - [`ExecutionEnvironment`] - Stack and register roots, plus the sync-block
//!   cache (an auxiliary per-object hash cache with its own weak entries)
//! - [`HandleTable`] - Handle storage. Implementations supply two enumeration
//!   primitives and handle aging; every scan operation has a provided body built
//!   on those primitives, so the per-kind semantics live in one place
//! - [`GcHeap`] - Answers whether an object has been promoted in the current
//!   collection
//!
//! # Scan Coverage
//!
//! | Operation | Kinds visited | Effect |
//! |---|---|---|
//! | [`HandleTable::trace_pinning_roots`] | pinned, async-pinned | promote with [`PromoteFlags::PINNED`] |
//! | [`HandleTable::trace_normal_roots`] | strong, counted (count > 0), sized-ref | promote |
//! | [`HandleTable::update_pointers`] | weak, strong, counted, sized-ref, dependent primaries | relocate |
//! | [`HandleTable::update_pinned_pointers`] | pinned, async-pinned | relocate |
//! | [`HandleTable::check_reachable`] | long weak, counted (count = 0), weak interior | null if dead |
//! | [`HandleTable::check_alive`] | short weak | null if dead |

use crate::gc::{
    dependent::DhContext,
    types::{HandleId, HandleInfo, HandleScanFn, HandleType, ObjectRef, PromoteFlags, PromoteFn, ScanContext},
};

/// Visitor over single-referent handles: id, kind, referent slot, extra info word.
pub type HandleVisitor<'v> = dyn FnMut(HandleId, HandleType, &mut ObjectRef, &mut usize) + 'v;

/// Visitor over dependent handles: id, primary slot, secondary slot.
pub type DependentVisitor<'v> = dyn FnMut(HandleId, &mut ObjectRef, &mut ObjectRef) + 'v;

/// The collector's view of object liveness.
pub trait GcHeap: Sync {
    /// Returns `true` if `obj` has been marked reachable in the current collection.
    ///
    /// Objects outside the condemned generations count as promoted.
    fn is_promoted(&self, obj: ObjectRef) -> bool;
}

/// Runtime services outside the handle table.
pub trait ExecutionEnvironment: Sync {
    /// Enumerates stack and register roots of every managed thread, invoking
    /// `promote` once per root slot.
    fn scan_roots(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext);

    /// Offers every weak sync-block-cache entry to `clear`, which nulls entries
    /// whose object died.
    fn sync_block_cache_weak_ptr_scan(&self, clear: &mut dyn FnMut(&mut ObjectRef));

    /// Called when objects of `max_gen` and below are demoted.
    fn sync_block_cache_demote(&self, max_gen: u32);

    /// Called when surviving objects of `max_gen` and below are promoted a generation.
    fn sync_block_cache_promotions_granted(&self, max_gen: u32);
}

/// Handle storage as seen by the scan coordinator.
///
/// Implementations provide the enumeration primitives and aging; the scan
/// operations have provided bodies. `for_each_*` must only visit handles that
/// belong to the calling worker (as identified by `sc.thread_number`) and whose
/// age places them in the collected generations.
pub trait HandleTable: Sync {
    /// Visits every handle of the given kinds in scope for this collection.
    fn for_each_handle(
        &self,
        types: &[HandleType],
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
        visit: &mut HandleVisitor<'_>,
    );

    /// Visits every dependent handle in scope for this collection.
    fn for_each_dependent(
        &self,
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
        visit: &mut DependentVisitor<'_>,
    );

    /// Resets the age of handles in the condemned generations to 0.
    fn rejuvenate_handles(&self, condemned: u32, max_gen: u32, sc: &ScanContext);

    /// Advances the age of handles that survived the condemned generations.
    fn age_handles(&self, condemned: u32, max_gen: u32, sc: &ScanContext);

    /// Checks the table's internal consistency. Returns `false` on corruption.
    fn verify(&self, _condemned: u32, _max_gen: u32, _sc: &ScanContext) -> bool {
        true
    }

    /// Promotes the referents of pinning handles.
    fn trace_pinning_roots(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.for_each_handle(HandleType::PINNING, condemned, max_gen, sc, &mut |_, _, slot, _| {
            if !slot.is_null() {
                promote(slot, sc, PromoteFlags::PINNED);
            }
        });
    }

    /// Promotes the referents of strong handles.
    ///
    /// Counted handles only act as roots while their count is non-zero.
    fn trace_normal_roots(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.for_each_handle(HandleType::STRONG, condemned, max_gen, sc, &mut |_, kind, slot, extra| {
            if slot.is_null() || (kind == HandleType::RefCounted && *extra == 0) {
                return;
            }
            promote(slot, sc, PromoteFlags::empty());
        });
    }

    /// Relocates every non-pinning referent, dependent primaries included.
    fn update_pointers(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        const RELOCATED: &[HandleType] = &[
            HandleType::WeakShort,
            HandleType::WeakLong,
            HandleType::Strong,
            HandleType::RefCounted,
            HandleType::SizedRef,
        ];
        self.for_each_handle(RELOCATED, condemned, max_gen, sc, &mut |_, _, slot, _| {
            if !slot.is_null() {
                promote(slot, sc, PromoteFlags::empty());
            }
        });
        self.for_each_dependent(condemned, max_gen, sc, &mut |_, primary, _| {
            if !primary.is_null() {
                promote(primary, sc, PromoteFlags::empty());
            }
        });
    }

    /// Relocates the referents of pinning handles.
    fn update_pinned_pointers(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.for_each_handle(HandleType::PINNING, condemned, max_gen, sc, &mut |_, _, slot, _| {
            if !slot.is_null() {
                promote(slot, sc, PromoteFlags::empty());
            }
        });
    }

    /// Relocates dependent secondaries whose primary survived.
    fn scan_dependent_handles_for_relocation(
        &self,
        promote: &PromoteFn<'_>,
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
    ) {
        self.for_each_dependent(condemned, max_gen, sc, &mut |_, primary, secondary| {
            if !primary.is_null() && !secondary.is_null() {
                promote(secondary, sc, PromoteFlags::empty());
            }
        });
    }

    /// Relocates weak interior pointer handles.
    ///
    /// The referent is relocated first and the interior pointer stored in the
    /// extra info word is moved by the same distance.
    fn scan_weak_interior_pointers_for_relocation(
        &self,
        promote: &PromoteFn<'_>,
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
    ) {
        self.for_each_handle(
            &[HandleType::WeakInteriorPointer],
            condemned,
            max_gen,
            sc,
            &mut |_, _, slot, interior| {
                if slot.is_null() {
                    return;
                }
                let old = slot.addr();
                promote(slot, sc, PromoteFlags::empty());
                let new = slot.addr();
                *interior = interior.wrapping_add(new.wrapping_sub(old));
            },
        );
    }

    /// Promotes the referents of sized-ref handles.
    fn scan_sized_refs(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.for_each_handle(&[HandleType::SizedRef], condemned, max_gen, sc, &mut |_, _, slot, _| {
            if !slot.is_null() {
                promote(slot, sc, PromoteFlags::empty());
            }
        });
    }

    /// Nulls long-weak referents that were not promoted.
    ///
    /// Counted handles with a zero count behave as long weak handles here.
    fn check_reachable(&self, heap: &dyn GcHeap, condemned: u32, max_gen: u32, sc: &ScanContext) {
        const CHECKED: &[HandleType] = &[
            HandleType::WeakLong,
            HandleType::RefCounted,
            HandleType::WeakInteriorPointer,
        ];
        self.for_each_handle(CHECKED, condemned, max_gen, sc, &mut |_, kind, slot, extra| {
            if slot.is_null() || (kind == HandleType::RefCounted && *extra != 0) {
                return;
            }
            if !heap.is_promoted(*slot) {
                *slot = ObjectRef::NULL;
                if kind == HandleType::WeakInteriorPointer {
                    *extra = 0;
                }
            }
        });
    }

    /// Nulls short-weak referents that were not promoted.
    fn check_alive(&self, heap: &dyn GcHeap, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.for_each_handle(&[HandleType::WeakShort], condemned, max_gen, sc, &mut |_, _, slot, _| {
            if !slot.is_null() && !heap.is_promoted(*slot) {
                *slot = ObjectRef::NULL;
            }
        });
    }

    /// Clears dependent handles whose primary is dead.
    ///
    /// Both halves are nulled together so a later relocation never sees a
    /// secondary without its primary.
    fn scan_dependent_handles_for_clearing(
        &self,
        heap: &dyn GcHeap,
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
    ) {
        self.for_each_dependent(condemned, max_gen, sc, &mut |_, primary, secondary| {
            if primary.is_null() || !heap.is_promoted(*primary) {
                *primary = ObjectRef::NULL;
                *secondary = ObjectRef::NULL;
            }
        });
    }

    /// Runs promotion sweeps over the dependent handles until a sweep promotes nothing.
    ///
    /// Both flags of `dh` are reset at the start of every sweep, so on return
    /// `dh.unpromoted_primaries()` describes the final sweep. Returns whether any
    /// sweep promoted a secondary; `dh.promoted()` holds the same value.
    fn scan_dependent_handles_for_promotion(&self, dh: &mut DhContext<'_>, heap: &dyn GcHeap) -> bool {
        let (condemned, max_gen, sc) = (dh.condemned(), dh.max_gen(), *dh.scan_context());
        let mut any_promotions = false;

        loop {
            dh.begin_sweep();
            self.for_each_dependent(condemned, max_gen, &sc, &mut |_, primary, secondary| {
                dh.promote_dependent(primary, secondary, heap);
            });
            if !dh.promoted() {
                break;
            }
            any_promotions = true;
        }

        dh.finish_pass(any_promotions);
        any_promotions
    }

    /// Reports every single-referent handle to `f` without mutating it.
    fn scan_handles_for_profiler(&self, max_gen: u32, sc: &ScanContext, f: &mut HandleScanFn<'_>) {
        const REPORTED: &[HandleType] = &[
            HandleType::WeakShort,
            HandleType::WeakLong,
            HandleType::Strong,
            HandleType::Pinned,
            HandleType::RefCounted,
            HandleType::AsyncPinned,
            HandleType::SizedRef,
            HandleType::WeakInteriorPointer,
        ];
        self.for_each_handle(REPORTED, max_gen, max_gen, sc, &mut |handle, handle_type, slot, extra| {
            f(&HandleInfo {
                handle,
                handle_type,
                referent: *slot,
                extra: *extra,
            });
        });
    }

    /// Reports every dependent handle to `f`; the secondary travels in `extra`.
    fn scan_dependent_handles_for_profiler(&self, max_gen: u32, sc: &ScanContext, f: &mut HandleScanFn<'_>) {
        self.for_each_dependent(max_gen, max_gen, sc, &mut |handle, primary, secondary| {
            f(&HandleInfo {
                handle,
                handle_type: HandleType::Dependent,
                referent: *primary,
                extra: secondary.addr(),
            });
        });
    }
}
