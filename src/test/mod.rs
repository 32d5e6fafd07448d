//! Collaborators used by unit tests: a marking heap, a recording execution
//! environment and a recording handle table.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use dashmap::{DashMap, DashSet};

use crate::gc::{
    collaborators::{DependentVisitor, ExecutionEnvironment, GcHeap, HandleTable, HandleVisitor},
    table::InMemoryHandleTable,
    types::{HandleType, ObjectRef, PromoteFlags, PromoteFn, ScanContext},
};

/// Object number `n` as an address.
pub fn obj(n: usize) -> ObjectRef {
    ObjectRef::new(0x1000 + n * 0x10)
}

/// A heap with explicit object edges, a mark set and a mark stack.
///
/// Promotion marks the object and pushes it; [`MarkHeap::drain`] traces edges
/// of pushed objects. In the relocate phase promotion rewrites slots through
/// the forwarding table.
#[derive(Default)]
pub struct MarkHeap {
    marks: DashSet<ObjectRef>,
    pinned: DashSet<ObjectRef>,
    edges: DashMap<ObjectRef, Vec<ObjectRef>>,
    forwarding: DashMap<ObjectRef, ObjectRef>,
    mark_stack: Mutex<Vec<ObjectRef>>,
    promote_calls: AtomicUsize,
}

impl MarkHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&self, from: ObjectRef, to: ObjectRef) {
        self.edges.entry(from).or_default().push(to);
    }

    pub fn set_forwarding(&self, from: ObjectRef, to: ObjectRef) {
        self.forwarding.insert(from, to);
    }

    pub fn mark_root(&self, o: ObjectRef) {
        self.mark(o);
    }

    pub fn is_pinned(&self, o: ObjectRef) -> bool {
        self.pinned.contains(&o)
    }

    pub fn promote_calls(&self) -> usize {
        self.promote_calls.load(Ordering::SeqCst)
    }

    fn mark(&self, o: ObjectRef) -> bool {
        if o.is_null() || !self.marks.insert(o) {
            return false;
        }
        lock!(self.mark_stack).push(o);
        true
    }

    /// Traces everything reachable from the mark stack. Returns `true` if a new
    /// object was marked.
    pub fn drain(&self) -> bool {
        let mut marked_any = false;
        loop {
            let next = lock!(self.mark_stack).pop();
            let Some(o) = next else {
                break;
            };
            let children = self.edges.get(&o).map(|c| c.value().clone()).unwrap_or_default();
            for child in children {
                marked_any |= self.mark(child);
            }
        }
        marked_any
    }

    pub fn promoter(&self) -> impl Fn(&mut ObjectRef, &ScanContext, PromoteFlags) + Sync + '_ {
        move |slot: &mut ObjectRef, sc: &ScanContext, flags: PromoteFlags| {
            self.promote_calls.fetch_add(1, Ordering::SeqCst);
            if sc.promotion {
                if flags.contains(PromoteFlags::PINNED) {
                    self.pinned.insert(*slot);
                }
                self.mark(*slot);
            } else if let Some(to) = self.forwarding.get(&*slot) {
                *slot = *to;
            }
        }
    }
}

impl GcHeap for MarkHeap {
    fn is_promoted(&self, obj: ObjectRef) -> bool {
        self.marks.contains(&obj)
    }
}

/// An execution environment with a fixed root set and sync-block cache, which
/// records the hooks it receives.
#[derive(Default)]
pub struct RecordingEnvironment {
    pub roots: Mutex<Vec<ObjectRef>>,
    pub sync_block_cache: Mutex<Vec<ObjectRef>>,
    pub calls: Mutex<Vec<String>>,
}

impl RecordingEnvironment {
    pub fn with_roots(roots: &[ObjectRef]) -> Self {
        RecordingEnvironment {
            roots: Mutex::new(roots.to_vec()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        lock!(self.calls).clone()
    }
}

impl ExecutionEnvironment for RecordingEnvironment {
    fn scan_roots(&self, promote: &PromoteFn<'_>, _condemned: u32, _max_gen: u32, sc: &ScanContext) {
        lock!(self.calls).push("scan_roots".to_string());
        for root in lock!(self.roots).iter_mut() {
            promote(root, sc, PromoteFlags::empty());
        }
    }

    fn sync_block_cache_weak_ptr_scan(&self, clear: &mut dyn FnMut(&mut ObjectRef)) {
        lock!(self.calls).push("sync_block_cache_weak_ptr_scan".to_string());
        for entry in lock!(self.sync_block_cache).iter_mut() {
            clear(entry);
        }
    }

    fn sync_block_cache_demote(&self, max_gen: u32) {
        lock!(self.calls).push(format!("sync_block_cache_demote({max_gen})"));
    }

    fn sync_block_cache_promotions_granted(&self, max_gen: u32) {
        lock!(self.calls).push(format!("sync_block_cache_promotions_granted({max_gen})"));
    }
}

/// An [`InMemoryHandleTable`] that records which scan operations ran, in order.
pub struct RecordingTable {
    pub inner: InMemoryHandleTable,
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingTable {
    pub fn new(segments: usize) -> Self {
        RecordingTable {
            inner: InMemoryHandleTable::new(segments),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock!(self.calls).clone()
    }

    fn record(&self, name: &'static str) {
        lock!(self.calls).push(name);
    }
}

impl HandleTable for RecordingTable {
    fn for_each_handle(
        &self,
        types: &[HandleType],
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
        visit: &mut HandleVisitor<'_>,
    ) {
        self.inner.for_each_handle(types, condemned, max_gen, sc, visit);
    }

    fn for_each_dependent(&self, condemned: u32, max_gen: u32, sc: &ScanContext, visit: &mut DependentVisitor<'_>) {
        self.inner.for_each_dependent(condemned, max_gen, sc, visit);
    }

    fn rejuvenate_handles(&self, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.record("rejuvenate_handles");
        self.inner.rejuvenate_handles(condemned, max_gen, sc);
    }

    fn age_handles(&self, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.record("age_handles");
        self.inner.age_handles(condemned, max_gen, sc);
    }

    fn verify(&self, condemned: u32, max_gen: u32, sc: &ScanContext) -> bool {
        self.record("verify");
        self.inner.verify(condemned, max_gen, sc)
    }

    fn trace_pinning_roots(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.record("trace_pinning_roots");
        self.inner.trace_pinning_roots(promote, condemned, max_gen, sc);
    }

    fn trace_normal_roots(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.record("trace_normal_roots");
        self.inner.trace_normal_roots(promote, condemned, max_gen, sc);
    }

    fn update_pointers(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.record("update_pointers");
        self.inner.update_pointers(promote, condemned, max_gen, sc);
    }

    fn update_pinned_pointers(&self, promote: &PromoteFn<'_>, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.record("update_pinned_pointers");
        self.inner.update_pinned_pointers(promote, condemned, max_gen, sc);
    }

    fn scan_dependent_handles_for_relocation(
        &self,
        promote: &PromoteFn<'_>,
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
    ) {
        self.record("scan_dependent_handles_for_relocation");
        self.inner
            .scan_dependent_handles_for_relocation(promote, condemned, max_gen, sc);
    }

    fn scan_weak_interior_pointers_for_relocation(
        &self,
        promote: &PromoteFn<'_>,
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
    ) {
        self.record("scan_weak_interior_pointers_for_relocation");
        self.inner
            .scan_weak_interior_pointers_for_relocation(promote, condemned, max_gen, sc);
    }

    fn check_reachable(&self, heap: &dyn GcHeap, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.record("check_reachable");
        self.inner.check_reachable(heap, condemned, max_gen, sc);
    }

    fn check_alive(&self, heap: &dyn GcHeap, condemned: u32, max_gen: u32, sc: &ScanContext) {
        self.record("check_alive");
        self.inner.check_alive(heap, condemned, max_gen, sc);
    }

    fn scan_dependent_handles_for_clearing(
        &self,
        heap: &dyn GcHeap,
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
    ) {
        self.record("scan_dependent_handles_for_clearing");
        self.inner
            .scan_dependent_handles_for_clearing(heap, condemned, max_gen, sc);
    }
}
