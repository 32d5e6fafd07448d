//! Slab allocator for exception trackers.
//!
//! # Overview
//!
//! Trackers are allocated on the first chance of every exception and freed
//! when the dispatch finishes, so allocation sits on a hot and failure-sensitive
//! path. The allocator keeps a list of fixed-size pages. Each page holds a small
//! header and an array of tracker slots; a slot is free while its tracker has
//! no owner.
//!
//! Every slot carries a generation that is bumped each time the slot is handed
//! out, and every [`TrackerId`] records the generation it was issued for.
//! Lookups go through [`TrackerAllocator::with_tracker`] and friends, which
//! reject an id whose slot is free or has been handed out again since.
//!
//! Every operation runs under a single mutex.
//!
//! # Growth and Exhaustion
//!
//! When every slot is taken a new page is appended. Page growth uses fallible
//! reservation and honors [`TrackerAllocatorConfig::max_pages`]. A failed growth
//! is retried `max_oom_spins` times, sleeping `oom_spin_delay` in between, before
//! [`Error::TrackerAllocationFailed`] is returned.

use std::{mem, sync::Mutex, thread};

use log::{debug, warn};

use crate::{
    config::TrackerAllocatorConfig,
    eh::tracker::{ExceptionTracker, ThreadId, TrackerId},
    gc::ObjectRef,
    Error, Result,
};

/// Which parts of a tracker [`TrackerAllocator::free_tracker_memory`] releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerMemoryType {
    /// The reference to the thrown object.
    Managed,
    /// The slot itself.
    Unmanaged,
    /// Both.
    Both,
}

/// Per-page bookkeeping that precedes the slot array.
#[derive(Debug, Default)]
pub(crate) struct PageHeader {
    /// No slot below this index is free.
    first_free: usize,
}

#[derive(Debug, Default)]
struct TrackerSlot {
    generation: u32,
    tracker: ExceptionTracker,
}

impl TrackerSlot {
    fn holds(&self, id: TrackerId) -> bool {
        self.generation == id.generation() && self.tracker.is_live()
    }
}

#[derive(Debug)]
struct TrackerPage {
    header: PageHeader,
    slots: Box<[TrackerSlot]>,
}

impl TrackerPage {
    /// Hands out the first free slot at or after the first-free hint.
    ///
    /// A slot whose id cannot be represented is never handed out.
    fn claim(&mut self, page_index: usize, owner: ThreadId) -> Option<TrackerId> {
        let start = self.header.first_free.min(self.slots.len());
        let index = (start..self.slots.len())
            .chain(0..start)
            .find(|&i| !self.slots[i].tracker.is_live())?;

        let slot = &mut self.slots[index];
        let generation = slot.generation.wrapping_add(1);
        let id = TrackerId::new(page_index, index, generation)?;
        slot.generation = generation;
        slot.tracker = ExceptionTracker::new(owner);
        self.header.first_free = index + 1;
        Some(id)
    }

    fn slot(&self, id: TrackerId) -> Option<&TrackerSlot> {
        self.slots.get(id.slot()).filter(|s| s.holds(id))
    }

    fn slot_mut(&mut self, id: TrackerId) -> Option<&mut TrackerSlot> {
        self.slots.get_mut(id.slot()).filter(|s| s.holds(id))
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.tracker.is_live()).count()
    }
}

/// One thread's tracker chain, newest first, read under the allocator lock.
///
/// Iteration stops early at a link that has been retired or belongs to another
/// thread; [`TrackerAllocator::with_chain`] reports that link.
pub(crate) struct TrackerChain<'p> {
    pages: &'p [TrackerPage],
    owner: ThreadId,
    next: Option<TrackerId>,
    broken: Option<TrackerId>,
}

impl<'p> Iterator for TrackerChain<'p> {
    type Item = (TrackerId, &'p ExceptionTracker);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match self.pages.get(id.page()).and_then(|p| p.slot(id)) {
            Some(slot) if slot.tracker.owner == Some(self.owner) => {
                self.next = slot.tracker.previous;
                Some((id, &slot.tracker))
            }
            _ => {
                self.broken = Some(id);
                None
            }
        }
    }
}

/// The tracker slab shared by every thread of a runtime.
#[derive(Debug)]
pub struct TrackerAllocator {
    config: TrackerAllocatorConfig,
    trackers_per_page: usize,
    pages: Mutex<Vec<TrackerPage>>,
}

impl TrackerAllocator {
    /// Creates an allocator with no pages.
    ///
    /// # Arguments
    ///
    /// * `config` - Page size, page limit and retry policy
    #[must_use]
    pub fn new(config: TrackerAllocatorConfig) -> Self {
        let trackers_per_page = (config
            .page_size
            .saturating_sub(mem::size_of::<PageHeader>())
            / mem::size_of::<TrackerSlot>())
        .max(1);

        TrackerAllocator {
            config,
            trackers_per_page,
            pages: Mutex::new(Vec::new()),
        }
    }

    /// The configuration the allocator was created with.
    #[must_use]
    pub fn config(&self) -> &TrackerAllocatorConfig {
        &self.config
    }

    /// How many trackers fit on one page.
    #[must_use]
    pub fn trackers_per_page(&self) -> usize {
        self.trackers_per_page
    }

    /// Number of pages currently held.
    #[must_use]
    pub fn page_count(&self) -> usize {
        lock!(self.pages).len()
    }

    /// Number of slots currently holding a tracker.
    #[must_use]
    pub fn live_trackers(&self) -> usize {
        lock!(self.pages).iter().map(TrackerPage::live).sum()
    }

    /// Allocates a fresh tracker owned by `owner`.
    ///
    /// Free slots are reused before a new page is added.
    ///
    /// # Arguments
    ///
    /// * `owner` - The thread the tracker belongs to
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrackerAllocationFailed`] if every slot is taken and the
    /// page list could not grow on any attempt.
    pub fn get_tracker_memory(&self, owner: ThreadId) -> Result<TrackerId> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            {
                let mut pages = lock!(self.pages);
                for (page_index, page) in pages.iter_mut().enumerate() {
                    if let Some(id) = page.claim(page_index, owner) {
                        return Ok(id);
                    }
                }

                if let Some(page_index) = self.grow(&mut pages) {
                    if let Some(id) = pages[page_index].claim(page_index, owner) {
                        return Ok(id);
                    }
                }
            }

            if attempts > self.config.max_oom_spins {
                return Err(Error::TrackerAllocationFailed { attempts });
            }
            warn!(
                "Tracker allocation for {} failed (attempt {} of {}), retrying",
                owner,
                attempts,
                self.config.max_oom_spins + 1
            );
            thread::sleep(self.config.oom_spin_delay);
        }
    }

    fn grow(&self, pages: &mut Vec<TrackerPage>) -> Option<usize> {
        if let Some(max) = self.config.max_pages {
            if pages.len() >= max {
                return None;
            }
        }

        pages.try_reserve(1).ok()?;
        let mut slots = Vec::new();
        slots.try_reserve_exact(self.trackers_per_page).ok()?;
        slots.resize_with(self.trackers_per_page, TrackerSlot::default);

        pages.push(TrackerPage {
            header: PageHeader::default(),
            slots: slots.into_boxed_slice(),
        });
        debug!(
            "Tracker allocator grew to {} pages ({} slots)",
            pages.len(),
            pages.len() * self.trackers_per_page
        );
        Some(pages.len() - 1)
    }

    /// Releases parts of a tracker.
    ///
    /// # Arguments
    ///
    /// * `id` - The tracker to release
    /// * `mem` - [`TrackerMemoryType::Managed`] drops the thrown object,
    ///   [`TrackerMemoryType::Unmanaged`] returns the slot to the free pool
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTracker`] if `id` is outside every page or its
    /// slot has been handed out again since `id` was issued.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation if the tracker is already free.
    pub fn free_tracker_memory(&self, id: TrackerId, mem: TrackerMemoryType) -> Result<()> {
        let mut pages = lock!(self.pages);
        let page = pages
            .get_mut(id.page())
            .filter(|p| id.slot() < p.slots.len())
            .ok_or(Error::InvalidTracker(id))?;

        let slot = &mut page.slots[id.slot()];
        if slot.generation != id.generation() {
            return Err(Error::InvalidTracker(id));
        }
        if !slot.tracker.is_live() {
            contract_violation!("tracker {} freed twice", id);
        }

        let tracker = &mut slot.tracker;
        if matches!(mem, TrackerMemoryType::Managed | TrackerMemoryType::Both) {
            tracker.throwable = ObjectRef::NULL;
        }
        if matches!(mem, TrackerMemoryType::Unmanaged | TrackerMemoryType::Both) {
            *tracker = ExceptionTracker::default();
            page.header.first_free = page.header.first_free.min(id.slot());
        }
        Ok(())
    }

    /// Runs `f` on a live tracker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTracker`] if `id` has been retired.
    pub fn with_tracker<R>(&self, id: TrackerId, f: impl FnOnce(&ExceptionTracker) -> R) -> Result<R> {
        let pages = lock!(self.pages);
        match pages.get(id.page()).and_then(|p| p.slot(id)) {
            Some(slot) => Ok(f(&slot.tracker)),
            None => Err(Error::InvalidTracker(id)),
        }
    }

    /// Runs `f` on a live tracker with mutable access.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTracker`] if `id` has been retired.
    pub fn with_tracker_mut<R>(
        &self,
        id: TrackerId,
        f: impl FnOnce(&mut ExceptionTracker) -> R,
    ) -> Result<R> {
        let mut pages = lock!(self.pages);
        match pages.get_mut(id.page()).and_then(|p| p.slot_mut(id)) {
            Some(slot) => Ok(f(&mut slot.tracker)),
            None => Err(Error::InvalidTracker(id)),
        }
    }

    /// Runs `f` over the chain starting at `head` without releasing the lock
    /// between links.
    ///
    /// `f` must not call back into the allocator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTracker`] with the offending link if `f` walked
    /// into a retired tracker or one not owned by `owner`.
    pub(crate) fn with_chain<R>(
        &self,
        head: Option<TrackerId>,
        owner: ThreadId,
        f: impl FnOnce(&mut TrackerChain<'_>) -> R,
    ) -> Result<R> {
        let pages = lock!(self.pages);
        let mut chain = TrackerChain {
            pages: pages.as_slice(),
            owner,
            next: head,
            broken: None,
        };
        let result = f(&mut chain);
        match chain.broken {
            Some(id) => Err(Error::InvalidTracker(id)),
            None => Ok(result),
        }
    }

    /// A copy of a live tracker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTracker`] if `id` has been retired.
    pub fn snapshot(&self, id: TrackerId) -> Result<ExceptionTracker> {
        self.with_tracker(id, ExceptionTracker::clone)
    }

    /// Releases every page.
    ///
    /// # Panics
    ///
    /// Panics with a contract violation if any tracker is still live.
    pub fn terminate(&self) {
        let mut pages = lock!(self.pages);
        let live: usize = pages.iter().map(TrackerPage::live).sum();
        if live > 0 {
            contract_violation!("tracker allocator terminated with {} live trackers", live);
        }
        debug!("Tracker allocator released {} pages", pages.len());
        pages.clear();
        pages.shrink_to_fit();
    }
}
