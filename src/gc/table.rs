//! In-memory handle storage.
//!
//! [`InMemoryHandleTable`] is a complete [`HandleTable`] for embedders that do not
//! bring their own handle storage, and the table the crate's tests scan.
//!
//! # Layout
//!
//! Handles live in segments, each behind its own `RwLock`. Segment `i` is
//! swept by worker `i % thread_count`, so parallel workers never touch the same
//! segment and a single worker sweeps all of them. New handles are spread
//! round-robin across segments.
//!
//! # Ages
//!
//! Every handle carries the age of the youngest generation its referent may
//! live in. A collection of generation `n` only visits handles of age `n` or
//! below, except full collections (`condemned >= max_gen`) which visit all.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    RwLock,
};

use crate::{
    gc::{
        collaborators::{DependentVisitor, HandleTable, HandleVisitor},
        types::{HandleId, HandleType, ObjectRef, ScanContext},
    },
    Error, Result,
};

#[derive(Clone, Debug)]
struct HandleEntry {
    handle_type: HandleType,
    referent: ObjectRef,
    secondary: ObjectRef,
    extra: usize,
    age: u32,
    live: bool,
}

impl HandleEntry {
    fn in_scope(&self, condemned: u32, max_gen: u32) -> bool {
        self.live && (condemned >= max_gen || self.age <= condemned)
    }
}

/// Segmented handle storage implementing [`HandleTable`].
#[derive(Debug)]
pub struct InMemoryHandleTable {
    segments: Vec<RwLock<Vec<HandleEntry>>>,
    next_segment: AtomicUsize,
}

impl InMemoryHandleTable {
    /// Creates a table with `segments` storage segments (at least one).
    #[must_use]
    pub fn new(segments: usize) -> Self {
        InMemoryHandleTable {
            segments: (0..segments.max(1)).map(|_| RwLock::new(Vec::new())).collect(),
            next_segment: AtomicUsize::new(0),
        }
    }

    /// Number of storage segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Creates a single-referent handle.
    ///
    /// # Panics
    ///
    /// Panics for [`HandleType::Dependent`]; use [`create_dependent`](Self::create_dependent).
    pub fn create_handle(&self, handle_type: HandleType, referent: ObjectRef) -> HandleId {
        self.create_handle_with_extra(handle_type, referent, 0)
    }

    /// Creates a single-referent handle with an extra info word (reference
    /// count, interior pointer or retained size).
    ///
    /// # Panics
    ///
    /// Panics for [`HandleType::Dependent`].
    pub fn create_handle_with_extra(&self, handle_type: HandleType, referent: ObjectRef, extra: usize) -> HandleId {
        if handle_type == HandleType::Dependent {
            contract_violation!("dependent handles are created with create_dependent");
        }
        self.insert(HandleEntry {
            handle_type,
            referent,
            secondary: ObjectRef::NULL,
            extra,
            age: 0,
            live: true,
        })
    }

    /// Creates a dependent handle. A null primary never keeps a secondary.
    pub fn create_dependent(&self, primary: ObjectRef, secondary: ObjectRef) -> HandleId {
        self.insert(HandleEntry {
            handle_type: HandleType::Dependent,
            referent: primary,
            secondary: if primary.is_null() { ObjectRef::NULL } else { secondary },
            extra: 0,
            age: 0,
            live: true,
        })
    }

    /// Destroys a handle. Its slot is not reused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleNotFound`] if the handle does not exist or was
    /// already destroyed.
    pub fn destroy(&self, id: HandleId) -> Result<()> {
        self.with_entry_mut(id, |entry| {
            entry.live = false;
            entry.referent = ObjectRef::NULL;
            entry.secondary = ObjectRef::NULL;
        })
    }

    /// Returns the referent (the primary, for dependent handles).
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleNotFound`] for unknown or destroyed handles.
    pub fn referent(&self, id: HandleId) -> Result<ObjectRef> {
        self.with_entry(id, |entry| entry.referent)
    }

    /// Returns the secondary of a dependent handle (null for other kinds).
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleNotFound`] for unknown or destroyed handles.
    pub fn secondary(&self, id: HandleId) -> Result<ObjectRef> {
        self.with_entry(id, |entry| entry.secondary)
    }

    /// Returns the extra info word.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleNotFound`] for unknown or destroyed handles.
    pub fn extra(&self, id: HandleId) -> Result<usize> {
        self.with_entry(id, |entry| entry.extra)
    }

    /// Returns the handle's age.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleNotFound`] for unknown or destroyed handles.
    pub fn age(&self, id: HandleId) -> Result<u32> {
        self.with_entry(id, |entry| entry.age)
    }

    /// Returns the handle's kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleNotFound`] for unknown or destroyed handles.
    pub fn handle_type(&self, id: HandleId) -> Result<HandleType> {
        self.with_entry(id, |entry| entry.handle_type)
    }

    /// Stores a new referent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleNotFound`] for unknown or destroyed handles.
    pub fn set_referent(&self, id: HandleId, referent: ObjectRef) -> Result<()> {
        self.with_entry_mut(id, |entry| {
            entry.referent = referent;
            if entry.handle_type == HandleType::Dependent && referent.is_null() {
                entry.secondary = ObjectRef::NULL;
            }
        })
    }

    /// Stores a new extra info word.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleNotFound`] for unknown or destroyed handles.
    pub fn set_extra(&self, id: HandleId, extra: usize) -> Result<()> {
        self.with_entry_mut(id, |entry| entry.extra = extra)
    }

    /// Number of live handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| read_lock!(segment).iter().filter(|e| e.live).count())
            .sum()
    }

    fn insert(&self, entry: HandleEntry) -> HandleId {
        let segment = self.next_segment.fetch_add(1, Ordering::Relaxed) % self.segments.len();
        let mut entries = write_lock!(self.segments[segment]);
        entries.push(entry);
        HandleId::new(segment as u32, (entries.len() - 1) as u32)
    }

    fn with_entry<T>(&self, id: HandleId, f: impl FnOnce(&HandleEntry) -> T) -> Result<T> {
        let segment = self
            .segments
            .get(id.segment as usize)
            .ok_or(Error::HandleNotFound(id))?;
        let entries = read_lock!(segment);
        match entries.get(id.index as usize) {
            Some(entry) if entry.live => Ok(f(entry)),
            _ => Err(Error::HandleNotFound(id)),
        }
    }

    fn with_entry_mut<T>(&self, id: HandleId, f: impl FnOnce(&mut HandleEntry) -> T) -> Result<T> {
        let segment = self
            .segments
            .get(id.segment as usize)
            .ok_or(Error::HandleNotFound(id))?;
        let mut entries = write_lock!(segment);
        match entries.get_mut(id.index as usize) {
            Some(entry) if entry.live => Ok(f(entry)),
            _ => Err(Error::HandleNotFound(id)),
        }
    }

    /// Segments swept by the worker owning `sc`.
    fn owned_segments<'s>(&'s self, sc: &ScanContext) -> impl Iterator<Item = (usize, &'s RwLock<Vec<HandleEntry>>)> + 's {
        let (worker, workers) = (sc.thread_number, sc.thread_count.max(1));
        self.segments
            .iter()
            .enumerate()
            .filter(move |(index, _)| index % workers == worker)
    }
}

impl HandleTable for InMemoryHandleTable {
    fn for_each_handle(
        &self,
        types: &[HandleType],
        condemned: u32,
        max_gen: u32,
        sc: &ScanContext,
        visit: &mut HandleVisitor<'_>,
    ) {
        for (segment, entries) in self.owned_segments(sc) {
            let mut entries = write_lock!(entries);
            for (index, entry) in entries.iter_mut().enumerate() {
                if entry.handle_type == HandleType::Dependent
                    || !types.contains(&entry.handle_type)
                    || !entry.in_scope(condemned, max_gen)
                {
                    continue;
                }
                visit(
                    HandleId::new(segment as u32, index as u32),
                    entry.handle_type,
                    &mut entry.referent,
                    &mut entry.extra,
                );
            }
        }
    }

    fn for_each_dependent(&self, condemned: u32, max_gen: u32, sc: &ScanContext, visit: &mut DependentVisitor<'_>) {
        for (segment, entries) in self.owned_segments(sc) {
            let mut entries = write_lock!(entries);
            for (index, entry) in entries.iter_mut().enumerate() {
                if entry.handle_type != HandleType::Dependent || !entry.in_scope(condemned, max_gen) {
                    continue;
                }
                visit(
                    HandleId::new(segment as u32, index as u32),
                    &mut entry.referent,
                    &mut entry.secondary,
                );
            }
        }
    }

    fn rejuvenate_handles(&self, condemned: u32, max_gen: u32, sc: &ScanContext) {
        for (_, entries) in self.owned_segments(sc) {
            for entry in write_lock!(entries).iter_mut() {
                if entry.in_scope(condemned, max_gen) {
                    entry.age = 0;
                }
            }
        }
    }

    fn age_handles(&self, condemned: u32, max_gen: u32, sc: &ScanContext) {
        for (_, entries) in self.owned_segments(sc) {
            for entry in write_lock!(entries).iter_mut() {
                if entry.in_scope(condemned, max_gen) && !entry.referent.is_null() {
                    entry.age = (entry.age + 1).min(max_gen);
                }
            }
        }
    }

    fn verify(&self, _condemned: u32, max_gen: u32, sc: &ScanContext) -> bool {
        self.owned_segments(sc).all(|(_, entries)| {
            read_lock!(entries).iter().filter(|e| e.live).all(|entry| {
                let dependent_ok = entry.handle_type != HandleType::Dependent
                    || !entry.referent.is_null()
                    || entry.secondary.is_null();
                entry.age <= max_gen && dependent_ok
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::obj;

    #[test]
    fn test_create_and_query() -> Result<()> {
        let table = InMemoryHandleTable::new(2);
        let strong = table.create_handle(HandleType::Strong, obj(1));
        let dependent = table.create_dependent(obj(2), obj(3));

        assert_ne!(strong.segment, dependent.segment);
        assert_eq!(table.referent(strong)?, obj(1));
        assert_eq!(table.secondary(dependent)?, obj(3));
        assert_eq!(table.handle_type(dependent)?, HandleType::Dependent);
        assert_eq!(table.handle_count(), 2);

        table.destroy(strong)?;
        assert!(matches!(table.referent(strong), Err(Error::HandleNotFound(_))));
        assert!(table.destroy(strong).is_err());
        assert_eq!(table.handle_count(), 1);
        Ok(())
    }

    #[test]
    fn test_null_primary_drops_secondary() -> Result<()> {
        let table = InMemoryHandleTable::new(1);
        let h = table.create_dependent(ObjectRef::NULL, obj(3));
        assert!(table.secondary(h)?.is_null());

        let h = table.create_dependent(obj(1), obj(3));
        table.set_referent(h, ObjectRef::NULL)?;
        assert!(table.secondary(h)?.is_null());
        Ok(())
    }

    #[test]
    fn test_workers_sweep_disjoint_segments() {
        let table = InMemoryHandleTable::new(4);
        for n in 1..=8 {
            table.create_handle(HandleType::Strong, obj(n));
        }

        let mut seen = Vec::new();
        for worker in 0..2 {
            let sc = ScanContext::new(worker, 2);
            table.for_each_handle(&[HandleType::Strong], 2, 2, &sc, &mut |id, _, _, _| {
                assert_eq!(id.segment as usize % 2, worker);
                seen.push(id);
            });
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_aging_limits_ephemeral_scans() -> Result<()> {
        let table = InMemoryHandleTable::new(1);
        let h = table.create_handle(HandleType::Strong, obj(1));
        let sc = ScanContext::default();

        table.age_handles(0, 2, &sc);
        assert_eq!(table.age(h)?, 1);

        let mut visited = 0;
        table.for_each_handle(&[HandleType::Strong], 0, 2, &sc, &mut |_, _, _, _| visited += 1);
        assert_eq!(visited, 0);

        table.age_handles(1, 2, &sc);
        table.age_handles(2, 2, &sc);
        assert_eq!(table.age(h)?, 2);

        table.rejuvenate_handles(2, 2, &sc);
        assert_eq!(table.age(h)?, 0);
        assert!(table.verify(2, 2, &sc));
        Ok(())
    }
}
