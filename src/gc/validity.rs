//! Process-wide "GC runtime structures are valid" state.
//!
//! Code that mutates collector-owned structures outside a collection suspends
//! their validity for the duration of the mutation. Suspensions nest: validity
//! returns only when every suspension has ended. The state is a single atomic
//! counter, shared by arbitrary threads without a lock.
//!
//! Suspension is only available in scoped form through [`InvalidationGuard`],
//! so a suspension cannot outlive its scope or be released twice.

use std::sync::atomic::{AtomicI32, Ordering};

/// The validity counter shared by the whole process.
pub static GC_RUNTIME_STRUCTURES: StructureValidity = StructureValidity::new();

/// A reentrant invalid-count. Valid when the count is zero.
#[derive(Debug, Default)]
pub struct StructureValidity {
    invalid_count: AtomicI32,
}

impl StructureValidity {
    /// Creates a counter in the valid state.
    #[must_use]
    pub const fn new() -> Self {
        StructureValidity {
            invalid_count: AtomicI32::new(0),
        }
    }

    /// Returns `true` when no suspension is active.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.invalid_count.load(Ordering::SeqCst) == 0
    }

    /// Number of active suspensions.
    #[must_use]
    pub fn invalid_count(&self) -> i32 {
        self.invalid_count.load(Ordering::SeqCst)
    }

    /// Suspends validity until the returned guard is dropped.
    #[must_use = "validity is restored as soon as the guard is dropped"]
    pub fn invalidate(&self) -> InvalidationGuard<'_> {
        let previous = self.invalid_count.fetch_add(1, Ordering::SeqCst);
        if previous < 0 {
            contract_violation!("invalid-structures count was negative ({})", previous);
        }
        InvalidationGuard { validity: self }
    }

    fn restore(&self) {
        let previous = self.invalid_count.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            contract_violation!("invalid-structures count went negative ({})", previous - 1);
        }
    }
}

/// Scoped suspension of structure validity.
#[derive(Debug)]
pub struct InvalidationGuard<'v> {
    validity: &'v StructureValidity,
}

impl Drop for InvalidationGuard<'_> {
    fn drop(&mut self) {
        self.validity.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_guards_restore_validity() {
        let validity = StructureValidity::new();
        assert!(validity.is_valid());
        {
            let _outer = validity.invalidate();
            assert!(!validity.is_valid());
            {
                let _inner = validity.invalidate();
                assert_eq!(validity.invalid_count(), 2);
            }
            assert_eq!(validity.invalid_count(), 1);
            assert!(!validity.is_valid());
        }
        assert!(validity.is_valid());
        assert_eq!(validity.invalid_count(), 0);
    }

    #[test]
    fn test_guards_released_out_of_order() {
        let validity = StructureValidity::new();
        let a = validity.invalidate();
        let b = validity.invalidate();
        drop(a);
        assert!(!validity.is_valid());
        drop(b);
        assert!(validity.is_valid());
    }

    #[test]
    fn test_count_never_negative_across_sequences() {
        let validity = StructureValidity::new();
        for depth in 0..8 {
            let guards: Vec<_> = (0..depth).map(|_| validity.invalidate()).collect();
            assert_eq!(validity.invalid_count(), depth);
            drop(guards);
            assert!(validity.invalid_count() >= 0);
            assert!(validity.is_valid());
        }
    }
}
