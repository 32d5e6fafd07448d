#![allow(unused_macros)]

// A poisoned lock means another thread panicked while holding it. Every panic in
// this crate is a contract violation, so the protected state can no longer be
// trusted and taking the lock escalates the same way.

/// Helper macro for locking the tracker allocator and similar mutex-guarded state
///
/// ```rust, ignore
///  let mut pages = lock!(self.pages);
///  pages.push(page);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock
            .lock()
            .expect("lock poisoned by a contract violation on another thread")
    };
}

/// Helper macro for reading a handle-table segment
///
/// ```rust, ignore
///  let segment = read_lock!(self.segments[n]);
///  let live = segment.iter().filter(|h| h.is_live()).count();
/// ```
macro_rules! read_lock {
    ($rwlock:expr) => {
        $rwlock
            .read()
            .expect("read lock poisoned by a contract violation on another thread")
    };
}

/// Helper macro for writing to a handle-table segment
///
/// ```rust, ignore
///  let mut segment = write_lock!(self.segments[n]);
///  segment.push(entry);
/// ```
macro_rules! write_lock {
    ($rwlock:expr) => {
        $rwlock
            .write()
            .expect("write lock poisoned by a contract violation on another thread")
    };
}
