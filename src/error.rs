use thiserror::Error;

use crate::{
    eh::{TrackerId, TrackerState},
    gc::HandleId,
};

/// Panics with a contract-violation message that carries the source location.
///
/// A contract violation means a GC or tracker invariant was breached. Continuing
/// would operate on a heap or stack that is already inconsistent, so there is no
/// recovery path.
///
/// ```rust, ignore
/// if count < 0 {
///     contract_violation!("invalid-structures count went negative ({})", count);
/// }
/// ```
macro_rules! contract_violation {
    // Single string version
    ($msg:expr) => {
        panic!("{}", crate::Error::Violation {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        })
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        panic!("{}", crate::Error::Violation {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        })
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Almost nothing in this crate is recoverable. Scans run while the heap is
/// mid-collection and exception dispatch cannot raise a secondary error without
/// recursing into itself, so most invariant breaches panic through
/// `contract_violation!`. The variants below cover the few places where a caller
/// can still make a decision.
///
/// # Error Categories
///
/// ## Resource Exhaustion
/// - [`Error::TrackerAllocationFailed`] - Tracker pages could not be grown after retrying
///
/// ## Stale References
/// - [`Error::InvalidTracker`] - A tracker handle no longer refers to a live slot
/// - [`Error::HandleNotFound`] - A handle id is not present in the handle table
///
/// ## State Machine
/// - [`Error::InvalidTransition`] - A tracker was asked to move to a state it cannot reach
/// - [`Error::Violation`] - The payload `contract_violation!` panics with
///
/// # Examples
///
/// ```rust
/// use rootwalk::{Error, eh::{TrackerAllocator, ThreadId}, config::TrackerAllocatorConfig};
///
/// let allocator = TrackerAllocator::new(
///     TrackerAllocatorConfig::testing().with_max_pages(Some(1)),
/// );
/// let mut held = Vec::new();
/// loop {
///     match allocator.get_tracker_memory(ThreadId::new(1)) {
///         Ok(id) => held.push(id),
///         Err(Error::TrackerAllocationFailed { attempts }) => {
///             assert!(attempts > 0);
///             break;
///         }
///         Err(e) => panic!("unexpected: {e}"),
///     }
/// }
/// assert_eq!(held.len(), allocator.trackers_per_page());
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// Tracker memory could not be obtained.
    ///
    /// Every page was occupied and growing the page list failed (or the page
    /// limit was reached) on each of `attempts` tries. The exception dispatch
    /// path treats this as fatal.
    #[error("Failed to allocate exception tracker memory after {attempts} attempts")]
    TrackerAllocationFailed {
        /// How many times the allocation was attempted
        attempts: u32,
    },

    /// A [`TrackerId`] refers to a slot that is free or belongs to another tracker.
    #[error("Tracker {0} does not refer to a live tracker")]
    InvalidTracker(TrackerId),

    /// A tracker state transition that the dispatch protocol does not allow.
    #[error("Invalid tracker transition from {from} to {to}")]
    InvalidTransition {
        /// The state the tracker was in
        from: TrackerState,
        /// The state that was requested
        to: TrackerState,
    },

    /// The handle is not present in the handle table.
    #[error("Handle {0} not found")]
    HandleNotFound(HandleId),

    /// A contract violation, carrying the source location it was detected at.
    ///
    /// # Fields
    ///
    /// * `message` - What was violated
    /// * `file` - Source file where the violation was detected
    /// * `line` - Source line where the violation was detected
    #[error("Contract violation - {file}:{line}: {message}")]
    Violation {
        /// The message to be printed for the violation
        message: String,
        /// The source file in which this violation was detected
        file: &'static str,
        /// The source line in which this violation was detected
        line: u32,
    },
}
