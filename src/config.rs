//! Configuration for root scanning and tracker allocation.
//!
//! # Overview
//!
//! Configuration is split in two:
//!
//! - [`ScanConfig`] - How the collector drives the handle scan coordinator (worker
//!   count, server GC gating, post-scan verification)
//! - [`TrackerAllocatorConfig`] - Page geometry and out-of-memory retry policy of the
//!   exception tracker slab
//!
//! [`RootwalkConfig`] bundles both.
//!
//! # Configuration Presets
//!
//! - [`RootwalkConfig::workstation()`] - Single worker, no gating
//! - [`RootwalkConfig::server()`] - One worker per heap, sync-block-cache hooks gated to worker 0
//! - [`TrackerAllocatorConfig::testing()`] - No retry delay, suitable for exhaustion tests
//!
//! # Example
//!
//! ```rust
//! use rootwalk::config::{RootwalkConfig, TrackerAllocatorConfig};
//! use std::time::Duration;
//!
//! // Use a preset
//! let config = RootwalkConfig::server(8);
//! assert!(config.scan.server_gc);
//!
//! // Or customize
//! let config = RootwalkConfig {
//!     allocator: TrackerAllocatorConfig::new()
//!         .with_max_oom_spins(5)
//!         .with_oom_spin_delay(Duration::from_millis(10)),
//!     ..Default::default()
//! };
//! assert_eq!(config.allocator.max_oom_spins, 5);
//! ```

use std::time::Duration;

/// Page size of the tracker slab, in bytes.
pub const TRACKER_ALLOCATOR_PAGE_SIZE: usize = 8 * 1024;

/// How many times a failed page allocation is retried before giving up.
pub const TRACKER_ALLOCATOR_MAX_OOM_SPINS: u32 = 20;

/// Delay between page allocation retries.
pub const TRACKER_ALLOCATOR_OOM_SPIN_DELAY: Duration = Duration::from_millis(100);

/// Top-level configuration.
#[derive(Clone, Debug, Default)]
pub struct RootwalkConfig {
    /// Handle scan coordinator settings.
    pub scan: ScanConfig,
    /// Exception tracker allocator settings.
    pub allocator: TrackerAllocatorConfig,
}

impl RootwalkConfig {
    /// Workstation collection: a single worker and no worker-0 gating.
    #[must_use]
    pub fn workstation() -> Self {
        Self::default()
    }

    /// Server collection with `workers` parallel scan workers.
    ///
    /// Sync-block-cache maintenance runs once per collection on worker 0 only;
    /// every worker ages its own handles.
    ///
    /// # Arguments
    ///
    /// * `workers` - Number of collector worker threads (clamped to at least 1)
    #[must_use]
    pub fn server(workers: usize) -> Self {
        Self {
            scan: ScanConfig::new().with_server_gc(true).with_workers(workers),
            allocator: TrackerAllocatorConfig::default(),
        }
    }
}

/// Settings for the handle scan coordinator.
#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// Whether the collector runs one worker per heap (server GC).
    ///
    /// When set, the sync-block-cache hooks of demotion and promotions-granted
    /// run on worker 0 only.
    pub server_gc: bool,
    /// Number of scan workers under server GC.
    ///
    /// [`GcScan::worker_contexts`](crate::gc::GcScan::worker_contexts) hands out
    /// one scan context per worker. Workstation collection always uses one.
    pub workers: usize,
    /// Ask the handle table to verify itself after each handle scan.
    pub verify_after_scan: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            server_gc: false,
            workers: 1,
            verify_after_scan: cfg!(debug_assertions),
        }
    }
}

impl ScanConfig {
    /// Creates the default scan configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets server GC mode.
    #[must_use]
    pub fn with_server_gc(mut self, server_gc: bool) -> Self {
        self.server_gc = server_gc;
        self
    }

    /// Sets the worker count (at least 1).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Enables or disables post-scan handle table verification.
    #[must_use]
    pub fn with_verify_after_scan(mut self, verify: bool) -> Self {
        self.verify_after_scan = verify;
        self
    }
}

/// Settings for the exception tracker slab allocator.
///
/// # Default Configuration
///
/// - 8 KiB pages
/// - 20 retries, 100 ms apart, when a page cannot be allocated
/// - No page limit
#[derive(Clone, Debug)]
pub struct TrackerAllocatorConfig {
    /// Size of one page in bytes, header included.
    pub page_size: usize,
    /// Number of retries when a new page cannot be obtained.
    pub max_oom_spins: u32,
    /// Delay between retries.
    pub oom_spin_delay: Duration,
    /// Upper bound on the number of pages, `None` for unbounded.
    pub max_pages: Option<usize>,
}

impl Default for TrackerAllocatorConfig {
    fn default() -> Self {
        Self {
            page_size: TRACKER_ALLOCATOR_PAGE_SIZE,
            max_oom_spins: TRACKER_ALLOCATOR_MAX_OOM_SPINS,
            oom_spin_delay: TRACKER_ALLOCATOR_OOM_SPIN_DELAY,
            max_pages: None,
        }
    }
}

impl TrackerAllocatorConfig {
    /// Creates the default allocator configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for tests: two retries with no delay.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            max_oom_spins: 2,
            oom_spin_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Sets the page size in bytes.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the retry count for failed page allocations.
    #[must_use]
    pub fn with_max_oom_spins(mut self, spins: u32) -> Self {
        self.max_oom_spins = spins;
        self
    }

    /// Sets the delay between retries.
    #[must_use]
    pub fn with_oom_spin_delay(mut self, delay: Duration) -> Self {
        self.oom_spin_delay = delay;
        self
    }

    /// Limits how many pages the allocator may hold.
    #[must_use]
    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }
}
