//! The stack range a tracker has scanned or unwound.

use std::fmt;

use crate::eh::frame::StackFrame;

/// An inclusive `[low, high]` interval of stack frames.
///
/// `low` is the frame closest to the leaf. The empty range has `low` at
/// [`StackFrame::MAX`] and `high` at [`StackFrame::NULL`], so that the first
/// extension in either direction initializes it.
///
/// During a tracker's life the range only grows. The exceptions are an
/// explicit [`trim_lower_bound`](Self::trim_lower_bound) and a
/// [`combine_with`](Self::combine_with) when a superseded tracker is collapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackRange {
    low: StackFrame,
    high: StackFrame,
}

impl Default for StackRange {
    fn default() -> Self {
        StackRange::new()
    }
}

impl StackRange {
    /// Creates an empty range.
    #[must_use]
    pub const fn new() -> Self {
        StackRange {
            low: StackFrame::MAX,
            high: StackFrame::NULL,
        }
    }

    /// Creates the range `[low, high]`.
    ///
    /// # Panics
    ///
    /// Panics if `low > high`.
    #[must_use]
    pub fn from_bounds(low: StackFrame, high: StackFrame) -> Self {
        if low > high {
            contract_violation!("stack range lower bound {} above upper bound {}", low, high);
        }
        StackRange { low, high }
    }

    /// Empties the range.
    pub fn reset(&mut self) {
        *self = StackRange::new();
    }

    /// Returns `true` if nothing has been scanned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.low.is_max() && self.high.is_null()
    }

    /// The leaf-most frame of the range.
    #[must_use]
    pub fn lower_bound(&self) -> StackFrame {
        self.low
    }

    /// The root-most frame of the range.
    #[must_use]
    pub fn upper_bound(&self) -> StackFrame {
        self.high
    }

    /// Returns `true` if a walk that has reached `sf` has covered this range's
    /// lower bound, i.e. `sf` is at or above it.
    #[must_use]
    pub fn is_superseded_by(&self, sf: StackFrame) -> bool {
        sf >= self.low
    }

    /// Returns `true` if `sf` lies inside the range.
    #[must_use]
    pub fn contains(&self, sf: StackFrame) -> bool {
        self.low <= sf && sf <= self.high
    }

    /// Makes the range exactly `[sf, sf]`.
    pub fn init(&mut self, sf: StackFrame) {
        self.low = sf;
        self.high = sf;
    }

    /// Extends the range towards the root.
    ///
    /// # Panics
    ///
    /// Panics unless `sf` is above the current upper bound.
    pub fn extend_upper_bound(&mut self, sf: StackFrame) {
        if sf <= self.high {
            contract_violation!("upper bound extension to {} does not pass {}", sf, self.high);
        }
        self.high = sf;
    }

    /// Extends the range towards the leaf.
    ///
    /// # Panics
    ///
    /// Panics unless `sf` is below the current lower bound.
    pub fn extend_lower_bound(&mut self, sf: StackFrame) {
        if sf >= self.low {
            contract_violation!("lower bound extension to {} does not pass {}", sf, self.low);
        }
        self.low = sf;
    }

    /// Raises the lower bound to `sf`.
    ///
    /// # Panics
    ///
    /// Panics unless `sf` is above the current lower bound.
    pub fn trim_lower_bound(&mut self, sf: StackFrame) {
        if sf <= self.low {
            contract_violation!("lower bound trim to {} does not pass {}", sf, self.low);
        }
        self.low = sf;
    }

    /// Adds `sf` to the range: initializes an empty range, extends the upper
    /// bound for frames above it, and leaves frames already covered alone.
    pub fn include(&mut self, sf: StackFrame) {
        if self.is_empty() {
            self.init(sf);
        } else if sf > self.high {
            self.high = sf;
        } else if sf < self.low {
            self.low = sf;
        }
    }

    /// Merges a superseded previous range into this one at frame `sf_current`.
    ///
    /// The result is the union of both ranges and `sf_current`. An empty range
    /// takes the previous range's lower bound.
    ///
    /// # Panics
    ///
    /// Panics if `previous` is non-empty and not superseded by `sf_current`,
    /// since the union would then cover frames neither tracker visited.
    pub fn combine_with(&mut self, sf_current: StackFrame, previous: &StackRange) {
        if previous.is_empty() {
            self.include(sf_current);
            return;
        }
        if !previous.is_superseded_by(sf_current) {
            contract_violation!(
                "combining at {} with range {} that it does not supersede",
                sf_current,
                previous
            );
        }

        if self.is_empty() {
            self.low = previous.low;
            self.high = previous.high.max(sf_current);
        } else {
            self.low = self.low.min(previous.low);
            self.high = self.high.max(previous.high).max(sf_current);
        }
    }

    /// Returns `true` if this range ends strictly below `other`.
    #[must_use]
    pub fn is_disjoint_with_and_lower_than(&self, other: &StackRange) -> bool {
        self.high < other.low
    }

    /// Returns `true` if the range is empty or a proper interval between the sentinels.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        if self.is_empty() {
            return true;
        }
        !self.low.is_null() && !self.high.is_max() && !self.low.is_max() && self.low <= self.high
    }
}

impl fmt::Display for StackRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[empty]")
        } else {
            write!(f, "[{}, {}]", self.low, self.high)
        }
    }
}
