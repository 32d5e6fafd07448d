//! Funclet-aware stack walking.
//!
//! A funclet runs on its own frame, but logically it is part of the method it
//! was split out of. When a walk reports a funclet it must not report the
//! frames between the funclet and that parent, and it must treat the parent
//! as the frame the funclet's state belongs to. [`FuncletAwareWalk`] applies
//! the [`ParentFrame`] decisions of a [`ThreadExceptionState`] to a sequence of
//! crawl frames.

use std::{iter::FusedIterator, slice};

use log::trace;

use crate::eh::{
    chain::{ParentFrame, ThreadExceptionState},
    frame::{CrawlFrame, StackFrame},
};

/// A frame reported by a [`FuncletAwareWalk`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalkedFrame<'f> {
    /// The frame.
    pub frame: &'f CrawlFrame,
    /// `true` if a funclet reported earlier in the walk belongs to this frame.
    pub is_funclet_parent: bool,
}

/// Returns `true` if `frame` is the parent frame a walk is skipping to.
#[must_use]
pub fn is_unwound_to_target_parent_frame(frame: &CrawlFrame, parent: StackFrame) -> bool {
    frame.frame_for_parent_check() == parent
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Skip {
    None,
    One,
    To(StackFrame),
}

/// Iterator over crawl frames, leaf to root, that skips the frames between a
/// funclet and its parent.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use rootwalk::{
///     config::TrackerAllocatorConfig,
///     eh::{CrawlFrame, FuncletAwareWalk, MethodId, ThreadExceptionState, ThreadId, TrackerAllocator},
/// };
///
/// let allocator = Arc::new(TrackerAllocator::new(TrackerAllocatorConfig::testing()));
/// let state = ThreadExceptionState::new(allocator, ThreadId::new(1));
/// let frames = [
///     CrawlFrame::method(0x100, 0x200, MethodId(1), 0x4000, 0),
///     CrawlFrame::method(0x200, 0x300, MethodId(2), 0x5000, 0),
/// ];
///
/// // Without exceptions in flight every frame is reported.
/// assert_eq!(FuncletAwareWalk::new(&state, &frames, true).count(), 2);
/// ```
#[derive(Debug)]
pub struct FuncletAwareWalk<'s, 'f> {
    state: &'s ThreadExceptionState,
    frames: slice::Iter<'f, CrawlFrame>,
    for_gc: bool,
    skip: Skip,
}

impl<'s, 'f> FuncletAwareWalk<'s, 'f> {
    /// Starts a walk.
    ///
    /// # Arguments
    ///
    /// * `state` - The exception state of the thread being walked
    /// * `frames` - The thread's frames, leaf first
    /// * `for_gc` - Whether the walk reports GC roots
    #[must_use]
    pub fn new(state: &'s ThreadExceptionState, frames: &'f [CrawlFrame], for_gc: bool) -> Self {
        FuncletAwareWalk {
            state,
            frames: frames.iter(),
            for_gc,
            skip: Skip::None,
        }
    }
}

impl<'f> Iterator for FuncletAwareWalk<'_, 'f> {
    type Item = WalkedFrame<'f>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.frames.next()?;
            let is_funclet_parent = match self.skip {
                Skip::None => false,
                Skip::One => {
                    trace!("Walk skipped {} after a funclet", frame.sp);
                    self.skip = Skip::None;
                    continue;
                }
                Skip::To(target) => {
                    if !is_unwound_to_target_parent_frame(frame, target) {
                        trace!("Walk skipped {} on the way to {}", frame.sp, target);
                        continue;
                    }
                    self.skip = Skip::None;
                    true
                }
            };

            self.skip = match self
                .state
                .find_parent_stack_frame_for_stack_walk(frame, self.for_gc)
            {
                ParentFrame::NoSkip => Skip::None,
                ParentFrame::SkipOne => Skip::One,
                ParentFrame::SkipTo(target) => Skip::To(target),
            };
            return Some(WalkedFrame {
                frame,
                is_funclet_parent,
            });
        }
    }
}

impl FusedIterator for FuncletAwareWalk<'_, '_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::{
        config::TrackerAllocatorConfig,
        eh::{
            allocator::TrackerAllocator,
            chain::FuncletCall,
            clause::{ExceptionClause, TypeToken},
            frame::{FuncletKind, MethodId},
            tracker::{ExceptionRecord, ThreadId},
        },
        gc::ObjectRef,
        Result,
    };

    const M: MethodId = MethodId(1);

    fn finally() -> ExceptionClause {
        ExceptionClause::Finally {
            try_offset: 0,
            try_length: 0x20,
            handler_offset: 0x40,
            handler_length: 0x10,
        }
    }

    /// A thread whose exception is running M's finally on a funclet frame
    /// called from `funclet_caller`.
    fn running_finally(method: &CrawlFrame, funclet_caller: usize) -> Result<ThreadExceptionState> {
        let allocator = Arc::new(TrackerAllocator::new(TrackerAllocatorConfig::testing()));
        let mut state = ThreadExceptionState::new(allocator, ThreadId::new(1));
        let id = state.raise(ExceptionRecord::clr(0x4000), 0, ObjectRef::new(0x5000));
        let catch = [ExceptionClause::Catch {
            try_offset: 0,
            try_length: 0x20,
            handler_offset: 0x60,
            handler_length: 0x10,
            catch_type: TypeToken(1),
        }];
        state.first_pass_frame(id, method, &catch, &mut |_| true)?;
        state.begin_second_pass(id)?;
        state.second_pass_frame(id, method, &[])?;
        let call = FuncletCall::handler(method, 0, &finally()).with_caller_sp(StackFrame::new(funclet_caller));
        state.begin_funclet(id, &call)?;
        Ok(state)
    }

    #[test]
    fn test_walk_skips_to_funclet_parent() -> Result<()> {
        let method = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let state = running_finally(&method, 0x900)?;
        let frames = [
            CrawlFrame::funclet(0x800, 0x900, M, FuncletKind::FaultFinally).at(0x40),
            CrawlFrame::method(0x900, 0xA00, MethodId(90), 0x9000, 0),
            CrawlFrame::method(0xA00, 0x1000, MethodId(91), 0x9100, 0),
            method,
            CrawlFrame::method(0x1100, 0x1200, MethodId(2), 0x5000, 0),
        ];

        let walked: Vec<_> = FuncletAwareWalk::new(&state, &frames, true)
            .map(|w| (w.frame.sp.sp(), w.is_funclet_parent))
            .collect();
        assert_eq!(walked, vec![(0x800, false), (0x1000, true), (0x1100, false)]);
        Ok(())
    }

    #[test]
    fn test_walk_skip_one() -> Result<()> {
        let method = CrawlFrame::method(0x1000, 0, M, 0x4000, 0x10);
        let state = running_finally(&method, 0x900)?;
        let frames = [
            CrawlFrame::funclet(0x800, 0x900, M, FuncletKind::FaultFinally),
            CrawlFrame::method(0x900, 0xA00, MethodId(90), 0x9000, 0),
            CrawlFrame::method(0xA00, 0x1000, MethodId(91), 0x9100, 0),
        ];

        let walked: Vec<_> = FuncletAwareWalk::new(&state, &frames, false)
            .map(|w| w.frame.sp.sp())
            .collect();
        assert_eq!(walked, vec![0x800, 0xA00]);
        Ok(())
    }

    #[test]
    fn test_unrelated_funclet_is_not_skipped() -> Result<()> {
        let method = CrawlFrame::method(0x1000, 0x1100, M, 0x4000, 0x10);
        let state = running_finally(&method, 0x900)?;
        let frames = [
            CrawlFrame::funclet(0x300, 0x400, MethodId(5), FuncletKind::FaultFinally),
            CrawlFrame::method(0x400, 0x500, MethodId(5), 0x7000, 0),
        ];
        assert_eq!(FuncletAwareWalk::new(&state, &frames, true).count(), 2);
        assert!(is_unwound_to_target_parent_frame(&frames[1], StackFrame::new(0x500)));
        Ok(())
    }
}
