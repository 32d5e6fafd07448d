//! Stack frame identities and the crawl frames a stack walk produces.
//!
//! Frames are identified by stack pointer values. The stack grows towards
//! lower addresses, so a frame closer to the leaf has a smaller [`StackFrame`]
//! than its callers.

use std::fmt;

use strum::Display;

/// A stack pointer value identifying a frame.
///
/// Two sentinels bracket every real frame: [`StackFrame::NULL`] (no frame) and
/// [`StackFrame::MAX`] (above every frame).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackFrame(usize);

impl StackFrame {
    /// No frame.
    pub const NULL: StackFrame = StackFrame(0);
    /// Above every frame.
    pub const MAX: StackFrame = StackFrame(usize::MAX);

    /// Creates a frame from a stack pointer.
    #[must_use]
    pub const fn new(sp: usize) -> Self {
        StackFrame(sp)
    }

    /// The stack pointer value.
    #[must_use]
    pub const fn sp(self) -> usize {
        self.0
    }

    /// Returns `true` for [`StackFrame::NULL`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` for [`StackFrame::MAX`].
    #[must_use]
    pub const fn is_max(self) -> bool {
        self.0 == usize::MAX
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else if self.is_max() {
            write!(f, "max")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// The kind of handler a funclet implements.
///
/// Discriminants match the runtime's funclet type encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum FuncletKind {
    /// Filter expression of a filtered catch.
    Filter = 1,
    /// Fault or finally block.
    FaultFinally = 2,
    /// Catch block, filtered or typed.
    Catch = 4,
}

/// What a crawl frame is executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// The main body of a method.
    Method,
    /// A funclet split out of a method body.
    Funclet(FuncletKind),
}

/// Identity of a method as seen by the platform unwinder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// One frame reported by the platform's stack walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrawlFrame {
    /// The frame's own stack pointer (the establisher frame for its clauses).
    pub sp: StackFrame,
    /// The caller's stack pointer; used as the frame identity for parent checks.
    pub caller_sp: StackFrame,
    /// The method the frame belongs to (funclets report their parent method).
    pub method: MethodId,
    /// Start address of the method's code.
    pub method_start: usize,
    /// Offset of the current instruction from `method_start`.
    pub offset: u32,
    /// Main body or funclet.
    pub kind: FrameKind,
}

impl CrawlFrame {
    /// A method-body frame.
    #[must_use]
    pub fn method(sp: usize, caller_sp: usize, method: MethodId, method_start: usize, offset: u32) -> Self {
        CrawlFrame {
            sp: StackFrame::new(sp),
            caller_sp: StackFrame::new(caller_sp),
            method,
            method_start,
            offset,
            kind: FrameKind::Method,
        }
    }

    /// A funclet frame.
    #[must_use]
    pub fn funclet(sp: usize, caller_sp: usize, method: MethodId, kind: FuncletKind) -> Self {
        CrawlFrame {
            sp: StackFrame::new(sp),
            caller_sp: StackFrame::new(caller_sp),
            method,
            method_start: 0,
            offset: 0,
            kind: FrameKind::Funclet(kind),
        }
    }

    /// Sets the instruction offset.
    #[must_use]
    pub fn at(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Returns `true` if the frame is a funclet.
    #[must_use]
    pub fn is_funclet(&self) -> bool {
        matches!(self.kind, FrameKind::Funclet(_))
    }

    /// Returns `true` if the frame is a filter funclet.
    #[must_use]
    pub fn is_filter_funclet(&self) -> bool {
        self.kind == FrameKind::Funclet(FuncletKind::Filter)
    }

    /// The identity used when checking whether a walk reached a parent frame.
    #[must_use]
    pub fn frame_for_parent_check(&self) -> StackFrame {
        self.caller_sp
    }
}
