//! Exception clauses and the funclet bookkeeping a tracker keeps about them.
//!
//! A method's exception clauses describe protected regions and their handlers.
//! During dispatch each handler runs as a funclet: a separately compiled body
//! with its own frame. [`EhClauseInfo`] records the funclet a tracker is
//! currently running and [`EnclosingClauseInfo`] records the frame that
//! logically encloses it, which is what a GC stack walk reports instead of
//! the funclet.
//!
//! # Clause Types
//!
//! - **Catch** - Entered when the thrown type matches the clause type
//! - **Filter** - Entered when the filter funclet accepts the exception
//! - **Finally** - Runs on every exit from the protected region
//! - **Fault** - Runs only on the exceptional exit

use std::fmt;

use crate::eh::frame::{FuncletKind, StackFrame};

/// Token of the type a catch clause accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TypeToken(pub u32);

impl fmt::Display for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// An exception handling clause of a method.
///
/// All offsets are relative to the start of the method's code. The try region
/// is `try_offset..try_offset + try_length` and the handler region is
/// `handler_offset..handler_offset + handler_length`, both half-open.
///
/// Clauses of a method are listed innermost first, which is the order both
/// dispatch passes examine them in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExceptionClause {
    /// A typed catch.
    Catch {
        /// Offset where the try region begins.
        try_offset: u32,
        /// Length of the try region.
        try_length: u32,
        /// Offset where the catch funclet begins.
        handler_offset: u32,
        /// Length of the catch funclet.
        handler_length: u32,
        /// The type the clause accepts.
        catch_type: TypeToken,
    },

    /// A filtered catch.
    ///
    /// The filter funclet runs during the first pass and decides whether the
    /// handler at `handler_offset` is the one that catches.
    Filter {
        /// Offset where the try region begins.
        try_offset: u32,
        /// Length of the try region.
        try_length: u32,
        /// Offset where the catch funclet begins.
        handler_offset: u32,
        /// Length of the catch funclet.
        handler_length: u32,
        /// Offset where the filter funclet begins.
        filter_offset: u32,
    },

    /// A finally block.
    Finally {
        /// Offset where the try region begins.
        try_offset: u32,
        /// Length of the try region.
        try_length: u32,
        /// Offset where the finally funclet begins.
        handler_offset: u32,
        /// Length of the finally funclet.
        handler_length: u32,
    },

    /// A fault block.
    Fault {
        /// Offset where the try region begins.
        try_offset: u32,
        /// Length of the try region.
        try_length: u32,
        /// Offset where the fault funclet begins.
        handler_offset: u32,
        /// Length of the fault funclet.
        handler_length: u32,
    },
}

impl ExceptionClause {
    /// Offset where the try region begins.
    #[must_use]
    pub fn try_offset(&self) -> u32 {
        match self {
            Self::Catch { try_offset, .. }
            | Self::Filter { try_offset, .. }
            | Self::Finally { try_offset, .. }
            | Self::Fault { try_offset, .. } => *try_offset,
        }
    }

    /// First offset after the try region.
    #[must_use]
    pub fn try_end(&self) -> u32 {
        let length = match self {
            Self::Catch { try_length, .. }
            | Self::Filter { try_length, .. }
            | Self::Finally { try_length, .. }
            | Self::Fault { try_length, .. } => *try_length,
        };
        self.try_offset().saturating_add(length)
    }

    /// Offset where the handler funclet begins.
    #[must_use]
    pub fn handler_offset(&self) -> u32 {
        match self {
            Self::Catch { handler_offset, .. }
            | Self::Filter { handler_offset, .. }
            | Self::Finally { handler_offset, .. }
            | Self::Fault { handler_offset, .. } => *handler_offset,
        }
    }

    /// First offset after the handler funclet.
    #[must_use]
    pub fn handler_end(&self) -> u32 {
        let length = match self {
            Self::Catch { handler_length, .. }
            | Self::Filter { handler_length, .. }
            | Self::Finally { handler_length, .. }
            | Self::Fault { handler_length, .. } => *handler_length,
        };
        self.handler_offset().saturating_add(length)
    }

    /// Checks if an offset is within the try region.
    ///
    /// # Arguments
    ///
    /// * `offset` - The code offset to check
    ///
    /// # Returns
    ///
    /// `true` if `try_offset <= offset < try_end`.
    #[must_use]
    pub fn is_in_try(&self, offset: u32) -> bool {
        offset >= self.try_offset() && offset < self.try_end()
    }

    /// Checks if an offset is within the handler funclet.
    #[must_use]
    pub fn is_in_handler(&self, offset: u32) -> bool {
        offset >= self.handler_offset() && offset < self.handler_end()
    }

    /// Returns `true` for typed and filtered catches.
    #[must_use]
    pub fn is_catching(&self) -> bool {
        matches!(self, Self::Catch { .. } | Self::Filter { .. })
    }

    /// Returns `true` for finally and fault clauses, which run during the
    /// second pass and never stop it.
    #[must_use]
    pub fn is_termination_handler(&self) -> bool {
        matches!(self, Self::Finally { .. } | Self::Fault { .. })
    }

    /// The funclet kind of the clause's handler.
    #[must_use]
    pub fn handler_kind(&self) -> FuncletKind {
        if self.is_catching() {
            FuncletKind::Catch
        } else {
            FuncletKind::FaultFinally
        }
    }

    /// The catch type for [`Catch`](ExceptionClause::Catch) clauses.
    #[must_use]
    pub fn catch_type(&self) -> Option<TypeToken> {
        match self {
            Self::Catch { catch_type, .. } => Some(*catch_type),
            _ => None,
        }
    }

    /// The filter funclet offset for [`Filter`](ExceptionClause::Filter) clauses.
    #[must_use]
    pub fn filter_offset(&self) -> Option<u32> {
        match self {
            Self::Filter { filter_offset, .. } => Some(*filter_offset),
            _ => None,
        }
    }
}

/// The funclet a tracker is currently running.
///
/// `kind` is `None` while no funclet runs. `caller_sp` is the stack pointer of
/// the funclet's caller, which is how a stack walk recognizes the funclet's
/// frame as belonging to this tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EhClauseInfo {
    /// The kind of funclet running, if any.
    pub kind: Option<FuncletKind>,
    /// Address the funclet was entered at.
    pub handler_pc: usize,
    /// Frame of the method that owns the clause.
    pub establisher: StackFrame,
    /// Stack pointer of the funclet's caller.
    pub caller_sp: StackFrame,
    /// Index of the clause within its method.
    pub clause_index: Option<usize>,
}

impl EhClauseInfo {
    /// Returns `true` while a funclet runs.
    #[must_use]
    pub fn is_in_funclet(&self) -> bool {
        self.kind.is_some()
    }

    /// Forgets the funclet once it has returned.
    pub fn reset(&mut self) {
        *self = EhClauseInfo::default();
    }
}

/// The frame that logically encloses a running funclet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnclosingClauseInfo {
    /// Whether the enclosing frame is itself a funclet.
    pub is_funclet: bool,
    /// Code offset in the enclosing frame when the funclet was entered.
    pub offset: u32,
    /// Caller SP of the enclosing frame, or [`StackFrame::NULL`] if unknown.
    pub caller_sp: StackFrame,
}

impl EnclosingClauseInfo {
    /// Creates an enclosing-clause record.
    #[must_use]
    pub fn new(is_funclet: bool, offset: u32, caller_sp: StackFrame) -> Self {
        EnclosingClauseInfo {
            is_funclet,
            offset,
            caller_sp,
        }
    }
}
