//! Frame walking over suspended fiber stacks
//!
//! The runtime does not know how frames are laid out. It rebuilds a
//! [`FrameCursor`] from a fiber's saved resume point and asks the host's
//! [`FrameSource`] for the frames above it.

use crate::fiber::Fiber;
use serde::Serialize;
use std::fmt;

/// Register state a walk starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    pub sp: usize,
    pub fp: usize,
    pub pc: usize,
}

/// Source location of a managed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedMethod {
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// One frame produced by a `FrameSource`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub sp: usize,
    pub fp: usize,
    pub pc: usize,
    /// Present for managed-code frames, absent for native ones
    pub method: Option<ManagedMethod>,
}

impl CallFrame {
    pub fn native(sp: usize, fp: usize, pc: usize) -> Self {
        Self {
            sp,
            fp,
            pc,
            method: None,
        }
    }

    pub fn managed(sp: usize, fp: usize, pc: usize, method: ManagedMethod) -> Self {
        Self {
            sp,
            fp,
            pc,
            method: Some(method),
        }
    }

    pub fn is_managed(&self) -> bool {
        self.method.is_some()
    }

    pub fn trace_element(&self) -> Option<StackTraceElement> {
        self.method.as_ref().map(|m| StackTraceElement {
            method: m.name.clone(),
            file: m.file.clone(),
            line: m.line,
        })
    }
}

/// Host capability that decodes frames from a cursor
///
/// The iterator is lazy, finite and not restartable.
pub trait FrameSource {
    fn frames<'a>(
        &'a self,
        cursor: FrameCursor,
        owner: &'a Fiber,
    ) -> Box<dyn Iterator<Item = CallFrame> + 'a>;
}

/// How a walk treats frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// Every frame, no limit
    Scan,
    /// Managed frames only, starting at the first managed frame, at most
    /// `max_depth` frames counted from there
    Dump { max_depth: usize },
}

/// Structured stack trace entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackTraceElement {
    pub method: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl fmt::Display for StackTraceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "\tat {}({}:{})", self.method, file, line),
            (Some(file), None) => write!(f, "\tat {}({})", self.method, file),
            (None, _) => write!(f, "\tat {}(Unknown Source)", self.method),
        }
    }
}

/// Structured trace of a fiber; empty when there is no fiber.
pub fn dump_stack_trace(
    fiber: Option<&Fiber>,
    source: &dyn FrameSource,
    max_depth: usize,
) -> Vec<StackTraceElement> {
    match fiber {
        Some(fiber) => fiber.stack_trace(source, max_depth),
        None => Vec::new(),
    }
}
