//! Logical thread identifiers and lifecycle statuses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a logical thread inside a single process instance.
///
/// Logical threads are the VM's unit of concurrency. They are not OS
/// threads: each one is a separate frame stack scheduled onto the async
/// runtime. Identifiers are allocated monotonically by
/// [`crate::state::State::next_thread_id`] and are never reused within a
/// process, even across suspend/resume cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The identifier of the initial (root) thread of a process.
    pub const ROOT: ThreadId = ThreadId(0);

    /// Wraps a raw identifier value.
    pub fn new(id: u64) -> Self {
        ThreadId(id)
    }

    /// Returns the raw identifier value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a logical thread.
///
/// `Done` and `Failed` are terminal. A `Suspended` thread can only go back
/// to `Ready` through [`crate::vm::Vm::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadStatus {
    /// Eligible to run but not currently being evaluated.
    Ready,
    /// Currently being evaluated by the scheduler.
    Running,
    /// Waiting for an external event to arrive.
    Suspended,
    /// Completed normally.
    Done,
    /// Completed with an unhandled error.
    Failed,
}

impl ThreadStatus {
    /// Returns `true` for statuses a thread can never leave on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ThreadStatus::Done | ThreadStatus::Failed)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadStatus::Ready => "READY",
            ThreadStatus::Running => "RUNNING",
            ThreadStatus::Suspended => "SUSPENDED",
            ThreadStatus::Done => "DONE",
            ThreadStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
