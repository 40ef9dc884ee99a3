//! Error types for the execution core.
//!
//! All errors are serializable: a failure raised in one logical thread may
//! need to cross a suspend/resume boundary (stored in frame locals or in the
//! per-thread error table) before an exception handler or a `join` observes
//! it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::thread::ThreadId;

/// Errors raised while evaluating a process.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VmError {
    /// A logical thread id has no entry in the state.
    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),

    /// A frame operation was attempted on an empty call stack.
    #[error("empty call stack for thread {0}")]
    EmptyStack(ThreadId),

    /// The machine reached a state the scheduler considers impossible,
    /// e.g. evaluating a thread that has already completed.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A value had the wrong shape for the operation, e.g. a non-boolean
    /// `if` condition or a scalar used as a loop source.
    #[error("type error: {0}")]
    Type(String),

    /// Expression evaluation failed.
    #[error("expression error: {0}")]
    Expression(String),

    /// Script evaluation failed or no script engine is configured.
    #[error("script error: {0}")]
    Script(String),

    /// A step referenced a task that is not registered.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A task reported a failure.
    #[error("task '{name}' failed: {message}")]
    Task {
        /// Name the task was invoked under.
        name: String,
        /// Failure description supplied by the task.
        message: String,
    },

    /// A call step referenced a flow that is not registered.
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// A resume was attempted with an event reference no suspended thread
    /// is waiting on.
    #[error("unknown event reference: {0}")]
    UnknownEventRef(String),

    /// A checkpoint could not be taken or stored.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// State could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// One or more parallel branches failed. The causes are ordered by the
    /// failed threads' ids, so the order is stable across runs.
    #[error("{} parallel branch(es) failed", .0.len())]
    Aggregate(Vec<VmError>),

    /// Marker wrapper: the underlying error has already been reported by a
    /// step wrapper and should not be logged again while it propagates.
    #[error(transparent)]
    Logged(Box<VmError>),
}

impl VmError {
    /// Wraps the error in the "already logged" marker. Idempotent.
    pub fn logged(self) -> VmError {
        if self.is_logged() {
            self
        } else {
            VmError::Logged(Box::new(self))
        }
    }

    /// Returns `true` if the error carries the "already logged" marker.
    pub fn is_logged(&self) -> bool {
        matches!(self, VmError::Logged(_))
    }

    /// Strips any "already logged" markers, returning the original cause.
    pub fn unlogged(self) -> VmError {
        match self {
            VmError::Logged(inner) => inner.unlogged(),
            other => other,
        }
    }

    /// Renders the error as a value suitable for exposing to user
    /// expressions (the `lastError` variable).
    pub fn as_variable(&self) -> Value {
        match self {
            VmError::Logged(inner) => inner.as_variable(),
            VmError::Aggregate(causes) => json!({
                "message": self.to_string(),
                "causes": causes.iter().map(VmError::as_variable).collect::<Vec<_>>(),
            }),
            other => json!({ "message": other.to_string() }),
        }
    }
}

impl From<serde_json::Error> for VmError {
    fn from(e: serde_json::Error) -> Self {
        VmError::Serialization(e.to_string())
    }
}
