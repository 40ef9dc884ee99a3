//! Structured error handling scopes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::commands::{Command, SeqCommand};
use crate::error::VmError;
use crate::frame::{Frame, LAST_ERROR_KEY, LAST_EXCEPTION_KEY};
use crate::state::State;
use crate::thread::ThreadId;

/// Runs a body with an error handler attached.
///
/// If the body fails, the unwinder hands the frame over to the handler,
/// which sees the failure as the `lastError` variable (an object with at
/// least a `message` field, plus `causes` for aggregated parallel
/// failures). A handled error stops propagating; an error raised by the
/// handler itself propagates outward as usual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorScopeCommand {
    /// The guarded body.
    pub body: Box<Command>,
    /// Handler run when the body fails.
    pub handler: Box<Command>,
    /// Optional finalizer; runs after the body or the handler, and also
    /// when an error is propagating past this scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer: Option<Box<Command>>,
}

impl ErrorScopeCommand {
    pub(crate) fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        let handler = Command::Seq(SeqCommand {
            commands: vec![
                Command::ExposeLastError(ExposeLastErrorCommand),
                (*self.handler).clone(),
            ],
        });
        let mut builder = Frame::builder()
            .non_root()
            .exception_handler(handler)
            .command((*self.body).clone());
        if let Some(finalizer) = &self.finalizer {
            builder = builder.finalizer((**finalizer).clone());
        }
        state.push_frame(thread_id, builder.build())
    }
}

/// Translates the serialized cause stored by the unwinder into the
/// user-facing `lastError` variable. Runs as the first command of an error
/// scope's handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposeLastErrorCommand;

impl ExposeLastErrorCommand {
    pub(crate) fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        state.with_frame(thread_id, |frame| {
            let cause: Option<VmError> = frame
                .local(LAST_EXCEPTION_KEY)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok());
            if let Some(cause) = cause {
                frame.set_local(LAST_ERROR_KEY, cause.as_variable());
            }
        })
    }
}
