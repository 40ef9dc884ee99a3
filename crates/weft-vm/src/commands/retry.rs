//! Bounded re-execution of a failing body.
//!
//! A retry pushes a bookkeeping frame whose exception handler is a
//! [`RetryNextCommand`]. When the body fails, the handler either schedules
//! another attempt (after a delay, re-installing itself) or, once the
//! attempt budget is spent, re-raises the original cause so it propagates
//! to whatever encloses the retry.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::commands::Command;
use crate::error::VmError;
use crate::frame::{Frame, LAST_EXCEPTION_KEY};
use crate::runtime::Runtime;
use crate::scope::Variables;
use crate::state::State;
use crate::thread::ThreadId;

const ATTEMPT_KEY: &str = "__retry_attempt";
const MAX_ATTEMPTS_KEY: &str = "__retry_max_attempts";
const DELAY_KEY: &str = "__retry_delay_ms";

/// Runs a body, re-running it on failure up to a limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryCommand {
    /// The body to (re-)run.
    pub body: Box<Command>,
    /// Total number of attempts, including the first one. Must evaluate to
    /// a number of at least 1.
    pub times: Value,
    /// Delay between attempts, in milliseconds.
    pub delay_ms: Value,
    /// Input override expressions applied to task calls in every re-attempt
    /// (not the first attempt), deep-merged over the evaluated input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_overrides: Option<Variables>,
}

impl RetryCommand {
    pub(crate) fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let vars = state.scope(thread_id);
        let expressions = &runtime.services().expressions;
        let times = expressions.eval(&vars, &self.times)?;
        let times = times
            .as_u64()
            .ok_or_else(|| VmError::Type(format!("retry 'times' must be a number, got: {times}")))?;
        if times == 0 {
            return Err(VmError::Type(
                "retry 'times' must be at least 1".to_string(),
            ));
        }
        let delay = expressions.eval(&vars, &self.delay_ms)?;
        let delay = delay.as_u64().ok_or_else(|| {
            VmError::Type(format!("retry 'delay' must be a number, got: {delay}"))
        })?;

        let handler = RetryNextCommand {
            body: self.body.clone(),
            input_overrides: self.input_overrides.clone(),
        };
        let frame = Frame::builder()
            .non_root()
            .local(ATTEMPT_KEY, json!(0))
            .local(MAX_ATTEMPTS_KEY, json!(times))
            .local(DELAY_KEY, json!(delay))
            .exception_handler(Command::RetryNext(handler))
            .command((*self.body).clone())
            .build();
        state.push_frame(thread_id, frame)
    }
}

/// The handler installed by [`RetryCommand`]: schedules the next attempt or
/// gives up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryNextCommand {
    /// The body to re-run.
    pub body: Box<Command>,
    /// Input override expressions for re-attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_overrides: Option<Variables>,
}

impl RetryNextCommand {
    pub(crate) async fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let (attempt, max_attempts, delay, cause) = state.with_frame(thread_id, |f| {
            (
                f.local(ATTEMPT_KEY).and_then(Value::as_u64),
                f.local(MAX_ATTEMPTS_KEY).and_then(Value::as_u64),
                f.local(DELAY_KEY).and_then(Value::as_u64),
                f.local(LAST_EXCEPTION_KEY).cloned(),
            )
        })?;
        let corrupt =
            || VmError::IllegalState("retry bookkeeping frame is incomplete".to_string());
        let attempt = attempt.ok_or_else(corrupt)?;
        let max_attempts = max_attempts.ok_or_else(corrupt)?;
        let delay = delay.ok_or_else(corrupt)?;
        let cause: VmError = match cause {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| VmError::IllegalState(format!("corrupt retry cause: {e}")))?,
            None => return Err(corrupt()),
        };

        let failed_attempts = attempt + 1;
        if failed_attempts >= max_attempts {
            debug!(
                thread = %thread_id,
                attempts = failed_attempts,
                "retry attempts exhausted"
            );
            // re-raise the original cause, unwrapped, so enclosing error
            // scopes see what actually went wrong
            return Err(cause.unlogged());
        }

        debug!(
            thread = %thread_id,
            attempt = failed_attempts + 1,
            max_attempts,
            delay_ms = delay,
            "retrying after delay"
        );
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let overrides = match &self.input_overrides {
            Some(overrides) => {
                let vars = state.scope(thread_id);
                Some(runtime.services().expressions.eval_map(&vars, overrides)?)
            }
            None => None,
        };

        let handler = self.clone();
        let body = (*self.body).clone();
        state.with_frame(thread_id, |f| {
            f.set_local(ATTEMPT_KEY, json!(failed_attempts));
            f.take_local(LAST_EXCEPTION_KEY);
            if let Some(overrides) = overrides {
                f.extend_overrides(overrides);
            }
            f.set_exception_handler(Command::RetryNext(handler));
            f.push_command(body);
        })?;
        Ok(())
    }
}
