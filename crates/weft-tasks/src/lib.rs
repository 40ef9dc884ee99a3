//! Built-in tasks for the Weft execution core.
//!
//! These cover the basics every deployment wants: logging, sleeping,
//! echoing input back, failing on purpose (useful for exercising error
//! scopes and retries), and waiting for an external event.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use weft_vm::error::VmError;
use weft_vm::sdk::{Task, TaskInput, TaskRegistry, TaskResult};

/// Returns its whole input as the task result.
#[derive(Debug, Default)]
pub struct EchoTask;

#[async_trait]
impl Task for EchoTask {
    async fn execute(&self, input: TaskInput) -> Result<TaskResult, VmError> {
        Ok(TaskResult::Done(Value::Object(input.variables().clone())))
    }
}

/// Logs the `message` input.
#[derive(Debug, Default)]
pub struct LogTask;

#[async_trait]
impl Task for LogTask {
    async fn execute(&self, input: TaskInput) -> Result<TaskResult, VmError> {
        let message = input.get_str("message").unwrap_or("");
        info!("{message}");
        Ok(TaskResult::Done(Value::Null))
    }
}

/// Sleeps for `ms` milliseconds.
#[derive(Debug, Default)]
pub struct SleepTask;

#[async_trait]
impl Task for SleepTask {
    async fn execute(&self, input: TaskInput) -> Result<TaskResult, VmError> {
        let ms = input
            .get_u64("ms")
            .ok_or_else(|| VmError::Type("sleep: missing numeric input 'ms'".to_string()))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(TaskResult::Done(Value::Null))
    }
}

/// Always fails, with the `message` input as the failure message.
#[derive(Debug, Default)]
pub struct FailTask;

#[async_trait]
impl Task for FailTask {
    async fn execute(&self, input: TaskInput) -> Result<TaskResult, VmError> {
        let message = input.get_str("message").unwrap_or("fail task invoked");
        Err(VmError::Task {
            name: "fail".to_string(),
            message: message.to_string(),
        })
    }
}

/// Parks the calling thread until an external event arrives, then returns
/// the event payload as the task result.
///
/// The event reference comes from the required `event` input. The task is
/// reentrant: the resume side may run in a different process, against
/// state restored from a snapshot.
#[derive(Debug, Default)]
pub struct AwaitEventTask;

#[async_trait]
impl Task for AwaitEventTask {
    async fn execute(&self, input: TaskInput) -> Result<TaskResult, VmError> {
        let event = input.require_str("event")?;
        Ok(TaskResult::Suspended {
            event: event.to_string(),
        })
    }

    async fn resume(&self, payload: Value) -> Result<TaskResult, VmError> {
        Ok(TaskResult::Done(payload))
    }
}

/// Registers every built-in task under its canonical name.
pub fn register_builtins(registry: &TaskRegistry) {
    registry.register("echo", Arc::new(EchoTask));
    registry.register("log", Arc::new(LogTask));
    registry.register("sleep", Arc::new(SleepTask));
    registry.register("fail", Arc::new(FailTask));
    registry.register("awaitEvent", Arc::new(AwaitEventTask));
}
