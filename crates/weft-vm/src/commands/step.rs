//! Workflow steps and the step wrapper.
//!
//! [`StepCommand`] wraps every user-visible step kind with uniform error
//! reporting: a failing step is logged exactly once, with its source
//! location and the stack depth at the point of failure, and the cause is
//! recorded on the current frame before it propagates.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::commands::suspend::suspend_thread;
use crate::commands::Command;
use crate::error::VmError;
use crate::frame::{Frame, LAST_EXCEPTION_KEY, RESUME_PAYLOAD_KEY};
use crate::runtime::Runtime;
use crate::scope::{deep_merge, Variables};
use crate::sdk::{TaskInput, TaskResult};
use crate::state::State;
use crate::thread::ThreadId;

/// Source position of a step in the flow definition it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Name of the flow definition file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub col: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{file}:{}:{}", self.line, self.col),
            None => write!(f, "{}:{}", self.line, self.col),
        }
    }
}

/// The step kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Step {
    /// Invokes a registered task.
    Task {
        /// Registered task name.
        name: String,
        /// Input expressions, evaluated before the call.
        input: Variables,
        /// Variable that receives the task result, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        out: Option<String>,
    },
    /// Continues a task suspended in a previous run. Pushed by the machine
    /// itself; not meant to appear in user flows.
    TaskResume {
        /// Registered task name.
        name: String,
        /// Variable that receives the task result, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        out: Option<String>,
    },
    /// Evaluates an expression.
    Expression {
        /// The expression.
        expression: Value,
        /// Variable that receives the result, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        out: Option<String>,
    },
    /// Runs an inline script through the configured script engine.
    Script {
        /// Script language identifier.
        language: String,
        /// Script body.
        body: String,
        /// Variable that receives the result, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        out: Option<String>,
    },
    /// Evaluates expressions and stores them on the nearest scope root.
    SetVariables {
        /// Variable name to expression.
        variables: Variables,
    },
    /// Calls a registered flow in a fresh scope.
    FlowCall {
        /// Registered flow name.
        flow: String,
        /// Input expressions seeding the flow's scope.
        input: Variables,
    },
    /// Logs an interpolated message.
    Log {
        /// Message template.
        message: Value,
    },
}

/// A step plus its source location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCommand {
    /// The step to run.
    pub step: Step,
    /// Where the step came from, for error reporting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl StepCommand {
    /// A step without location information.
    pub fn of(step: Step) -> Self {
        StepCommand {
            step,
            location: None,
        }
    }

    /// A step with a source location.
    pub fn at(step: Step, location: Location) -> Self {
        StepCommand {
            step,
            location: Some(location),
        }
    }

    pub(crate) async fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        match self.run(runtime, state, thread_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_logged() => Err(e),
            Err(e) => {
                let location = self
                    .location
                    .as_ref()
                    .map(Location::to_string)
                    .unwrap_or_else(|| "unknown location".to_string());
                let depth = state.frame_count(thread_id);
                error!(thread = %thread_id, %location, depth, "step failed: {e}");
                let serialized = serde_json::to_value(&e)
                    .unwrap_or_else(|_| Value::String(e.to_string()));
                // best effort: the stack may already be unwound
                let _ = state.with_frame(thread_id, |f| f.set_local(LAST_EXCEPTION_KEY, serialized));
                Err(e.logged())
            }
        }
    }

    async fn run(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let services = runtime.services();
        match &self.step {
            Step::Task { name, input, out } => {
                let input = prepare_input(runtime, state, thread_id, input)?;
                let task = services
                    .tasks
                    .task(name)
                    .ok_or_else(|| VmError::TaskNotFound(name.clone()))?;
                let result = task.execute(TaskInput::new(input)).await?;
                self.apply_task_result(state, thread_id, name, out.as_deref(), result)
            }
            Step::TaskResume { name, out } => {
                let payload = state
                    .with_frame(thread_id, |f| f.take_local(RESUME_PAYLOAD_KEY))?
                    .unwrap_or(Value::Null);
                let task = services
                    .tasks
                    .task(name)
                    .ok_or_else(|| VmError::TaskNotFound(name.clone()))?;
                let result = task.resume(payload).await?;
                self.apply_task_result(state, thread_id, name, out.as_deref(), result)
            }
            Step::Expression { expression, out } => {
                let vars = state.scope(thread_id);
                let value = services.expressions.eval(&vars, expression)?;
                if let Some(out) = out {
                    state.set_root_local(thread_id, out.as_str(), value)?;
                }
                Ok(())
            }
            Step::Script {
                language,
                body,
                out,
            } => {
                let vars = state.scope(thread_id);
                let value = services.scripts.eval(language, body, &vars)?;
                if let Some(out) = out {
                    state.set_root_local(thread_id, out.as_str(), value)?;
                }
                Ok(())
            }
            Step::SetVariables { variables } => {
                let vars = state.scope(thread_id);
                let evaluated = services.expressions.eval_map(&vars, variables)?;
                for (k, v) in evaluated {
                    state.set_root_local(thread_id, k, v)?;
                }
                Ok(())
            }
            Step::FlowCall { flow, input } => {
                let entry = services
                    .flows
                    .flow(flow)
                    .ok_or_else(|| VmError::FlowNotFound(flow.clone()))?;
                let vars = state.scope(thread_id);
                let evaluated = services.expressions.eval_map(&vars, input)?;
                let frame = Frame::builder()
                    .root()
                    .locals(evaluated)
                    .command(entry)
                    .build();
                state.push_frame(thread_id, frame)
            }
            Step::Log { message } => {
                let vars = state.scope(thread_id);
                let value = services.expressions.eval(&vars, message)?;
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                info!(thread = %thread_id, "{text}");
                Ok(())
            }
        }
    }

    fn apply_task_result(
        &self,
        state: &Arc<State>,
        thread_id: ThreadId,
        name: &str,
        out: Option<&str>,
        result: TaskResult,
    ) -> Result<(), VmError> {
        match result {
            TaskResult::Done(value) => {
                if let Some(out) = out {
                    state.set_root_local(thread_id, out, value)?;
                }
                Ok(())
            }
            TaskResult::Suspended { event } => {
                let continuation = Command::Step(StepCommand {
                    step: Step::TaskResume {
                        name: name.to_string(),
                        out: out.map(str::to_string),
                    },
                    location: self.location.clone(),
                });
                state.with_frame(thread_id, |f| f.push_command(continuation))?;
                suspend_thread(state, thread_id, &event)
            }
        }
    }
}

/// Evaluates a step's input expressions and deep-merges the thread's
/// combined input overrides on top, overrides winning.
fn prepare_input(
    runtime: &Runtime,
    state: &Arc<State>,
    thread_id: ThreadId,
    input: &Variables,
) -> Result<Variables, VmError> {
    let vars = state.scope(thread_id);
    let expressions = &runtime.services().expressions;
    let evaluated = expressions.eval_map(&vars, input)?;
    let overrides = state.combined_overrides(thread_id);
    if overrides.is_empty() {
        return Ok(evaluated);
    }
    let overrides = expressions.eval_map(&vars, &overrides)?;
    let mut merged = Value::Object(evaluated);
    deep_merge(&mut merged, &Value::Object(overrides));
    match merged {
        Value::Object(map) => Ok(map),
        _ => Ok(Variables::new()),
    }
}
