//! Extension points of the execution core.
//!
//! The machine itself only knows how to move frames around; everything with
//! an outside effect goes through the traits here: [`Task`] for units of
//! work, [`ExpressionEvaluator`] for turning `${...}` templates into values,
//! [`FlowRegistry`] for named sub-flows, [`ScriptEvaluator`] for inline
//! scripts, and [`CheckpointSink`] for storing mid-flight snapshots.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commands::Command;
use crate::error::VmError;
use crate::scope::Variables;
use crate::state::StateSnapshot;

/// Input passed to a task: its evaluated `in` variables, with any input
/// overrides already merged in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    variables: Variables,
}

impl TaskInput {
    /// Wraps an already-evaluated variable map.
    pub fn new(variables: Variables) -> Self {
        TaskInput { variables }
    }

    /// All input variables.
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// A single input variable.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// A string input variable.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.variables.get(key).and_then(Value::as_str)
    }

    /// An unsigned integer input variable.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.variables.get(key).and_then(Value::as_u64)
    }

    /// A required string input variable, with a type error naming the key
    /// when it is missing.
    pub fn require_str(&self, key: &str) -> Result<&str, VmError> {
        self.get_str(key)
            .ok_or_else(|| VmError::Type(format!("missing required input string '{key}'")))
    }
}

/// What a task invocation produced.
#[derive(Debug, Clone)]
pub enum TaskResult {
    /// The task completed with a result value.
    Done(Value),
    /// The task wants the calling thread parked until the named event
    /// arrives; [`Task::resume`] is invoked with the event payload.
    Suspended {
        /// Event reference the thread will wait on.
        event: String,
    },
}

/// A unit of work invokable from a step.
///
/// Tasks must be reentrant with respect to suspension: a task that returns
/// [`TaskResult::Suspended`] may see its [`resume`](Task::resume) called in
/// a different OS process, against state restored from a snapshot.
#[async_trait]
pub trait Task: Send + Sync {
    /// Runs the task.
    async fn execute(&self, input: TaskInput) -> Result<TaskResult, VmError>;

    /// Continues a previously suspended invocation with the event payload.
    async fn resume(&self, _payload: Value) -> Result<TaskResult, VmError> {
        Err(VmError::IllegalState(
            "this task does not support resuming".to_string(),
        ))
    }
}

/// Resolves task names to implementations.
pub trait TaskProvider: Send + Sync {
    /// Looks up a task by name.
    fn task(&self, name: &str) -> Option<Arc<dyn Task>>;
}

/// A concurrent in-memory [`TaskProvider`].
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        TaskRegistry::default()
    }

    /// Registers a task under a name, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, task: Arc<dyn Task>) {
        self.tasks.insert(name.into(), task);
    }
}

impl TaskProvider for TaskRegistry {
    fn task(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).map(|t| Arc::clone(t.value()))
    }
}

/// Resolves flow names to their entry commands.
pub trait FlowRegistry: Send + Sync {
    /// Looks up a flow's entry command by name.
    fn flow(&self, name: &str) -> Option<Command>;
}

/// A concurrent in-memory [`FlowRegistry`].
#[derive(Default)]
pub struct InMemoryFlowRegistry {
    flows: DashMap<String, Command>,
}

impl InMemoryFlowRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        InMemoryFlowRegistry::default()
    }

    /// Registers a flow under a name.
    pub fn register(&self, name: impl Into<String>, entry: Command) {
        self.flows.insert(name.into(), entry);
    }
}

impl FlowRegistry for InMemoryFlowRegistry {
    fn flow(&self, name: &str) -> Option<Command> {
        self.flows.get(name).map(|c| c.value().clone())
    }
}

/// Evaluates expression templates against a variable scope.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluates a single value. Strings may contain `${...}` templates;
    /// arrays and objects are evaluated recursively; other values pass
    /// through unchanged.
    fn eval(&self, scope: &Variables, value: &Value) -> Result<Value, VmError>;

    /// Evaluates every value of a map.
    fn eval_map(&self, scope: &Variables, map: &Variables) -> Result<Variables, VmError> {
        let mut out = Variables::new();
        for (k, v) in map {
            out.insert(k.clone(), self.eval(scope, v)?);
        }
        Ok(out)
    }
}

/// The default template evaluator.
///
/// A string consisting of exactly one `${path}` template resolves to the
/// referenced value with its type intact; templates embedded in a longer
/// string are rendered into it. Paths are dot-separated, with numeric
/// segments indexing arrays. An unresolvable path yields `null`.
#[derive(Debug, Default)]
pub struct TemplateEvaluator;

impl TemplateEvaluator {
    /// Creates the evaluator.
    pub fn new() -> Self {
        TemplateEvaluator
    }

    fn resolve(scope: &Variables, path: &str) -> Value {
        let mut segments = path.split('.');
        let first = match segments.next() {
            Some(s) => s,
            None => return Value::Null,
        };
        let mut current = match scope.get(first.trim()) {
            Some(v) => v.clone(),
            None => return Value::Null,
        };
        for segment in segments {
            let segment = segment.trim();
            current = match &current {
                Value::Object(map) => match map.get(segment) {
                    Some(v) => v.clone(),
                    None => return Value::Null,
                },
                Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i))
                {
                    Some(v) => v.clone(),
                    None => return Value::Null,
                },
                _ => return Value::Null,
            };
        }
        current
    }

    fn render(value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn eval_str(&self, scope: &Variables, s: &str) -> Result<Value, VmError> {
        // single full-string template keeps the referenced value's type
        if let Some(inner) = s
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            if !inner.contains("${") {
                return Ok(Self::resolve(scope, inner));
            }
        }
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                VmError::Expression(format!("unterminated template in '{s}'"))
            })?;
            out.push_str(&Self::render(&Self::resolve(scope, &after[..end])));
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }
}

impl ExpressionEvaluator for TemplateEvaluator {
    fn eval(&self, scope: &Variables, value: &Value) -> Result<Value, VmError> {
        match value {
            Value::String(s) if s.contains("${") => self.eval_str(scope, s),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.eval(scope, v))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => Ok(Value::Object(self.eval_map(scope, map)?)),
            other => Ok(other.clone()),
        }
    }
}

/// Evaluates inline scripts.
pub trait ScriptEvaluator: Send + Sync {
    /// Runs a script body in the given language against the scope.
    fn eval(&self, language: &str, body: &str, scope: &Variables) -> Result<Value, VmError>;
}

/// Default script evaluator: rejects every script. Embedders plug in a real
/// engine through [`crate::runtime::Services::with_scripts`].
#[derive(Debug, Default)]
pub struct NoScriptSupport;

impl ScriptEvaluator for NoScriptSupport {
    fn eval(&self, language: &str, _body: &str, _scope: &Variables) -> Result<Value, VmError> {
        Err(VmError::Script(format!(
            "no script engine configured (language: {language})"
        )))
    }
}

/// A mid-flight snapshot of a process, taken by a checkpoint command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// User-assigned checkpoint name.
    pub name: String,
    /// Event reference under which the captured state can be resumed.
    pub event_ref: String,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
    /// The captured state.
    pub state: StateSnapshot,
}

/// Receives checkpoints for storage.
pub trait CheckpointSink: Send + Sync {
    /// Stores a checkpoint.
    fn store(&self, checkpoint: Checkpoint) -> Result<(), VmError>;
}

/// Default sink: discards checkpoints.
#[derive(Debug, Default)]
pub struct NoopCheckpointSink;

impl CheckpointSink for NoopCheckpointSink {
    fn store(&self, _checkpoint: Checkpoint) -> Result<(), VmError> {
        Ok(())
    }
}

/// An in-memory sink that keeps every stored checkpoint. Mostly useful in
/// tests and single-process embeddings.
#[derive(Debug, Default)]
pub struct MemoryCheckpointSink {
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl MemoryCheckpointSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        MemoryCheckpointSink::default()
    }

    /// Removes and returns all stored checkpoints, oldest first.
    pub fn take_all(&self) -> Vec<Checkpoint> {
        let mut guard = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }
}

impl CheckpointSink for MemoryCheckpointSink {
    fn store(&self, checkpoint: Checkpoint) -> Result<(), VmError> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn scope() -> Variables {
        let v = json!({
            "name": "weft",
            "count": 3,
            "nested": {"list": [10, 20, 30], "flag": true},
        });
        match v {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn full_string_template_keeps_the_type() {
        let eval = TemplateEvaluator::new();
        assert_eq!(eval.eval(&scope(), &json!("${count}")).unwrap(), json!(3));
        assert_eq!(
            eval.eval(&scope(), &json!("${nested.list.1}")).unwrap(),
            json!(20)
        );
        assert_eq!(
            eval.eval(&scope(), &json!("${nested.flag}")).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn embedded_templates_render_into_the_string() {
        let eval = TemplateEvaluator::new();
        assert_eq!(
            eval.eval(&scope(), &json!("hi ${name}, you have ${count}"))
                .unwrap(),
            json!("hi weft, you have 3")
        );
    }

    #[test]
    fn unresolvable_paths_yield_null() {
        let eval = TemplateEvaluator::new();
        assert_eq!(eval.eval(&scope(), &json!("${missing.path}")).unwrap(), json!(null));
        assert_eq!(
            eval.eval(&scope(), &json!("x=${missing}")).unwrap(),
            json!("x=")
        );
    }

    #[test]
    fn containers_are_evaluated_recursively() {
        let eval = TemplateEvaluator::new();
        let value = json!({"a": ["${name}", "${count}"], "b": {"c": "${nested.flag}"}});
        assert_eq!(
            eval.eval(&scope(), &value).unwrap(),
            json!({"a": ["weft", 3], "b": {"c": true}})
        );
    }

    #[test]
    fn unterminated_template_is_an_error() {
        let eval = TemplateEvaluator::new();
        assert!(matches!(
            eval.eval(&scope(), &json!("${name")),
            Err(VmError::Expression(_))
        ));
    }

    #[test]
    fn plain_values_pass_through() {
        let eval = TemplateEvaluator::new();
        assert_eq!(eval.eval(&scope(), &json!(42)).unwrap(), json!(42));
        assert_eq!(
            eval.eval(&scope(), &json!("no templates")).unwrap(),
            json!("no templates")
        );
    }
}
