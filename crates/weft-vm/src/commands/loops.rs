//! Serial and parallel iteration over item lists.
//!
//! A loop is compiled into a small bookkeeping frame at eval time. Serial
//! loops re-push a [`LoopNextCommand`] that runs one body frame per item;
//! parallel loops fork the items in batches, each batch fenced by a `join`.
//! Out-variables are accumulated per iteration in the bookkeeping frame's
//! locals and published to the nearest enclosing scope root once the loop
//! finishes, each as a list with one element per item, in item order.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;

use crate::commands::{
    Command, ForkCommand, JoinCommand,
};
use crate::error::VmError;
use crate::frame::Frame;
use crate::runtime::Runtime;
use crate::scope::{normalize_items, Variables};
use crate::state::State;
use crate::thread::ThreadId;

/// Local holding the current item inside a loop body.
pub const CURRENT_ITEM: &str = "item";
/// Local holding the current zero-based index inside a loop body.
pub const CURRENT_INDEX: &str = "itemIndex";
/// Local holding the full normalized item list inside a loop body.
pub const CURRENT_ITEMS: &str = "items";

/// Bookkeeping local of the accumulator object.
const LOOP_ACC_KEY: &str = "__loop_acc";

/// Execution mode of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopMode {
    /// Items run one after another in the calling thread.
    Serial,
    /// Items run in child threads, in batches.
    Parallel,
}

/// Iterates a body command over a list of items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopCommand {
    /// The loop body, run once per item.
    pub body: Box<Command>,
    /// Item source expression. Arrays iterate as-is, objects iterate as
    /// `{key, value}` entries, `null` skips the loop entirely.
    pub items: Value,
    /// Out-variable names collected from each iteration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out: Vec<String>,
    /// Serial or parallel execution.
    pub mode: LoopMode,
    /// Parallel batch size expression. Only meaningful for parallel loops;
    /// defaults to the configured parallelism, with a floor of 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<Value>,
}

impl LoopCommand {
    pub(crate) fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let vars = state.scope(thread_id);
        let source = runtime.services().expressions.eval(&vars, &self.items)?;
        if source.is_null() {
            trace!(thread = %thread_id, "loop source is null, skipping");
            return Ok(());
        }
        let items = normalize_items(&source)?;
        if items.is_empty() {
            return Ok(());
        }
        match self.mode {
            LoopMode::Serial => self.eval_serial(state, thread_id, items),
            LoopMode::Parallel => self.eval_parallel(runtime, state, thread_id, items),
        }
    }

    fn accumulator(&self) -> Value {
        let mut acc = Variables::new();
        for var in &self.out {
            acc.insert(var.clone(), json!([]));
        }
        Value::Object(acc)
    }

    fn eval_serial(
        &self,
        state: &Arc<State>,
        thread_id: ThreadId,
        items: Vec<Value>,
    ) -> Result<(), VmError> {
        let frame = Frame::builder()
            .non_root()
            .local(CURRENT_ITEMS, Value::Array(items))
            .local(CURRENT_INDEX, json!(0))
            .local(LOOP_ACC_KEY, self.accumulator())
            .command(Command::LoopNext(LoopNextCommand {
                body: self.body.clone(),
                out: self.out.clone(),
            }))
            .command(Command::FlushLoopOutputs(FlushLoopOutputsCommand {
                out: self.out.clone(),
            }))
            .build();
        state.push_frame(thread_id, frame)
    }

    fn eval_parallel(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
        items: Vec<Value>,
    ) -> Result<(), VmError> {
        let batch_size = match &self.parallelism {
            Some(expr) => {
                let vars = state.scope(thread_id);
                let value = runtime.services().expressions.eval(&vars, expr)?;
                value.as_u64().ok_or_else(|| {
                    VmError::Type(format!("'parallelism' must be a number, got: {value}"))
                })? as usize
            }
            None => runtime.config().parallelism(),
        };
        let batch_size = batch_size.max(1);
        let frame = Frame::builder()
            .non_root()
            .local(CURRENT_ITEMS, Value::Array(items))
            .local(LOOP_ACC_KEY, self.accumulator())
            .command(Command::ForkBatch(ForkBatchCommand {
                body: self.body.clone(),
                out: self.out.clone(),
                offset: 0,
                batch_size,
            }))
            .command(Command::FlushLoopOutputs(FlushLoopOutputsCommand {
                out: self.out.clone(),
            }))
            .build();
        state.push_frame(thread_id, frame)
    }
}

/// Runs one serial iteration and re-pushes itself for the next.
///
/// Expects the current frame to be the loop's bookkeeping frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopNextCommand {
    /// The loop body.
    pub body: Box<Command>,
    /// Out-variable names collected from each iteration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out: Vec<String>,
}

impl LoopNextCommand {
    pub(crate) fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        let (items, index) = state.with_frame(thread_id, |f| {
            (
                f.local(CURRENT_ITEMS).cloned(),
                f.local(CURRENT_INDEX).and_then(Value::as_u64),
            )
        })?;
        let items = match items {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(VmError::IllegalState(
                    "loop bookkeeping frame has no item list".to_string(),
                ))
            }
        };
        let index = index.ok_or_else(|| {
            VmError::IllegalState("loop bookkeeping frame has no index".to_string())
        })? as usize;

        if index >= items.len() {
            return Ok(());
        }
        trace!(thread = %thread_id, index, total = items.len(), "serial loop iteration");

        let next = self.clone();
        state.with_frame(thread_id, |f| {
            f.set_local(CURRENT_INDEX, json!(index + 1));
            f.push_command(Command::LoopNext(next));
        })?;

        let body_frame = Frame::builder()
            .root()
            .local(CURRENT_ITEMS, Value::Array(items.clone()))
            .local(CURRENT_INDEX, json!(index))
            .local(CURRENT_ITEM, items[index].clone())
            .command((*self.body).clone())
            .command(Command::CollectIteration(CollectIterationCommand {
                out: self.out.clone(),
            }))
            .build();
        state.push_frame(thread_id, body_frame)
    }
}

/// Appends a serial iteration's out-variables to the loop accumulator.
///
/// Runs as the last command of a body frame; missing variables are recorded
/// as `null` so that positions stay aligned with items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectIterationCommand {
    /// Out-variable names to collect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out: Vec<String>,
}

impl CollectIterationCommand {
    pub(crate) fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        if self.out.is_empty() {
            return Ok(());
        }
        let values: Vec<(String, Value)> = state.with_frame(thread_id, |f| {
            self.out
                .iter()
                .map(|var| (var.clone(), f.local(var).cloned().unwrap_or(Value::Null)))
                .collect()
        })?;
        append_to_accumulator(state, thread_id, values)
    }
}

/// Publishes the accumulated out-variables to the nearest scope root.
///
/// Runs as the last command of the loop's bookkeeping frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushLoopOutputsCommand {
    /// Out-variable names to publish.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out: Vec<String>,
}

impl FlushLoopOutputsCommand {
    pub(crate) fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        if self.out.is_empty() {
            return Ok(());
        }
        let acc = state
            .with_frame(thread_id, |f| f.take_local(LOOP_ACC_KEY))?
            .ok_or_else(|| {
                VmError::IllegalState("loop bookkeeping frame has no accumulator".to_string())
            })?;
        let acc = match acc {
            Value::Object(map) => map,
            _ => {
                return Err(VmError::IllegalState(
                    "loop accumulator is not an object".to_string(),
                ))
            }
        };
        for var in &self.out {
            let list = acc.get(var).cloned().unwrap_or_else(|| json!([]));
            state.set_root_local(thread_id, var.as_str(), list)?;
        }
        Ok(())
    }
}

/// Forks the next batch of a parallel loop.
///
/// Pushes, onto the loop's bookkeeping frame: a join fencing the batch,
/// a gather collecting its outputs, the fork of the following batch, and
/// one wrapper frame per item carrying that item's locals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkBatchCommand {
    /// The loop body.
    pub body: Box<Command>,
    /// Out-variable names collected from each item.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out: Vec<String>,
    /// Index of the first item of this batch.
    pub offset: usize,
    /// Number of items per batch.
    pub batch_size: usize,
}

impl ForkBatchCommand {
    pub(crate) fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        let items = state.with_frame(thread_id, |f| f.local(CURRENT_ITEMS).cloned())?;
        let items = match items {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(VmError::IllegalState(
                    "loop bookkeeping frame has no item list".to_string(),
                ))
            }
        };
        if self.offset >= items.len() {
            return Ok(());
        }
        let end = (self.offset + self.batch_size).min(items.len());
        trace!(
            thread = %thread_id,
            from = self.offset,
            to = end,
            total = items.len(),
            "forking parallel loop batch"
        );

        let children: Vec<ThreadId> = (self.offset..end).map(|_| state.next_thread_id()).collect();

        let next_batch = ForkBatchCommand {
            offset: end,
            ..self.clone()
        };
        let gather = GatherBatchCommand {
            threads: children.clone(),
            out: self.out.clone(),
        };
        let join = JoinCommand {
            threads: children.iter().copied().collect::<BTreeSet<_>>(),
        };
        state.with_frame(thread_id, |f| {
            // pushed in reverse: the join runs first, then the gather,
            // then the next batch
            f.push_command(Command::ForkBatch(next_batch));
            f.push_command(Command::GatherBatch(gather));
            f.push_command(Command::Join(join));
        })?;

        for (child, index) in children.iter().zip(self.offset..end) {
            let mut program = vec![(*self.body).clone()];
            if !self.out.is_empty() {
                program.push(Command::StoreThreadOutputs(StoreThreadOutputsCommand {
                    out: self.out.clone(),
                }));
            }
            let wrapper = Frame::builder()
                .non_root()
                .local(CURRENT_ITEMS, Value::Array(items.clone()))
                .local(CURRENT_INDEX, json!(index))
                .local(CURRENT_ITEM, items[index].clone())
                .command(Command::Fork(ForkCommand {
                    thread_id: *child,
                    commands: program,
                }))
                .build();
            state.push_frame(thread_id, wrapper)?;
        }
        Ok(())
    }
}

/// Collects a finished batch's published outputs into the accumulator, in
/// item order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatherBatchCommand {
    /// Batch threads, in item order.
    pub threads: Vec<ThreadId>,
    /// Out-variable names to collect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out: Vec<String>,
}

impl GatherBatchCommand {
    pub(crate) fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        if self.out.is_empty() {
            return Ok(());
        }
        for child in &self.threads {
            let outputs = state.take_thread_outputs(*child).unwrap_or_default();
            let values: Vec<(String, Value)> = self
                .out
                .iter()
                .map(|var| {
                    (
                        var.clone(),
                        outputs.get(var).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect();
            append_to_accumulator(state, thread_id, values)?;
        }
        Ok(())
    }
}

/// Publishes a loop body thread's out-variables for the parent's gather.
///
/// Runs as the last command of a forked body thread, in its root frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreThreadOutputsCommand {
    /// Out-variable names to publish.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out: Vec<String>,
}

impl StoreThreadOutputsCommand {
    pub(crate) fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        let outputs: Variables = state.with_frame(thread_id, |f| {
            self.out
                .iter()
                .filter_map(|var| f.local(var).map(|v| (var.clone(), v.clone())))
                .collect()
        })?;
        state.set_thread_outputs(thread_id, outputs);
        Ok(())
    }
}

/// Appends one value per out-variable to the nearest accumulator frame.
fn append_to_accumulator(
    state: &Arc<State>,
    thread_id: ThreadId,
    values: Vec<(String, Value)>,
) -> Result<(), VmError> {
    state.update_local_nearest(thread_id, LOOP_ACC_KEY, |acc| {
        if let Value::Object(map) = acc {
            for (var, value) in values {
                match map.get_mut(&var) {
                    Some(Value::Array(list)) => list.push(value),
                    _ => {
                        map.insert(var, json!([value]));
                    }
                }
            }
        }
    })
}
