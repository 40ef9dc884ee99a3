//! The command set of the machine.
//!
//! [`Command`] is a closed, serializable enum: everything a process can do
//! is one of these variants, and a frame's command list is plain data. The
//! scheduler pops a command off the top frame and calls [`Command::eval`];
//! commands never pop themselves. A command that needs to run again (a loop
//! iterator, a suspended `join`) pushes itself back.

mod branch;
mod error_scope;
mod fork;
mod join;
mod loops;
mod retry;
mod step;
mod suspend;

pub use branch::{IfCommand, SwitchCase, SwitchCommand};
pub use error_scope::{ErrorScopeCommand, ExposeLastErrorCommand};
pub use fork::{ForkCommand, ParallelCommand};
pub use join::JoinCommand;
pub use loops::{
    CollectIterationCommand, FlushLoopOutputsCommand, ForkBatchCommand, GatherBatchCommand,
    LoopCommand, LoopMode, LoopNextCommand, StoreThreadOutputsCommand,
};
pub use retry::{RetryCommand, RetryNextCommand};
pub use step::{Location, Step, StepCommand};
pub use suspend::{CheckpointCommand, SuspendCommand};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::VmError;
use crate::frame::Frame;
use crate::runtime::Runtime;
use crate::state::State;
use crate::thread::ThreadId;

/// A single instruction of the machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Runs commands in a fresh frame.
    Block(BlockCommand),
    /// Runs commands in the current frame.
    Seq(SeqCommand),
    /// A workflow step (task call, expression, script, flow call, ...).
    Step(StepCommand),
    /// Conditional branch.
    If(IfCommand),
    /// Multi-way branch.
    Switch(SwitchCommand),
    /// Starts a child thread with a fixed id.
    Fork(ForkCommand),
    /// Starts one child thread per branch and joins them.
    Parallel(ParallelCommand),
    /// Waits for a set of child threads.
    Join(JoinCommand),
    /// Iterates a body over a list of items, serially or in parallel.
    Loop(LoopCommand),
    /// Internal: schedules the next serial loop iteration.
    LoopNext(LoopNextCommand),
    /// Internal: collects a serial iteration's out-variables.
    CollectIteration(CollectIterationCommand),
    /// Internal: publishes accumulated loop out-variables.
    FlushLoopOutputs(FlushLoopOutputsCommand),
    /// Internal: forks the next batch of a parallel loop.
    ForkBatch(ForkBatchCommand),
    /// Internal: collects a finished batch's out-variables.
    GatherBatch(GatherBatchCommand),
    /// Internal: publishes a loop body thread's out-variables.
    StoreThreadOutputs(StoreThreadOutputsCommand),
    /// Runs a body, re-running it on failure up to a limit.
    Retry(RetryCommand),
    /// Internal: the handler installed by [`RetryCommand`].
    RetryNext(RetryNextCommand),
    /// Runs a body with an error handler attached.
    ErrorScope(ErrorScopeCommand),
    /// Internal: exposes the intercepted error as `lastError`.
    ExposeLastError(ExposeLastErrorCommand),
    /// Parks the current thread until an event arrives.
    Suspend(SuspendCommand),
    /// Stores a restartable snapshot of the process.
    Checkpoint(CheckpointCommand),
    /// Raises an error. Used to re-raise after finalizers.
    Raise(RaiseCommand),
}

impl Command {
    /// Shorthand for a [`RaiseCommand`].
    pub fn raise(error: VmError) -> Command {
        Command::Raise(RaiseCommand { error })
    }

    /// Evaluates the command in the context of the given logical thread.
    pub(crate) async fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        match self {
            Command::Block(c) => c.eval(state, thread_id),
            Command::Seq(c) => c.eval(state, thread_id),
            Command::Step(c) => c.eval(runtime, state, thread_id).await,
            Command::If(c) => c.eval(runtime, state, thread_id),
            Command::Switch(c) => c.eval(runtime, state, thread_id),
            Command::Fork(c) => c.eval(runtime, state, thread_id),
            Command::Parallel(c) => c.eval(runtime, state, thread_id),
            Command::Join(c) => c.eval(runtime, state, thread_id).await,
            Command::Loop(c) => c.eval(runtime, state, thread_id),
            Command::LoopNext(c) => c.eval(state, thread_id),
            Command::CollectIteration(c) => c.eval(state, thread_id),
            Command::FlushLoopOutputs(c) => c.eval(state, thread_id),
            Command::ForkBatch(c) => c.eval(state, thread_id),
            Command::GatherBatch(c) => c.eval(state, thread_id),
            Command::StoreThreadOutputs(c) => c.eval(state, thread_id),
            Command::Retry(c) => c.eval(runtime, state, thread_id),
            Command::RetryNext(c) => c.eval(runtime, state, thread_id).await,
            Command::ErrorScope(c) => c.eval(state, thread_id),
            Command::ExposeLastError(c) => c.eval(state, thread_id),
            Command::Suspend(c) => c.eval(state, thread_id),
            Command::Checkpoint(c) => c.eval(runtime, state, thread_id),
            Command::Raise(c) => Err(c.error.clone()),
        }
    }
}

/// Runs a list of commands in a fresh frame pushed on top of the stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCommand {
    /// Commands, in execution order.
    pub commands: Vec<Command>,
    /// Whether the new frame is a variable scope root.
    pub root: bool,
    /// Optional finalizer of the new frame; runs on normal exit and during
    /// unwinding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer: Option<Box<Command>>,
}

impl BlockCommand {
    fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        let mut builder = Frame::builder();
        builder = if self.root {
            builder.root()
        } else {
            builder.non_root()
        };
        builder = builder.commands(self.commands.iter().cloned());
        if let Some(finalizer) = &self.finalizer {
            builder = builder.finalizer((**finalizer).clone());
        }
        state.push_frame(thread_id, builder.build())
    }
}

/// Pushes a list of commands onto the current frame, to run in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqCommand {
    /// Commands, in execution order.
    pub commands: Vec<Command>,
}

impl SeqCommand {
    fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        state.with_frame(thread_id, |frame| {
            for command in self.commands.iter().rev() {
                frame.push_command(command.clone());
            }
        })
    }
}

/// Raises an error when evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaiseCommand {
    /// The error to raise.
    pub error: VmError,
}
