//! Starting child threads.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::commands::{Command, JoinCommand};
use crate::error::VmError;
use crate::runtime::Runtime;
use crate::state::State;
use crate::thread::ThreadId;

/// Starts a child thread with a pre-allocated id.
///
/// The child's root frame is seeded with a snapshot of the parent's
/// combined locals and input overrides. This is the primitive used by
/// parallel loops, which need per-item locals on the fork site; user flows
/// normally go through [`ParallelCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkCommand {
    /// Id of the child thread, allocated via
    /// [`State::next_thread_id`].
    pub thread_id: ThreadId,
    /// The child's program, in execution order.
    pub commands: Vec<Command>,
}

impl ForkCommand {
    pub(crate) fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        state.fork(thread_id, self.thread_id, self.commands.clone())?;
        runtime.spawn(state, self.thread_id);
        Ok(())
    }
}

/// Starts one child thread per branch and immediately joins all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelCommand {
    /// One program per branch, in execution order.
    pub branches: Vec<Vec<Command>>,
}

impl ParallelCommand {
    pub(crate) fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let ids: Vec<ThreadId> = self
            .branches
            .iter()
            .map(|_| state.next_thread_id())
            .collect();
        let join = JoinCommand {
            threads: ids.iter().copied().collect::<BTreeSet<_>>(),
        };
        state.with_frame(thread_id, |f| f.push_command(Command::Join(join)))?;
        for (id, branch) in ids.iter().zip(&self.branches) {
            state.fork(thread_id, *id, branch.clone())?;
            runtime.spawn(state, *id);
        }
        Ok(())
    }
}
