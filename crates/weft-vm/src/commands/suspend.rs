//! Suspension and checkpoints.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::VmError;
use crate::runtime::Runtime;
use crate::sdk::Checkpoint;
use crate::state::State;
use crate::thread::{ThreadId, ThreadStatus};

/// Parks the current thread until [`crate::vm::Vm::resume`] is called with
/// the event reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendCommand {
    /// Event reference to wait on.
    pub event: String,
}

impl SuspendCommand {
    pub(crate) fn eval(&self, state: &Arc<State>, thread_id: ThreadId) -> Result<(), VmError> {
        suspend_thread(state, thread_id, &self.event)
    }
}

/// Records the event reference and parks the thread. The scheduler notices
/// the status on its next turn and leaves the evaluation loop.
pub(crate) fn suspend_thread(
    state: &Arc<State>,
    thread_id: ThreadId,
    event: &str,
) -> Result<(), VmError> {
    state.set_event_ref(thread_id, event)?;
    state.set_status(thread_id, ThreadStatus::Suspended);
    debug!(thread = %thread_id, event, "thread suspended");
    Ok(())
}

/// Stores a restartable snapshot of the whole process.
///
/// The snapshot shows the capturing thread as suspended on a fresh event
/// reference; resuming that reference against a state restored from the
/// snapshot continues the process right after the checkpoint. The live run
/// is not interrupted. Taking a checkpoint is only legal when every other
/// thread is at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointCommand {
    /// User-assigned checkpoint name.
    pub name: String,
}

impl CheckpointCommand {
    pub(crate) fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let event_ref = format!("checkpoint-{}", Uuid::new_v4());
        let snapshot = state.snapshot_as_suspended(thread_id, &event_ref)?;
        debug!(thread = %thread_id, name = %self.name, event = %event_ref, "checkpoint taken");
        runtime.services().checkpoints.store(Checkpoint {
            name: self.name.clone(),
            event_ref,
            created_at: Utc::now(),
            state: snapshot,
        })
    }
}
