//! Waiting on child threads.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::commands::Command;
use crate::error::VmError;
use crate::runtime::Runtime;
use crate::state::State;
use crate::thread::{ThreadId, ThreadStatus};

#[derive(Debug)]
enum Outcome {
    Pending,
    Suspended,
    Failed,
    Completed,
}

/// Waits until every thread in the set reaches a terminal state.
///
/// Exactly one of three things happens:
/// - all threads end `Done`: the join completes and the threads are reaped;
/// - at least one thread fails (and none are still running): the stored
///   causes are collected into [`VmError::Aggregate`], ordered by thread
///   id, and raised in the joining thread;
/// - no thread is runnable but at least one is `Suspended`: the joining
///   thread suspends too, with the join pushed back so that resuming a
///   descendant re-evaluates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCommand {
    /// The threads being waited on.
    pub threads: BTreeSet<ThreadId>,
}

impl JoinCommand {
    pub(crate) async fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        loop {
            match self.outcome(state) {
                Outcome::Pending => {
                    state
                        .wait_for_change(runtime.config().join_poll_interval())
                        .await;
                }
                Outcome::Completed => {
                    trace!(thread = %thread_id, "join complete");
                    state.reap(self.threads.iter().copied());
                    return Ok(());
                }
                Outcome::Suspended => {
                    debug!(thread = %thread_id, "all children parked, suspending the join");
                    state.with_frame(thread_id, |f| {
                        f.push_command(Command::Join(self.clone()))
                    })?;
                    state.set_status(thread_id, ThreadStatus::Suspended);
                    return Ok(());
                }
                Outcome::Failed => {
                    // BTreeSet order makes the aggregate stable
                    let mut causes = Vec::new();
                    for id in &self.threads {
                        if let Some(cause) = state.take_thread_error(*id) {
                            causes.push(cause);
                        }
                    }
                    state.reap(self.threads.iter().copied());
                    return Err(VmError::Aggregate(causes));
                }
            }
        }
    }

    fn outcome(&self, state: &Arc<State>) -> Outcome {
        let statuses = state.statuses();
        let mut any_suspended = false;
        let mut any_failed = false;
        for id in &self.threads {
            match statuses.get(id) {
                Some(ThreadStatus::Ready) | Some(ThreadStatus::Running) => {
                    return Outcome::Pending;
                }
                Some(ThreadStatus::Suspended) => any_suspended = true,
                Some(ThreadStatus::Failed) => any_failed = true,
                // unknown threads were already reaped, count them as done
                Some(ThreadStatus::Done) | None => {}
            }
        }
        if any_suspended {
            Outcome::Suspended
        } else if any_failed {
            Outcome::Failed
        } else {
            Outcome::Completed
        }
    }
}
