//! The virtual machine: the per-thread evaluation loop, stack unwinding,
//! and the process-level entry points `start` and `resume`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, trace};

use crate::commands::{Command, Step};
use crate::error::VmError;
use crate::frame::{LAST_ERROR_KEY, LAST_EXCEPTION_KEY, RESUME_PAYLOAD_KEY};
use crate::runtime::{Runtime, Services, VmConfig};
use crate::state::{Advance, State};
use crate::thread::{ThreadId, ThreadStatus};

/// The process interpreter.
///
/// A `Vm` is stateless apart from its [`Runtime`]; all process data lives in
/// the [`State`] passed to each call, so one `Vm` can drive any number of
/// processes.
pub struct Vm {
    runtime: Runtime,
}

impl Vm {
    /// Creates a machine with the default configuration.
    pub fn new(services: Arc<Services>) -> Self {
        Vm::with_config(services, VmConfig::default())
    }

    /// Creates a machine with the given configuration.
    pub fn with_config(services: Arc<Services>, config: VmConfig) -> Self {
        Vm {
            runtime: Runtime::new(services, config),
        }
    }

    /// The machine's runtime handle.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Runs a process from its current state until every logical thread is
    /// `Done` or `Suspended`.
    ///
    /// On an unhandled error the process's `lastError` global is set and
    /// the error is returned.
    pub async fn start(&self, state: &Arc<State>) -> Result<(), VmError> {
        debug!("start -> begin");
        let root = state.root_thread_id();
        let result = Self::eval_thread(&self.runtime, state, root).await;
        self.runtime.drain().await;
        self.finish(state, result, "start")
    }

    /// Delivers an external event to a suspended process and runs it until
    /// it is at rest again.
    ///
    /// The thread waiting on `event_ref` receives `payload` (unless it is
    /// `null`) on its top frame; every suspended ancestor of that thread is
    /// woken so that pending joins re-evaluate.
    pub async fn resume(
        &self,
        state: &Arc<State>,
        event_ref: &str,
        payload: Value,
    ) -> Result<(), VmError> {
        debug!(event = event_ref, "resume -> begin");
        let thread_id = state
            .take_event_ref(event_ref)
            .ok_or_else(|| VmError::UnknownEventRef(event_ref.to_string()))?;
        if !payload.is_null() {
            // only a pending task continuation consumes the payload; an
            // explicit suspend has no consumer and must not retain it
            state.with_frame(thread_id, |f| {
                let continuation_pending = matches!(
                    f.peek_command(),
                    Some(Command::Step(step)) if matches!(step.step, Step::TaskResume { .. })
                );
                if continuation_pending {
                    f.set_local(RESUME_PAYLOAD_KEY, payload);
                }
            })?;
        }

        let root = state.root_thread_id();
        let mut cursor = Some(thread_id);
        while let Some(id) = cursor {
            if id == root {
                break;
            }
            if state.status(id) == Some(ThreadStatus::Suspended) {
                state.set_status(id, ThreadStatus::Ready);
                self.runtime.spawn(state, id);
            }
            cursor = state.parent_of(id);
        }

        state.set_status(root, ThreadStatus::Ready);
        let result = Self::eval_thread(&self.runtime, state, root).await;
        self.runtime.drain().await;
        self.finish(state, result, "resume")
    }

    /// Evaluates a single command in the root thread's current context,
    /// without touching the rest of the machine. Useful for embedder-driven
    /// side entry points such as recovery handlers.
    pub async fn run_single(&self, state: &Arc<State>, command: &Command) -> Result<(), VmError> {
        command
            .eval(&self.runtime, state, state.root_thread_id())
            .await
    }

    fn finish(
        &self,
        state: &Arc<State>,
        result: Result<(), VmError>,
        what: &str,
    ) -> Result<(), VmError> {
        if let Err(e) = &result {
            state.set_global(LAST_ERROR_KEY, e.as_variable());
        }
        debug!("{what} -> done");
        result
    }

    /// Drives one logical thread until it finishes, suspends or fails.
    pub(crate) async fn eval_thread(
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let result = Self::eval_loop(runtime, state, thread_id).await;
        state.gc();
        result
    }

    async fn eval_loop(
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        loop {
            match state.status(thread_id) {
                None => return Err(VmError::ThreadNotFound(thread_id)),
                Some(ThreadStatus::Done) => {
                    return Err(VmError::IllegalState(format!(
                        "thread {thread_id} is already done"
                    )))
                }
                Some(ThreadStatus::Failed) => {
                    return Err(VmError::IllegalState(format!(
                        "thread {thread_id} has failed and cannot continue"
                    )))
                }
                Some(ThreadStatus::Suspended) => {
                    trace!(thread = %thread_id, "thread is suspended, leaving the loop");
                    return Ok(());
                }
                Some(ThreadStatus::Ready) => {
                    state.set_status(thread_id, ThreadStatus::Running);
                }
                Some(ThreadStatus::Running) => {}
            }

            match state.advance(thread_id)? {
                Advance::Finished => {
                    trace!(thread = %thread_id, "thread is done");
                    return Ok(());
                }
                Advance::Continue => continue,
                Advance::Run(command) => {
                    if let Err(e) = command.eval(runtime, state, thread_id).await {
                        Self::unwind(state, thread_id, e)?;
                    }
                }
            }
        }
    }

    /// Propagates an error up the given thread's stack.
    ///
    /// Frames are popped until one with an exception handler is found; that
    /// frame's remaining commands are replaced by the handler and the
    /// serialized cause is stored in its locals. A frame with a finalizer
    /// but no handler runs the finalizer first and then re-raises. If the
    /// stack runs dry the thread is marked `Failed`, the cause is stored
    /// for a parent `join`, and the error is returned to the caller.
    fn unwind(state: &Arc<State>, thread_id: ThreadId, cause: VmError) -> Result<(), VmError> {
        loop {
            if state.frame_count(thread_id) == 0 {
                error!(thread = %thread_id, "unhandled error: {}", cause.clone().unlogged());
                state.set_thread_error(thread_id, cause.clone().unlogged());
                state.set_status(thread_id, ThreadStatus::Failed);
                return Err(cause);
            }

            let handled = state.with_frame(thread_id, |frame| {
                if let Some(handler) = frame.take_exception_handler() {
                    frame.clear_commands();
                    let serialized = serde_json::to_value(&cause)
                        .unwrap_or_else(|_| Value::String(cause.to_string()));
                    frame.set_local(LAST_EXCEPTION_KEY, serialized);
                    frame.push_command(handler);
                    true
                } else if let Some(finalizer) = frame.take_finalizer() {
                    // run the finalizer, then continue unwinding
                    frame.clear_commands();
                    frame.push_command(Command::raise(cause.clone()));
                    frame.push_command(finalizer);
                    true
                } else {
                    false
                }
            })?;

            if handled {
                trace!(thread = %thread_id, "error intercepted: {cause}");
                return Ok(());
            }
            let _ = state.pop_frame(thread_id)?;
        }
    }
}
