//! Durable process state.
//!
//! [`State`] holds everything a running process is: one frame stack per
//! logical thread, thread statuses and parent links, event references of
//! suspended threads, stored errors and outputs of finished threads, and the
//! process globals. All of it serializes to a [`StateSnapshot`], which is
//! what makes suspension durable.
//!
//! The container is internally synchronized; commands and the scheduler
//! share it through an `Arc`. Every mutation that can unblock a waiting
//! `join` also pings a [`tokio::sync::Notify`] so waiters re-check cheaply.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::commands::Command;
use crate::error::VmError;
use crate::frame::Frame;
use crate::scope::Variables;
use crate::thread::{ThreadId, ThreadStatus};

/// Shared, synchronized state of a single process instance.
#[derive(Debug)]
pub struct State {
    inner: Mutex<Inner>,
    change: Notify,
}

#[derive(Debug, Clone)]
struct Inner {
    root: ThreadId,
    next_thread_id: u64,
    globals: Variables,
    /// Frame stacks, bottom of stack first.
    frames: HashMap<ThreadId, Vec<Frame>>,
    statuses: HashMap<ThreadId, ThreadStatus>,
    parents: HashMap<ThreadId, ThreadId>,
    /// Event references of suspended threads, one per thread.
    event_refs: HashMap<ThreadId, String>,
    /// Unhandled errors of failed threads, kept until a `join` collects them.
    errors: HashMap<ThreadId, VmError>,
    /// Out-variables published by finished threads, kept until collected.
    outputs: HashMap<ThreadId, Variables>,
}

/// Result of asking the scheduler's [`State::advance`] what to do next.
#[derive(Debug)]
pub(crate) enum Advance {
    /// Evaluate this command.
    Run(Command),
    /// Bookkeeping happened (an empty frame was popped or a finalizer was
    /// promoted); ask again.
    Continue,
    /// The stack is empty; the thread was marked `Done`.
    Finished,
}

impl State {
    /// Creates the state of a new process with the given root frame.
    pub fn new(root_frame: Frame) -> Self {
        let root = ThreadId::ROOT;
        let mut frames = HashMap::new();
        frames.insert(root, vec![root_frame]);
        let mut statuses = HashMap::new();
        statuses.insert(root, ThreadStatus::Ready);
        State {
            inner: Mutex::new(Inner {
                root,
                next_thread_id: root.value() + 1,
                globals: Variables::new(),
                frames,
                statuses,
                parents: HashMap::new(),
                event_refs: HashMap::new(),
                errors: HashMap::new(),
                outputs: HashMap::new(),
            }),
            change: Notify::new(),
        }
    }

    /// Convenience: a new process whose root frame runs a single command.
    pub fn with_command(command: Command) -> Self {
        State::new(Frame::builder().root().command(command).build())
    }

    /// Rebuilds a state from a previously taken snapshot.
    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        let mut frames = HashMap::new();
        let mut statuses = HashMap::new();
        let mut parents = HashMap::new();
        let mut event_refs = HashMap::new();
        let mut errors = HashMap::new();
        let mut outputs = HashMap::new();
        for t in snapshot.threads {
            frames.insert(t.id, t.frames);
            statuses.insert(t.id, t.status);
            if let Some(parent) = t.parent {
                parents.insert(t.id, parent);
            }
            if let Some(event_ref) = t.event_ref {
                event_refs.insert(t.id, event_ref);
            }
            if let Some(error) = t.error {
                errors.insert(t.id, error);
            }
            if let Some(out) = t.outputs {
                outputs.insert(t.id, out);
            }
        }
        State {
            inner: Mutex::new(Inner {
                root: snapshot.root,
                next_thread_id: snapshot.next_thread_id,
                globals: snapshot.globals,
                frames,
                statuses,
                parents,
                event_refs,
                errors,
                outputs,
            }),
            change: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The id of the process's initial thread.
    pub fn root_thread_id(&self) -> ThreadId {
        self.lock().root
    }

    /// Allocates the next logical thread id. Ids are never reused within a
    /// process, even across suspend/resume cycles.
    pub fn next_thread_id(&self) -> ThreadId {
        let mut inner = self.lock();
        let id = ThreadId::new(inner.next_thread_id);
        inner.next_thread_id += 1;
        id
    }

    // ------------------------------------------------------------------
    // frames

    /// Pushes a frame onto the given thread's stack.
    pub fn push_frame(&self, thread_id: ThreadId, frame: Frame) -> Result<(), VmError> {
        let mut inner = self.lock();
        match inner.frames.get_mut(&thread_id) {
            Some(stack) => {
                stack.push(frame);
                Ok(())
            }
            None => Err(VmError::ThreadNotFound(thread_id)),
        }
    }

    /// Number of frames currently on the given thread's stack.
    pub fn frame_count(&self, thread_id: ThreadId) -> usize {
        self.lock()
            .frames
            .get(&thread_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Runs a closure against the top frame of the given thread.
    pub fn with_frame<R>(
        &self,
        thread_id: ThreadId,
        f: impl FnOnce(&mut Frame) -> R,
    ) -> Result<R, VmError> {
        let mut inner = self.lock();
        let frame = inner
            .frames
            .get_mut(&thread_id)
            .and_then(|stack| stack.last_mut())
            .ok_or(VmError::EmptyStack(thread_id))?;
        Ok(f(frame))
    }

    /// Decides the next scheduler action for the given thread: pop an empty
    /// frame (promoting its finalizer first, if any), finish the thread when
    /// the stack runs dry, or hand out the next command to evaluate.
    pub(crate) fn advance(&self, thread_id: ThreadId) -> Result<Advance, VmError> {
        enum Action {
            Run(Command),
            Promoted,
            PopFrame,
            Finish,
        }
        let action = {
            let mut inner = self.lock();
            match inner.frames.get_mut(&thread_id) {
                // gc may already have pruned a finished thread's stack, e.g.
                // when a resume re-enters a root that completed earlier
                None => {
                    inner.statuses.insert(thread_id, ThreadStatus::Done);
                    Action::Finish
                }
                Some(stack) => match stack.last_mut() {
                    None => {
                        inner.statuses.insert(thread_id, ThreadStatus::Done);
                        Action::Finish
                    }
                    Some(frame) => {
                        if let Some(command) = frame.pop_command() {
                            Action::Run(command)
                        } else if let Some(finalizer) = frame.take_finalizer() {
                            frame.push_command(finalizer);
                            Action::Promoted
                        } else {
                            stack.pop();
                            Action::PopFrame
                        }
                    }
                },
            }
        };
        match action {
            Action::Run(command) => Ok(Advance::Run(command)),
            Action::Promoted | Action::PopFrame => Ok(Advance::Continue),
            Action::Finish => {
                self.change.notify_waiters();
                Ok(Advance::Finished)
            }
        }
    }

    /// Pops the top frame of the given thread during unwinding.
    pub(crate) fn pop_frame(&self, thread_id: ThreadId) -> Result<Option<Frame>, VmError> {
        let mut inner = self.lock();
        let stack = inner
            .frames
            .get_mut(&thread_id)
            .ok_or(VmError::ThreadNotFound(thread_id))?;
        Ok(stack.pop())
    }

    // ------------------------------------------------------------------
    // variable scoping

    /// Builds the full evaluation scope of the given thread: process globals
    /// plus the locals of every frame on the stack, oldest frame first, so
    /// inner frames shadow outer ones.
    pub fn scope(&self, thread_id: ThreadId) -> Variables {
        let inner = self.lock();
        let mut scope = inner.globals.clone();
        if let Some(stack) = inner.frames.get(&thread_id) {
            for frame in stack {
                scope.extend(frame.locals().clone());
            }
        }
        scope
    }

    /// Combined locals of the given thread, without globals. Inner frames
    /// shadow outer ones.
    pub fn combined_locals(&self, thread_id: ThreadId) -> Variables {
        let inner = self.lock();
        let mut locals = Variables::new();
        if let Some(stack) = inner.frames.get(&thread_id) {
            for frame in stack {
                locals.extend(frame.locals().clone());
            }
        }
        locals
    }

    /// Combined input overrides of the given thread; overrides of inner
    /// frames win over outer ones.
    pub fn combined_overrides(&self, thread_id: ThreadId) -> Variables {
        let inner = self.lock();
        let mut overrides = Variables::new();
        if let Some(stack) = inner.frames.get(&thread_id) {
            for frame in stack {
                overrides.extend(frame.overrides().clone());
            }
        }
        overrides
    }

    /// Sets a variable on the nearest scope-root frame at or below the top
    /// of the stack. This is where step `out` variables land.
    pub fn set_root_local(
        &self,
        thread_id: ThreadId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), VmError> {
        let mut inner = self.lock();
        let stack = inner
            .frames
            .get_mut(&thread_id)
            .ok_or(VmError::ThreadNotFound(thread_id))?;
        let frame = stack
            .iter_mut()
            .rev()
            .find(|f| f.is_root())
            .ok_or_else(|| {
                VmError::IllegalState(format!("no root frame on the stack of thread {thread_id}"))
            })?;
        frame.set_local(key, value);
        Ok(())
    }

    /// Updates a local on the nearest frame (top first) that defines `key`.
    /// Used by loop accumulators to reach their bookkeeping frame from
    /// inside body frames.
    pub fn update_local_nearest(
        &self,
        thread_id: ThreadId,
        key: &str,
        f: impl FnOnce(&mut Value),
    ) -> Result<(), VmError> {
        let mut inner = self.lock();
        let stack = inner
            .frames
            .get_mut(&thread_id)
            .ok_or(VmError::ThreadNotFound(thread_id))?;
        for frame in stack.iter_mut().rev() {
            if frame.has_local(key) {
                let mut value = frame.take_local(key).unwrap_or(Value::Null);
                f(&mut value);
                frame.set_local(key, value);
                return Ok(());
            }
        }
        Err(VmError::IllegalState(format!(
            "no frame of thread {thread_id} defines '{key}'"
        )))
    }

    // ------------------------------------------------------------------
    // statuses and thread tree

    /// Current status of a thread, if it is known to the state.
    pub fn status(&self, thread_id: ThreadId) -> Option<ThreadStatus> {
        self.lock().statuses.get(&thread_id).copied()
    }

    /// Snapshot of all known thread statuses.
    pub fn statuses(&self) -> HashMap<ThreadId, ThreadStatus> {
        self.lock().statuses.clone()
    }

    /// Sets a thread's status and wakes any `join` waiting on a change.
    pub fn set_status(&self, thread_id: ThreadId, status: ThreadStatus) {
        self.lock().statuses.insert(thread_id, status);
        self.change.notify_waiters();
    }

    /// Parent of the given thread, if it is not the root.
    pub fn parent_of(&self, thread_id: ThreadId) -> Option<ThreadId> {
        self.lock().parents.get(&thread_id).copied()
    }

    /// Creates a child thread. The child gets a single root frame seeded
    /// with the parent's combined locals and input overrides (a snapshot,
    /// not a live reference) and the given commands, and starts `Ready`.
    pub fn fork(
        &self,
        parent: ThreadId,
        child: ThreadId,
        commands: Vec<Command>,
    ) -> Result<(), VmError> {
        let mut inner = self.lock();
        if inner.frames.contains_key(&child) {
            return Err(VmError::IllegalState(format!(
                "thread {child} already exists"
            )));
        }
        let (locals, overrides) = {
            let stack = inner
                .frames
                .get(&parent)
                .ok_or(VmError::ThreadNotFound(parent))?;
            let mut locals = Variables::new();
            let mut overrides = Variables::new();
            for frame in stack {
                locals.extend(frame.locals().clone());
                overrides.extend(frame.overrides().clone());
            }
            (locals, overrides)
        };
        let frame = Frame::builder()
            .root()
            .locals(locals)
            .overrides(overrides)
            .commands(commands)
            .build();
        inner.frames.insert(child, vec![frame]);
        inner.statuses.insert(child, ThreadStatus::Ready);
        inner.parents.insert(child, parent);
        drop(inner);
        self.change.notify_waiters();
        Ok(())
    }

    /// Forgets finished threads a `join` has already accounted for.
    pub fn reap(&self, thread_ids: impl IntoIterator<Item = ThreadId>) {
        let mut inner = self.lock();
        for id in thread_ids {
            inner.frames.remove(&id);
            inner.statuses.remove(&id);
            inner.parents.remove(&id);
            inner.event_refs.remove(&id);
            inner.errors.remove(&id);
        }
    }

    // ------------------------------------------------------------------
    // events, errors, outputs, globals

    /// Associates a suspended thread with an event reference. Each thread
    /// can wait on at most one event at a time.
    pub fn set_event_ref(&self, thread_id: ThreadId, event_ref: &str) -> Result<(), VmError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.event_refs.get(&thread_id) {
            return Err(VmError::IllegalState(format!(
                "thread {thread_id} is already waiting on '{existing}'"
            )));
        }
        inner.event_refs.insert(thread_id, event_ref.to_string());
        Ok(())
    }

    /// Resolves an event reference to the waiting thread, removing the
    /// association.
    pub fn take_event_ref(&self, event_ref: &str) -> Option<ThreadId> {
        let mut inner = self.lock();
        let thread_id = inner
            .event_refs
            .iter()
            .find(|(_, e)| e.as_str() == event_ref)
            .map(|(id, _)| *id)?;
        inner.event_refs.remove(&thread_id);
        Some(thread_id)
    }

    /// Event references of all currently suspended threads.
    pub fn event_refs(&self) -> HashMap<ThreadId, String> {
        self.lock().event_refs.clone()
    }

    /// Records the unhandled error of a failed thread.
    pub fn set_thread_error(&self, thread_id: ThreadId, error: VmError) {
        self.lock().errors.insert(thread_id, error);
    }

    /// Removes and returns the stored error of a failed thread.
    pub fn take_thread_error(&self, thread_id: ThreadId) -> Option<VmError> {
        self.lock().errors.remove(&thread_id)
    }

    /// Publishes the out-variables of a finishing thread for a later
    /// collector.
    pub fn set_thread_outputs(&self, thread_id: ThreadId, outputs: Variables) {
        self.lock().outputs.insert(thread_id, outputs);
    }

    /// Removes and returns a thread's published out-variables.
    pub fn take_thread_outputs(&self, thread_id: ThreadId) -> Option<Variables> {
        self.lock().outputs.remove(&thread_id)
    }

    /// Sets a process global.
    pub fn set_global(&self, key: impl Into<String>, value: Value) {
        self.lock().globals.insert(key.into(), value);
    }

    /// Returns a process global.
    pub fn global(&self, key: &str) -> Option<Value> {
        self.lock().globals.get(key).cloned()
    }

    // ------------------------------------------------------------------
    // lifecycle

    /// Drops the frames of terminal threads. Statuses, stored errors and
    /// published outputs are kept so that a pending `join` can still
    /// account for them; [`reap`](Self::reap) removes those.
    pub fn gc(&self) {
        let mut inner = self.lock();
        let terminal: Vec<ThreadId> = inner
            .statuses
            .iter()
            .filter(|(_, s)| s.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in terminal {
            inner.frames.remove(&id);
            inner.event_refs.remove(&id);
        }
    }

    /// Waits until something in the state changes, or `max` elapses.
    pub async fn wait_for_change(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.change.notified()).await;
    }

    /// Takes a serializable snapshot. Valid only when the machine is at
    /// rest: every thread must be `Done` or `Suspended`.
    pub fn snapshot(&self) -> Result<StateSnapshot, VmError> {
        let inner = self.lock();
        Self::snapshot_inner(&inner)
    }

    /// Takes a snapshot in which `thread_id` is marked `Suspended`, waiting
    /// on `event_ref`. This is how a checkpoint command captures a restart
    /// point while the capturing thread itself is still running.
    pub fn snapshot_as_suspended(
        &self,
        thread_id: ThreadId,
        event_ref: &str,
    ) -> Result<StateSnapshot, VmError> {
        let mut inner = self.lock().clone();
        if inner.event_refs.contains_key(&thread_id) {
            return Err(VmError::IllegalState(format!(
                "thread {thread_id} is already waiting on an event"
            )));
        }
        inner.statuses.insert(thread_id, ThreadStatus::Suspended);
        inner.event_refs.insert(thread_id, event_ref.to_string());
        Self::snapshot_inner(&inner)
    }

    fn snapshot_inner(inner: &Inner) -> Result<StateSnapshot, VmError> {
        for (id, status) in &inner.statuses {
            if !matches!(status, ThreadStatus::Done | ThreadStatus::Suspended) {
                return Err(VmError::Checkpoint(format!(
                    "thread {id} is {status}, the machine is not at rest"
                )));
            }
        }
        let mut ids: Vec<ThreadId> = inner.statuses.keys().copied().collect();
        ids.sort();
        let threads = ids
            .into_iter()
            .map(|id| ThreadSnapshot {
                id,
                status: inner.statuses[&id],
                parent: inner.parents.get(&id).copied(),
                frames: inner.frames.get(&id).cloned().unwrap_or_default(),
                event_ref: inner.event_refs.get(&id).cloned(),
                error: inner.errors.get(&id).cloned(),
                outputs: inner.outputs.get(&id).cloned(),
            })
            .collect();
        Ok(StateSnapshot {
            root: inner.root,
            next_thread_id: inner.next_thread_id,
            globals: inner.globals.clone(),
            threads,
        })
    }
}

/// Serializable image of a process at rest. Produced by
/// [`State::snapshot`], consumed by [`State::from_snapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Id of the process's initial thread.
    pub root: ThreadId,
    /// Next value of the thread id sequence.
    pub next_thread_id: u64,
    /// Process globals.
    pub globals: Variables,
    /// Per-thread snapshots, ordered by thread id.
    pub threads: Vec<ThreadSnapshot>,
}

/// Serializable image of one logical thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    /// The thread's id.
    pub id: ThreadId,
    /// The thread's status; `Done` or `Suspended` in any valid snapshot.
    pub status: ThreadStatus,
    /// Parent thread, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ThreadId>,
    /// The thread's frame stack, bottom first.
    pub frames: Vec<Frame>,
    /// Event reference the thread is waiting on, if suspended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ref: Option<String>,
    /// Stored unhandled error, if the thread failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VmError>,
    /// Published out-variables not yet collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Variables>,
}
