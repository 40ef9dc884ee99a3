//! Call stack frames.
//!
//! A frame is the VM's unit of scope and control: it carries the commands
//! still to be executed (a LIFO list, last element on top), local variables,
//! a typed overlay of input overrides, and optional exception/finalization
//! handlers. Frames are plain serializable data so that whole stacks can be
//! persisted mid-flight.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commands::Command;
use crate::scope::Variables;

/// Local key holding the serialized cause while an exception handler or a
/// retry handler runs. Internal, not meant for user expressions.
pub const LAST_EXCEPTION_KEY: &str = "__last_exception";

/// Local key under which error scopes expose the error to user expressions.
pub const LAST_ERROR_KEY: &str = "lastError";

/// Local key holding the payload passed to [`crate::vm::Vm::resume`], set on
/// the resumed thread's top frame and consumed by the continuation.
pub const RESUME_PAYLOAD_KEY: &str = "__resume_payload";

/// Whether a frame starts a new variable scope root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// The frame is a scope root: "nearest root" variable writes land here
    /// and do not leak past it.
    Root,
    /// The frame is transparent for variable scoping.
    NonRoot,
}

/// A single frame of a logical thread's call stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    kind: FrameKind,
    /// Remaining commands, top of stack last.
    commands: Vec<Command>,
    locals: Variables,
    /// Input overrides applied on top of evaluated task input, deep-merged
    /// with the override winning. Used by retry handlers.
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    overrides: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exception_handler: Option<Box<Command>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finalizer: Option<Box<Command>>,
}

impl Frame {
    /// Starts building a new frame.
    pub fn builder() -> FrameBuilder {
        FrameBuilder::new()
    }

    /// Returns `true` if this frame is a variable scope root.
    pub fn is_root(&self) -> bool {
        self.kind == FrameKind::Root
    }

    /// Pushes a command on top of the frame's command stack.
    pub fn push_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Pops the topmost command, if any.
    pub fn pop_command(&mut self) -> Option<Command> {
        self.commands.pop()
    }

    /// The command the scheduler would run next, if any.
    pub fn peek_command(&self) -> Option<&Command> {
        self.commands.last()
    }

    /// Returns `true` if the frame has no commands left.
    pub fn is_done(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drops all remaining commands. Used when an exception handler takes
    /// over the frame.
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Sets a local variable on this frame.
    pub fn set_local(&mut self, key: impl Into<String>, value: Value) {
        self.locals.insert(key.into(), value);
    }

    /// Returns a local variable of this frame (not of enclosing frames).
    pub fn local(&self, key: &str) -> Option<&Value> {
        self.locals.get(key)
    }

    /// Removes and returns a local variable of this frame.
    pub fn take_local(&mut self, key: &str) -> Option<Value> {
        self.locals.remove(key)
    }

    /// Returns `true` if this frame defines the given local.
    pub fn has_local(&self, key: &str) -> bool {
        self.locals.contains_key(key)
    }

    /// All locals of this frame.
    pub fn locals(&self) -> &Variables {
        &self.locals
    }

    /// Input overrides carried by this frame.
    pub fn overrides(&self) -> &Variables {
        &self.overrides
    }

    /// Merges the given entries into this frame's input overrides.
    pub fn extend_overrides(&mut self, overrides: Variables) {
        self.overrides.extend(overrides);
    }

    /// Installs (or replaces) the exception handler of this frame.
    pub fn set_exception_handler(&mut self, handler: Command) {
        self.exception_handler = Some(Box::new(handler));
    }

    /// Removes and returns the exception handler, if any.
    pub fn take_exception_handler(&mut self) -> Option<Command> {
        self.exception_handler.take().map(|c| *c)
    }

    /// Returns `true` if an exception handler is installed.
    pub fn has_exception_handler(&self) -> bool {
        self.exception_handler.is_some()
    }

    /// Removes and returns the finalizer, if any. The scheduler promotes it
    /// to a regular command once the frame runs out of commands; the unwind
    /// path runs it before propagating an error past this frame.
    pub fn take_finalizer(&mut self) -> Option<Command> {
        self.finalizer.take().map(|c| *c)
    }
}

/// Builder for [`Frame`]. Commands are listed in execution order.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    kind: Option<FrameKind>,
    commands: Vec<Command>,
    locals: Variables,
    overrides: Variables,
    exception_handler: Option<Box<Command>>,
    finalizer: Option<Box<Command>>,
}

impl FrameBuilder {
    fn new() -> Self {
        FrameBuilder::default()
    }

    /// Makes the frame a variable scope root.
    pub fn root(mut self) -> Self {
        self.kind = Some(FrameKind::Root);
        self
    }

    /// Makes the frame transparent for variable scoping.
    pub fn non_root(mut self) -> Self {
        self.kind = Some(FrameKind::NonRoot);
        self
    }

    /// Appends a command. Commands run in the order they were added.
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Appends several commands in execution order.
    pub fn commands(mut self, commands: impl IntoIterator<Item = Command>) -> Self {
        self.commands.extend(commands);
        self
    }

    /// Sets an initial local variable.
    pub fn local(mut self, key: impl Into<String>, value: Value) -> Self {
        self.locals.insert(key.into(), value);
        self
    }

    /// Sets several initial locals at once.
    pub fn locals(mut self, locals: Variables) -> Self {
        self.locals.extend(locals);
        self
    }

    /// Sets the initial input overrides.
    pub fn overrides(mut self, overrides: Variables) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Installs an exception handler.
    pub fn exception_handler(mut self, handler: Command) -> Self {
        self.exception_handler = Some(Box::new(handler));
        self
    }

    /// Installs a finalizer that runs when the frame exits, normally or
    /// during unwinding.
    pub fn finalizer(mut self, finalizer: Command) -> Self {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Builds the frame. Defaults to a non-root frame if neither
    /// [`root`](Self::root) nor [`non_root`](Self::non_root) was called.
    pub fn build(self) -> Frame {
        let mut commands = self.commands;
        // stored top-of-stack last; reverse so that listed order == execution order
        commands.reverse();
        Frame {
            kind: self.kind.unwrap_or(FrameKind::NonRoot),
            commands,
            locals: self.locals,
            overrides: self.overrides,
            exception_handler: self.exception_handler,
            finalizer: self.finalizer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Command, SuspendCommand};
    use serde_json::json;

    fn marker(event: &str) -> Command {
        Command::Suspend(SuspendCommand {
            event: event.to_string(),
        })
    }

    #[test]
    fn commands_pop_in_listed_order() {
        let mut frame = Frame::builder()
            .root()
            .command(marker("first"))
            .command(marker("second"))
            .build();
        match frame.pop_command() {
            Some(Command::Suspend(c)) => assert_eq!(c.event, "first"),
            other => panic!("unexpected command: {other:?}"),
        }
        match frame.pop_command() {
            Some(Command::Suspend(c)) => assert_eq!(c.event, "second"),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(frame.is_done());
    }

    #[test]
    fn handler_can_be_taken_once() {
        let mut frame = Frame::builder()
            .non_root()
            .exception_handler(marker("on-error"))
            .build();
        assert!(frame.has_exception_handler());
        assert!(frame.take_exception_handler().is_some());
        assert!(frame.take_exception_handler().is_none());
    }

    #[test]
    fn frame_round_trips_through_json() {
        let frame = Frame::builder()
            .root()
            .local("x", json!(1))
            .command(marker("ev"))
            .finalizer(marker("cleanup"))
            .build();
        let s = serde_json::to_string(&frame).unwrap();
        let mut back: Frame = serde_json::from_str(&s).unwrap();
        assert!(back.is_root());
        assert_eq!(back.local("x"), Some(&json!(1)));
        assert!(back.take_finalizer().is_some());
    }
}
