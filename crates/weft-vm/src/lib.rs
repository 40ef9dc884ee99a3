//! The Weft execution core: a small stack machine that runs workflow
//! processes as trees of logical threads.
//!
//! Each logical thread owns a stack of [`frame::Frame`]s; each frame carries
//! a list of [`commands::Command`]s, local variables, and optional exception
//! and finalization handlers. The whole machine state is serializable, which
//! is what makes processes durable: a suspended process can be written out
//! as JSON, stored, and picked up later by [`vm::Vm::resume`].
//!
//! A minimal run looks like this:
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft_vm::commands::{Command, Step, StepCommand};
//! use weft_vm::runtime::Services;
//! use weft_vm::state::State;
//! use weft_vm::vm::Vm;
//!
//! # async fn run() -> Result<(), weft_vm::error::VmError> {
//! let program = Command::Step(StepCommand::of(Step::Log {
//!     message: "hello from ${name}".into(),
//! }));
//! let state = Arc::new(State::with_command(program));
//! let vm = Vm::new(Arc::new(Services::new()));
//! vm.start(&state).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod commands;
pub mod error;
pub mod frame;
pub mod runtime;
pub mod scope;
pub mod sdk;
pub mod state;
pub mod thread;
pub mod vm;

pub use error::VmError;
pub use frame::Frame;
pub use scope::Variables;
pub use state::{State, StateSnapshot};
pub use thread::{ThreadId, ThreadStatus};
pub use vm::Vm;
