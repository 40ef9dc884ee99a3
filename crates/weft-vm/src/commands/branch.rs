//! Conditional and multi-way branching.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commands::Command;
use crate::error::VmError;
use crate::runtime::Runtime;
use crate::scope;
use crate::state::State;
use crate::thread::ThreadId;

/// Evaluates a condition and pushes one of two branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfCommand {
    /// Condition expression. Must produce a boolean or the strings
    /// `"true"`/`"false"`.
    pub expression: Value,
    /// Branch taken when the condition holds.
    pub then_branch: Box<Command>,
    /// Branch taken otherwise, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub else_branch: Option<Box<Command>>,
}

impl IfCommand {
    pub(crate) fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let vars = state.scope(thread_id);
        let value = runtime.services().expressions.eval(&vars, &self.expression)?;
        let condition = scope::coerce_bool(&value).ok_or_else(|| {
            VmError::Type(format!(
                "'if' expects a boolean or \"true\"/\"false\", got: {value}"
            ))
        })?;
        let branch = if condition {
            Some(&self.then_branch)
        } else {
            self.else_branch.as_ref()
        };
        if let Some(branch) = branch {
            let command = (**branch).clone();
            state.with_frame(thread_id, |frame| frame.push_command(command))?;
        }
        Ok(())
    }
}

/// One arm of a [`SwitchCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    /// Label expression, compared for equality with the switch value.
    pub label: Value,
    /// Command to run when the label matches.
    pub command: Command,
}

/// Evaluates an expression and runs the first case whose label matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCommand {
    /// The value being switched on.
    pub expression: Value,
    /// Cases, checked in order.
    pub cases: Vec<SwitchCase>,
    /// Fallback when no case matches. When absent, a non-matching switch
    /// does nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Box<Command>>,
}

impl SwitchCommand {
    pub(crate) fn eval(
        &self,
        runtime: &Runtime,
        state: &Arc<State>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let vars = state.scope(thread_id);
        let expressions = &runtime.services().expressions;
        let value = expressions.eval(&vars, &self.expression)?;
        let mut selected = None;
        for case in &self.cases {
            let label = expressions.eval(&vars, &case.label)?;
            if label == value {
                selected = Some(case.command.clone());
                break;
            }
        }
        if selected.is_none() {
            selected = self.default.as_ref().map(|c| (**c).clone());
        }
        if let Some(command) = selected {
            state.with_frame(thread_id, |frame| frame.push_command(command))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::SuspendCommand;
    use crate::runtime::{Services, VmConfig};
    use crate::frame::Frame;
    use serde_json::json;

    fn runtime() -> Runtime {
        Runtime::new(Arc::new(Services::new()), VmConfig::default())
    }

    fn marker(event: &str) -> Command {
        Command::Suspend(SuspendCommand {
            event: event.to_string(),
        })
    }

    fn pushed_marker(state: &Arc<State>, thread_id: ThreadId) -> Option<String> {
        state
            .with_frame(thread_id, |f| match f.pop_command() {
                Some(Command::Suspend(c)) => Some(c.event),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn if_takes_the_then_branch() {
        let state = Arc::new(State::new(
            Frame::builder().root().local("flag", json!(true)).build(),
        ));
        let root = state.root_thread_id();
        let cmd = IfCommand {
            expression: json!("${flag}"),
            then_branch: Box::new(marker("then")),
            else_branch: Some(Box::new(marker("else"))),
        };
        cmd.eval(&runtime(), &state, root).unwrap();
        assert_eq!(pushed_marker(&state, root).as_deref(), Some("then"));
    }

    #[test]
    fn if_coerces_string_conditions() {
        let state = Arc::new(State::new(
            Frame::builder().root().local("flag", json!("False")).build(),
        ));
        let root = state.root_thread_id();
        let cmd = IfCommand {
            expression: json!("${flag}"),
            then_branch: Box::new(marker("then")),
            else_branch: Some(Box::new(marker("else"))),
        };
        cmd.eval(&runtime(), &state, root).unwrap();
        assert_eq!(pushed_marker(&state, root).as_deref(), Some("else"));
    }

    #[test]
    fn if_rejects_non_boolean_conditions() {
        let state = Arc::new(State::new(
            Frame::builder().root().local("flag", json!(42)).build(),
        ));
        let root = state.root_thread_id();
        let cmd = IfCommand {
            expression: json!("${flag}"),
            then_branch: Box::new(marker("then")),
            else_branch: None,
        };
        assert!(matches!(
            cmd.eval(&runtime(), &state, root),
            Err(VmError::Type(_))
        ));
    }

    #[test]
    fn switch_picks_the_first_matching_case() {
        let state = Arc::new(State::new(
            Frame::builder().root().local("color", json!("red")).build(),
        ));
        let root = state.root_thread_id();
        let cmd = SwitchCommand {
            expression: json!("${color}"),
            cases: vec![
                SwitchCase {
                    label: json!("blue"),
                    command: marker("blue"),
                },
                SwitchCase {
                    label: json!("red"),
                    command: marker("red"),
                },
            ],
            default: Some(Box::new(marker("default"))),
        };
        cmd.eval(&runtime(), &state, root).unwrap();
        assert_eq!(pushed_marker(&state, root).as_deref(), Some("red"));
    }

    #[test]
    fn switch_without_a_match_or_default_does_nothing() {
        let state = Arc::new(State::new(
            Frame::builder().root().local("color", json!("green")).build(),
        ));
        let root = state.root_thread_id();
        let cmd = SwitchCommand {
            expression: json!("${color}"),
            cases: vec![SwitchCase {
                label: json!("blue"),
                command: marker("blue"),
            }],
            default: None,
        };
        cmd.eval(&runtime(), &state, root).unwrap();
        assert_eq!(pushed_marker(&state, root), None);
    }
}
