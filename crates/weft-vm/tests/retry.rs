//! End-to-end tests of bounded retries.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use common::recording_services;
use weft_vm::commands::{
    Command, ErrorScopeCommand, RetryCommand, SeqCommand, Step, StepCommand,
};
use weft_vm::error::VmError;
use weft_vm::sdk::{Task, TaskInput, TaskResult};
use weft_vm::state::State;
use weft_vm::{Variables, Vm};

fn vars(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

fn record(value: Value) -> Command {
    Command::Step(StepCommand::of(Step::Task {
        name: "record".to_string(),
        input: vars(value),
        out: None,
    }))
}

fn task(name: &str, input: Value, out: Option<&str>) -> Command {
    Command::Step(StepCommand::of(Step::Task {
        name: name.to_string(),
        input: vars(input),
        out: out.map(str::to_string),
    }))
}

fn seq(commands: Vec<Command>) -> Command {
    Command::Seq(SeqCommand { commands })
}

/// Fails the first `failures` invocations, then succeeds.
struct FlakyTask {
    failures: u64,
    calls: AtomicU64,
}

impl FlakyTask {
    fn new(failures: u64) -> Arc<Self> {
        Arc::new(FlakyTask {
            failures,
            calls: AtomicU64::new(0),
        })
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for FlakyTask {
    async fn execute(&self, _input: TaskInput) -> Result<TaskResult, VmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(VmError::Task {
                name: "flaky".to_string(),
                message: format!("attempt {call} failed"),
            })
        } else {
            Ok(TaskResult::Done(json!("ok")))
        }
    }
}

/// Fails unless the input says `mode == "fallback"`. Records what it saw.
struct ModeTask {
    inputs: std::sync::Mutex<Vec<Value>>,
}

impl ModeTask {
    fn new() -> Arc<Self> {
        Arc::new(ModeTask {
            inputs: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Task for ModeTask {
    async fn execute(&self, input: TaskInput) -> Result<TaskResult, VmError> {
        self.inputs
            .lock()
            .unwrap()
            .push(Value::Object(input.variables().clone()));
        if input.get_str("mode") == Some("fallback") {
            Ok(TaskResult::Done(Value::Null))
        } else {
            Err(VmError::Task {
                name: "mode".to_string(),
                message: "not in fallback mode".to_string(),
            })
        }
    }
}

#[tokio::test]
async fn a_flaky_body_eventually_succeeds() {
    let (services, recorder, registry) = recording_services();
    let flaky = FlakyTask::new(2);
    registry.register("flaky", Arc::clone(&flaky) as Arc<dyn Task>);

    let program = seq(vec![
        Command::Retry(RetryCommand {
            body: Box::new(task("flaky", json!({}), Some("r"))),
            times: json!(3),
            delay_ms: json!(10),
            input_overrides: None,
        }),
        record(json!({"result": "${r}"})),
    ]);
    let state = Arc::new(State::with_command(program));
    Vm::new(services).start(&state).await.unwrap();

    assert_eq!(flaky.calls(), 3);
    assert_eq!(recorder.values(), vec![json!({"result": "ok"})]);
}

#[tokio::test]
async fn attempts_are_spaced_by_the_configured_delay() {
    let (services, _, registry) = recording_services();
    let flaky = FlakyTask::new(1);
    registry.register("flaky", Arc::clone(&flaky) as Arc<dyn Task>);

    let program = Command::Retry(RetryCommand {
        body: Box::new(task("flaky", json!({}), None)),
        times: json!(2),
        delay_ms: json!(100),
        input_overrides: None,
    });
    let state = Arc::new(State::with_command(program));
    let started = Instant::now();
    Vm::new(services).start(&state).await.unwrap();

    assert_eq!(flaky.calls(), 2);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn exhausted_retries_raise_the_original_cause() {
    let (services, _, registry) = recording_services();
    let flaky = FlakyTask::new(u64::MAX);
    registry.register("flaky", Arc::clone(&flaky) as Arc<dyn Task>);

    let program = Command::Retry(RetryCommand {
        body: Box::new(task("flaky", json!({}), None)),
        times: json!(2),
        delay_ms: json!(1),
        input_overrides: None,
    });
    let state = Arc::new(State::with_command(program));
    let err = Vm::new(services).start(&state).await.unwrap_err();

    assert_eq!(flaky.calls(), 2);
    assert_eq!(
        err.unlogged(),
        VmError::Task {
            name: "flaky".to_string(),
            message: "attempt 2 failed".to_string()
        }
    );
}

#[tokio::test]
async fn exhausted_retries_reach_the_enclosing_error_scope() {
    let (services, recorder, registry) = recording_services();
    let flaky = FlakyTask::new(u64::MAX);
    registry.register("flaky", Arc::clone(&flaky) as Arc<dyn Task>);

    let program = Command::ErrorScope(ErrorScopeCommand {
        body: Box::new(Command::Retry(RetryCommand {
            body: Box::new(task("flaky", json!({}), None)),
            times: json!(3),
            delay_ms: json!(1),
            input_overrides: None,
        })),
        handler: Box::new(record(json!({"handled": "${lastError.message}"}))),
        finalizer: None,
    });
    let state = Arc::new(State::with_command(program));
    Vm::new(services).start(&state).await.unwrap();

    assert_eq!(flaky.calls(), 3);
    assert_eq!(
        recorder.values(),
        vec![json!({"handled": "task 'flaky' failed: attempt 3 failed"})]
    );
}

#[tokio::test]
async fn re_attempts_apply_input_overrides() {
    let (services, _, registry) = recording_services();
    let mode = ModeTask::new();
    registry.register("mode", Arc::clone(&mode) as Arc<dyn Task>);

    let program = Command::Retry(RetryCommand {
        body: Box::new(task("mode", json!({"mode": "normal"}), None)),
        times: json!(3),
        delay_ms: json!(1),
        input_overrides: Some(vars(json!({"mode": "fallback"}))),
    });
    let state = Arc::new(State::with_command(program));
    Vm::new(services).start(&state).await.unwrap();

    let inputs = mode.inputs.lock().unwrap().clone();
    assert_eq!(
        inputs,
        vec![json!({"mode": "normal"}), json!({"mode": "fallback"})]
    );
}

#[tokio::test]
async fn a_zero_attempt_budget_is_rejected() {
    let (services, _, registry) = recording_services();
    registry.register("flaky", FlakyTask::new(0) as Arc<dyn Task>);
    let program = Command::Retry(RetryCommand {
        body: Box::new(task("flaky", json!({}), None)),
        times: json!(0),
        delay_ms: json!(1),
        input_overrides: None,
    });
    let state = Arc::new(State::with_command(program));
    let err = Vm::new(services).start(&state).await.unwrap_err();
    assert!(matches!(err.unlogged(), VmError::Type(_)));
}
