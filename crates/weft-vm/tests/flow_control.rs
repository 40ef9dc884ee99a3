//! End-to-end tests of sequencing, branching, scoping and error handling.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use common::recording_services;
use weft_vm::commands::{
    BlockCommand, Command, ErrorScopeCommand, IfCommand, SeqCommand, Step, StepCommand,
    SwitchCase, SwitchCommand,
};
use weft_vm::error::VmError;
use weft_vm::frame::Frame;
use weft_vm::runtime::Services;
use weft_vm::sdk::InMemoryFlowRegistry;
use weft_vm::state::State;
use weft_vm::thread::ThreadStatus;
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

fn set_vars(value: Value) -> Command {
    Command::Step(StepCommand::of(Step::SetVariables {
        variables: vars(value),
    }))
}

fn seq(commands: Vec<Command>) -> Command {
    Command::Seq(SeqCommand { commands })
}

#[tokio::test]
async fn a_linear_flow_runs_to_completion() {
    let (services, recorder, _) = recording_services();
    let program = seq(vec![
        set_vars(json!({"name": "weft"})),
        Command::Step(StepCommand::of(Step::Expression {
            expression: json!("hello ${name}"),
            out: Some("greeting".to_string()),
        })),
        record(json!({"value": "${greeting}"})),
    ]);
    let state = Arc::new(State::with_command(program));
    let vm = Vm::new(services);
    vm.start(&state).await.unwrap();

    assert_eq!(recorder.values(), vec![json!({"value": "hello weft"})]);
    assert_eq!(
        state.status(state.root_thread_id()),
        Some(ThreadStatus::Done)
    );
}

#[tokio::test]
async fn if_and_switch_route_execution() {
    let (services, recorder, _) = recording_services();
    let program = seq(vec![
        set_vars(json!({"n": 2, "color": "red"})),
        Command::If(IfCommand {
            expression: json!(true),
            then_branch: Box::new(record(json!({"branch": "then"}))),
            else_branch: Some(Box::new(record(json!({"branch": "else"})))),
        }),
        Command::Switch(SwitchCommand {
            expression: json!("${color}"),
            cases: vec![
                SwitchCase {
                    label: json!("blue"),
                    command: record(json!({"case": "blue"})),
                },
                SwitchCase {
                    label: json!("red"),
                    command: record(json!({"case": "red"})),
                },
            ],
            default: Some(Box::new(record(json!({"case": "default"})))),
        }),
    ]);
    let state = Arc::new(State::with_command(program));
    Vm::new(services).start(&state).await.unwrap();

    assert_eq!(
        recorder.values(),
        vec![json!({"branch": "then"}), json!({"case": "red"})]
    );
}

#[tokio::test]
async fn error_scope_handles_a_failure_and_execution_continues() {
    let (services, recorder, _) = recording_services();
    let program = seq(vec![
        Command::ErrorScope(ErrorScopeCommand {
            body: Box::new(Command::Step(StepCommand::of(Step::Task {
                name: "fail".to_string(),
                input: vars(json!({"message": "boom"})),
                out: None,
            }))),
            handler: Box::new(record(json!({"handled": "${lastError.message}"}))),
            finalizer: None,
        }),
        record(json!({"after": true})),
    ]);
    let state = Arc::new(State::with_command(program));
    Vm::new(services).start(&state).await.unwrap();

    assert_eq!(
        recorder.values(),
        vec![
            json!({"handled": "task 'fail' failed: boom"}),
            json!({"after": true}),
        ]
    );
}

#[tokio::test]
async fn finalizers_run_on_both_exit_paths() {
    let (services, recorder, _) = recording_services();
    // success path
    let program = Command::Block(BlockCommand {
        commands: vec![record(json!({"at": "body"}))],
        root: false,
        finalizer: Some(Box::new(record(json!({"at": "cleanup"})))),
    });
    let state = Arc::new(State::with_command(program));
    Vm::new(Arc::clone(&services)).start(&state).await.unwrap();
    assert_eq!(
        recorder.values(),
        vec![json!({"at": "body"}), json!({"at": "cleanup"})]
    );

    // error path: the finalizer runs, then the error reaches the handler
    let (services, recorder, _) = recording_services();
    let program = Command::ErrorScope(ErrorScopeCommand {
        body: Box::new(Command::Block(BlockCommand {
            commands: vec![Command::Step(StepCommand::of(Step::Task {
                name: "fail".to_string(),
                input: vars(json!({"message": "late"})),
                out: None,
            }))],
            root: false,
            finalizer: Some(Box::new(record(json!({"at": "cleanup"})))),
        })),
        handler: Box::new(record(json!({"at": "handler"}))),
        finalizer: None,
    });
    let state = Arc::new(State::with_command(program));
    Vm::new(services).start(&state).await.unwrap();
    assert_eq!(
        recorder.values(),
        vec![json!({"at": "cleanup"}), json!({"at": "handler"})]
    );
}

#[tokio::test]
async fn flow_calls_run_in_a_fresh_scope() {
    let (services, recorder, _) = recording_services();
    let flows = Arc::new(InMemoryFlowRegistry::new());
    flows.register(
        "sub",
        seq(vec![
            set_vars(json!({"local": "inner"})),
            record(json!({"got": "${x}"})),
        ]),
    );
    let services = Arc::new(
        Services::new()
            .with_tasks(Arc::clone(&services.tasks))
            .with_flows(flows),
    );

    let program = seq(vec![
        set_vars(json!({"n": 7})),
        Command::Step(StepCommand::of(Step::FlowCall {
            flow: "sub".to_string(),
            input: vars(json!({"x": "${n}"})),
        })),
        // the callee's locals do not leak back
        record(json!({"leaked": "${local}"})),
    ]);
    let state = Arc::new(State::with_command(program));
    Vm::new(services).start(&state).await.unwrap();

    assert_eq!(
        recorder.values(),
        vec![json!({"got": 7}), json!({"leaked": null})]
    );
}

#[tokio::test]
async fn calling_an_unknown_flow_fails() {
    let (services, _, _) = recording_services();
    let program = Command::Step(StepCommand::of(Step::FlowCall {
        flow: "nope".to_string(),
        input: Variables::new(),
    }));
    let state = Arc::new(State::with_command(program));
    let err = Vm::new(services).start(&state).await.unwrap_err();
    assert_eq!(err.unlogged(), VmError::FlowNotFound("nope".to_string()));
}

#[tokio::test]
async fn an_unhandled_error_is_exposed_as_a_global() {
    let (services, _, _) = recording_services();
    let program = Command::Step(StepCommand::of(Step::Task {
        name: "fail".to_string(),
        input: vars(json!({"message": "fatal"})),
        out: None,
    }));
    let state = Arc::new(State::with_command(program));
    let err = Vm::new(services).start(&state).await.unwrap_err();
    assert_eq!(
        err.unlogged(),
        VmError::Task {
            name: "fail".to_string(),
            message: "fatal".to_string()
        }
    );
    assert_eq!(
        state.global("lastError"),
        Some(json!({"message": "task 'fail' failed: fatal"}))
    );
    assert_eq!(
        state.status(state.root_thread_id()),
        Some(ThreadStatus::Failed)
    );
}

#[tokio::test]
async fn empty_frames_pop_without_side_effects() {
    let (services, recorder, _) = recording_services();
    let program = seq(vec![
        Command::Block(BlockCommand {
            commands: vec![],
            root: true,
            finalizer: None,
        }),
        record(json!({"after": true})),
    ]);
    let state = Arc::new(State::with_command(program));
    Vm::new(Arc::clone(&services)).start(&state).await.unwrap();
    assert_eq!(recorder.values(), vec![json!({"after": true})]);

    // a process that is nothing but an empty frame just finishes
    let state = Arc::new(State::new(Frame::builder().root().build()));
    Vm::new(services).start(&state).await.unwrap();
    assert_eq!(
        state.status(state.root_thread_id()),
        Some(ThreadStatus::Done)
    );
}

#[tokio::test]
async fn run_single_evaluates_one_command_in_place() {
    let (services, _, _) = recording_services();
    let state = Arc::new(State::new(Frame::builder().root().build()));
    let vm = Vm::new(services);
    vm.run_single(&state, &set_vars(json!({"patched": true})))
        .await
        .unwrap();
    assert_eq!(
        state
            .combined_locals(state.root_thread_id())
            .get("patched"),
        Some(&json!(true))
    );
}
