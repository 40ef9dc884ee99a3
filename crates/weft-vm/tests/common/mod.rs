#![allow(dead_code)]

//! Shared helpers for the integration tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use weft_vm::error::VmError;
use weft_vm::sdk::{Task, TaskInput, TaskProvider, TaskRegistry, TaskResult};
use weft_vm::runtime::Services;

/// Captures every input it is invoked with, in invocation order.
pub struct RecordTask {
    values: Arc<Mutex<Vec<Value>>>,
}

impl RecordTask {
    pub fn new() -> (Arc<Self>, Recorder) {
        let values = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(RecordTask {
                values: Arc::clone(&values),
            }),
            Recorder { values },
        )
    }
}

#[async_trait]
impl Task for RecordTask {
    async fn execute(&self, input: TaskInput) -> Result<TaskResult, VmError> {
        self.values
            .lock()
            .unwrap()
            .push(Value::Object(input.variables().clone()));
        Ok(TaskResult::Done(Value::Null))
    }
}

/// Read side of a [`RecordTask`].
#[derive(Clone)]
pub struct Recorder {
    values: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    pub fn values(&self) -> Vec<Value> {
        self.values.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }
}

/// Installs a log subscriber honoring `RUST_LOG`. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A service set with the built-in tasks plus a `record` task, returning
/// the recorder and the registry for further registrations.
pub fn recording_services() -> (Arc<Services>, Recorder, Arc<TaskRegistry>) {
    init_tracing();
    let registry = Arc::new(TaskRegistry::new());
    weft_tasks::register_builtins(&registry);
    let (record, recorder) = RecordTask::new();
    registry.register("record", record);
    let services = Arc::new(Services::new().with_tasks(Arc::clone(&registry) as Arc<dyn TaskProvider>));
    (services, recorder, registry)
}
