//! The execution runtime: configuration, service wiring and the logical
//! thread scheduler's spawn tracker.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::sdk::{
    CheckpointSink, ExpressionEvaluator, FlowRegistry, InMemoryFlowRegistry, NoScriptSupport,
    NoopCheckpointSink, ScriptEvaluator, TaskProvider, TaskRegistry, TemplateEvaluator,
};
use crate::state::State;
use crate::thread::ThreadId;
use crate::vm::Vm;

/// The services a process can reach from its steps.
///
/// Every field has a working default; embedders swap in their own
/// implementations through the `with_*` methods.
pub struct Services {
    /// Expression template evaluation.
    pub expressions: Arc<dyn ExpressionEvaluator>,
    /// Task lookup.
    pub tasks: Arc<dyn TaskProvider>,
    /// Named sub-flow lookup.
    pub flows: Arc<dyn FlowRegistry>,
    /// Inline script evaluation.
    pub scripts: Arc<dyn ScriptEvaluator>,
    /// Checkpoint storage.
    pub checkpoints: Arc<dyn CheckpointSink>,
}

impl Services {
    /// Creates the default service set: template expressions, empty task
    /// and flow registries, no script support, checkpoints discarded.
    pub fn new() -> Self {
        Services {
            expressions: Arc::new(TemplateEvaluator::new()),
            tasks: Arc::new(TaskRegistry::new()),
            flows: Arc::new(InMemoryFlowRegistry::new()),
            scripts: Arc::new(NoScriptSupport),
            checkpoints: Arc::new(NoopCheckpointSink),
        }
    }

    /// Replaces the expression evaluator.
    pub fn with_expressions(mut self, expressions: Arc<dyn ExpressionEvaluator>) -> Self {
        self.expressions = expressions;
        self
    }

    /// Replaces the task provider.
    pub fn with_tasks(mut self, tasks: Arc<dyn TaskProvider>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Replaces the flow registry.
    pub fn with_flows(mut self, flows: Arc<dyn FlowRegistry>) -> Self {
        self.flows = flows;
        self
    }

    /// Replaces the script evaluator.
    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptEvaluator>) -> Self {
        self.scripts = scripts;
        self
    }

    /// Replaces the checkpoint sink.
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoints = checkpoints;
        self
    }
}

impl Default for Services {
    fn default() -> Self {
        Services::new()
    }
}

/// Tunables of the execution core.
#[derive(Debug, Clone)]
pub struct VmConfig {
    parallelism: usize,
    join_poll_interval: Duration,
}

impl VmConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        VmConfig::default()
    }

    /// Default batch size of parallel loops that do not specify one.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Upper bound on how long a `join` sleeps between re-checks when no
    /// state change notification arrives.
    pub fn with_join_poll_interval(mut self, interval: Duration) -> Self {
        self.join_poll_interval = interval;
        self
    }

    /// Default parallel loop batch size.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Join re-check interval.
    pub fn join_poll_interval(&self) -> Duration {
        self.join_poll_interval
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            parallelism: 4,
            join_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Handle through which commands reach services, configuration and the
/// scheduler. Cheap to clone; all clones share the spawn tracker.
#[derive(Clone)]
pub struct Runtime {
    services: Arc<Services>,
    config: VmConfig,
    spawned: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Runtime {
    /// Creates a runtime over the given services and configuration.
    pub fn new(services: Arc<Services>, config: VmConfig) -> Self {
        Runtime {
            services,
            config,
            spawned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The configured services.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Schedules a logical thread onto the async runtime. Failures of
    /// spawned threads are recorded in the state (and collected by `join`),
    /// not propagated through the task handle.
    pub fn spawn(&self, state: &Arc<State>, thread_id: ThreadId) {
        debug!(thread = %thread_id, "spawning logical thread");
        let runtime = self.clone();
        let state = Arc::clone(state);
        let handle = tokio::spawn(async move {
            if let Err(e) = Vm::eval_thread(&runtime, &state, thread_id).await {
                debug!(thread = %thread_id, "logical thread stopped with error: {e}");
            }
        });
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Waits for every logical thread spawned so far, including threads
    /// spawned while draining.
    pub async fn drain(&self) {
        loop {
            let handle = self
                .spawned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }
}
