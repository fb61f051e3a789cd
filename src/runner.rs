//! Resolves a runtime identifier (`nodejs18.x`, `python3.12`, `go1.x`, ...)
//! into the command that launches a worker for a function.
//!
//! Strategies are looked up by identifier prefix, so adding a runtime family
//! only means registering another [`RuntimeStrategy`].

use std::{collections::HashMap, path::Path, sync::Arc};

use crate::{config::RunnersConfig, function::FunctionDescriptor};

/// How to launch one worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

pub trait RuntimeStrategy: Send + Sync {
    fn command(&self, function: &FunctionDescriptor) -> Command;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unsupported runtime: {0}")]
pub struct UnsupportedRuntime(pub String);

/// Runs the artifact through the Node.js runtime interface client. The entry
/// point is the bundle path with its `.js` extension swapped for the handler
/// name (`dist/api.js` + `main` -> `dist/api.main`).
pub struct NodeRunner {
    ric: String,
}

impl NodeRunner {
    pub fn new(ric: impl Into<String>) -> Self {
        Self { ric: ric.into() }
    }
}

impl RuntimeStrategy for NodeRunner {
    fn command(&self, function: &FunctionDescriptor) -> Command {
        let handler = function.handler();
        Command {
            program: self.ric.clone(),
            args: vec![function
                .out_path
                .replacen(".js", &format!(".{handler}"), 1)],
            env: HashMap::new(),
        }
    }
}

/// Runs the artifact through `awslambdaric`, importing the module from the
/// artifact's directory.
pub struct PythonRunner {
    interpreter: String,
}

impl PythonRunner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl RuntimeStrategy for PythonRunner {
    fn command(&self, function: &FunctionDescriptor) -> Command {
        let out_path = Path::new(&function.out_path);
        let module = out_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let directory = out_path
            .parent()
            .map(|dir| dir.to_string_lossy().to_string())
            .filter(|dir| !dir.is_empty())
            .unwrap_or_else(|| ".".to_string());

        Command {
            program: self.interpreter.clone(),
            args: vec![
                "-m".to_string(),
                "awslambdaric".to_string(),
                format!("{module}.{}", function.handler()),
            ],
            env: HashMap::from([("PYTHONPATH".to_string(), directory)]),
        }
    }
}

/// The build artifact is itself the worker executable (Go binaries, custom
/// `provided` runtimes).
pub struct ExecutableRunner;

impl RuntimeStrategy for ExecutableRunner {
    fn command(&self, function: &FunctionDescriptor) -> Command {
        Command {
            program: function.out_path.clone(),
            args: vec![],
            env: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub struct RunnerRegistry {
    strategies: Vec<(String, Arc<dyn RuntimeStrategy>)>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(config: &RunnersConfig) -> Self {
        let mut registry = Self::new();
        registry.register("node", Arc::new(NodeRunner::new(config.node_ric.clone())));
        registry.register("python", Arc::new(PythonRunner::new(config.python.clone())));
        registry.register("go", Arc::new(ExecutableRunner));
        registry.register("provided", Arc::new(ExecutableRunner));
        registry
    }

    /// Registers a strategy for every runtime identifier starting with
    /// `prefix`. A later registration for the same prefix replaces the earlier.
    pub fn register(&mut self, prefix: impl Into<String>, strategy: Arc<dyn RuntimeStrategy>) {
        let prefix = prefix.into();
        self.strategies.retain(|(existing, _)| *existing != prefix);
        self.strategies.push((prefix, strategy));
    }

    /// Longest registered prefix wins.
    pub fn resolve(&self, runtime: &str) -> Result<Arc<dyn RuntimeStrategy>, UnsupportedRuntime> {
        self.strategies
            .iter()
            .filter(|(prefix, _)| runtime.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, strategy)| strategy.clone())
            .ok_or_else(|| UnsupportedRuntime(runtime.to_string()))
    }
}
