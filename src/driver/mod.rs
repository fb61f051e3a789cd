mod fork_exec;

use anyhow::Result;
use async_trait::async_trait;
pub use fork_exec::ForkExecDriver;
use tokio::sync::oneshot;

/// Configuration for starting a worker process.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments to pass to the program.
    pub args: Vec<String>,
    /// Environment variables, applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of inheriting the host's.
    pub clear_env: bool,
}

/// Handle to a running worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Unique identifier for the process within its driver. Never a pid.
    pub id: String,
    pub pid: Option<u32>,
}

/// Exit status information for a terminated process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code of the process, `None` when it was ended by a signal.
    pub exit_code: Option<i64>,
    /// Whether the driver terminated the process on request.
    pub killed: bool,
}

/// A freshly started process together with the notification fired once it
/// exits, whether on its own or because it was killed.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub exited: oneshot::Receiver<ExitStatus>,
}

/// Trait for process drivers that can start and terminate worker processes.
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    /// Start a new process with the given configuration. Standard I/O is
    /// inherited from the host.
    async fn start(&self, config: ProcessConfig) -> Result<SpawnedProcess>;

    /// Signal a process to terminate without waiting for it to exit. Fails
    /// if the process is unknown or has already exited.
    async fn kill(&self, handle: &ProcessHandle) -> Result<()>;

    /// Check if a process is still alive.
    async fn alive(&self, handle: &ProcessHandle) -> bool;
}
