use std::{collections::HashMap, process::Stdio, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{
    process::Command,
    sync::{oneshot, Mutex},
};
use tracing::{debug, error};
use uuid::Uuid;

use super::{ExitStatus, ProcessConfig, ProcessDriver, ProcessHandle, SpawnedProcess};

/// Runs workers as plain child processes of the host.
///
/// Each child is owned by a reaper task that waits for it to exit. Killing a
/// process only asks that task to terminate the child, so `kill` never blocks
/// on the exit itself. Handles are keyed by a generated id, never the pid,
/// since the kernel may hand a reaped child's pid to a new process.
pub struct ForkExecDriver {
    processes: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl ForkExecDriver {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ForkExecDriver {
    fn default() -> Self {
        Self::new()
    }
}

enum Wake {
    Exited(std::io::Result<std::process::ExitStatus>),
    Kill,
}

#[async_trait]
impl ProcessDriver for ForkExecDriver {
    async fn start(&self, config: ProcessConfig) -> Result<SpawnedProcess> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args);
        if config.clear_env {
            cmd.env_clear();
        }
        cmd.envs(config.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn process: {:?}", config.program))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get process ID"))?;
        let id = Uuid::new_v4().to_string();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        self.processes.lock().await.insert(id.clone(), kill_tx);

        let processes = self.processes.clone();
        let reaper_id = id.clone();
        tokio::spawn(async move {
            let wake = tokio::select! {
                status = child.wait() => Wake::Exited(status),
                _ = kill_rx => Wake::Kill,
            };
            let (status, killed) = match wake {
                Wake::Exited(status) => (status, false),
                Wake::Kill => {
                    if let Err(err) = child.start_kill() {
                        error!(id = %reaper_id, pid, "failed to kill process: {:?}", err);
                    }
                    (child.wait().await, true)
                }
            };
            processes.lock().await.remove(&reaper_id);

            let exit_code = match status {
                Ok(status) => status.code().map(i64::from),
                Err(err) => {
                    error!(id = %reaper_id, pid, "failed to wait for process: {:?}", err);
                    None
                }
            };
            debug!(id = %reaper_id, pid, ?exit_code, killed, "process exited");
            let _ = exit_tx.send(ExitStatus { exit_code, killed });
        });

        Ok(SpawnedProcess {
            handle: ProcessHandle { id, pid: Some(pid) },
            exited: exit_rx,
        })
    }

    async fn kill(&self, handle: &ProcessHandle) -> Result<()> {
        let kill_tx = self
            .processes
            .lock()
            .await
            .remove(&handle.id)
            .ok_or_else(|| anyhow::anyhow!("process {} is not running", handle.id))?;
        kill_tx
            .send(())
            .map_err(|_| anyhow::anyhow!("process {} already exited", handle.id))
    }

    async fn alive(&self, handle: &ProcessHandle) -> bool {
        self.processes.lock().await.contains_key(&handle.id)
    }
}
