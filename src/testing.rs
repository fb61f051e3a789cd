use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::RunnersConfig,
    driver::{ExitStatus, ProcessConfig, ProcessDriver, ProcessHandle, SpawnedProcess},
    function::{FunctionDescriptor, FunctionId, Invocation, InvocationContext},
    runner::RunnerRegistry,
    scheduler::{InvokeRequest, PoolStats, Scheduler, SchedulerConfig},
};

pub const TEST_API_PORT: u16 = 9000;

/// Process driver that records what it was asked to do instead of running
/// anything.
#[derive(Default)]
pub struct FakeDriver {
    next_id: AtomicU32,
    fail_start: AtomicBool,
    fixed_pid: Mutex<Option<u32>>,
    started: Mutex<Vec<(ProcessHandle, ProcessConfig)>>,
    killed: Mutex<Vec<String>>,
    refused_kills: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, oneshot::Sender<ExitStatus>>>,
}

impl FakeDriver {
    pub fn started(&self) -> Vec<(ProcessHandle, ProcessConfig)> {
        self.started.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Every later start reports `pid`, as if the kernel recycled it.
    pub fn reuse_pid(&self, pid: u32) {
        *self.fixed_pid.lock().unwrap() = Some(pid);
    }

    /// Makes every later `kill` of `id` fail.
    pub fn refuse_kill(&self, id: &str) {
        self.refused_kills.lock().unwrap().push(id.to_string());
    }

    /// Simulates the process exiting on its own.
    pub fn exit(&self, id: &str, exit_code: i64) -> bool {
        match self.running.lock().unwrap().remove(id) {
            Some(exited) => exited
                .send(ExitStatus {
                    exit_code: Some(exit_code),
                    killed: false,
                })
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ProcessDriver for FakeDriver {
    async fn start(&self, config: ProcessConfig) -> Result<SpawnedProcess> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("Failed to spawn process: {:?}", config.program));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = ProcessHandle {
            id: format!("fake-{n}"),
            pid: Some(self.fixed_pid.lock().unwrap().unwrap_or(1000 + n)),
        };
        let (exit_tx, exit_rx) = oneshot::channel();
        self.running
            .lock()
            .unwrap()
            .insert(handle.id.clone(), exit_tx);
        self.started.lock().unwrap().push((handle.clone(), config));
        Ok(SpawnedProcess {
            handle,
            exited: exit_rx,
        })
    }

    async fn kill(&self, handle: &ProcessHandle) -> Result<()> {
        self.killed.lock().unwrap().push(handle.id.clone());
        if self.refused_kills.lock().unwrap().contains(&handle.id) {
            return Err(anyhow!("operation not permitted: {}", handle.id));
        }
        let exited = self
            .running
            .lock()
            .unwrap()
            .remove(&handle.id)
            .ok_or_else(|| anyhow!("process {} is not running", handle.id))?;
        let _ = exited.send(ExitStatus {
            exit_code: None,
            killed: true,
        });
        Ok(())
    }

    async fn alive(&self, handle: &ProcessHandle) -> bool {
        self.running.lock().unwrap().contains_key(&handle.id)
    }
}

pub struct TestScheduler {
    pub scheduler: Arc<Scheduler>,
    pub driver: Arc<FakeDriver>,
}

impl TestScheduler {
    pub fn new() -> Self {
        Self::with_default_env(HashMap::new())
    }

    pub fn with_default_env(default_env: HashMap<String, String>) -> Self {
        init_test_tracing();

        let driver = Arc::new(FakeDriver::default());
        let config = SchedulerConfig {
            api_host: "127.0.0.1".to_string(),
            api_port: TEST_API_PORT,
            default_env,
            inherit_env: true,
        };
        let scheduler = Arc::new(Scheduler::new(
            config,
            RunnerRegistry::with_defaults(&RunnersConfig::default()),
            driver.clone(),
        ));
        Self { scheduler, driver }
    }

    pub async fn stats(&self, function: &FunctionDescriptor) -> PoolStats {
        self.scheduler.pool_stats(&function.id()).await
    }

    /// Yields until the pool matches `predicate` or a second has passed.
    pub async fn wait_for_stats(
        &self,
        function_id: &FunctionId,
        predicate: impl Fn(&PoolStats) -> bool,
    ) -> PoolStats {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let stats = self.scheduler.pool_stats(function_id).await;
            if predicate(&stats) || tokio::time::Instant::now() > deadline {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Value a worker would see for `key`; later entries win.
pub fn env_var<'a>(config: &'a ProcessConfig, key: &str) -> Option<&'a str> {
    config
        .env
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub fn init_test_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
    );
}

pub fn node_function(src_path: &str) -> FunctionDescriptor {
    FunctionDescriptor::new(src_path, ".build/src/api.js")
}

pub fn invocation(request_id: &str, event: Value) -> Invocation {
    Invocation::new(event, InvocationContext::new(request_id), 1000)
}

pub fn invoke_request(function: &FunctionDescriptor, request_id: &str) -> InvokeRequest {
    InvokeRequest {
        function: function.clone(),
        runtime: "nodejs18.x".to_string(),
        env: HashMap::new(),
        payload: invocation(request_id, json!({ "request": request_id })),
    }
}
