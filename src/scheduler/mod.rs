//! Invocation scheduler.
//!
//! Every function gets a [`Pool`] keyed by its [`FunctionId`]. Invocations
//! and polling workers meet inside the pool: an invocation that finds an
//! idle worker is handed over directly, otherwise it is queued and a new
//! worker process is launched, which will find it on its first poll.
//!
//! All pool state sits behind a single lock, so submit, poll, delivery and
//! drain steps never interleave. Callers and workers wait on oneshot
//! channels outside the lock.

mod pool;

use std::{collections::HashMap, sync::Arc};

use futures::future::join_all;
pub use pool::PoolStats;
use pool::{Drained, Pool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    driver::{ProcessConfig, ProcessDriver, SpawnedProcess},
    function::{
        FunctionDescriptor,
        FunctionId,
        InvalidContext,
        Invocation,
        InvocationResult,
        Outcome,
    },
    metrics::scheduler_metrics::Metrics,
    runner::{RunnerRegistry, UnsupportedRuntime},
};

/// Environment variable telling a worker where its runtime API lives.
pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    UnsupportedRuntime(#[from] UnsupportedRuntime),

    #[error("failed to launch worker for function {function_id}: {source}")]
    Spawn {
        function_id: FunctionId,
        source: anyhow::Error,
    },

    #[error("invalid invocation context: {0}")]
    InvalidContext(#[from] InvalidContext),

    #[error("request {0} is already in flight")]
    DuplicateRequest(String),

    #[error("request {0} was abandoned before a result was delivered")]
    Abandoned(String),

    #[error("worker was released before receiving an invocation")]
    WorkerReleased,
}

/// A request to run one invocation of a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub function: FunctionDescriptor,
    pub runtime: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub payload: Invocation,
}

/// The caller's side of an in-flight invocation.
#[derive(Debug)]
pub struct PendingResult {
    function_id: FunctionId,
    request_id: String,
    rx: oneshot::Receiver<InvocationResult>,
}

impl PendingResult {
    pub fn function_id(&self) -> &FunctionId {
        &self.function_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the worker's result. Fails with `Abandoned` if the request
    /// was dropped by a drain.
    pub async fn wait(self) -> Result<InvocationResult, SchedulerError> {
        let PendingResult { request_id, rx, .. } = self;
        rx.await.map_err(|_| SchedulerError::Abandoned(request_id))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Host and port workers use to reach the runtime API.
    pub api_host: String,
    pub api_port: u16,
    pub default_env: HashMap<String, String>,
    pub inherit_env: bool,
}

impl SchedulerConfig {
    pub fn from_server_config(config: &ServerConfig, api_port: u16) -> Self {
        Self {
            api_host: config.api_host.clone(),
            api_port,
            default_env: config.default_env.clone(),
            inherit_env: config.inherit_env,
        }
    }
}

pub struct Scheduler {
    pools: Arc<Mutex<HashMap<FunctionId, Pool>>>,
    runners: RunnerRegistry,
    driver: Arc<dyn ProcessDriver>,
    config: SchedulerConfig,
    metrics: Metrics,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        runners: RunnerRegistry,
        driver: Arc<dyn ProcessDriver>,
    ) -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            runners,
            driver,
            config,
            metrics: Metrics::new(),
        }
    }

    /// Base URL a worker for `function_id` polls and posts results to.
    pub fn runtime_api(&self, function_id: &FunctionId) -> String {
        format!(
            "http://{}:{}/{}",
            self.config.api_host, self.config.api_port, function_id
        )
    }

    /// Registers the caller and dispatches the invocation. The returned
    /// [`PendingResult`] resolves once a worker posts a result for the
    /// request id.
    ///
    /// A context a worker could not be given is rejected before anything is
    /// queued. If no worker can be launched the error is returned here; the
    /// invocation stays queued for whichever worker polls next.
    pub async fn submit_invocation(
        &self,
        request: InvokeRequest,
    ) -> Result<PendingResult, SchedulerError> {
        request.payload.context.validate()?;
        let function_id = request.function.id();
        let request_id = request.payload.request_id().to_string();
        self.metrics.invocations.add(1, &[]);

        let mut pools = self.pools.lock().await;
        let pool = pools.entry(function_id.clone()).or_default();

        let rx = pool
            .register_request(&request_id)
            .ok_or_else(|| SchedulerError::DuplicateRequest(request_id.clone()))?;

        if let Err(err) = self.dispatch(&function_id, pool, &request).await {
            pool.forget_request(&request_id);
            return Err(err);
        }

        Ok(PendingResult {
            function_id,
            request_id,
            rx,
        })
    }

    /// Submits an invocation and waits for its result.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvocationResult, SchedulerError> {
        self.submit_invocation(request).await?.wait().await
    }

    async fn dispatch(
        &self,
        function_id: &FunctionId,
        pool: &mut Pool,
        request: &InvokeRequest,
    ) -> Result<(), SchedulerError> {
        let invocation = match pool.hand_to_idle_worker(request.payload.clone()) {
            Ok(()) => {
                debug!(
                    function_id = %function_id,
                    request_id = request.payload.request_id(),
                    "invocation handed to idle worker"
                );
                self.metrics.warm_starts.add(1, &[]);
                return Ok(());
            }
            Err(invocation) => invocation,
        };

        pool.push_queued(invocation);

        let command = self.runners.resolve(&request.runtime)?.command(&request.function);
        let mut env: HashMap<String, String> = self.config.default_env.clone();
        env.extend(request.env.clone());
        env.extend(command.env);
        env.insert(RUNTIME_API_ENV.to_string(), self.runtime_api(function_id));

        let process_config = ProcessConfig {
            program: command.program,
            args: command.args,
            env: env.into_iter().collect(),
            clear_env: !self.config.inherit_env,
        };
        let spawned = self
            .driver
            .start(process_config)
            .await
            .map_err(|source| SchedulerError::Spawn {
                function_id: function_id.clone(),
                source,
            })?;

        info!(
            function_id = %function_id,
            request_id = request.payload.request_id(),
            pid = ?spawned.handle.pid,
            "launched worker"
        );
        self.metrics.cold_starts.add(1, &[]);
        pool.add_process(spawned.handle.clone());
        self.reap_on_exit(function_id.clone(), spawned);
        Ok(())
    }

    /// Removes the process from its pool once it exits.
    fn reap_on_exit(&self, function_id: FunctionId, spawned: SpawnedProcess) {
        let pools = self.pools.clone();
        let worker_exits = self.metrics.worker_exits.clone();
        let SpawnedProcess { handle, exited } = spawned;
        tokio::spawn(async move {
            let status = exited.await.unwrap_or_default();
            info!(
                function_id = %function_id,
                pid = ?handle.pid,
                exit_code = ?status.exit_code,
                killed = status.killed,
                "worker exited"
            );
            worker_exits.add(1, &[]);
            if let Some(pool) = pools.lock().await.get_mut(&function_id) {
                pool.remove_process(&handle.id);
            }
        });
    }

    /// Long-polls for the next invocation of `function_id`. Returns at once
    /// if one is queued, otherwise parks until an invocation is dispatched
    /// to this worker.
    pub async fn poll_for_work(&self, function_id: &FunctionId) -> Result<Invocation, SchedulerError> {
        let rx = {
            let mut pools = self.pools.lock().await;
            let pool = pools.entry(function_id.clone()).or_default();
            if let Some(invocation) = pool.take_queued() {
                debug!(
                    function_id = %function_id,
                    request_id = invocation.request_id(),
                    "worker picked up queued invocation"
                );
                return Ok(invocation);
            }
            pool.park_worker()
        };
        rx.await.map_err(|_| SchedulerError::WorkerReleased)
    }

    /// Resolves the caller waiting on `request_id`. Unknown or already
    /// completed requests are ignored; returns whether a caller was notified.
    pub async fn deliver_result(
        &self,
        function_id: &FunctionId,
        request_id: &str,
        outcome: Outcome,
        body: Value,
    ) -> bool {
        let delivered = match self.pools.lock().await.get_mut(function_id) {
            Some(pool) => pool.complete_request(request_id, InvocationResult::new(outcome, body)),
            None => false,
        };
        if delivered {
            self.metrics
                .results
                .add(1, &[opentelemetry::KeyValue::new("outcome", outcome.to_string())]);
        } else {
            debug!(
                function_id = %function_id,
                request_id,
                %outcome,
                "no caller waiting for result, ignoring"
            );
        }
        delivered
    }

    pub async fn success(&self, function_id: &FunctionId, request_id: &str, body: Value) -> bool {
        self.deliver_result(function_id, request_id, Outcome::Success, body)
            .await
    }

    pub async fn failure(&self, function_id: &FunctionId, request_id: &str, body: Value) -> bool {
        self.deliver_result(function_id, request_id, Outcome::Failure, body)
            .await
    }

    /// Kills every worker of the function and releases its idle pollers.
    pub async fn drain(&self, function: &FunctionDescriptor) {
        self.drain_pool(&function.id()).await
    }

    /// Drains every known pool.
    pub async fn drain_all(&self) {
        for function_id in self.function_ids().await {
            self.drain_pool(&function_id).await;
        }
    }

    /// Functions that have had a pool created, by submission or by a poll.
    pub async fn function_ids(&self) -> Vec<FunctionId> {
        let mut function_ids: Vec<FunctionId> = self.pools.lock().await.keys().cloned().collect();
        function_ids.sort();
        function_ids
    }

    async fn drain_pool(&self, function_id: &FunctionId) {
        let drained = self
            .pools
            .lock()
            .await
            .get_mut(function_id)
            .map(|pool| pool.drain());
        let Some(Drained {
            processes,
            released_workers,
            abandoned_requests,
        }) = drained
        else {
            debug!(function_id = %function_id, "no pool to drain");
            return;
        };

        info!(
            function_id = %function_id,
            processes = processes.len(),
            released_workers,
            abandoned_requests,
            "draining pool"
        );
        self.metrics.drains.add(1, &[]);

        let kills = processes.iter().map(|handle| async move {
            if !self.driver.alive(handle).await {
                debug!(function_id = %function_id, pid = ?handle.pid, "worker already exited");
                return;
            }
            if let Err(err) = self.driver.kill(handle).await {
                warn!(
                    function_id = %function_id,
                    pid = ?handle.pid,
                    "failed to kill worker: {:?}",
                    err
                );
            }
        });
        join_all(kills).await;
    }

    /// Stops tracking `request_id` once its caller has given up waiting.
    /// A caller still waiting on the same id is left alone.
    pub async fn release_request(&self, function_id: &FunctionId, request_id: &str) -> bool {
        match self.pools.lock().await.get_mut(function_id) {
            Some(pool) => pool.forget_abandoned_request(request_id),
            None => false,
        }
    }

    /// Logs an initialization error reported by a worker.
    pub fn report_init_error(&self, function_id: &FunctionId, body: &Value) {
        warn!(function_id = %function_id, error = %body, "worker failed to initialize");
    }

    pub async fn pool_stats(&self, function_id: &FunctionId) -> PoolStats {
        self.pools
            .lock()
            .await
            .get(function_id)
            .map(|pool| pool.stats())
            .unwrap_or_default()
    }
}
