use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum_server::Handle;
use tokio::signal;
use tracing::info;

use crate::{
    config::ServerConfig,
    driver::ForkExecDriver,
    routes::{create_routes, RouteState},
    runner::RunnerRegistry,
    scheduler::{Scheduler, SchedulerConfig},
};

pub struct Service {
    pub config: ServerConfig,
    pub scheduler: Arc<Scheduler>,
    listener: Option<std::net::TcpListener>,
    local_addr: SocketAddr,
    handle: Handle,
}

impl Service {
    /// Binds the listen address and builds the scheduler. Workers are told
    /// the bound port, so `listen_addr` may use port 0.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let addr: SocketAddr = config.listen_addr.parse()?;
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::from_server_config(&config, local_addr.port()),
            RunnerRegistry::with_defaults(&config.runners),
            Arc::new(ForkExecDriver::new()),
        ));

        Ok(Self {
            config,
            scheduler,
            listener: Some(listener),
            local_addr,
            handle: Handle::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops the server when `shutdown` is called on it.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Serves until a shutdown signal arrives, then drains every pool.
    pub async fn start(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("service already started"))?;

        let handle_sh = self.handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let route_state = RouteState {
            scheduler: self.scheduler.clone(),
            invoke_timeout: self.config.invoke_timeout(),
        };
        let routes = create_routes(route_state);

        info!("server api listening on {}", self.local_addr);
        axum_server::from_tcp(listener)
            .handle(self.handle.clone())
            .serve(routes.into_make_service())
            .await?;

        info!("server stopped, draining workers");
        self.scheduler.drain_all().await;
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    info!("signal received, shutting down server gracefully");
}
