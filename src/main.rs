use std::{path::PathBuf, time::Duration};

use ::tracing::{error, info, info_span, Instrument};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use invocation_host::{
    config::ServerConfig,
    function::{FunctionDescriptor, Invocation, InvocationContext, Outcome},
    http_objects::parse_env_pairs,
    metrics,
    scheduler::InvokeRequest,
    service::Service,
    tracing::setup_tracing,
    utils::deadline_after,
};
use uuid::Uuid;

/// Deadline handed to workers when no invoke timeout is configured.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(900);

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the runtime API and host API until interrupted.
    Serve,
    /// Start the host, run a single invocation and print its result.
    Invoke(InvokeArgs),
}

#[derive(Args)]
struct InvokeArgs {
    #[arg(long, help = "Source path identifying the function")]
    src_path: String,
    #[arg(long, help = "Built artifact to run")]
    out_path: String,
    #[arg(long, help = "Handler export, defaults to the last segment of the source path")]
    handler: Option<String>,
    #[arg(long, default_value = "nodejs18.x")]
    runtime: String,
    #[arg(long, default_value = "{}", help = "Event JSON")]
    event: String,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    #[arg(long, help = "Overrides listen_addr, use port 0 for any free port")]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => ServerConfig::from_path(
            path.to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?,
        )?,
        None => ServerConfig::from_env().context("Failed to load config from environment")?,
    };

    setup_tracing(&config)?;
    metrics::init_provider(&config.telemetry, &config.instance_id())?;

    let root_span = info_span!(
        "invocation-host",
        env = config.env,
        "instance-id" = config.instance_id()
    );

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).instrument(root_span).await,
        Commands::Invoke(args) => invoke_once(config, args).instrument(root_span).await,
    };
    if let Err(err) = &result {
        error!("invocation host failed: {:?}", err);
    }
    result
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let mut service = Service::new(config).await?;
    service.start().await
}

async fn invoke_once(mut config: ServerConfig, args: InvokeArgs) -> anyhow::Result<()> {
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
        config.validate()?;
    }

    let mut function = FunctionDescriptor::new(args.src_path, args.out_path);
    if let Some(handler) = args.handler {
        function = function.with_handler(handler);
    }
    let event: serde_json::Value =
        serde_json::from_str(&args.event).context("Failed to parse --event as JSON")?;
    let request_id = args
        .request_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let timeout = config.invoke_timeout();
    let request = InvokeRequest {
        function,
        runtime: args.runtime,
        env: parse_env_pairs(&args.env)?,
        payload: Invocation::new(
            event,
            InvocationContext::new(request_id),
            deadline_after(timeout.unwrap_or(DEFAULT_DEADLINE)),
        ),
    };

    let mut service = Service::new(config).await?;
    let scheduler = service.scheduler.clone();
    let handle = service.handle();
    info!(addr = %service.local_addr(), "runtime api ready");
    let server = tokio::spawn(async move { service.start().await });

    let result = match scheduler.submit_invocation(request).await {
        Ok(pending) => {
            let function_id = pending.function_id().clone();
            let request_id = pending.request_id().to_string();
            match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, pending.wait()).await {
                    Ok(result) => result.map_err(anyhow::Error::from),
                    Err(_) => {
                        scheduler.release_request(&function_id, &request_id).await;
                        Err(anyhow::anyhow!("timed out after {:?}", timeout))
                    }
                },
                None => pending.wait().await.map_err(anyhow::Error::from),
            }
        }
        Err(err) => Err(err.into()),
    };

    // Stopping the server drains every worker it launched.
    handle.shutdown();
    server.await??;

    let result = result?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.outcome() == Outcome::Failure {
        std::process::exit(1);
    }
    Ok(())
}
