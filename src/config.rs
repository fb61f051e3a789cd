use std::{collections::HashMap, net::SocketAddr, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "INVOCATION_HOST_";

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde_inline_default("127.0.0.1:9000".to_string())]
    pub listen_addr: String,
    /// Host workers use to reach the runtime API. Combined with the bound
    /// port and the function id into `AWS_LAMBDA_RUNTIME_API`.
    #[serde_inline_default("127.0.0.1".to_string())]
    pub api_host: String,
    /// Timeout applied by the direct invoke endpoint and CLI. 0 waits forever.
    #[serde(default)]
    pub invoke_timeout_secs: u64,
    /// Environment injected into every worker, overridden by caller and
    /// runtime supplied variables.
    #[serde(default)]
    pub default_env: HashMap<String, String>,
    /// Whether workers inherit the host's environment.
    #[serde_inline_default(true)]
    pub inherit_env: bool,
    #[serde(default)]
    pub runners: RunnersConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "127.0.0.1:9000".to_string(),
            api_host: "127.0.0.1".to_string(),
            invoke_timeout_secs: 0,
            default_env: HashMap::new(),
            inherit_env: true,
            runners: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `INVOCATION_HOST_*` environment variables.
    pub fn from_env() -> Result<ServerConfig> {
        let config: ServerConfig = Figment::from(figment::providers::Serialized::defaults(
            ServerConfig::default(),
        ))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.api_host.trim().is_empty() {
            return Err(anyhow::anyhow!("api_host cannot be empty"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn invoke_timeout(&self) -> Option<Duration> {
        match self.invoke_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnersConfig {
    /// Runtime interface client used by `node*` runtimes.
    #[serde_inline_default("./node_modules/.bin/aws-lambda-ric".to_string())]
    pub node_ric: String,
    /// Interpreter used by `python*` runtimes.
    #[serde_inline_default("python3".to_string())]
    pub python: String,
}

impl Default for RunnersConfig {
    fn default() -> Self {
        Self {
            node_ric: "./node_modules/.bin/aws-lambda-ric".to_string(),
            python: "python3".to_string(),
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    // Enable metrics.
    #[serde(default)]
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint for metrics.
    // Defaults to using OTEL_EXPORTER_OTLP_ENDPOINT env var or to localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    // Metrics export interval. Defaults to 10 seconds.
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(10))]
    pub metrics_interval: Duration,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}
