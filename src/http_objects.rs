use std::collections::HashMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{function::FunctionId, scheduler::SchedulerError};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn timeout(request_id: &str) -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            &format!("request {request_id} timed out waiting for a result"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status_code = match &e {
            SchedulerError::UnsupportedRuntime(_) | SchedulerError::InvalidContext(_) => {
                StatusCode::BAD_REQUEST
            }
            SchedulerError::DuplicateRequest(_) => StatusCode::CONFLICT,
            SchedulerError::Abandoned(_) | SchedulerError::WorkerReleased => StatusCode::GONE,
            SchedulerError::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status_code, &e.to_string())
    }
}

/// Response of `POST /drain`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrainResponse {
    pub function_id: FunctionId,
}

/// Query parameters of `POST /invoke`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeOptions {
    /// Overrides the configured invoke timeout for this request.
    pub timeout_secs: Option<u64>,
}

/// Parses `K=V` pairs given on the command line.
pub fn parse_env_pairs(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(anyhow::anyhow!("invalid environment variable {pair:?}, expected KEY=VALUE")),
        })
        .collect()
}
