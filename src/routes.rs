use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{MatchedPath, Path, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json,
    Router,
};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::{
    function::{FunctionDescriptor, FunctionId, Invocation, InvocationResult},
    http_objects::{ApiError, DrainResponse, InvokeOptions},
    scheduler::{InvokeRequest, PoolStats, Scheduler},
};

/// Version segment of the runtime API paths.
pub const API_VERSION: &str = "2018-06-01";

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("lambda-runtime-aws-request-id");
const DEADLINE_HEADER: HeaderName = HeaderName::from_static("lambda-runtime-deadline-ms");
const FUNCTION_ARN_HEADER: HeaderName =
    HeaderName::from_static("lambda-runtime-invoked-function-arn");
const CLIENT_CONTEXT_HEADER: HeaderName =
    HeaderName::from_static("lambda-runtime-client-context");
const COGNITO_IDENTITY_HEADER: HeaderName =
    HeaderName::from_static("lambda-runtime-cognito-identity");

#[derive(Clone)]
pub struct RouteState {
    pub scheduler: Arc<Scheduler>,
    pub invoke_timeout: Option<Duration>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route(
            &format!("/{{function_id}}/{API_VERSION}/runtime/invocation/next"),
            get(next_invocation).with_state(route_state.clone()),
        )
        .route(
            &format!("/{{function_id}}/{API_VERSION}/runtime/invocation/{{request_id}}/response"),
            post(invocation_response).with_state(route_state.clone()),
        )
        .route(
            &format!("/{{function_id}}/{API_VERSION}/runtime/invocation/{{request_id}}/error"),
            post(invocation_error).with_state(route_state.clone()),
        )
        .route(
            &format!("/{{function_id}}/{API_VERSION}/runtime/init/error"),
            post(init_error).with_state(route_state.clone()),
        )
        .route("/invoke", post(invoke).with_state(route_state.clone()))
        .route("/drain", post(drain).with_state(route_state.clone()))
        .route(
            "/functions/{function_id}/stats",
            get(pool_stats).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
}

/// Headers a runtime interface client reads alongside the event.
fn invocation_headers(invocation: &Invocation) -> Result<HeaderMap, ApiError> {
    let context = &invocation.context;
    let mut headers = HeaderMap::new();
    headers.insert(REQUEST_ID_HEADER, header_value(&context.aws_request_id)?);
    headers.insert(DEADLINE_HEADER, HeaderValue::from(invocation.deadline));
    if let Some(arn) = &context.invoked_function_arn {
        headers.insert(FUNCTION_ARN_HEADER, header_value(arn)?);
    }
    headers.insert(
        CLIENT_CONTEXT_HEADER,
        header_value(&json_or_empty(context.client_context.as_ref()))?,
    );
    headers.insert(
        COGNITO_IDENTITY_HEADER,
        header_value(&json_or_empty(context.identity.as_ref()))?,
    );
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|e| ApiError::internal_error(e.into()))
}

fn json_or_empty(value: Option<&Value>) -> String {
    value.map_or_else(|| "{}".to_string(), Value::to_string)
}

/// Result bodies are JSON when they parse, otherwise the raw text.
fn result_body(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[tracing::instrument(skip(state))]
async fn next_invocation(
    Path(function_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<impl IntoResponse, ApiError> {
    let invocation = state
        .scheduler
        .poll_for_work(&FunctionId::new(function_id))
        .await?;
    let headers = invocation_headers(&invocation)?;
    Ok((headers, Json(invocation.event)))
}

#[tracing::instrument(skip(state, body))]
async fn invocation_response(
    Path((function_id, request_id)): Path<(String, String)>,
    State(state): State<RouteState>,
    body: Bytes,
) -> impl IntoResponse {
    state
        .scheduler
        .success(&FunctionId::new(function_id), &request_id, result_body(&body))
        .await;
    (StatusCode::ACCEPTED, "ok")
}

#[tracing::instrument(skip(state, body))]
async fn invocation_error(
    Path((function_id, request_id)): Path<(String, String)>,
    State(state): State<RouteState>,
    body: Bytes,
) -> impl IntoResponse {
    state
        .scheduler
        .failure(&FunctionId::new(function_id), &request_id, result_body(&body))
        .await;
    (StatusCode::ACCEPTED, "ok")
}

#[tracing::instrument(skip(state, body))]
async fn init_error(
    Path(function_id): Path<String>,
    State(state): State<RouteState>,
    body: Bytes,
) -> impl IntoResponse {
    state
        .scheduler
        .report_init_error(&FunctionId::new(function_id), &result_body(&body));
    (StatusCode::ACCEPTED, "ok")
}

async fn invoke(
    State(state): State<RouteState>,
    Query(options): Query<InvokeOptions>,
    Json(request): Json<InvokeRequest>,
) -> Result<Json<InvocationResult>, ApiError> {
    let pending = state.scheduler.submit_invocation(request).await?;
    let function_id = pending.function_id().clone();
    let request_id = pending.request_id().to_string();
    debug!(
        function_id = %function_id,
        request_id = %request_id,
        "waiting for invocation result"
    );

    let timeout = options
        .timeout_secs
        .map(Duration::from_secs)
        .or(state.invoke_timeout);
    let result = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(result) => result?,
            Err(_) => {
                state
                    .scheduler
                    .release_request(&function_id, &request_id)
                    .await;
                return Err(ApiError::timeout(&request_id));
            }
        },
        None => pending.wait().await?,
    };
    Ok(Json(result))
}

async fn drain(
    State(state): State<RouteState>,
    Json(function): Json<FunctionDescriptor>,
) -> impl IntoResponse {
    state.scheduler.drain(&function).await;
    (
        StatusCode::ACCEPTED,
        Json(DrainResponse {
            function_id: function.id(),
        }),
    )
}

async fn pool_stats(
    Path(function_id): Path<String>,
    State(state): State<RouteState>,
) -> Json<PoolStats> {
    Json(state.scheduler.pool_stats(&FunctionId::new(function_id)).await)
}
