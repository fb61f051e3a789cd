use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::{
    function::{FunctionDescriptor, InvocationResult},
    http_objects::DrainResponse,
    routes::{create_routes, RouteState, API_VERSION},
    scheduler::PoolStats,
    testing::{invoke_request, node_function, TestScheduler},
};

fn router(test: &TestScheduler) -> Router {
    create_routes(RouteState {
        scheduler: test.scheduler.clone(),
        invoke_timeout: None,
    })
}

fn runtime_path(function: &FunctionDescriptor, suffix: &str) -> String {
    format!("/{}/{API_VERSION}/runtime/{suffix}", function.id())
}

fn get(uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder().method("GET").uri(uri).body(Body::empty())?)
}

fn post(uri: &str, body: impl Into<Body>) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())?)
}

async fn body_bytes(response: Response) -> Result<Vec<u8>> {
    Ok(to_bytes(response.into_body(), usize::MAX).await?.to_vec())
}

async fn body_json(response: Response) -> Result<Value> {
    Ok(serde_json::from_slice(&body_bytes(response).await?)?)
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn test_invoke_round_trip_over_runtime_api() -> Result<()> {
    let test = TestScheduler::new();
    let app = router(&test);
    let function = node_function("src/http.main");

    let mut request = invoke_request(&function, "http-1");
    request.payload.event = json!({"n": 1});
    request.payload.deadline = 1234;
    let invoke = tokio::spawn(
        app.clone()
            .oneshot(post("/invoke", serde_json::to_string(&request)?)?),
    );

    let next = app
        .clone()
        .oneshot(get(&runtime_path(&function, "invocation/next"))?)
        .await?;
    assert_eq!(next.status(), StatusCode::OK);
    assert_eq!(header(&next, "lambda-runtime-aws-request-id"), Some("http-1"));
    assert_eq!(header(&next, "lambda-runtime-deadline-ms"), Some("1234"));
    assert_eq!(header(&next, "lambda-runtime-client-context"), Some("{}"));
    assert_eq!(header(&next, "lambda-runtime-cognito-identity"), Some("{}"));
    assert!(header(&next, "lambda-runtime-invoked-function-arn").is_none());
    assert_eq!(body_json(next).await?, json!({"n": 1}));

    let accepted = app
        .clone()
        .oneshot(post(
            &runtime_path(&function, "invocation/http-1/response"),
            r#"{"ok":true}"#,
        )?)
        .await?;
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    assert_eq!(body_bytes(accepted).await?, b"ok");

    let response = invoke.await??;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await?,
        json!({"type": "success", "data": {"ok": true}})
    );

    Ok(())
}

#[tokio::test]
async fn test_next_forwards_context_headers() -> Result<()> {
    let test = TestScheduler::new();
    let app = router(&test);
    let function = node_function("src/context.main");

    let mut request = invoke_request(&function, "ctx-1");
    request.payload.context.invoked_function_arn =
        Some("arn:aws:lambda:us-east-1:123456789012:function:api".to_string());
    request.payload.context.client_context = Some(json!({"client": {"appTitle": "demo"}}));
    request.payload.context.identity = Some(json!({"cognitoIdentityId": "id-1"}));
    let _pending = test.scheduler.submit_invocation(request).await?;

    let next = app
        .oneshot(get(&runtime_path(&function, "invocation/next"))?)
        .await?;
    assert_eq!(
        header(&next, "lambda-runtime-invoked-function-arn"),
        Some("arn:aws:lambda:us-east-1:123456789012:function:api")
    );
    let client_context: Value =
        serde_json::from_str(header(&next, "lambda-runtime-client-context").unwrap_or_default())?;
    assert_eq!(client_context, json!({"client": {"appTitle": "demo"}}));
    let identity: Value =
        serde_json::from_str(header(&next, "lambda-runtime-cognito-identity").unwrap_or_default())?;
    assert_eq!(identity, json!({"cognitoIdentityId": "id-1"}));

    Ok(())
}

#[tokio::test]
async fn test_error_endpoint_resolves_failure() -> Result<()> {
    let test = TestScheduler::new();
    let app = router(&test);
    let function = node_function("src/fails.main");

    let pending = test
        .scheduler
        .submit_invocation(invoke_request(&function, "err-1"))
        .await?;
    test.scheduler.poll_for_work(&function.id()).await?;

    let accepted = app
        .oneshot(post(
            &runtime_path(&function, "invocation/err-1/error"),
            "handler blew up",
        )?)
        .await?;
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);

    assert_eq!(
        pending.wait().await?,
        InvocationResult::Failure {
            error: json!("handler blew up")
        }
    );

    Ok(())
}

#[tokio::test]
async fn test_results_for_unknown_requests_are_accepted() -> Result<()> {
    let test = TestScheduler::new();
    let app = router(&test);
    let function = node_function("src/unknown.main");

    for suffix in ["invocation/ghost/response", "invocation/ghost/error", "init/error"] {
        let response = app
            .clone()
            .oneshot(post(&runtime_path(&function, suffix), r#"{"errorMessage":"x"}"#)?)
            .await?;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    Ok(())
}

#[tokio::test]
async fn test_invoke_unsupported_runtime_is_bad_request() -> Result<()> {
    let test = TestScheduler::new();
    let function = node_function("src/java.main");
    let mut request = invoke_request(&function, "java-1");
    request.runtime = "java21".to_string();

    let response = router(&test)
        .oneshot(post("/invoke", serde_json::to_string(&request)?)?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_bytes(response).await?, b"unsupported runtime: java21");
    assert!(test.driver.started().is_empty());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invoke_times_out() -> Result<()> {
    let test = TestScheduler::new();
    let function = node_function("src/slow.main");
    let request = invoke_request(&function, "slow-1");

    let app = router(&test);

    let response = app
        .clone()
        .oneshot(post(
            "/invoke?timeout_secs=1",
            serde_json::to_string(&request)?,
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    // The timed out caller is forgotten; its invocation still waits for a worker.
    let stats_uri = format!("/functions/{}/stats", function.id());
    let stats: PoolStats =
        serde_json::from_value(body_json(app.oneshot(get(&stats_uri)?).await?).await?)?;
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 1);

    Ok(())
}

#[tokio::test]
async fn test_invoke_rejects_context_unfit_for_headers() -> Result<()> {
    let test = TestScheduler::new();
    let app = router(&test);
    let function = node_function("src/headers.main");

    let mut request = invoke_request(&function, "hdr-1");
    request.payload.context.invoked_function_arn = Some("arn\nx".to_string());
    let response = app
        .clone()
        .oneshot(post("/invoke", serde_json::to_string(&request)?)?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_bytes(response).await?,
        b"invalid invocation context: invokedFunctionArn must not contain control characters"
    );
    assert!(test.scheduler.function_ids().await.is_empty());
    assert!(test.driver.started().is_empty());

    // A valid invocation submitted afterwards is served normally.
    let _pending = test
        .scheduler
        .submit_invocation(invoke_request(&function, "hdr-2"))
        .await?;
    let next = app
        .oneshot(get(&runtime_path(&function, "invocation/next"))?)
        .await?;
    assert_eq!(next.status(), StatusCode::OK);
    assert_eq!(header(&next, "lambda-runtime-aws-request-id"), Some("hdr-2"));
    let stats = test.stats(&function).await;
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, 1);

    Ok(())
}

#[tokio::test]
async fn test_drain_and_stats_endpoints() -> Result<()> {
    let test = TestScheduler::new();
    let app = router(&test);
    let function = node_function("src/stats.main");

    let dispatched = test
        .scheduler
        .submit_invocation(invoke_request(&function, "st-1"))
        .await?;
    test.scheduler.poll_for_work(&function.id()).await?;
    let _queued = test
        .scheduler
        .submit_invocation(invoke_request(&function, "st-2"))
        .await?;

    let stats_uri = format!("/functions/{}/stats", function.id());
    let stats: PoolStats =
        serde_json::from_value(body_json(app.clone().oneshot(get(&stats_uri)?).await?).await?)?;
    assert_eq!(
        stats,
        PoolStats {
            idle_workers: 0,
            queued: 1,
            processes: 2,
            in_flight: 2,
        }
    );

    let drained = app
        .clone()
        .oneshot(post("/drain", serde_json::to_string(&function)?)?)
        .await?;
    assert_eq!(drained.status(), StatusCode::ACCEPTED);
    let drained: DrainResponse = serde_json::from_value(body_json(drained).await?)?;
    assert_eq!(drained.function_id, function.id());
    assert!(dispatched.wait().await.is_err());

    let stats: PoolStats =
        serde_json::from_value(body_json(app.oneshot(get(&stats_uri)?).await?).await?)?;
    assert_eq!(stats.processes, 0);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.in_flight, 1);

    Ok(())
}

#[tokio::test]
async fn test_drain_releases_long_poll() -> Result<()> {
    let test = TestScheduler::new();
    let app = router(&test);
    let function = node_function("src/poll.main");

    let poll = tokio::spawn(
        app.clone()
            .oneshot(get(&runtime_path(&function, "invocation/next"))?),
    );
    test.wait_for_stats(&function.id(), |s| s.idle_workers == 1)
        .await;

    test.scheduler.drain(&function).await;

    let response = poll.await??;
    assert_eq!(response.status(), StatusCode::GONE);

    Ok(())
}
