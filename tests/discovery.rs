//! Gateway discovery retry behaviour

mod common;

use arrakis_orchestrator::controller::{fetch_gateway_info, RetryPolicy};
use arrakis_orchestrator::{ErrorKind, GatewayError};
use common::{response, ScriptedApi, SCENARIO_B_BODY};
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

#[tokio::test(start_paused = true)]
async fn server_errors_give_up_after_five_attempts() {
    let api = ScriptedApi::always(500, "internal error");
    let started = Instant::now();

    let err = assert_err!(fetch_gateway_info(&api, RetryPolicy::default()).await);

    assert_eq!(api.calls(), 5);
    match &err {
        GatewayError::Http { status, attempts, body } => {
            assert_eq!(*status, 500);
            assert_eq!(*attempts, 5);
            assert_eq!(body, "internal error");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("HTTP 500 after 5 attempt(s)"));
    // 2 + 4 + 8 + 16 seconds of backoff between the five attempts
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn unauthorized_fails_without_retry() {
    let api = ScriptedApi::always(401, r#"{"message":"401: Unauthorized","code":0}"#);

    let err = assert_err!(fetch_gateway_info(&api, RetryPolicy::default()).await);

    assert_eq!(api.calls(), 1);
    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[tokio::test(start_paused = true)]
async fn throttling_is_retried_until_success() {
    let api = ScriptedApi::script(
        vec![Ok(response(429, "slow down")), Ok(response(503, "unavailable"))],
        200,
        SCENARIO_B_BODY,
    );

    let info = assert_ok!(fetch_gateway_info(&api, RetryPolicy::default()).await);

    assert_eq!(api.calls(), 3);
    assert_eq!(info.url, "wss://example");
    assert_eq!(info.shards, 8);
    assert_eq!(info.max_concurrency(), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_failures_share_the_ceiling() {
    let api = ScriptedApi::script(
        (0..10)
            .map(|_| Err(GatewayError::transient("GET /gateway/bot", "connection refused")))
            .collect(),
        200,
        SCENARIO_B_BODY,
    );

    let err = assert_err!(fetch_gateway_info(&api, RetryPolicy::default()).await);

    assert_eq!(api.calls(), 5);
    assert_eq!(err.kind(), ErrorKind::TransientNetwork);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let api = ScriptedApi::always(404, "not found");

    let err = assert_err!(fetch_gateway_info(&api, RetryPolicy::default()).await);

    assert_eq!(api.calls(), 1);
    assert!(matches!(err, GatewayError::Http { status: 404, attempts: 1, .. }));
}

#[tokio::test]
async fn malformed_payload_is_reported() {
    let api = ScriptedApi::always(200, "<html>");

    let err = assert_err!(fetch_gateway_info(&api, RetryPolicy::default()).await);

    assert_eq!(api.calls(), 1);
    assert!(matches!(err, GatewayError::InvalidResponse(_)));
}
