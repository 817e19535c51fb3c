use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use url::Url;

use modeldeploy::deploy::cancel::{cancel_pair, CancelSignal};
use modeldeploy::errors::DeployError;
use modeldeploy::fakes::FakeProbe;
use modeldeploy::health::probe::{HealthProbe, HttpProbe, ProbeResult};
use modeldeploy::health::{HealthOutcome, HealthValidator};

fn url() -> Url {
    Url::parse("http://10.0.0.5:8000/health").unwrap()
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test(start_paused = true)]
async fn test_healthy_on_fourth_poll() {
    let probe = Arc::new(FakeProbe::new().status(503).status(503).status(503).status(200));
    let validator = HealthValidator::new(probe.clone());

    let started = tokio::time::Instant::now();
    let report = validator
        .poll(&url(), Duration::from_secs(10), Duration::from_secs(60), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.outcome, HealthOutcome::Healthy);
    assert_eq!(report.polls, 4);
    assert_eq!(probe.calls(), 4);
    assert_eq!(started.elapsed(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_never_healthy_times_out() {
    let probe = Arc::new(FakeProbe::new().status(503));
    let validator = HealthValidator::new(probe.clone());

    let report = validator
        .poll(&url(), Duration::from_secs(10), Duration::from_secs(60), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.outcome, HealthOutcome::TimedOut);
    assert_eq!(probe.calls(), 6);
    assert!(report.last_observation.unwrap().contains("503"));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_then_loading_then_ready() {
    let probe = Arc::new(
        FakeProbe::new()
            .unreachable("connection refused")
            .respond(200, r#"{"status":"healthy","vllm_available":false}"#)
            .respond(200, r#"{"status":"healthy","vllm_available":true}"#),
    );
    let validator = HealthValidator::new(probe.clone());

    let report = validator
        .poll(&url(), Duration::from_secs(5), Duration::from_secs(60), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.outcome, HealthOutcome::Healthy);
    assert_eq!(report.polls, 3);
}

#[tokio::test(start_paused = true)]
async fn test_html_success_page_is_not_ready() {
    let probe = Arc::new(
        FakeProbe::new()
            .respond(200, "<html><body>Welcome to nginx!</body></html>")
            .respond(200, ""),
    );
    let validator = HealthValidator::new(probe.clone());

    let report = validator
        .poll(&url(), Duration::from_secs(5), Duration::from_secs(60), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.outcome, HealthOutcome::Healthy);
    assert_eq!(report.polls, 2);
    assert_eq!(probe.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_final() {
    let probe = Arc::new(FakeProbe::new().status(404));
    let validator = HealthValidator::new(probe.clone());

    let report = validator
        .poll(&url(), Duration::from_secs(10), Duration::from_secs(60), &CancelSignal::never())
        .await
        .unwrap();

    assert!(matches!(report.outcome, HealthOutcome::Unhealthy(ref o) if o.contains("404")));
    assert_eq!(probe.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_polling() {
    let probe = Arc::new(FakeProbe::new().status(503));
    let validator = HealthValidator::new(probe.clone());
    let (cancel, signal) = cancel_pair();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
    });

    let err = validator
        .poll(&url(), Duration::from_secs(10), Duration::from_secs(600), &signal)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Cancelled));
    assert_eq!(probe.calls(), 3);
}

#[tokio::test]
async fn test_http_probe_against_live_server() {
    let router = Router::new()
        .route(
            "/health",
            get(|| async { Json(json!({"status": "healthy", "vllm_available": true})) }),
        )
        .route("/loading", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "loading model") }));
    let addr = serve(router).await;
    let probe = HttpProbe::new(Duration::from_secs(5)).unwrap();

    let healthy = probe
        .get(&Url::parse(&format!("http://{}/health", addr)).unwrap())
        .await;
    match healthy {
        ProbeResult::Response { status, body } => {
            assert_eq!(status, 200);
            assert!(body.contains("\"vllm_available\":true"));
        }
        other => panic!("unexpected probe result: {:?}", other),
    }

    let loading = probe
        .get(&Url::parse(&format!("http://{}/loading", addr)).unwrap())
        .await;
    assert_eq!(
        loading,
        ProbeResult::Response {
            status: 503,
            body: "loading model".to_string()
        }
    );

    let validator = HealthValidator::new(Arc::new(probe));
    let report = validator
        .poll(
            &Url::parse(&format!("http://{}/health", addr)).unwrap(),
            Duration::from_millis(100),
            Duration::from_secs(5),
            &CancelSignal::never(),
        )
        .await
        .unwrap();
    assert_eq!(report.outcome, HealthOutcome::Healthy);
}

#[tokio::test]
async fn test_http_probe_closed_port_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
    let result = probe
        .get(&Url::parse(&format!("http://{}/health", addr)).unwrap())
        .await;
    assert!(matches!(result, ProbeResult::Unreachable(_)));
}
