/// Retry behaviour of the provider transport against a mocked endpoint
use std::time::{Duration, Instant};

use conversion_delivery::errors::DeliveryError;
use conversion_delivery::transport::{ProviderRequest, RetryPolicy, RetryingTransport};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn policy(attempt_timeout: Duration) -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        attempt_timeout,
        backoff: vec![Duration::from_millis(100), Duration::from_millis(200)],
    }
}

fn request(base: &str) -> ProviderRequest {
    ProviderRequest::new(format!("{}/events", base), json!({"data": [{"event_id": "E1_2"}]}))
        .with_header("Access-Token", "secret")
}

#[tokio::test]
async fn test_server_errors_are_retried_with_backoff() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .and(header("Access-Token", "secret"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let transport = RetryingTransport::new(policy(Duration::from_secs(5))).unwrap();

    let started = Instant::now();
    let err = transport.send(&request(&mock_server.uri())).await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        DeliveryError::Transport {
            status,
            attempts,
            message,
        } => {
            assert_eq!(status, Some(503));
            assert_eq!(attempts, 3);
            assert!(message.contains("unavailable"));
        }
        other => panic!("expected transport error, got {:?}", other),
    }
    // 100ms after the first attempt, 200ms after the second.
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn test_backoff_uses_one_entry_per_failed_attempt() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    // Mirrors the default 1s/2s/4s shape, scaled down.
    let transport = RetryingTransport::new(RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_secs(5),
        backoff: vec![
            Duration::from_millis(300),
            Duration::from_millis(600),
            Duration::from_millis(1200),
        ],
    })
    .unwrap();

    let started = Instant::now();
    let err = transport.send(&request(&mock_server.uri())).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, DeliveryError::Transport { attempts: 3, .. }));
    // Waits are 300ms then 600ms; the last entry is never reached with 3 attempts.
    assert!(elapsed >= Duration::from_millis(900), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn test_malformed_header_is_validation_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let transport = RetryingTransport::new(policy(Duration::from_secs(5))).unwrap();
    let bad = ProviderRequest::new(format!("{}/events", mock_server.uri()), json!({}))
        .with_header("Access-Token", "line\nbreak");

    let err = transport.send(&bad).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Validation(_)));
}

#[tokio::test]
async fn test_client_errors_are_returned_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"code": 40002})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let transport = RetryingTransport::new(policy(Duration::from_secs(5))).unwrap();
    let response = transport.send(&request(&mock_server.uri())).await.unwrap();

    assert_eq!(response.status, 400);
    assert_eq!(response.attempts, 1);
    assert!(response.body.contains("40002"));
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let transport = RetryingTransport::new(policy(Duration::from_secs(5))).unwrap();
    let response = transport.send(&request(&mock_server.uri())).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.attempts, 2);
}

#[tokio::test]
async fn test_slow_responses_time_out_per_attempt() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .expect(3)
        .mount(&mock_server)
        .await;

    let transport = RetryingTransport::new(policy(Duration::from_millis(150))).unwrap();

    let started = Instant::now();
    let err = transport.send(&request(&mock_server.uri())).await.unwrap_err();

    assert!(matches!(
        err,
        DeliveryError::Transport {
            status: None,
            attempts: 3,
            ..
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_error() {
    // Nothing listens on port 9 on a test host.
    let transport = RetryingTransport::new(RetryPolicy {
        max_attempts: 2,
        attempt_timeout: Duration::from_secs(2),
        backoff: vec![Duration::from_millis(10)],
    })
    .unwrap();

    let err = transport
        .send(&request("http://127.0.0.1:9"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Transport { status: None, .. }));
}
