mod support;

use std::time::Duration;

use axum::http::StatusCode;
use common_entitlements::Effect;
use gateway::circuit_breaker::BreakerConfig;
use httpmock::MockServer;
use support::{body_json, get_bearer, harness, send, TestOptions};

#[tokio::test(flavor = "multi_thread")]
async fn open_breaker_serves_registered_fallback() {
    let downstream = MockServer::start_async().await;
    downstream
        .mock_async(|when, then| {
            when.method("GET").path("/api/v1/instruments");
            then.status(500);
        })
        .await;

    let harness = harness(TestOptions {
        market_data_url: Some(downstream.base_url()),
        breaker: BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(300),
            success_threshold: 1,
        },
        ..Default::default()
    })
    .await;
    harness
        .seed_role_rule("t1", "instrument", "user", Effect::Allow, 100)
        .await;
    let router = harness.router();
    let token = harness.token_for("u1", "t1", &["user"]);

    // First request: the downstream fails, the retry fails, the breaker opens.
    let first = send(&router, get_bearer("/api/v1/instruments", &token)).await;
    assert_eq!(first.status(), StatusCode::BAD_GATEWAY);
    let envelope = body_json(first).await;
    assert_eq!(envelope["code"], "EXTERNAL_SERVICE_ERROR");
    assert_eq!(envelope["details"]["service"], "market-data");

    // Second request: the breaker is open, the registered fallback answers.
    let second = send(&router, get_bearer("/api/v1/instruments", &token)).await;
    assert_eq!(second.status(), StatusCode::OK);
    let body = body_json(second).await;
    assert_eq!(body["fallback"], true);
    assert!(body["instruments"].as_array().unwrap()[0]["name"]
        .as_str()
        .unwrap()
        .contains("Cached"));
}

#[tokio::test(flavor = "multi_thread")]
async fn open_breaker_without_fallback_maps_to_503() {
    let downstream = MockServer::start_async().await;
    downstream
        .mock_async(|when, then| {
            when.method("GET").path("/api/v1/pricing");
            then.status(500);
        })
        .await;

    let harness = harness(TestOptions {
        market_data_url: Some(downstream.base_url()),
        breaker: BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(300),
            success_threshold: 1,
        },
        ..Default::default()
    })
    .await;
    harness
        .seed_role_rule("t1", "pricing", "user", Effect::Allow, 100)
        .await;
    let router = harness.router();
    let token = harness.token_for("u1", "t1", &["user"]);

    let first = send(&router, get_bearer("/api/v1/pricing", &token)).await;
    assert_eq!(first.status(), StatusCode::BAD_GATEWAY);

    // Pricing has no registered fallback, so an open breaker is a 503.
    let second = send(&router, get_bearer("/api/v1/pricing", &token)).await;
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    let envelope = body_json(second).await;
    assert_eq!(envelope["code"], "EXTERNAL_SERVICE_ERROR");
}

#[tokio::test(flavor = "multi_thread")]
async fn breaker_snapshot_is_exposed() {
    let downstream = MockServer::start_async().await;
    downstream
        .mock_async(|when, then| {
            when.method("GET").path("/api/v1/instruments");
            then.status(500);
        })
        .await;

    let harness = harness(TestOptions {
        market_data_url: Some(downstream.base_url()),
        breaker: BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(300),
            success_threshold: 1,
        },
        ..Default::default()
    })
    .await;
    harness
        .seed_role_rule("t1", "instrument", "user", Effect::Allow, 100)
        .await;
    let router = harness.router();
    let token = harness.token_for("u1", "t1", &["user"]);
    send(&router, get_bearer("/api/v1/instruments", &token)).await;

    let response = send(&router, support::get("/api/v1/circuit-breakers")).await;
    let body = body_json(response).await;
    let breakers = body["circuit_breakers"].as_array().unwrap();
    let market = breakers
        .iter()
        .find(|b| b["name"] == "market-data")
        .expect("market-data breaker registered");
    assert_eq!(market["state"], "open");
}
