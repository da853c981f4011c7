mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common_entitlements::Effect;
use support::{body_json, get, get_bearer, harness, send, TestOptions};

#[tokio::test(flavor = "multi_thread")]
async fn bearer_happy_path_with_cache_flip() {
    let harness = harness(TestOptions::default()).await;
    harness
        .seed_role_rule("t1", "instrument", "user", Effect::Allow, 100)
        .await;
    let router = harness.router();
    let token = harness.token_for("u1", "t1", &["user"]);

    let first = send(&router, get_bearer("/api/v1/instruments", &token)).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().contains_key("X-Request-Id"));
    assert!(first.headers().contains_key("X-RateLimit-Limit"));
    let first_body = body_json(first).await;
    assert_eq!(first_body["cached"], false);
    assert_eq!(first_body["user"], "u1");
    assert_eq!(first_body["tenant"], "t1");
    assert!(first_body["instruments"].as_array().unwrap().len() >= 3);

    let second = send(&router, get_bearer("/api/v1/instruments", &token)).await;
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;
    assert_eq!(second_body["cached"], true);
    assert_eq!(second_body["instruments"], first_body["instruments"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn api_key_fallback_authenticates() {
    let harness = harness(TestOptions::default()).await;
    harness
        .seed_role_rule("tenant-1", "instrument", "user", Effect::Allow, 100)
        .await;
    let router = harness.router();

    let request = Request::builder()
        .uri("/api/v1/instruments")
        .header("X-API-Key", "dev-key-123")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["user"], "api-key-dev-key-123");
    assert_eq!(body["tenant"], "tenant-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_credentials_yield_401_envelope() {
    let harness = harness(TestOptions::default()).await;
    let router = harness.router();

    let response = send(&router, get("/api/v1/instruments")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "AUTHENTICATION_ERROR");
    assert!(body["message"].is_string());
    assert!(body["details"].is_object());
}

#[tokio::test(flavor = "multi_thread")]
async fn entitlement_deny_yields_403_envelope() {
    let harness = harness(TestOptions::default()).await;
    // No allow rule: default deny.
    let router = harness.router();
    let token = harness.token_for("u1", "t1", &["user"]);

    let response = send(&router, get_bearer("/api/v1/instruments", &token)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["code"], "AUTHORIZATION_ERROR");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_api_key_is_rejected() {
    let harness = harness(TestOptions::default()).await;
    let router = harness.router();

    let request = Request::builder()
        .uri("/api/v1/instruments")
        .header("X-API-Key", "bogus")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "AUTHENTICATION_ERROR");
}

#[tokio::test(flavor = "multi_thread")]
async fn restricted_resource_denied_by_higher_priority_rule() {
    let harness = harness(TestOptions::default()).await;
    harness
        .seed_role_rule("t1", "instrument", "user", Effect::Allow, 100)
        .await;
    // Priority 200 deny for a specific resource id.
    harness
        .state
        .entitlements
        .create_rule(common_entitlements::RuleDraft {
            name: "deny restricted".into(),
            description: None,
            resource: "instrument".into(),
            effect: Effect::Deny,
            conditions: vec![common_entitlements::RuleCondition {
                field: "resource_id".into(),
                operator: common_entitlements::ConditionOperator::Equals,
                value: serde_json::json!("RESTRICTED"),
                description: None,
            }],
            priority: 200,
            enabled: true,
            tenant_id: Some("t1".into()),
            user_id: None,
            expires_at: None,
        })
        .await
        .unwrap();

    let request = common_entitlements::CheckRequest::new("u1", "t1", "instrument", "read")
        .with_roles(&["user".to_string()])
        .with_context("resource_id", serde_json::json!("RESTRICTED"));
    let decision = harness.state.entitlements.check(&request).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.matched_rule_ids.len(), 1);

    // The plain list request is still allowed.
    let router = harness.router();
    let token = harness.token_for("u1", "t1", &["user"]);
    let response = send(&router, get_bearer("/api/v1/instruments", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn served_latest_price_normalises_and_caches() {
    let harness = harness(TestOptions::default()).await;
    harness
        .seed_role_rule("t1", "market_data", "user", Effect::Allow, 100)
        .await;
    let router = harness.router();
    let token = harness.token_for("u1", "t1", &["user"]);

    let first = send(&router, get_bearer("/api/v1/served/latest-price/brn", &token)).await;
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;
    assert_eq!(first_body["instrument_id"], "BRN");
    assert_eq!(first_body["cached"], false);
    assert_eq!(first_body["projection"]["price"], 52.5);

    let second = send(&router, get_bearer("/api/v1/served/latest-price/BRN", &token)).await;
    let second_body = body_json(second).await;
    assert_eq!(second_body["cached"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn curve_snapshot_requires_horizon() {
    let harness = harness(TestOptions::default()).await;
    harness
        .seed_role_rule("t1", "market_data", "user", Effect::Allow, 100)
        .await;
    let router = harness.router();
    let token = harness.token_for("u1", "t1", &["user"]);

    let ok = send(
        &router,
        get_bearer("/api/v1/served/curve-snapshots/BRN?horizon=1M", &token),
    )
    .await;
    assert_eq!(ok.status(), StatusCode::OK);
    let body = body_json(ok).await;
    assert_eq!(body["horizon"], "1m");

    let missing = send(&router, get_bearer("/api/v1/served/curve-snapshots/BRN", &token)).await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn warm_cache_requires_admin_entitlement() {
    let harness = harness(TestOptions::default()).await;
    harness
        .seed_role_rule("t1", "cache", "admin", Effect::Allow, 100)
        .await;
    let router = harness.router();

    let user_token = harness.token_for("u1", "t1", &["user"]);
    let denied = send(
        &router,
        Request::builder()
            .method("POST")
            .uri("/api/v1/cache/warm")
            .header("Authorization", format!("Bearer {user_token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let admin_token = harness.token_for("admin-1", "t1", &["admin"]);
    let allowed = send(
        &router,
        Request::builder()
            .method("POST")
            .uri("/api/v1/cache/warm")
            .header("Authorization", format!("Bearer {admin_token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(allowed.status(), StatusCode::OK);
    let body = body_json(allowed).await;
    assert!(body["summary"]["warmed"].as_u64().unwrap() >= 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn introspection_endpoints_answer() {
    let harness = harness(TestOptions::default()).await;
    let router = harness.router();

    for path in [
        "/health",
        "/api/v1/status",
        "/api/v1/circuit-breakers",
        "/api/v1/rate-limits",
        "/api/v1/cache/stats",
        "/api/v1/cache/catalog",
    ] {
        let response = send(&router, get(path)).await;
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }

    let catalog = body_json(send(&router, get("/api/v1/cache/catalog")).await).await;
    assert_eq!(catalog["cache_catalog"].as_array().unwrap().len(), 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_route_returns_request_id_header() {
    let harness = harness(TestOptions::default()).await;
    let router = harness.router();
    let response = send(&router, get("/healthz")).await;
    assert!(response.headers().contains_key("X-Request-Id"));
}
