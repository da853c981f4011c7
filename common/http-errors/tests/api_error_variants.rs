use axum::http::StatusCode;
use axum::response::IntoResponse;
use common_http_errors::ApiError;
use uuid::Uuid;

#[test]
fn status_and_code_mapping() {
    let cases = vec![
        (
            ApiError::authentication("missing token"),
            StatusCode::UNAUTHORIZED,
            "AUTHENTICATION_ERROR",
        ),
        (
            ApiError::authorization("denied"),
            StatusCode::FORBIDDEN,
            "AUTHORIZATION_ERROR",
        ),
        (
            ApiError::validation("bad input"),
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
        ),
        (
            ApiError::not_found("no such task"),
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
        ),
        (
            ApiError::RateLimit {
                limit: 100,
                current_count: 101,
                retry_after_seconds: 12,
                trace_id: None,
            },
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMIT_ERROR",
        ),
        (
            ApiError::external("projection", "connect refused", true),
            StatusCode::SERVICE_UNAVAILABLE,
            "EXTERNAL_SERVICE_ERROR",
        ),
        (
            ApiError::external("projection", "HTTP 500", false),
            StatusCode::BAD_GATEWAY,
            "EXTERNAL_SERVICE_ERROR",
        ),
        (
            ApiError::JwksUnavailable {
                message: "no keys".into(),
                trace_id: None,
            },
            StatusCode::SERVICE_UNAVAILABLE,
            "JWKS_UNAVAILABLE",
        ),
        (
            ApiError::ConnectionLimitExceeded {
                max_connections: 5000,
                trace_id: None,
            },
            StatusCode::TOO_MANY_REQUESTS,
            "CONNECTION_LIMIT_EXCEEDED",
        ),
        (
            ApiError::UnknownTopic {
                topic: "nope".into(),
                trace_id: None,
            },
            StatusCode::BAD_REQUEST,
            "UNKNOWN_TOPIC",
        ),
        (
            ApiError::internal("boom"),
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
        ),
    ];

    for (err, status, code) in cases {
        assert_eq!(err.status(), status, "status for {code}");
        assert_eq!(err.code(), code);
        let resp = err.into_response();
        assert_eq!(resp.status(), status);
        assert_eq!(
            resp.headers().get("X-Error-Code").unwrap().to_str().unwrap(),
            code
        );
    }
}

#[test]
fn envelope_carries_trace_id_and_details() {
    let id = Uuid::new_v4();
    let err = ApiError::RateLimit {
        limit: 10,
        current_count: 11,
        retry_after_seconds: 42,
        trace_id: None,
    }
    .with_trace_id(id);

    let envelope = err.envelope();
    assert_eq!(envelope.trace_id, Some(id));
    assert_eq!(envelope.code, "RATE_LIMIT_ERROR");
    assert_eq!(envelope.details["retry_after"], 42);
    assert_eq!(envelope.details["limit"], 10);
}

#[test]
fn rate_limit_response_sets_retry_after_header() {
    let resp = ApiError::RateLimit {
        limit: 100,
        current_count: 101,
        retry_after_seconds: 7,
        trace_id: None,
    }
    .into_response();
    assert_eq!(
        resp.headers().get("Retry-After").unwrap().to_str().unwrap(),
        "7"
    );
    assert_eq!(
        resp.headers()
            .get("X-RateLimit-Remaining")
            .unwrap()
            .to_str()
            .unwrap(),
        "0"
    );
    assert_eq!(
        resp.headers()
            .get("X-RateLimit-Limit")
            .unwrap()
            .to_str()
            .unwrap(),
        "100"
    );
}

#[test]
fn external_service_names_the_downstream() {
    let envelope = ApiError::external("served-data", "timeout", true).envelope();
    assert!(envelope.message.starts_with("served-data:"));
    assert_eq!(envelope.details["service"], "served-data");
}
