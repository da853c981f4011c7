use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Canonical error envelope carried by every 4xx/5xx response body.
#[derive(Serialize, Debug)]
pub struct ErrorEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    pub code: String,
    pub message: String,
    pub details: Value,
}

#[derive(Debug)]
pub enum ApiError {
    Authentication {
        message: String,
        trace_id: Option<Uuid>,
    },
    Authorization {
        message: String,
        trace_id: Option<Uuid>,
    },
    Validation {
        message: String,
        trace_id: Option<Uuid>,
        details: Value,
    },
    NotFound {
        message: String,
        trace_id: Option<Uuid>,
    },
    Conflict {
        message: String,
        trace_id: Option<Uuid>,
    },
    RateLimit {
        limit: u32,
        current_count: u32,
        retry_after_seconds: u64,
        trace_id: Option<Uuid>,
    },
    ExternalService {
        service: String,
        message: String,
        /// 503 when the downstream was unreachable, 502 when it answered badly.
        unreachable: bool,
        trace_id: Option<Uuid>,
    },
    JwksUnavailable {
        message: String,
        trace_id: Option<Uuid>,
    },
    ConnectionLimitExceeded {
        max_connections: usize,
        trace_id: Option<Uuid>,
    },
    UnknownTopic {
        topic: String,
        trace_id: Option<Uuid>,
    },
    Internal {
        message: String,
        trace_id: Option<Uuid>,
    },
}

impl ApiError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            trace_id: None,
        }
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
            trace_id: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            trace_id: None,
            details: Value::Null,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            trace_id: None,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            trace_id: None,
        }
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal {
            message: err.to_string(),
            trace_id: None,
        }
    }

    pub fn external(
        service: impl Into<String>,
        message: impl Into<String>,
        unreachable: bool,
    ) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
            unreachable,
            trace_id: None,
        }
    }

    /// Attach the request trace id so the envelope can be correlated with logs.
    pub fn with_trace_id(mut self, id: Uuid) -> Self {
        match &mut self {
            Self::Authentication { trace_id, .. }
            | Self::Authorization { trace_id, .. }
            | Self::Validation { trace_id, .. }
            | Self::NotFound { trace_id, .. }
            | Self::Conflict { trace_id, .. }
            | Self::RateLimit { trace_id, .. }
            | Self::ExternalService { trace_id, .. }
            | Self::JwksUnavailable { trace_id, .. }
            | Self::ConnectionLimitExceeded { trace_id, .. }
            | Self::UnknownTopic { trace_id, .. }
            | Self::Internal { trace_id, .. } => *trace_id = Some(id),
        }
        self
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "AUTHENTICATION_ERROR",
            Self::Authorization { .. } => "AUTHORIZATION_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::RateLimit { .. } => "RATE_LIMIT_ERROR",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::JwksUnavailable { .. } => "JWKS_UNAVAILABLE",
            Self::ConnectionLimitExceeded { .. } => "CONNECTION_LIMIT_EXCEEDED",
            Self::UnknownTopic { .. } => "UNKNOWN_TOPIC",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::Validation { .. } | Self::UnknownTopic { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::RateLimit { .. } | Self::ConnectionLimitExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::ExternalService { unreachable, .. } => {
                if *unreachable {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            Self::JwksUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let (trace_id, message, details) = match self {
            Self::Authentication { message, trace_id }
            | Self::Authorization { message, trace_id }
            | Self::NotFound { message, trace_id }
            | Self::Conflict { message, trace_id }
            | Self::JwksUnavailable { message, trace_id }
            | Self::Internal { message, trace_id } => (*trace_id, message.clone(), json!({})),
            Self::Validation {
                message,
                trace_id,
                details,
            } => {
                let details = if details.is_null() {
                    json!({})
                } else {
                    details.clone()
                };
                (*trace_id, message.clone(), details)
            }
            Self::RateLimit {
                limit,
                current_count,
                retry_after_seconds,
                trace_id,
            } => (
                *trace_id,
                "Rate limit exceeded".to_string(),
                json!({
                    "limit": limit,
                    "current_count": current_count,
                    "retry_after": retry_after_seconds,
                }),
            ),
            Self::ExternalService {
                service,
                message,
                trace_id,
                ..
            } => (
                *trace_id,
                format!("{service}: {message}"),
                json!({ "service": service }),
            ),
            Self::ConnectionLimitExceeded {
                max_connections,
                trace_id,
            } => (
                *trace_id,
                format!("Maximum connections ({max_connections}) exceeded"),
                json!({ "max_connections": max_connections }),
            ),
            Self::UnknownTopic { topic, trace_id } => (
                *trace_id,
                format!("Unsupported topic: {topic}"),
                json!({ "topic": topic }),
            ),
        };

        ErrorEnvelope {
            trace_id,
            code: self.code().to_string(),
            message,
            details,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env = self.envelope();
        write!(f, "{}: {}", env.code, env.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let rate_meta = match &self {
            Self::RateLimit {
                limit,
                retry_after_seconds,
                ..
            } => Some((*limit, *retry_after_seconds)),
            _ => None,
        };
        let envelope = self.envelope();

        let mut resp = (status, Json(envelope)).into_response();
        resp.headers_mut()
            .insert("X-Error-Code", HeaderValue::from_static(code));
        if let Some((limit, retry_after)) = rate_meta {
            let headers = resp.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value.clone());
                headers.insert("X-RateLimit-Reset", value);
            }
            if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("X-RateLimit-Limit", value);
            }
            headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
