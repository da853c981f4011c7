use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use common_http_errors::ApiError;
use futures::{stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::app_state::StreamingState;
use crate::filter::FilterMap;
use crate::registry::{ConnectionEntry, ConnectionRegistry, RegistryError, Transport};
use crate::ws::StreamParams;

/// Removes the connection from every index when the client goes away and the
/// response stream is dropped.
struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            registry.remove_connection(&connection_id).await;
        });
    }
}

struct SseStreamState {
    receiver: mpsc::Receiver<Value>,
    entry: Arc<ConnectionEntry>,
    _guard: ConnectionGuard,
}

/// GET /sse/stream?token=… — authenticate, register an SSE connection, and
/// stream its outbound queue as `data:` frames with a 30 s idle heartbeat.
pub async fn sse_endpoint(
    State(state): State<StreamingState>,
    Query(params): Query<StreamParams>,
) -> Response {
    let Some(token) = params.token else {
        return Json(json!({
            "message": "SSE endpoint available at /sse/stream (token required for live data)."
        }))
        .into_response();
    };
    let user = match state.verifier.user_info_from_token(&token).await {
        Ok(user) => user,
        Err(err) => return ApiError::from(err).into_response(),
    };

    let (entry, receiver) = match state
        .registry
        .add_connection(Transport::Sse, &user.user_id, &user.tenant_id)
        .await
    {
        Ok(pair) => pair,
        Err(RegistryError::ConnectionLimit(max)) => {
            return ApiError::ConnectionLimitExceeded {
                max_connections: max,
                trace_id: None,
            }
            .into_response()
        }
        Err(err) => return ApiError::internal(err).into_response(),
    };

    info!(connection_id = %entry.id, user_id = %user.user_id, "sse stream opened");
    let guard = ConnectionGuard {
        registry: state.registry.clone(),
        connection_id: entry.id.clone(),
    };

    let opening = Event::default().data(
        json!({
            "type": "connection_established",
            "connection_id": entry.id,
            "user_id": user.user_id,
            "tenant_id": user.tenant_id,
        })
        .to_string(),
    );

    let stream_state = SseStreamState {
        receiver,
        entry,
        _guard: guard,
    };
    let body = stream::unfold(stream_state, |mut s| async move {
        match tokio::time::timeout(Duration::from_secs(30), s.receiver.recv()).await {
            Ok(Some(envelope)) => {
                s.entry.touch();
                Some((
                    Ok::<Event, Infallible>(Event::default().data(envelope.to_string())),
                    s,
                ))
            }
            Ok(None) => None,
            Err(_) => {
                // Idle: keep intermediaries from timing the stream out.
                s.entry.touch();
                let heartbeat = json!({
                    "type": "heartbeat",
                    "timestamp": Utc::now().timestamp_millis(),
                });
                Some((
                    Ok::<Event, Infallible>(Event::default().data(heartbeat.to_string())),
                    s,
                ))
            }
        }
    });
    let body = stream::once(async move { Ok::<Event, Infallible>(opening) }).chain(body);

    let mut response = Sse::new(body).into_response();
    response
        .headers_mut()
        .insert("Cache-Control", "no-cache".parse().expect("header"));
    response
}

#[derive(Deserialize)]
pub struct SseSubscribeParams {
    pub connection_id: String,
    pub topic: String,
    pub filters: Option<String>,
    pub token: Option<String>,
}

/// POST /sse/subscribe — subscribe an existing SSE connection to a topic.
pub async fn sse_subscribe(
    State(state): State<StreamingState>,
    Query(params): Query<SseSubscribeParams>,
) -> Result<Json<Value>, ApiError> {
    let Some(token) = params.token else {
        return Err(ApiError::authentication("token required"));
    };
    state
        .verifier
        .user_info_from_token(&token)
        .await
        .map_err(ApiError::from)?;

    if !state.topics.contains(&params.topic) {
        return Err(ApiError::UnknownTopic {
            topic: params.topic.clone(),
            trace_id: None,
        });
    }

    let entry = state
        .registry
        .get(&params.connection_id)
        .await
        .ok_or_else(|| ApiError::not_found("Connection not found"))?;

    if !state.topic_entitled(&entry, &params.topic).await {
        return Err(ApiError::authorization("Entitlement denied"));
    }

    let filters: FilterMap = match &params.filters {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|err| ApiError::validation(format!("invalid filters: {err}")))?,
        None => FilterMap::new(),
    };

    state
        .consumer
        .ensure_subscribed(&params.topic)
        .await
        .map_err(|err| ApiError::internal(err))?;
    state
        .registry
        .subscribe(&params.connection_id, &params.topic, filters)
        .await
        .map_err(|err| ApiError::internal(err))?;

    debug!(connection_id = %params.connection_id, topic = %params.topic, "sse subscription added");
    Ok(Json(json!({"success": true, "topic": params.topic})))
}
