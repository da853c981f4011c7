use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use common_auth::UserInfo;
use common_http_errors::ApiError;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::app_state::StreamingState;
use crate::filter::FilterMap;
use crate::registry::{RegistryError, Transport};

const AVAILABLE_ACTIONS: [&str; 5] =
    ["subscribe", "unsubscribe", "ping", "list_topics", "get_stats"];

#[derive(Deserialize)]
pub struct StreamParams {
    pub token: Option<String>,
}

/// GET /ws/stream?token=… — authenticate, then upgrade into the streaming
/// message loop.
pub async fn ws_endpoint(
    State(state): State<StreamingState>,
    Query(params): Query<StreamParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.token else {
        return ApiError::authentication("WebSocket token required").into_response();
    };
    let user = match state.verifier.user_info_from_token(&token).await {
        Ok(user) => user,
        Err(err) => return ApiError::from(err).into_response(),
    };

    upgrade.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(socket: WebSocket, state: StreamingState, user: UserInfo) {
    let (entry, mut outbound) = match state
        .registry
        .add_connection(Transport::Ws, &user.user_id, &user.tenant_id)
        .await
    {
        Ok(pair) => pair,
        Err(RegistryError::ConnectionLimit(max)) => {
            let mut socket = socket;
            let envelope = ApiError::ConnectionLimitExceeded {
                max_connections: max,
                trace_id: None,
            }
            .envelope();
            let _ = socket
                .send(Message::Text(
                    serde_json::to_string(&envelope).unwrap_or_default(),
                ))
                .await;
            let _ = socket.close().await;
            return;
        }
        Err(err) => {
            error!(error = %err, "failed to register connection");
            return;
        }
    };
    let connection_id = entry.id.clone();

    let (mut sink, mut stream) = socket.split();

    let established = json!({
        "type": "connection_established",
        "connection_id": connection_id,
        "user_id": user.user_id,
        "tenant_id": user.tenant_id,
    });
    if sink
        .send(Message::Text(established.to_string()))
        .await
        .is_err()
    {
        state.registry.remove_connection(&connection_id).await;
        return;
    }

    // Writer: drains the bounded outbound queue onto the socket.
    let mut writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            if sink.send(Message::Text(envelope.to_string())).await.is_err() {
                break;
            }
        }
    });

    // Reader: the JSON protocol loop. Protocol errors answer in-band and
    // never close the socket.
    let reader_state = state.clone();
    let reader_entry = entry.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let response =
                        handle_message(&reader_state, &reader_entry.id, &text).await;
                    if let Some(response) = response {
                        if reader_entry.sender_for_protocol().send(response).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Ping(_)) => {
                    reader_entry.touch();
                }
                Ok(Message::Close(_)) => {
                    debug!(connection_id = %reader_entry.id, "client closed");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(connection_id = %reader_entry.id, error = %err, "socket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => { reader.abort(); }
        _ = &mut reader => { writer.abort(); }
    }

    state.registry.remove_connection(&connection_id).await;
    info!(connection_id, user_id = %user.user_id, "websocket session ended");
}

/// Route one protocol frame. Internal failures answer with an error envelope
/// rather than terminating the connection.
pub async fn handle_message(
    state: &StreamingState,
    connection_id: &str,
    text: &str,
) -> Option<Value> {
    let parsed: Result<Value, _> = serde_json::from_str(text);
    let message = match parsed {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Some(json!({
                "error": "INVALID_FORMAT",
                "message": "Message must be a JSON object",
            }))
        }
        Err(_) => {
            return Some(json!({
                "error": "INVALID_JSON",
                "message": "Message must be valid JSON",
            }))
        }
    };

    let Some(action) = message.get("action").and_then(Value::as_str) else {
        return Some(json!({
            "error": "INVALID_FORMAT",
            "message": "Message must have 'action' field",
        }));
    };
    let data = message.get("data").cloned().unwrap_or_else(|| json!({}));

    match action {
        "subscribe" => Some(handle_subscribe(state, connection_id, &data).await),
        "unsubscribe" => Some(handle_unsubscribe(state, connection_id, &data).await),
        "ping" => {
            state.registry.touch(connection_id).await;
            Some(json!({
                "action": "pong",
                "timestamp": Utc::now().timestamp_millis(),
            }))
        }
        "list_topics" => Some(handle_list_topics(state, connection_id).await),
        "get_stats" => Some(handle_get_stats(state, connection_id).await),
        other => Some(json!({
            "error": "UNKNOWN_ACTION",
            "message": format!("Unknown action: {other}"),
            "available_actions": AVAILABLE_ACTIONS,
        })),
    }
}

fn parse_filters(data: &Value, topic: &str) -> FilterMap {
    data.get("filters")
        .and_then(|filters| filters.get(topic))
        .and_then(|raw| serde_json::from_value(raw.clone()).ok())
        .unwrap_or_default()
}

async fn handle_subscribe(state: &StreamingState, connection_id: &str, data: &Value) -> Value {
    let Some(topics) = data.get("topics").and_then(Value::as_array) else {
        return json!({
            "error": "MISSING_TOPICS",
            "message": "Topics list is required",
        });
    };
    let Some(entry) = state.registry.get(connection_id).await else {
        return json!({
            "error": "CONNECTION_NOT_FOUND",
            "message": "Connection not found",
        });
    };

    let mut subscribed = Vec::new();
    let mut failed = Vec::new();

    for topic in topics.iter().filter_map(Value::as_str) {
        if !state.topics.contains(topic) {
            failed.push(json!({"topic": topic, "error": "UNKNOWN_TOPIC"}));
            continue;
        }
        if !state.topic_entitled(&entry, topic).await {
            failed.push(json!({"topic": topic, "error": "ENTITLEMENT_DENIED"}));
            continue;
        }
        if let Err(err) = state.consumer.ensure_subscribed(topic).await {
            error!(error = %err, topic, "bus subscribe failed");
            failed.push(json!({"topic": topic, "error": "INTERNAL_ERROR"}));
            continue;
        }
        let filters = parse_filters(data, topic);
        match state.registry.subscribe(connection_id, topic, filters).await {
            Ok(()) => subscribed.push(topic.to_string()),
            Err(_) => failed.push(json!({"topic": topic, "error": "SUBSCRIPTION_FAILED"})),
        }
    }

    json!({
        "action": "subscribe_response",
        "subscribed_topics": subscribed,
        "failed_topics": failed,
        "success": failed.is_empty(),
    })
}

async fn handle_unsubscribe(state: &StreamingState, connection_id: &str, data: &Value) -> Value {
    let topics = data
        .get("topics")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut unsubscribed = Vec::new();
    let mut failed = Vec::new();
    for topic in topics.iter().filter_map(Value::as_str) {
        match state.registry.unsubscribe(connection_id, topic).await {
            Ok(()) => unsubscribed.push(topic.to_string()),
            Err(_) => failed.push(json!({"topic": topic, "error": "UNSUBSCRIBE_FAILED"})),
        }
    }

    json!({
        "action": "unsubscribe_response",
        "unsubscribed_topics": unsubscribed,
        "failed_topics": failed,
        "success": failed.is_empty(),
    })
}

async fn handle_list_topics(state: &StreamingState, connection_id: &str) -> Value {
    let Some(entry) = state.registry.get(connection_id).await else {
        return json!({
            "error": "CONNECTION_NOT_FOUND",
            "message": "Connection not found",
        });
    };
    json!({
        "action": "topics_list",
        "subscribed_topics": entry.subscribed_topics(),
        "available_topics": state.topics.names(),
    })
}

async fn handle_get_stats(state: &StreamingState, connection_id: &str) -> Value {
    let Some(entry) = state.registry.get(connection_id).await else {
        return json!({
            "error": "CONNECTION_NOT_FOUND",
            "message": "Connection not found",
        });
    };
    json!({
        "action": "stats_response",
        "connection_stats": state.registry.stats().await,
        "connection_info": {
            "connection_id": entry.id,
            "user_id": entry.user_id,
            "tenant_id": entry.tenant_id,
            "subscribed_topics": entry.subscribed_topics(),
            "created_at": entry.created_at.to_rfc3339(),
            "dropped_messages": entry.dropped.load(std::sync::atomic::Ordering::Relaxed),
        },
    })
}
