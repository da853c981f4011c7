mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;
use streaming::bus::BusMessage;
use streaming::registry::{RegistryError, Transport};
use streaming::ws::handle_message;
use support::{fabric, seed_market_data_rule, FabricOptions};

fn bus_message(topic: &str, payload: serde_json::Value) -> BusMessage {
    BusMessage {
        topic: topic.to_string(),
        partition: 0,
        offset: 42,
        key: None,
        payload,
        timestamp: Some(1_700_000_000_000),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn destroyed_connection_leaves_every_index() {
    let state = fabric(FabricOptions::default()).await;
    let (entry, _rx) = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();
    let id = entry.id.clone();
    state
        .registry
        .subscribe(&id, "pricing.updates.v1", Default::default())
        .await
        .unwrap();

    assert_eq!(state.registry.connections_for_user("u1").await, vec![id.clone()]);
    assert_eq!(
        state.registry.topic_subscribers("pricing.updates.v1").await,
        vec![id.clone()]
    );

    state.registry.remove_connection(&id).await;

    assert!(state.registry.get(&id).await.is_none());
    assert!(state.registry.connections_for_user("u1").await.is_empty());
    assert!(state.registry.connections_for_tenant("t1").await.is_empty());
    assert!(state
        .registry
        .topic_subscribers("pricing.updates.v1")
        .await
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_limit_is_enforced() {
    let state = fabric(FabricOptions {
        max_connections: 2,
        ..Default::default()
    })
    .await;
    let _a = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();
    let _b = state
        .registry
        .add_connection(Transport::Ws, "u2", "t1")
        .await
        .unwrap();
    let third = state.registry.add_connection(Transport::Ws, "u3", "t1").await;
    assert!(matches!(third, Err(RegistryError::ConnectionLimit(2))));
}

#[tokio::test(flavor = "multi_thread")]
async fn fanout_delivers_envelopes_in_order() {
    let state = fabric(FabricOptions::default()).await;
    let (entry, mut rx) = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();
    state
        .registry
        .subscribe(&entry.id, "pricing.updates.v1", Default::default())
        .await
        .unwrap();

    for price in [52.5, 52.6, 52.7] {
        state
            .consumer
            .dispatch(bus_message(
                "pricing.updates.v1",
                json!({"instrument": "BRN", "price": price}),
            ))
            .await;
    }

    for expected in [52.5, 52.6, 52.7] {
        let envelope = rx.recv().await.expect("frame");
        assert_eq!(envelope["topic"], "pricing.updates.v1");
        assert_eq!(envelope["data"]["instrument"], "BRN");
        assert_eq!(envelope["data"]["price"], expected);
        assert_eq!(envelope["partition"], 0);
        assert_eq!(envelope["offset"], 42);
        assert!(envelope["timestamp"].is_i64());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn filters_gate_delivery() {
    let state = fabric(FabricOptions::default()).await;
    let (entry, mut rx) = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();
    let filters = serde_json::from_value(json!({"instrument": "BRN"})).unwrap();
    state
        .registry
        .subscribe(&entry.id, "pricing.updates.v1", filters)
        .await
        .unwrap();

    state
        .consumer
        .dispatch(bus_message(
            "pricing.updates.v1",
            json!({"instrument": "WTI", "price": 48.0}),
        ))
        .await;
    let sent = state
        .consumer
        .dispatch(bus_message(
            "pricing.updates.v1",
            json!({"instrument": "BRN", "price": 52.5}),
        ))
        .await;
    assert_eq!(sent, 1);

    let envelope = rx.recv().await.expect("frame");
    assert_eq!(envelope["data"]["instrument"], "BRN");
    assert!(rx.try_recv().is_err(), "filtered frame must not arrive");
}

#[tokio::test(flavor = "multi_thread")]
async fn overflow_drops_for_that_subscriber_only() {
    let state = fabric(FabricOptions {
        queue_capacity: 2,
        ..Default::default()
    })
    .await;
    let (slow, _slow_rx) = state
        .registry
        .add_connection(Transport::Ws, "slow", "t1")
        .await
        .unwrap();
    let (fast, mut fast_rx) = state
        .registry
        .add_connection(Transport::Ws, "fast", "t1")
        .await
        .unwrap();
    for id in [&slow.id, &fast.id] {
        state
            .registry
            .subscribe(id, "pricing.updates.v1", Default::default())
            .await
            .unwrap();
    }

    // The slow consumer never drains; its queue holds 2 and then drops. The
    // fast consumer drains as messages arrive and never loses one.
    for i in 0..5 {
        state
            .consumer
            .dispatch(bus_message("pricing.updates.v1", json!({"seq": i})))
            .await;
        let envelope = fast_rx.recv().await.unwrap();
        assert_eq!(envelope["data"]["seq"], i);
    }

    assert_eq!(slow.dropped.load(Ordering::Relaxed), 3);
    assert_eq!(fast.dropped.load(Ordering::Relaxed), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn sweeper_removes_stale_connections() {
    let state = fabric(FabricOptions {
        heartbeat_timeout: Duration::from_millis(50),
        ..Default::default()
    })
    .await;
    let (entry, _rx) = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();
    let id = entry.id.clone();

    tokio::time::sleep(Duration::from_millis(80)).await;
    let swept = state.registry.sweep_stale().await;
    assert_eq!(swept, 1);
    assert!(state.registry.get(&id).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_keeps_connections_alive() {
    let state = fabric(FabricOptions {
        heartbeat_timeout: Duration::from_millis(100),
        ..Default::default()
    })
    .await;
    let (entry, _rx) = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = handle_message(&state, &entry.id, r#"{"action":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(response["action"], "pong");
        assert!(response["timestamp"].is_i64());
    }
    assert_eq!(state.registry.sweep_stale().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_protocol_round_trip() {
    let state = fabric(FabricOptions::default()).await;
    seed_market_data_rule(&state, "t1").await;
    let (entry, _rx) = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();

    let request = json!({
        "action": "subscribe",
        "data": {
            "topics": ["pricing.updates.v1", "nope.topic"],
            "filters": {"pricing.updates.v1": {"instrument": "BRN"}},
        },
    });
    let response = handle_message(&state, &entry.id, &request.to_string())
        .await
        .unwrap();
    assert_eq!(response["action"], "subscribe_response");
    assert_eq!(response["subscribed_topics"], json!(["pricing.updates.v1"]));
    assert_eq!(response["failed_topics"][0]["topic"], "nope.topic");
    assert_eq!(response["failed_topics"][0]["error"], "UNKNOWN_TOPIC");
    assert_eq!(response["success"], false);

    // The bus consumer lazily subscribed exactly once.
    assert_eq!(
        state.consumer.subscribed_topics().await,
        vec!["pricing.updates.v1".to_string()]
    );

    let unsubscribe = json!({
        "action": "unsubscribe",
        "data": {"topics": ["pricing.updates.v1"]},
    });
    let response = handle_message(&state, &entry.id, &unsubscribe.to_string())
        .await
        .unwrap();
    assert_eq!(response["action"], "unsubscribe_response");
    assert_eq!(response["unsubscribed_topics"], json!(["pricing.updates.v1"]));
    assert!(state
        .registry
        .topic_subscribers("pricing.updates.v1")
        .await
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_without_entitlement_fails_per_topic() {
    let state = fabric(FabricOptions::default()).await;
    // No rules seeded: the engine's default is deny.
    let (entry, _rx) = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();

    let request = json!({
        "action": "subscribe",
        "data": {"topics": ["pricing.updates.v1"]},
    });
    let response = handle_message(&state, &entry.id, &request.to_string())
        .await
        .unwrap();
    assert_eq!(response["failed_topics"][0]["error"], "ENTITLEMENT_DENIED");
    assert!(response["subscribed_topics"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_errors_answer_in_band() {
    let state = fabric(FabricOptions::default()).await;
    let (entry, _rx) = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();

    let invalid = handle_message(&state, &entry.id, "{not json").await.unwrap();
    assert_eq!(invalid["error"], "INVALID_JSON");

    let unknown = handle_message(&state, &entry.id, r#"{"action":"dance"}"#)
        .await
        .unwrap();
    assert_eq!(unknown["error"], "UNKNOWN_ACTION");
    assert!(unknown["available_actions"]
        .as_array()
        .unwrap()
        .contains(&json!("subscribe")));

    let missing_action = handle_message(&state, &entry.id, r#"{"data":{}}"#)
        .await
        .unwrap();
    assert_eq!(missing_action["error"], "INVALID_FORMAT");
}

#[tokio::test(flavor = "multi_thread")]
async fn list_topics_and_stats_report_connection_state() {
    let state = fabric(FabricOptions::default()).await;
    seed_market_data_rule(&state, "t1").await;
    let (entry, _rx) = state
        .registry
        .add_connection(Transport::Ws, "u1", "t1")
        .await
        .unwrap();
    let subscribe = json!({
        "action": "subscribe",
        "data": {"topics": ["pricing.updates.v1"]},
    });
    handle_message(&state, &entry.id, &subscribe.to_string()).await;

    let topics = handle_message(&state, &entry.id, r#"{"action":"list_topics"}"#)
        .await
        .unwrap();
    assert_eq!(topics["action"], "topics_list");
    assert_eq!(topics["subscribed_topics"], json!(["pricing.updates.v1"]));
    assert!(topics["available_topics"]
        .as_array()
        .unwrap()
        .contains(&json!("market.data.v1")));

    let stats = handle_message(&state, &entry.id, r#"{"action":"get_stats"}"#)
        .await
        .unwrap();
    assert_eq!(stats["action"], "stats_response");
    assert_eq!(stats["connection_stats"]["total_connections"], 1);
    assert_eq!(stats["connection_info"]["connection_id"], entry.id.as_str());
}
