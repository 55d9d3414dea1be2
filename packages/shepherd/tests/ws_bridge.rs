mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::*;
use shepherd::gateway::BrokerConsumer;
use shepherd_wire::Envelope;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(stack: &TestStack) -> WsClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let app = stack.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let (client, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connect");
    client
}

async fn send_json(client: &mut WsClient, value: Value) {
    client
        .send(WsMessage::Text(value.to_string()))
        .await
        .expect("send websocket message");
}

async fn next_json(client: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a websocket message")
            .expect("websocket stream ended")
            .expect("websocket error");
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).expect("websocket frame is JSON");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initialize_before_any_traffic_replies_with_an_empty_snapshot() {
    let stack = start_stack().await;
    let mut client = connect(&stack).await;

    send_json(&mut client, json!({"event": "VISUALIZATION_INITIALIZE"})).await;
    assert_eq!(next_json(&mut client).await, json!({}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_topic_messages_reach_the_client_and_the_snapshot() {
    let stack = start_stack().await;
    let mut client = connect(&stack).await;

    // handshake first so the session's bus subscription is known to exist
    send_json(&mut client, json!({"event": "VISUALIZATION_INITIALIZE"})).await;
    assert_eq!(next_json(&mut client).await, json!({}));

    publish(
        &stack,
        "environment-state",
        json!({"event": "CELL_DECLARE", "agent_id": "cell-1", "volume": 1.2}),
    )
    .await;

    let frame = next_json(&mut client).await;
    assert_eq!(frame["environment-state"]["event"], json!("CELL_DECLARE"));
    assert_eq!(frame["environment-state"]["agent_id"], json!("cell-1"));

    // a late initialization now sees the cached message
    send_json(&mut client, json!({"event": "INITIALIZE"})).await;
    let snapshot = next_json(&mut client).await;
    assert_eq!(
        snapshot["environment-state"]["agent_id"],
        json!("cell-1")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_reply_is_scoped_to_the_event_topic() {
    let stack = start_stack().await;

    // control-plane traffic lands in the cache under shepherd-receive first
    publish(&stack, "shepherd-receive", json!({"event": "PAUSE_ALL"})).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stack.state.cache.get("shepherd-receive").is_none() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "control message never reached the cache"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut client = connect(&stack).await;

    // nothing on the event topic yet, so the reply is empty, not the
    // control-plane traffic
    send_json(&mut client, json!({"event": "VISUALIZATION_INITIALIZE"})).await;
    assert_eq!(next_json(&mut client).await, json!({}));

    publish(
        &stack,
        "environment-state",
        json!({"event": "CELL_DECLARE", "agent_id": "cell-7"}),
    )
    .await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["environment-state"]["agent_id"], json!("cell-7"));

    send_json(&mut client, json!({"event": "INITIALIZE"})).await;
    let snapshot = next_json(&mut client).await;
    let entries = snapshot.as_object().expect("snapshot is an object");
    assert_eq!(entries.len(), 1);
    assert_eq!(snapshot["environment-state"]["agent_id"], json!("cell-7"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn divide_cell_is_forwarded_to_the_cell_topic() {
    let stack = start_stack().await;
    let mut cell_rx = stack.broker.consumer(["cell-receive"]);
    let mut client = connect(&stack).await;

    send_json(
        &mut client,
        json!({"event": "DIVIDE_CELL", "agent_id": "cell-1"}),
    )
    .await;

    let batch = tokio::time::timeout(Duration::from_secs(5), cell_rx.poll())
        .await
        .expect("timed out waiting on cell-receive")
        .expect("poll");
    let envelope = Envelope::decode(&batch[0].payload).expect("decode");
    assert_eq!(envelope.event(), Some("DIVIDE_CELL"));
    assert_eq!(envelope.str_field("agent_id"), Some("cell-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn other_client_messages_are_forwarded_to_the_control_topic() {
    let stack = start_stack().await;
    let mut control_rx = stack.broker.consumer(["shepherd-receive"]);
    let mut client = connect(&stack).await;

    send_json(&mut client, json!({"event": "TRIGGER_ALL"})).await;

    let batch = tokio::time::timeout(Duration::from_secs(5), control_rx.poll())
        .await
        .expect("timed out waiting on shepherd-receive")
        .expect("poll");
    let envelope = Envelope::decode(&batch[0].payload).expect("decode");
    assert_eq!(envelope.event(), Some("TRIGGER_ALL"));
}
