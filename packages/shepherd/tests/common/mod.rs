use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tower::util::ServiceExt;

use shepherd::bus::EventBus;
use shepherd::config::ShepherdConfig;
use shepherd::gateway::{self, ChannelBroker, ChannelProducer, Dispatcher, LastMessageCache};
use shepherd::router::{build_router, AppState};
use shepherd::supervisor::AgentSupervisor;
use shepherd_wire::Envelope;

/// A fully wired shepherd on an in-process broker.
pub struct TestStack {
    pub app: Router,
    pub state: Arc<AppState>,
    pub broker: ChannelBroker,
    pub producer: ChannelProducer,
    _poll: JoinHandle<()>,
}

pub fn fast_config() -> ShepherdConfig {
    ShepherdConfig {
        termination_timeout_secs: 0,
        ..ShepherdConfig::default()
    }
}

pub async fn start_stack() -> TestStack {
    let config = fast_config();
    let broker = ChannelBroker::new();
    let producer = broker.producer();
    let consumer = broker.consumer(&config.kafka.subscribe);

    let bus = Arc::new(EventBus::new());
    let cache = Arc::new(LastMessageCache::new());
    let supervisor = Arc::new(AgentSupervisor::new(&config, Arc::new(broker.producer())));
    let dispatcher = Arc::new(Dispatcher::new(
        supervisor.clone(),
        bus.clone(),
        cache.clone(),
    ));
    let poll = gateway::spawn_poll_loop(consumer, dispatcher);

    let state = Arc::new(AppState {
        supervisor,
        bus,
        cache,
        producer: Arc::new(broker.producer()),
        topics: config.kafka.topics.clone(),
    });
    let app = build_router(state.clone(), None);

    TestStack {
        app,
        state,
        broker,
        producer,
        _poll: poll,
    }
}

/// Encode a header as an envelope and publish it on the broker.
pub async fn publish(stack: &TestStack, topic: &str, header: Value) {
    publish_with_blobs(stack, topic, header, Vec::new()).await;
}

pub async fn publish_with_blobs(stack: &TestStack, topic: &str, header: Value, blobs: Vec<Vec<u8>>) {
    use shepherd::gateway::BrokerProducer;
    let header = match header {
        Value::Object(map) => map,
        _ => panic!("expected an object header"),
    };
    let payload = Envelope::with_blobs(header, blobs)
        .encode()
        .expect("encode envelope");
    stack
        .producer
        .send(topic, payload)
        .await
        .expect("publish to test broker");
}

pub async fn get(app: &Router, path: &str) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(path)
                .body(Body::empty())
                .expect("build request"),
        )
        .await
        .expect("send request");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

pub async fn get_json(app: &Router, path: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, path).await;
    let value = serde_json::from_str(&body).unwrap_or(Value::Null);
    (status, value)
}

/// Poll `/status` until it reports the expected number of agents.
pub async fn wait_for_agents(app: &Router, count: usize) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, value) = get_json(app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        if let Some(agents) = value.as_array() {
            if agents.len() == count {
                return agents.clone();
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} agents; last status: {value}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
