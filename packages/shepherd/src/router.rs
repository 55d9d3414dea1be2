use std::path::Path;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use shepherd_error::ShepherdError;
use shepherd_wire::Envelope;

use crate::bus::EventBus;
use crate::config::TopicConfig;
use crate::gateway::{BrokerProducer, LastMessageCache};
use crate::supervisor::{AgentStatus, AgentSupervisor};

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Queued outbound frames per session before the bus subscription lags.
const OUTBOUND_DEPTH: usize = 64;

pub struct AppState {
    pub supervisor: Arc<AgentSupervisor>,
    pub bus: Arc<EventBus>,
    pub cache: Arc<LastMessageCache>,
    pub producer: Arc<dyn BrokerProducer>,
    pub topics: TopicConfig,
}

pub fn build_router(state: Arc<AppState>, public_dir: Option<&Path>) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_connect))
        .route("/status", get(get_status))
        .with_state(state);
    if let Some(dir) = public_dir {
        router = router.nest_service("/public", ServeDir::new(dir));
    }
    router.layer(TraceLayer::new_for_http())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<Vec<AgentStatus>> {
    Json(state.supervisor.status().await)
}

async fn ws_connect(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| handle_session(socket, state))
            .into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "application/text")],
            "must connect using websocket request",
        )
            .into_response(),
    }
}

/// One browser session: the event topic's bus subscription streams out to
/// the socket, and inbound client messages are routed back onto the broker.
async fn handle_session(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let event_topic = state.topics.environment_state.clone();
    let mut bus_rx = state.bus.subscribe(&event_topic);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_DEPTH);

    tracing::info!(topic = %event_topic, "websocket session opened");

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let bridge_tx = out_tx.clone();
    let bridge_topic = event_topic.clone();
    let bridge = tokio::spawn(async move {
        loop {
            match bus_rx.recv().await {
                Ok(payload) => {
                    let envelope: Value = match serde_json::from_str(&payload) {
                        Ok(envelope) => envelope,
                        Err(_) => continue,
                    };
                    let mut wrapper = Map::new();
                    wrapper.insert(bridge_topic.clone(), envelope);
                    let message = Value::Object(wrapper).to_string();
                    if bridge_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "websocket session lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Err(err) = handle_client_message(&state, &out_tx, &text).await {
                    tracing::warn!(error = %err, "websocket client message failed");
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    bridge.abort();
    drop(out_tx);
    let _ = writer.await;
    tracing::info!("websocket session closed");
}

/// Route one inbound client message: initialization requests are answered
/// from the last-message cache, cell division goes to the cell topic, and
/// everything else is forwarded to the shepherd's own control topic.
async fn handle_client_message(
    state: &AppState,
    out_tx: &mpsc::Sender<String>,
    text: &str,
) -> Result<(), ShepherdError> {
    let header: Map<String, Value> = serde_json::from_str(text)
        .map_err(|err| ShepherdError::invalid_request(format!("client sent invalid JSON: {err}")))?;
    let event = header
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    match event.as_str() {
        "INITIALIZE" | "VISUALIZATION_INITIALIZE" => {
            // the reply carries only the bridged event topic, in the same
            // {topic: envelope} shape as every other outbound frame
            let event_topic = &state.topics.environment_state;
            let mut snapshot = Map::new();
            if let Some(cached) = state.cache.get(event_topic) {
                snapshot.insert(event_topic.clone(), Value::Object(cached));
            }
            let reply = Value::Object(snapshot).to_string();
            if out_tx.send(reply).await.is_err() {
                tracing::debug!("session closed before the snapshot reply was sent");
            }
            Ok(())
        }
        "DIVIDE_CELL" => forward(state, &state.topics.cell_receive, header).await,
        _ => forward(state, &state.topics.shepherd_receive, header).await,
    }
}

async fn forward(
    state: &AppState,
    topic: &str,
    header: Map<String, Value>,
) -> Result<(), ShepherdError> {
    let payload = Envelope::new(header)
        .encode()
        .map_err(ShepherdError::encode)?;
    state.producer.send(topic, payload).await
}
