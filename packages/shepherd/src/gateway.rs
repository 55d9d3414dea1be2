use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use shepherd_error::ShepherdError;
use shepherd_wire::Envelope;

use crate::bus::EventBus;
use crate::supervisor::AgentSupervisor;

/// Bounded queue per consumer subscription; producers block when it fills.
const SUBSCRIPTION_DEPTH: usize = 1024;

/// One message delivered by the broker.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Topic-keyed publisher onto the message broker.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Enqueue an encoded message on a topic. Errors surface to the caller.
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), ShepherdError>;
}

/// Subscribed consumer side of the message broker.
///
/// `poll` long-polls: it blocks until at least one record is available and
/// returns the batch that is ready. Implementations retry transient broker
/// failures internally; a returned error is fatal and stops the gateway.
#[async_trait]
pub trait BrokerConsumer: Send {
    async fn poll(&mut self) -> Result<Vec<BrokerRecord>, ShepherdError>;
}

type TopicSenders = HashMap<String, Vec<mpsc::Sender<BrokerRecord>>>;

/// In-process broker: topic-keyed fan-out over bounded channels.
///
/// This is the implementation used by tests and single-process deployments;
/// an external broker client plugs in behind the same producer/consumer
/// traits.
#[derive(Debug, Clone, Default)]
pub struct ChannelBroker {
    topics: Arc<Mutex<TopicSenders>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(&self) -> ChannelProducer {
        ChannelProducer {
            topics: self.topics.clone(),
        }
    }

    /// Create a consumer subscribed to the given topics.
    pub fn consumer<I, S>(&self, topics: I) -> ChannelConsumer
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let mut registry = self.topics.lock().expect("broker lock poisoned");
        for topic in topics {
            registry
                .entry(topic.as_ref().to_string())
                .or_default()
                .push(tx.clone());
        }
        ChannelConsumer { rx }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelProducer {
    topics: Arc<Mutex<TopicSenders>>,
}

#[async_trait]
impl BrokerProducer for ChannelProducer {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), ShepherdError> {
        let senders: Vec<mpsc::Sender<BrokerRecord>> = {
            let registry = self.topics.lock().expect("broker lock poisoned");
            registry.get(topic).cloned().unwrap_or_default()
        };
        let mut stale = false;
        for sender in &senders {
            let record = BrokerRecord {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if sender.send(record).await.is_err() {
                stale = true;
            }
        }
        if stale {
            let mut registry = self.topics.lock().expect("broker lock poisoned");
            if let Some(list) = registry.get_mut(topic) {
                list.retain(|sender| !sender.is_closed());
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ChannelConsumer {
    rx: mpsc::Receiver<BrokerRecord>,
}

#[async_trait]
impl BrokerConsumer for ChannelConsumer {
    async fn poll(&mut self) -> Result<Vec<BrokerRecord>, ShepherdError> {
        let first = self.rx.recv().await.ok_or_else(|| ShepherdError::BrokerPoll {
            message: "broker channel closed".to_string(),
        })?;
        let mut batch = vec![first];
        while let Ok(record) = self.rx.try_recv() {
            batch.push(record);
        }
        Ok(batch)
    }
}

/// Most recent blob-stripped message per topic, used to answer late-joining
/// websocket clients asking for an initial snapshot.
#[derive(Debug, Default)]
pub struct LastMessageCache {
    inner: Mutex<HashMap<String, Map<String, Value>>>,
}

impl LastMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, topic: &str, header: Map<String, Value>) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.insert(topic.to_string(), header);
    }

    pub fn get(&self, topic: &str) -> Option<Map<String, Value>> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner.get(topic).cloned()
    }

    /// The full `{topic: last envelope}` map.
    pub fn snapshot(&self) -> Map<String, Value> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .iter()
            .map(|(topic, header)| (topic.clone(), Value::Object(header.clone())))
            .collect()
    }
}

/// Routes each decoded broker message: agent-supervisor handling, then the
/// last-message cache, then fan-out on the event bus. A failure in any step
/// is logged by the poll loop and the remaining records are unaffected.
pub struct Dispatcher {
    supervisor: Arc<AgentSupervisor>,
    bus: Arc<EventBus>,
    cache: Arc<LastMessageCache>,
}

impl Dispatcher {
    pub fn new(
        supervisor: Arc<AgentSupervisor>,
        bus: Arc<EventBus>,
        cache: Arc<LastMessageCache>,
    ) -> Self {
        Self {
            supervisor,
            bus,
            cache,
        }
    }

    pub async fn dispatch(&self, topic: &str, envelope: Envelope) -> Result<(), ShepherdError> {
        // Strip blobs before caching and fan-out so the snapshot does not
        // retain large buffers.
        let header = envelope.header.clone();
        self.supervisor.handle(topic, envelope).await?;
        let payload =
            serde_json::to_string(&header).map_err(ShepherdError::encode)?;
        self.cache.update(topic, header);
        self.bus.publish(topic, payload);
        Ok(())
    }
}

/// Run the consumer poll loop as an owned background task. The task ends
/// only on a fatal broker error; the caller ties its completion to service
/// shutdown.
pub fn spawn_poll_loop<C>(mut consumer: C, dispatcher: Arc<Dispatcher>) -> JoinHandle<()>
where
    C: BrokerConsumer + 'static,
{
    tokio::spawn(async move {
        loop {
            let records = match consumer.poll().await {
                Ok(records) => records,
                Err(err) => {
                    tracing::error!(error = %err, "broker poll failed, stopping gateway");
                    break;
                }
            };
            for record in records {
                let envelope = match Envelope::decode(&record.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(
                            topic = %record.topic,
                            error = %err,
                            "dropping undecodable record"
                        );
                        continue;
                    }
                };
                if let Err(err) = dispatcher.dispatch(&record.topic, envelope).await {
                    tracing::error!(
                        topic = %record.topic,
                        error = %err,
                        "message handler failed"
                    );
                }
            }
        }
    })
}
