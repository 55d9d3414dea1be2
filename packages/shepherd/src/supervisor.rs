use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;

use shepherd_error::ShepherdError;
use shepherd_wire::Envelope;

use crate::config::{LaunchConfig, ShepherdConfig, TopicConfig};
use crate::gateway::BrokerProducer;
use crate::process::{ChildHandle, SpawnSpec};

pub const TRIGGER_AGENT: &str = "TRIGGER_AGENT";
pub const PAUSE_AGENT: &str = "PAUSE_AGENT";
pub const SHUTDOWN_AGENT: &str = "SHUTDOWN_AGENT";

/// Control verbs handled on the shepherd-receive topic. Anything else is
/// logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlEvent {
    AddAgent,
    RemoveAgent,
    TriggerAll,
    PauseAll,
    ShutdownAll,
}

impl ControlEvent {
    fn parse(verb: &str) -> Option<Self> {
        match verb {
            "ADD_AGENT" => Some(Self::AddAgent),
            "REMOVE_AGENT" => Some(Self::RemoveAgent),
            "TRIGGER_ALL" => Some(Self::TriggerAll),
            "PAUSE_ALL" => Some(Self::PauseAll),
            "SHUTDOWN_ALL" => Some(Self::ShutdownAll),
            _ => None,
        }
    }
}

/// One supervised agent: its identity, the config handed to the child, the
/// live process handle, and the blob spill files the child was pointed at.
#[derive(Debug)]
struct AgentRecord {
    agent_id: String,
    agent_type: String,
    agent_config: Value,
    handle: ChildHandle,
    /// Held so the files outlive the record and are deleted with it.
    #[allow(dead_code)]
    spill_files: Vec<NamedTempFile>,
}

/// Projection of a record for the `/status` route; `alive` is queried from
/// the process at response time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub agent_type: String,
    pub agent_config: Value,
    pub alive: bool,
}

/// Supervises the flock: translates control messages into process spawns,
/// terminations, and per-agent command broadcasts.
pub struct AgentSupervisor {
    topics: TopicConfig,
    launch: LaunchConfig,
    child_kafka: Value,
    termination_timeout: Duration,
    producer: Arc<dyn BrokerProducer>,
    registry: RwLock<HashMap<String, AgentRecord>>,
}

impl AgentSupervisor {
    pub fn new(config: &ShepherdConfig, producer: Arc<dyn BrokerProducer>) -> Self {
        Self {
            topics: config.kafka.topics.clone(),
            launch: config.launch.clone(),
            child_kafka: config.child_kafka_config(),
            termination_timeout: Duration::from_secs(config.termination_timeout_secs),
            producer,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Route one decoded broker message. Only the shepherd-receive topic
    /// carries control messages; everything else passes through untouched.
    pub async fn handle(&self, topic: &str, envelope: Envelope) -> Result<(), ShepherdError> {
        if topic != self.topics.shepherd_receive {
            return Ok(());
        }
        let Some(verb) = envelope.event().map(str::to_string) else {
            tracing::warn!("control message without an event verb");
            return Ok(());
        };
        match ControlEvent::parse(&verb) {
            Some(ControlEvent::AddAgent) => self.add_agent(envelope).await,
            Some(ControlEvent::RemoveAgent) => {
                if let Some(prefix) = envelope.str_field("prefix") {
                    let prefix = prefix.to_string();
                    self.remove_by_prefix(&prefix).await;
                    Ok(())
                } else if let Some(agent_id) = envelope.str_field("agent_id") {
                    let agent_id = agent_id.to_string();
                    self.remove_agent(&agent_id).await
                } else {
                    Err(ShepherdError::invalid_request(
                        "REMOVE_AGENT needs agent_id or prefix",
                    ))
                }
            }
            Some(ControlEvent::TriggerAll) => self.broadcast(TRIGGER_AGENT).await,
            Some(ControlEvent::PauseAll) => self.broadcast(PAUSE_AGENT).await,
            Some(ControlEvent::ShutdownAll) => self.broadcast(SHUTDOWN_AGENT).await,
            None => {
                tracing::warn!(event = %verb, "ignoring unknown control event");
                Ok(())
            }
        }
    }

    async fn add_agent(&self, envelope: Envelope) -> Result<(), ShepherdError> {
        let agent_id = envelope
            .str_field("agent_id")
            .ok_or_else(|| ShepherdError::invalid_request("ADD_AGENT needs agent_id"))?
            .to_string();
        let agent_type = envelope
            .str_field("agent_type")
            .ok_or_else(|| ShepherdError::invalid_request("ADD_AGENT needs agent_type"))?
            .to_string();
        let mut agent_config = match envelope.header.get("agent_config") {
            Some(Value::Object(map)) => map.clone(),
            None => Map::new(),
            Some(_) => {
                return Err(ShepherdError::invalid_request(
                    "agent_config must be an object",
                ))
            }
        };

        // The child addresses the bus with the shepherd's own broker config.
        if !agent_config.contains_key("kafka_config") {
            agent_config.insert("kafka_config".to_string(), self.child_kafka.clone());
        }

        let mut spill_files = Vec::new();
        if !envelope.blobs.is_empty() {
            let mut files = Vec::new();
            for blob in &envelope.blobs {
                let mut file = NamedTempFile::new()?;
                file.write_all(blob)?;
                file.flush()?;
                files.push(Value::String(file.path().display().to_string()));
                spill_files.push(file);
            }
            agent_config.insert("files".to_string(), Value::Array(files));
        }

        let argv = compose_argv(&self.launch, &agent_config, &agent_id, &agent_type)?;
        tracing::info!(
            agent_id = %agent_id,
            agent_type = %agent_type,
            command = ?argv,
            "adding agent"
        );
        let handle = ChildHandle::spawn(SpawnSpec {
            argv,
            dir: Some(self.launch.dir.clone()),
            env: HashMap::new(),
            clear_env: false,
        })?;
        handle.tee_output(&agent_id);

        let record = AgentRecord {
            agent_id: agent_id.clone(),
            agent_type,
            agent_config: Value::Object(agent_config),
            handle,
            spill_files,
        };
        let mut registry = self.registry.write().await;
        if registry.insert(agent_id.clone(), record).is_some() {
            tracing::warn!(agent_id = %agent_id, "replaced an existing agent record");
        }
        Ok(())
    }

    /// Ask the agent to shut down, wait out the termination timeout, kill it
    /// if it is still alive, and drop the record.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<(), ShepherdError> {
        let handle = {
            let registry = self.registry.read().await;
            let record = registry
                .get(agent_id)
                .ok_or_else(|| ShepherdError::AgentNotFound {
                    agent_id: agent_id.to_string(),
                })?;
            record.handle.clone()
        };

        if let Err(err) = self.send_agent_event(SHUTDOWN_AGENT, agent_id).await {
            tracing::warn!(
                agent_id = %agent_id,
                error = %err,
                "failed to publish shutdown notice"
            );
        }
        handle.terminate(self.termination_timeout).await;

        self.registry.write().await.remove(agent_id);
        tracing::info!(agent_id = %agent_id, "agent removed");
        Ok(())
    }

    /// Remove every agent whose id starts with `prefix`. The id snapshot is
    /// taken up front; per-agent failures do not abort the batch.
    pub async fn remove_by_prefix(&self, prefix: &str) {
        let matching: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .keys()
                .filter(|id| id.starts_with(prefix))
                .cloned()
                .collect()
        };
        tracing::info!(prefix = %prefix, count = matching.len(), "removing agents by prefix");
        for agent_id in matching {
            if let Err(err) = self.remove_agent(&agent_id).await {
                tracing::warn!(
                    agent_id = %agent_id,
                    error = %err,
                    "prefix removal failed for agent"
                );
            }
        }
    }

    async fn broadcast(&self, verb: &str) -> Result<(), ShepherdError> {
        let ids: Vec<String> = self.registry.read().await.keys().cloned().collect();
        tracing::info!(event = %verb, count = ids.len(), "broadcasting to all agents");
        for agent_id in ids {
            self.send_agent_event(verb, &agent_id).await?;
        }
        Ok(())
    }

    async fn send_agent_event(&self, verb: &str, agent_id: &str) -> Result<(), ShepherdError> {
        let mut header = Map::new();
        header.insert("event".to_string(), Value::String(verb.to_string()));
        header.insert("agent_id".to_string(), Value::String(agent_id.to_string()));
        let payload = Envelope::new(header)
            .encode()
            .map_err(ShepherdError::encode)?;
        self.producer
            .send(&self.topics.agent_receive, payload)
            .await
    }

    pub async fn status(&self) -> Vec<AgentStatus> {
        let records: Vec<(String, String, Value, ChildHandle)> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .map(|record| {
                    (
                        record.agent_id.clone(),
                        record.agent_type.clone(),
                        record.agent_config.clone(),
                        record.handle.clone(),
                    )
                })
                .collect()
        };
        let mut statuses = Vec::with_capacity(records.len());
        for (agent_id, agent_type, agent_config, handle) in records {
            statuses.push(AgentStatus {
                agent_id,
                agent_type,
                agent_config,
                alive: handle.alive().await,
            });
        }
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        statuses
    }
}

/// Compose the child command line. A string `boot` entry names a module run
/// through the configured interpreter prefix; a list is used literally; with
/// neither, the launch map's default module is booted.
fn compose_argv(
    launch: &LaunchConfig,
    agent_config: &Map<String, Value>,
    agent_id: &str,
    agent_type: &str,
) -> Result<Vec<String>, ShepherdError> {
    let mut argv = match agent_config.get("boot") {
        Some(Value::String(module)) => {
            let mut argv = launch.boot_prefix.clone();
            argv.push(module.clone());
            argv
        }
        Some(Value::Array(words)) => {
            let mut argv = Vec::with_capacity(words.len());
            for word in words {
                match word.as_str() {
                    Some(word) => argv.push(word.to_string()),
                    None => {
                        return Err(ShepherdError::invalid_request(
                            "boot command must be a list of strings",
                        ))
                    }
                }
            }
            argv
        }
        None => {
            let mut argv = launch.boot_prefix.clone();
            argv.push(launch.boot.clone());
            argv
        }
        Some(_) => {
            return Err(ShepherdError::invalid_request(
                "boot must be a string or a list",
            ))
        }
    };

    let config_json = serde_json::to_string(agent_config).map_err(ShepherdError::encode)?;
    argv.extend([
        "--id".to_string(),
        agent_id.to_string(),
        "--type".to_string(),
        agent_type.to_string(),
        "--config".to_string(),
        config_json,
    ]);
    Ok(argv)
}
