use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use shepherd_error::ShepherdError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TERMINATION_TIMEOUT_SECS: u64 = 30;

/// Service configuration, loaded from a single JSON file. Every field has a
/// default so a minimal deployment can run from an empty object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShepherdConfig {
    pub host: String,
    pub port: u16,
    pub kafka: KafkaConfig,
    pub launch: LaunchConfig,
    /// Directory of static assets served under `/public`.
    pub public_dir: Option<PathBuf>,
    /// Bounded wait for an agent to exit cleanly before it is force-killed.
    pub termination_timeout_secs: u64,
}

impl Default for ShepherdConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            kafka: KafkaConfig::default(),
            launch: LaunchConfig::default(),
            public_dir: None,
            termination_timeout_secs: DEFAULT_TERMINATION_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Broker address, handed to spawned agents so they can reach the bus.
    pub host: String,
    pub group_id: String,
    pub topics: TopicConfig,
    /// Topics the shepherd's own consumer subscribes to.
    pub subscribe: Vec<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        let topics = TopicConfig::default();
        let subscribe = vec![
            topics.shepherd_receive.clone(),
            topics.environment_state.clone(),
        ];
        Self {
            host: "127.0.0.1:9092".to_string(),
            group_id: "shepherd".to_string(),
            topics,
            subscribe,
        }
    }
}

/// Canonical topic names. Config keys stay snake_case; the wire names are
/// the hyphenated strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub shepherd_receive: String,
    pub agent_receive: String,
    pub cell_receive: String,
    pub environment_receive: String,
    pub environment_state: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            shepherd_receive: "shepherd-receive".to_string(),
            agent_receive: "agent-receive".to_string(),
            cell_receive: "cell-receive".to_string(),
            environment_receive: "environment-receive".to_string(),
            environment_state: "environment-state".to_string(),
        }
    }
}

/// How agent child processes are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Working directory for spawned agents.
    pub dir: PathBuf,
    /// Module booted when the agent config names none.
    pub boot: String,
    /// Invocation prefix for module-style boot entries.
    pub boot_prefix: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            boot: "lens.environment.boot".to_string(),
            boot_prefix: vec!["python".to_string(), "-u".to_string(), "-m".to_string()],
        }
    }
}

impl ShepherdConfig {
    /// Load the config file; any failure here is fatal at startup.
    pub fn load(path: &Path) -> Result<Self, ShepherdError> {
        let text = fs::read_to_string(path)
            .map_err(|err| ShepherdError::config(path.display().to_string(), err))?;
        serde_json::from_str(&text)
            .map_err(|err| ShepherdError::config(path.display().to_string(), err))
    }

    /// The `kafka_config` injected into every spawned agent's config so the
    /// child can address the bus without separate configuration.
    pub fn child_kafka_config(&self) -> Value {
        json!({
            "host": self.kafka.host,
            "topics": self.kafka.topics,
            "subscribe": [],
        })
    }
}
