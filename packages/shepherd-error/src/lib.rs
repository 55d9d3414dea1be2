use thiserror::Error;

/// Errors surfaced by the shepherd service.
///
/// Decode and dispatch failures are logged and dropped per record by the
/// gateway; spawn and broker-send failures bubble up to the handler that
/// requested them; config failures are fatal at startup.
#[derive(Debug, Error)]
pub enum ShepherdError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("no such agent: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("failed to spawn agent process `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },

    #[error("broker send failed on topic `{topic}`: {message}")]
    BrokerSend { topic: String, message: String },

    #[error("broker poll failed: {message}")]
    BrokerPoll { message: String },

    #[error("failed to decode message on topic `{topic}`: {message}")]
    Decode { topic: String, message: String },

    #[error("failed to encode message: {message}")]
    Encode { message: String },

    #[error("invalid configuration `{path}`: {message}")]
    Config { path: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ShepherdError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn encode(error: impl std::fmt::Display) -> Self {
        Self::Encode {
            message: error.to_string(),
        }
    }

    pub fn decode(topic: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Decode {
            topic: topic.into(),
            message: error.to_string(),
        }
    }

    pub fn config(path: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Config {
            path: path.into(),
            message: error.to_string(),
        }
    }
}
