//! Commands sent to workers and their replies.

use serde::{Deserialize, Serialize};

use sourcegrid_state::{ConnectorDefinition, WorkerInstanceStatus};

/// Everything a worker needs to (re)start an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartPayload {
    pub definition: ConnectorDefinition,
    pub config_version: u64,
    pub config_digest: String,
}

impl StartPayload {
    pub fn for_definition(definition: &ConnectorDefinition) -> Self {
        Self {
            definition: definition.clone(),
            config_version: definition.version,
            config_digest: definition.config_digest(),
        }
    }
}

/// A command addressed to the worker owning one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Command {
    Start(StartPayload),
    Stop,
    Restart(StartPayload),
    FetchStatus,
}

/// The verb of a command, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Start,
    Stop,
    Restart,
    FetchStatus,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Restart => "restart",
            Verb::FetchStatus => "status",
        }
    }

    /// Stop and status can be repeated without side effects.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Verb::Stop | Verb::FetchStatus)
    }
}

impl Command {
    pub fn verb(&self) -> Verb {
        match self {
            Command::Start(_) => Verb::Start,
            Command::Stop => Verb::Stop,
            Command::Restart(_) => Verb::Restart,
            Command::FetchStatus => Verb::FetchStatus,
        }
    }
}

/// A worker's answer: the instance status after the command.
pub type CommandReply = WorkerInstanceStatus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stop_and_status_are_idempotent() {
        assert!(Verb::Stop.is_idempotent());
        assert!(Verb::FetchStatus.is_idempotent());
        assert!(!Verb::Start.is_idempotent());
        assert!(!Verb::Restart.is_idempotent());
    }

    #[test]
    fn command_tagged_by_verb() {
        let json = serde_json::to_value(Command::Stop).unwrap();
        assert_eq!(json["verb"], "stop");
        assert_eq!(Command::FetchStatus.verb().as_str(), "status");
    }
}
