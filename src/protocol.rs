use crate::session::DoneWhen;
use crate::shared::ids::{KenPath, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Specification for one child session inside a spawn_and_sleep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    #[serde(alias = "ken_path")]
    pub ken: KenPath,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_when: Option<DoneWhen>,
}

/// A request an agent sends to the engine. One line of JSON on the wire;
/// exactly one terminal request (`complete`, `fail`, `sleep` or
/// `spawn_and_sleep`) is expected before the agent exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    Complete {
        session_id: SessionId,
        result: String,
    },
    Fail {
        session_id: SessionId,
        reason: String,
    },
    Sleep {
        session_id: SessionId,
        trigger: Value,
        checkpoint: String,
    },
    SpawnAndSleep {
        session_id: SessionId,
        children: Vec<ChildSpec>,
        trigger: Value,
        checkpoint: String,
    },
    /// Non-terminal mid-work save; the session stays active.
    Checkpoint {
        session_id: SessionId,
        checkpoint: String,
    },
}

impl AgentRequest {
    pub fn session_id(&self) -> &SessionId {
        match self {
            AgentRequest::Complete { session_id, .. }
            | AgentRequest::Fail { session_id, .. }
            | AgentRequest::Sleep { session_id, .. }
            | AgentRequest::SpawnAndSleep { session_id, .. }
            | AgentRequest::Checkpoint { session_id, .. } => session_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AgentRequest::Complete { .. } => "complete",
            AgentRequest::Fail { .. } => "fail",
            AgentRequest::Sleep { .. } => "sleep",
            AgentRequest::SpawnAndSleep { .. } => "spawn_and_sleep",
            AgentRequest::Checkpoint { .. } => "checkpoint",
        }
    }
}

/// Response envelope: `{ok:true, data?}` or `{ok:false, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn success(data: Option<Value>) -> Self {
        AgentResponse {
            ok: true,
            data,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        AgentResponse {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            "{\"ok\":false,\"error\":\"response serialization failed\"}".to_string()
        })
    }
}
