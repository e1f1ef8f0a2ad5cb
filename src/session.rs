use crate::shared::ids::{KenPath, SessionId};
use crate::trigger::Trigger;
use serde::{Deserialize, Serialize};

/// Where a session sits in its lifecycle. Transitions are restricted to the
/// edges in [`SessionStatus::can_transition_to`]; `Complete` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Waking,
    Active,
    Sleeping,
    Complete,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waking => "waking",
            Self::Active => "active",
            Self::Sleeping => "sleeping",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "pending" => Ok(Self::Pending),
            "waking" => Ok(Self::Waking),
            "active" => Ok(Self::Active),
            "sleeping" => Ok(Self::Sleeping),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session status `{other}`")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// The session state machine. Any live state may fail (agent crash or
    /// operator abandon); terminal states never move.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self == next {
            return false;
        }
        match (self, next) {
            (Self::Pending, Self::Waking) => true,
            (Self::Waking, Self::Active) => true,
            // Engine restart reverts an orphaned wake.
            (Self::Waking, Self::Pending) => true,
            (Self::Active, Self::Complete) => true,
            (Self::Active, Self::Failed) => true,
            (Self::Active, Self::Sleeping) => true,
            (Self::Sleeping, Self::Pending) => true,
            // Operator recover re-enters the queue from failed.
            (Self::Failed, Self::Pending) => true,
            (Self::Pending | Self::Waking | Self::Sleeping, Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured completion criteria, delivered verbatim to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneWhen {
    pub description: String,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
}

/// One instance of work on one kenning with one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub ken_path: KenPath,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_when: Option<DoneWhen>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_pid: Option<u32>,
    #[serde(default)]
    pub recovering: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
}

impl Session {
    /// A fresh pending session with a minted id.
    pub fn new(ken_path: KenPath, task: &str, parent_id: Option<SessionId>, now: i64) -> Self {
        Self::with_id(SessionId::mint(), ken_path, task, parent_id, now)
    }

    pub fn with_id(
        id: SessionId,
        ken_path: KenPath,
        task: &str,
        parent_id: Option<SessionId>,
        now: i64,
    ) -> Self {
        Session {
            id,
            ken_path,
            task: task.to_string(),
            done_when: None,
            status: SessionStatus::Pending,
            parent_id,
            trigger: None,
            checkpoint: None,
            result: None,
            agent_pid: None,
            recovering: false,
            created_at: now,
            updated_at: now,
            last_heartbeat: None,
        }
    }
}

/// Closed set of audit event kinds. Exhaustive matches keep every consumer
/// honest when a kind is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionCreated,
    AgentSpawned,
    Checkpoint,
    Spawn,
    Sleep,
    Wake,
    Complete,
    Failed,
    TriggerSatisfied,
    Warning,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::AgentSpawned => "agent_spawned",
            Self::Checkpoint => "checkpoint",
            Self::Spawn => "spawn",
            Self::Sleep => "sleep",
            Self::Wake => "wake",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::TriggerSatisfied => "trigger_satisfied",
            Self::Warning => "warning",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "session_created" => Ok(Self::SessionCreated),
            "agent_spawned" => Ok(Self::AgentSpawned),
            "checkpoint" => Ok(Self::Checkpoint),
            "spawn" => Ok(Self::Spawn),
            "sleep" => Ok(Self::Sleep),
            "wake" => Ok(Self::Wake),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "trigger_satisfied" => Ok(Self::TriggerSatisfied),
            "warning" => Ok(Self::Warning),
            other => Err(format!("unknown event kind `{other}`")),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only audit record. `id` is assigned by the store on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: i64,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, session_id: Option<&SessionId>, data: Option<String>) -> Self {
        Event {
            id: 0,
            ts: crate::shared::time::now_secs(),
            session_id: session_id.cloned(),
            kind,
            data,
        }
    }
}
