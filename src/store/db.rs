use crate::session::{Event, EventKind, Session, SessionStatus};
use crate::shared::ids::{KenPath, SessionId};
use crate::trigger::Trigger;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    ken_path TEXT NOT NULL,
    task TEXT NOT NULL,
    done_when TEXT,
    status TEXT NOT NULL,
    parent_id TEXT REFERENCES sessions(id),
    trigger TEXT,
    checkpoint TEXT,
    result TEXT,
    agent_pid INTEGER,
    recovering INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_heartbeat INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id);
CREATE INDEX IF NOT EXISTS idx_sessions_ken_path ON sessions(ken_path);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    session_id TEXT,
    kind TEXT NOT NULL,
    data TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("store statement failed: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("failed to encode stored value: {source}")]
    Encode {
        #[from]
        source: serde_json::Error,
    },
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session id collision: {0}")]
    DuplicateSession(String),
    #[error("unknown parent session: {0}")]
    UnknownParent(String),
    #[error("illegal transition for session {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("store state violates an invariant: {0}")]
    Corrupt(String),
}

/// Partial update applied by [`update_session`]. `None` leaves a field
/// untouched; the nullable columns use a double Option so a patch can
/// distinguish "leave" from "clear".
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub trigger: Option<Option<Trigger>>,
    pub checkpoint: Option<String>,
    pub result: Option<Option<String>>,
    pub agent_pid: Option<Option<u32>>,
    pub recovering: Option<bool>,
    pub last_heartbeat: Option<i64>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        SessionPatch {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Filter for [`Store::query`]; empty filter returns every session.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub parent: Option<SessionId>,
    pub ken_path: Option<KenPath>,
}

/// Durable single-machine state for sessions and the append-only event log.
/// All writes go through immediate-mode SQLite transactions so concurrent
/// `ken request` processes and the daemon serialise against each other.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )
}

impl Store {
    /// Create the database and schema. Fails if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        configure(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing database. The schema statements are idempotent, so a
    /// database from an older engine picks up missing indexes here.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::Open {
                path: path.display().to_string(),
                source: rusqlite::Error::InvalidPath(path.to_path_buf()),
            });
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        configure(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `body` atomically: every mutation made through the handle commits
    /// together, or none do. The transaction takes the write lock up front
    /// (immediate) so read-modify-write sequences inside `body` are stable.
    /// The error type only has to embed [`StoreError`], so callers can abort
    /// with their own rejection reasons and still roll back.
    pub fn transaction<T, E>(
        &mut self,
        body: impl FnOnce(&StoreTx<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let result = {
            let handle = StoreTx { conn: &tx };
            body(&handle)
        };
        match result {
            Ok(value) => {
                tx.commit().map_err(StoreError::from)?;
                Ok(value)
            }
            // Drop of `tx` rolls back.
            Err(err) => Err(err),
        }
    }

    pub fn create_session(&mut self, session: &Session) -> Result<(), StoreError> {
        self.transaction(|tx| {
            tx.insert_session(session)?;
            tx.append_event(&Event {
                id: 0,
                ts: session.created_at,
                session_id: Some(session.id.clone()),
                kind: EventKind::SessionCreated,
                data: Some(session.ken_path.to_string()),
            })?;
            Ok(())
        })
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        get_session(&self.conn, id)
    }

    pub fn update_session(
        &mut self,
        id: &SessionId,
        patch: SessionPatch,
        now: i64,
    ) -> Result<Session, StoreError> {
        self.transaction(|tx| tx.update_session(id, patch, now))
    }

    pub fn append_event(&mut self, event: &Event) -> Result<i64, StoreError> {
        self.transaction(|tx| tx.append_event(event))
    }

    pub fn query(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError> {
        let mut sql = String::from(
            "SELECT id, ken_path, task, done_when, status, parent_id, trigger, checkpoint,
                    result, agent_pid, recovering, created_at, updated_at, last_heartbeat
             FROM sessions WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(status.as_str().to_string());
        }
        if let Some(parent) = &filter.parent {
            sql.push_str(" AND parent_id = ?");
            args.push(parent.as_str().to_string());
        }
        if let Some(ken_path) = &filter.ken_path {
            sql.push_str(" AND ken_path = ?");
            args.push(ken_path.as_str().to_string());
        }
        sql.push_str(" ORDER BY created_at, id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), session_from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??);
        }
        Ok(sessions)
    }

    pub fn all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.query(&SessionFilter::default())
    }

    pub fn children_of(&self, parent: &SessionId) -> Result<Vec<Session>, StoreError> {
        self.query(&SessionFilter {
            parent: Some(parent.clone()),
            ..Default::default()
        })
    }

    pub fn count_in_flight(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE status IN ('active', 'waking')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Most recent events, newest last, optionally scoped to one session.
    pub fn recent_events(
        &self,
        session: Option<&SessionId>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let mut events = match session {
            Some(id) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, ts, session_id, kind, data FROM events
                     WHERE session_id = ? ORDER BY id DESC LIMIT ?",
                )?;
                let rows =
                    stmt.query_map(params![id.as_str(), limit as i64], event_from_row)?;
                collect_events(rows)?
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, ts, session_id, kind, data FROM events
                     ORDER BY id DESC LIMIT ?",
                )?;
                let rows = stmt.query_map(params![limit as i64], event_from_row)?;
                collect_events(rows)?
            }
        };
        events.reverse();
        Ok(events)
    }
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<Result<Event, StoreError>>>,
) -> Result<Vec<Event>, StoreError> {
    let mut events = Vec::new();
    for row in rows {
        events.push(row??);
    }
    Ok(events)
}

/// Mutation handle passed to [`Store::transaction`] bodies. Every operation
/// here participates in the enclosing transaction.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    pub fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        if let Some(parent) = &session.parent_id {
            let exists: Option<String> = self
                .conn
                .query_row(
                    "SELECT id FROM sessions WHERE id = ?1",
                    params![parent.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::UnknownParent(parent.to_string()));
            }
        }

        let done_when = session
            .done_when
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let trigger = session
            .trigger
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO sessions
                 (id, ken_path, task, done_when, status, parent_id, trigger, checkpoint,
                  result, agent_pid, recovering, created_at, updated_at, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                session.id.as_str(),
                session.ken_path.as_str(),
                session.task,
                done_when,
                session.status.as_str(),
                session.parent_id.as_ref().map(|p| p.as_str()),
                trigger,
                session.checkpoint,
                session.result,
                session.agent_pid,
                session.recovering as i64,
                session.created_at,
                session.updated_at,
                session.last_heartbeat,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateSession(session.id.to_string()));
        }
        Ok(())
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        get_session(self.conn, id)
    }

    pub fn session_status(&self, id: &SessionId) -> Result<Option<SessionStatus>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM sessions WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(value) => Ok(Some(
                SessionStatus::parse(&value).map_err(StoreError::Corrupt)?,
            )),
            None => Ok(None),
        }
    }

    /// Apply a partial update. Rejects illegal status transitions and any
    /// patch that would break the trigger/status or result/status
    /// invariants; bumps `updated_at`.
    pub fn update_session(
        &self,
        id: &SessionId,
        patch: SessionPatch,
        now: i64,
    ) -> Result<Session, StoreError> {
        let current = self.get_session(id)?;

        if let Some(next) = patch.status {
            if !current.status.can_transition_to(next) {
                return Err(StoreError::IllegalTransition {
                    id: id.to_string(),
                    from: current.status,
                    to: next,
                });
            }
        }

        let mut updated = current.clone();
        if let Some(status) = patch.status {
            updated.status = status;
        }
        if let Some(trigger) = patch.trigger {
            updated.trigger = trigger;
        } else if patch.status.is_some() && updated.status != SessionStatus::Sleeping {
            // Leaving sleep clears the trigger unless the patch says otherwise.
            updated.trigger = None;
        }
        if let Some(checkpoint) = patch.checkpoint {
            updated.checkpoint = Some(checkpoint);
        }
        if let Some(result) = patch.result {
            updated.result = result;
        }
        if let Some(agent_pid) = patch.agent_pid {
            updated.agent_pid = agent_pid;
        }
        if let Some(recovering) = patch.recovering {
            updated.recovering = recovering;
        }
        if let Some(heartbeat) = patch.last_heartbeat {
            updated.last_heartbeat = Some(heartbeat);
        }
        updated.updated_at = now;

        if updated.trigger.is_some() != (updated.status == SessionStatus::Sleeping) {
            return Err(StoreError::Corrupt(format!(
                "session {id}: trigger must be present exactly when sleeping (status {})",
                updated.status
            )));
        }
        if updated.result.is_some() != updated.status.is_terminal() {
            return Err(StoreError::Corrupt(format!(
                "session {id}: result must be present exactly when terminal (status {})",
                updated.status
            )));
        }

        let trigger = updated
            .trigger
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "UPDATE sessions SET status = ?1, trigger = ?2, checkpoint = ?3, result = ?4,
                    agent_pid = ?5, recovering = ?6, updated_at = ?7, last_heartbeat = ?8
             WHERE id = ?9",
            params![
                updated.status.as_str(),
                trigger,
                updated.checkpoint,
                updated.result,
                updated.agent_pid,
                updated.recovering as i64,
                updated.updated_at,
                updated.last_heartbeat,
                id.as_str(),
            ],
        )?;
        Ok(updated)
    }

    pub fn append_event(&self, event: &Event) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO events (ts, session_id, kind, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.ts,
                event.session_id.as_ref().map(|id| id.as_str()),
                event.kind.as_str(),
                event.data,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

fn get_session(conn: &Connection, id: &SessionId) -> Result<Session, StoreError> {
    let session = conn
        .query_row(
            "SELECT id, ken_path, task, done_when, status, parent_id, trigger, checkpoint,
                    result, agent_pid, recovering, created_at, updated_at, last_heartbeat
             FROM sessions WHERE id = ?1",
            params![id.as_str()],
            session_from_row,
        )
        .optional()?;
    match session {
        Some(session) => session,
        None => Err(StoreError::SessionNotFound(id.to_string())),
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Session, StoreError>> {
    // Decoding failures surface as StoreError::Corrupt instead of poisoning
    // the rusqlite row iterator.
    Ok(decode_session(row))
}

fn decode_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let id: String = row.get(0)?;
    let ken_path: String = row.get(1)?;
    let status: String = row.get(4)?;
    let parent_id: Option<String> = row.get(5)?;
    let done_when: Option<String> = row.get(3)?;
    let trigger: Option<String> = row.get(6)?;

    Ok(Session {
        id: SessionId::parse(&id).map_err(StoreError::Corrupt)?,
        ken_path: KenPath::parse(&ken_path).map_err(StoreError::Corrupt)?,
        task: row.get(2)?,
        done_when: done_when.as_deref().map(serde_json::from_str).transpose()?,
        status: SessionStatus::parse(&status).map_err(StoreError::Corrupt)?,
        parent_id: parent_id
            .as_deref()
            .map(SessionId::parse)
            .transpose()
            .map_err(StoreError::Corrupt)?,
        trigger: trigger.as_deref().map(serde_json::from_str).transpose()?,
        checkpoint: row.get(7)?,
        result: row.get(8)?,
        agent_pid: row.get(9)?,
        recovering: row.get::<_, i64>(10)? != 0,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        last_heartbeat: row.get(13)?,
    })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Event, StoreError>> {
    Ok(decode_event(row))
}

fn decode_event(row: &rusqlite::Row<'_>) -> Result<Event, StoreError> {
    let session_id: Option<String> = row.get(2)?;
    let kind: String = row.get(3)?;
    Ok(Event {
        id: row.get(0)?,
        ts: row.get(1)?,
        session_id: session_id
            .as_deref()
            .map(SessionId::parse)
            .transpose()
            .map_err(StoreError::Corrupt)?,
        kind: EventKind::parse(&kind).map_err(StoreError::Corrupt)?,
        data: row.get(4)?,
    })
}
