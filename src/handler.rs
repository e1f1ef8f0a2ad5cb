use crate::protocol::{AgentRequest, AgentResponse, ChildSpec};
use crate::session::{Event, EventKind, Session, SessionStatus};
use crate::shared::ids::SessionId;
use crate::store::{SessionPatch, Store, StoreError, StoreTx};
use crate::trigger::resolve_trigger_value;
use serde_json::{json, Value};

/// Parse one line of agent JSON and execute it. Protocol errors (malformed
/// JSON, unknown type, missing fields) are reported in the response; nothing
/// is mutated.
pub fn handle_request_line(store: &mut Store, raw: &str, now: i64) -> AgentResponse {
    let request: AgentRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(err) => {
            // Distinguish "unknown request type" for the protocol contract.
            if let Ok(value) = serde_json::from_str::<Value>(raw) {
                let known = ["complete", "fail", "sleep", "spawn_and_sleep", "checkpoint"];
                if let Some(kind) = value.get("type").and_then(Value::as_str) {
                    if !known.contains(&kind) {
                        return AgentResponse::failure("unknown request type");
                    }
                }
            }
            return AgentResponse::failure(format!("malformed request: {err}"));
        }
    };
    handle_request(store, request, now)
}

/// Execute a validated request. Guard violations and store failures come
/// back as `{ok:false}`; each verb runs as one store transaction, so a
/// failure mutates nothing.
pub fn handle_request(store: &mut Store, request: AgentRequest, now: i64) -> AgentResponse {
    let outcome = match request {
        AgentRequest::Complete { session_id, result } => {
            finish_session(store, &session_id, SessionStatus::Complete, result, now)
        }
        AgentRequest::Fail { session_id, reason } => {
            finish_session(store, &session_id, SessionStatus::Failed, reason, now)
        }
        AgentRequest::Sleep {
            session_id,
            trigger,
            checkpoint,
        } => sleep_session(store, &session_id, &trigger, checkpoint, now),
        AgentRequest::SpawnAndSleep {
            session_id,
            children,
            trigger,
            checkpoint,
        } => spawn_and_sleep(store, &session_id, &children, &trigger, checkpoint, now),
        AgentRequest::Checkpoint {
            session_id,
            checkpoint,
        } => save_checkpoint(store, &session_id, checkpoint, now),
    };

    match outcome {
        Ok(data) => AgentResponse::success(data),
        Err(HandlerError::Rejected(message)) => AgentResponse::failure(message),
        Err(HandlerError::Store(err)) => AgentResponse::failure(err.to_string()),
    }
}

#[derive(Debug)]
enum HandlerError {
    /// Guard or validation failure; the request was never eligible.
    Rejected(String),
    Store(StoreError),
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(id) => {
                HandlerError::Rejected(format!("session not found: {id}"))
            }
            other => HandlerError::Store(other),
        }
    }
}

fn require_active(tx: &StoreTx<'_>, id: &SessionId) -> Result<Session, HandlerError> {
    let session = tx.get_session(id)?;
    if session.status != SessionStatus::Active {
        return Err(HandlerError::Rejected(format!(
            "session {id} is not active (status: {})",
            session.status
        )));
    }
    Ok(session)
}

fn finish_session(
    store: &mut Store,
    id: &SessionId,
    status: SessionStatus,
    result: String,
    now: i64,
) -> Result<Option<Value>, HandlerError> {
    store.transaction(|tx| {
        require_active(tx, id)?;
        tx.update_session(
            id,
            SessionPatch {
                status: Some(status),
                result: Some(Some(result.clone())),
                last_heartbeat: Some(now),
                agent_pid: Some(None),
                ..Default::default()
            },
            now,
        )?;
        let kind = if status == SessionStatus::Complete {
            EventKind::Complete
        } else {
            EventKind::Failed
        };
        tx.append_event(&Event {
            id: 0,
            ts: now,
            session_id: Some(id.clone()),
            kind,
            data: Some(result.clone()),
        })?;
        Ok(None)
    })
}

fn sleep_session(
    store: &mut Store,
    id: &SessionId,
    trigger_value: &Value,
    checkpoint: String,
    now: i64,
) -> Result<Option<Value>, HandlerError> {
    let trigger =
        resolve_trigger_value(trigger_value, now, &[]).map_err(HandlerError::Rejected)?;
    let stored = serde_json::to_string(&trigger).map_err(StoreError::from)?;

    store.transaction(|tx| {
        require_active(tx, id)?;
        for referenced in trigger.referenced_ids() {
            if tx.session_status(referenced)?.is_none() {
                return Err(HandlerError::Rejected(format!(
                    "trigger references unknown session {referenced}"
                )));
            }
        }
        tx.update_session(
            id,
            SessionPatch {
                status: Some(SessionStatus::Sleeping),
                trigger: Some(Some(trigger.clone())),
                checkpoint: Some(checkpoint.clone()),
                last_heartbeat: Some(now),
                agent_pid: Some(None),
                ..Default::default()
            },
            now,
        )?;
        tx.append_event(&Event {
            id: 0,
            ts: now,
            session_id: Some(id.clone()),
            kind: EventKind::Sleep,
            data: Some(stored.clone()),
        })?;
        Ok(None)
    })
}

fn spawn_and_sleep(
    store: &mut Store,
    id: &SessionId,
    children: &[ChildSpec],
    trigger_value: &Value,
    checkpoint: String,
    now: i64,
) -> Result<Option<Value>, HandlerError> {
    if children.is_empty() {
        return Err(HandlerError::Rejected(
            "spawn_and_sleep requires at least one child".to_string(),
        ));
    }

    // Ids are minted by the engine; duplicates within one spawn cannot occur.
    let child_sessions: Vec<Session> = children
        .iter()
        .map(|spec| {
            let mut child = Session::new(spec.ken.clone(), &spec.task, Some(id.clone()), now);
            child.done_when = spec.done_when.clone();
            child
        })
        .collect();
    let child_ids: Vec<SessionId> = child_sessions.iter().map(|c| c.id.clone()).collect();

    let trigger = resolve_trigger_value(trigger_value, now, &child_ids)
        .map_err(HandlerError::Rejected)?;
    let stored_trigger = serde_json::to_string(&trigger).map_err(StoreError::from)?;
    let child_ids_json = serde_json::to_string(&child_ids).map_err(StoreError::from)?;

    store.transaction(|tx| {
        require_active(tx, id)?;

        for referenced in trigger.referenced_ids() {
            let is_new_child = child_ids.iter().any(|c| c == referenced);
            if !is_new_child && tx.session_status(referenced)?.is_none() {
                return Err(HandlerError::Rejected(format!(
                    "trigger references unknown session {referenced}"
                )));
            }
        }

        tx.append_event(&Event {
            id: 0,
            ts: now,
            session_id: Some(id.clone()),
            kind: EventKind::Spawn,
            data: Some(child_ids_json.clone()),
        })?;
        for child in &child_sessions {
            tx.insert_session(child)?;
            tx.append_event(&Event {
                id: 0,
                ts: now,
                session_id: Some(child.id.clone()),
                kind: EventKind::SessionCreated,
                data: Some(child.ken_path.to_string()),
            })?;
        }
        tx.update_session(
            id,
            SessionPatch {
                status: Some(SessionStatus::Sleeping),
                trigger: Some(Some(trigger.clone())),
                checkpoint: Some(checkpoint.clone()),
                last_heartbeat: Some(now),
                agent_pid: Some(None),
                ..Default::default()
            },
            now,
        )?;
        tx.append_event(&Event {
            id: 0,
            ts: now,
            session_id: Some(id.clone()),
            kind: EventKind::Sleep,
            data: Some(stored_trigger.clone()),
        })?;
        Ok(Some(json!({ "children": child_ids })))
    })
}

fn save_checkpoint(
    store: &mut Store,
    id: &SessionId,
    checkpoint: String,
    now: i64,
) -> Result<Option<Value>, HandlerError> {
    store.transaction(|tx| {
        require_active(tx, id)?;
        tx.update_session(
            id,
            SessionPatch {
                checkpoint: Some(checkpoint.clone()),
                last_heartbeat: Some(now),
                ..Default::default()
            },
            now,
        )?;
        tx.append_event(&Event {
            id: 0,
            ts: now,
            session_id: Some(id.clone()),
            kind: EventKind::Checkpoint,
            data: None,
        })?;
        Ok(None)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::KenPath;
    use crate::trigger::Trigger;
    use tempfile::tempdir;

    fn open_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = Store::create(&dir.path().join("store.db")).expect("create");
        (store, dir)
    }

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).expect("id")
    }

    fn active_session(store: &mut Store, raw_id: &str) {
        let mut session = Session::with_id(
            id(raw_id),
            KenPath::parse("test/ken").expect("ken"),
            "task",
            None,
            100,
        );
        session.status = SessionStatus::Active;
        store.create_session(&session).expect("create");
    }

    #[test]
    fn complete_sets_result_and_logs_event() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"complete","session_id":"s1","result":"R"}"#,
            200,
        );
        assert!(response.ok, "error: {:?}", response.error);

        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Complete);
        assert_eq!(session.result.as_deref(), Some("R"));

        let events = store.recent_events(Some(&id("s1")), 10).expect("events");
        assert!(events.iter().any(|e| e.kind == EventKind::Complete));
    }

    #[test]
    fn fail_sets_reason_as_result() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"fail","session_id":"s1","reason":"boom"}"#,
            200,
        );
        assert!(response.ok);

        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.result.as_deref(), Some("boom"));
    }

    #[test]
    fn requests_from_non_active_sessions_are_rejected() {
        let (mut store, _dir) = open_store();
        let session = Session::with_id(
            id("s1"),
            KenPath::parse("test/ken").expect("ken"),
            "task",
            None,
            100,
        );
        store.create_session(&session).expect("create");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"complete","session_id":"s1","result":"R"}"#,
            200,
        );
        assert!(!response.ok);
        assert!(response.error.expect("error").contains("not active"));

        let unchanged = store.get_session(&id("s1")).expect("get");
        assert_eq!(unchanged.status, SessionStatus::Pending);
    }

    #[test]
    fn terminal_sessions_reject_further_requests() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");
        handle_request_line(
            &mut store,
            r#"{"type":"complete","session_id":"s1","result":"R"}"#,
            200,
        );

        let again = handle_request_line(
            &mut store,
            r#"{"type":"fail","session_id":"s1","reason":"late"}"#,
            201,
        );
        assert!(!again.ok);
        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Complete);
        assert_eq!(session.result.as_deref(), Some("R"));
    }

    #[test]
    fn sleep_persists_trigger_and_checkpoint() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"sleep","session_id":"s1","trigger":{"timeout_seconds":60},"checkpoint":"wait"}"#,
            1000,
        );
        assert!(response.ok, "error: {:?}", response.error);

        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Sleeping);
        assert_eq!(session.trigger, Some(Trigger::TimeoutAt(1060)));
        assert_eq!(session.checkpoint.as_deref(), Some("wait"));
    }

    #[test]
    fn sleep_with_past_timeout_is_stored_not_short_circuited() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"sleep","session_id":"s1","trigger":{"timeout_seconds":0},"checkpoint":"c"}"#,
            1000,
        );
        assert!(response.ok);
        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Sleeping);
        assert_eq!(session.trigger, Some(Trigger::TimeoutAt(1000)));
    }

    #[test]
    fn sleep_rejects_unknown_references_without_mutation() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"sleep","session_id":"s1","trigger":{"all_complete":["ghost"]},"checkpoint":"c"}"#,
            1000,
        );
        assert!(!response.ok);
        assert!(response.error.expect("error").contains("ghost"));

        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.checkpoint.is_none());
    }

    #[test]
    fn sleep_rejects_empty_trigger() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"sleep","session_id":"s1","trigger":{"all_complete":[]},"checkpoint":"c"}"#,
            1000,
        );
        assert!(!response.ok);
    }

    #[test]
    fn spawn_and_sleep_creates_children_atomically() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"spawn_and_sleep","session_id":"s1",
                "children":[{"ken":"core/a","task":"ta"},{"ken":"core/b","task":"tb"}],
                "trigger":{"all_complete":"__CHILDREN__"},
                "checkpoint":"cp"}"#,
            500,
        );
        assert!(response.ok, "error: {:?}", response.error);
        let data = response.data.expect("data");
        let returned: Vec<String> =
            serde_json::from_value(data["children"].clone()).expect("children");
        assert_eq!(returned.len(), 2);

        let parent = store.get_session(&id("s1")).expect("get");
        assert_eq!(parent.status, SessionStatus::Sleeping);
        assert_eq!(parent.checkpoint.as_deref(), Some("cp"));
        match parent.trigger.expect("trigger") {
            Trigger::AllComplete(ids) => {
                let raw: Vec<&str> = ids.iter().map(|i| i.as_str()).collect();
                assert_eq!(raw, returned.iter().map(String::as_str).collect::<Vec<_>>());
            }
            other => panic!("wrong trigger: {other:?}"),
        }

        let children = store.children_of(&id("s1")).expect("children");
        assert_eq!(children.len(), 2);
        for child in &children {
            assert_eq!(child.status, SessionStatus::Pending);
            assert_eq!(child.parent_id.as_ref().map(|p| p.as_str()), Some("s1"));
        }

        let events = store.recent_events(None, 20).expect("events");
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::Spawn));
        assert!(kinds.contains(&EventKind::Sleep));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::SessionCreated)
                .count(),
            3 // parent + two children
        );
    }

    #[test]
    fn spawn_and_sleep_rejects_empty_children() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"spawn_and_sleep","session_id":"s1","children":[],
                "trigger":{"all_complete":"__CHILDREN__"},"checkpoint":"cp"}"#,
            500,
        );
        assert!(!response.ok);
        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn spawn_and_sleep_mixes_children_with_known_ids() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");
        active_session(&mut store, "peer");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"spawn_and_sleep","session_id":"s1",
                "children":[{"ken":"core/a","task":"t"}],
                "trigger":{"any_complete":["peer","__CHILDREN__"]},
                "checkpoint":"cp"}"#,
            500,
        );
        assert!(response.ok, "error: {:?}", response.error);

        let parent = store.get_session(&id("s1")).expect("get");
        match parent.trigger.expect("trigger") {
            Trigger::AnyComplete(ids) => {
                assert_eq!(ids.len(), 2);
                assert_eq!(ids[0].as_str(), "peer");
            }
            other => panic!("wrong trigger: {other:?}"),
        }
    }

    #[test]
    fn spawn_and_sleep_rejects_unknown_reference_and_rolls_back_children() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"spawn_and_sleep","session_id":"s1",
                "children":[{"ken":"core/a","task":"t"}],
                "trigger":{"all_complete":["ghost","__CHILDREN__"]},
                "checkpoint":"cp"}"#,
            500,
        );
        assert!(!response.ok);

        // nothing committed: no children, parent untouched, no spawn event
        assert!(store.children_of(&id("s1")).expect("children").is_empty());
        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Active);
        let events = store.recent_events(None, 20).expect("events");
        assert!(events.iter().all(|e| e.kind != EventKind::Spawn));
    }

    #[test]
    fn checkpoint_keeps_session_active() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let response = handle_request_line(
            &mut store,
            r#"{"type":"checkpoint","session_id":"s1","checkpoint":"midway"}"#,
            300,
        );
        assert!(response.ok);

        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.checkpoint.as_deref(), Some("midway"));
        assert_eq!(session.last_heartbeat, Some(300));
    }

    #[test]
    fn malformed_json_and_unknown_types_are_protocol_errors() {
        let (mut store, _dir) = open_store();
        active_session(&mut store, "s1");

        let garbled = handle_request_line(&mut store, "{not json", 100);
        assert!(!garbled.ok);
        assert!(garbled.error.expect("error").contains("malformed"));

        let unknown = handle_request_line(
            &mut store,
            r#"{"type":"pause","session_id":"s1"}"#,
            100,
        );
        assert!(!unknown.ok);
        assert_eq!(unknown.error.as_deref(), Some("unknown request type"));

        let missing_field = handle_request_line(
            &mut store,
            r#"{"type":"complete","session_id":"s1"}"#,
            100,
        );
        assert!(!missing_field.ok);

        let session = store.get_session(&id("s1")).expect("get");
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn unknown_session_is_rejected() {
        let (mut store, _dir) = open_store();
        let response = handle_request_line(
            &mut store,
            r#"{"type":"complete","session_id":"ghost","result":"R"}"#,
            100,
        );
        assert!(!response.ok);
        assert!(response.error.expect("error").contains("not found"));
    }
}
