use crate::session::{Event, EventKind, SessionStatus};
use crate::shared::ids::SessionId;
use crate::shared::logging::append_engine_log;
use crate::spawn::is_process_alive;
use crate::store::{KenPaths, SessionFilter, SessionPatch, Store, StoreError};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session {id} is {status}; {operation} requires {required}")]
    WrongState {
        id: String,
        status: SessionStatus,
        operation: &'static str,
        required: &'static str,
    },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Waking sessions reverted to pending (their agent, if any, is orphaned).
    pub reverted: Vec<SessionId>,
    /// Active sessions without a live agent, failed with a synthetic result.
    pub lost: Vec<SessionId>,
}

/// Engine-restart recovery: `waking` reverts to `pending` with a recover
/// marker; `active` without a live agent process becomes `failed`.
pub fn startup_sweep(
    store: &mut Store,
    paths: &KenPaths,
    now: i64,
) -> Result<SweepReport, StoreError> {
    let mut report = SweepReport::default();

    let waking = store.query(&SessionFilter {
        status: Some(SessionStatus::Waking),
        ..Default::default()
    })?;
    for session in waking {
        store.transaction(|tx| -> Result<(), StoreError> {
            tx.update_session(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Pending),
                    recovering: Some(true),
                    agent_pid: Some(None),
                    ..Default::default()
                },
                now,
            )?;
            tx.append_event(&Event {
                id: 0,
                ts: now,
                session_id: Some(session.id.clone()),
                kind: EventKind::Warning,
                data: Some("engine restart: waking session reverted to pending".to_string()),
            })?;
            Ok(())
        })?;
        append_engine_log(
            paths,
            "warn",
            "recovery.reverted",
            &format!("session={} waking -> pending", session.id),
        );
        report.reverted.push(session.id);
    }

    let active = store.query(&SessionFilter {
        status: Some(SessionStatus::Active),
        ..Default::default()
    })?;
    for session in active {
        if session.agent_pid.is_some_and(is_process_alive) {
            continue;
        }
        let synthetic = "engine restart: agent process lost; recover to resume from the last \
                         checkpoint"
            .to_string();
        store.transaction(|tx| -> Result<(), StoreError> {
            tx.update_session(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Failed),
                    result: Some(Some(synthetic.clone())),
                    agent_pid: Some(None),
                    ..Default::default()
                },
                now,
            )?;
            tx.append_event(&Event {
                id: 0,
                ts: now,
                session_id: Some(session.id.clone()),
                kind: EventKind::Failed,
                data: Some(synthetic.clone()),
            })?;
            Ok(())
        })?;
        append_engine_log(
            paths,
            "warn",
            "recovery.agent_lost",
            &format!("session={} active without live agent", session.id),
        );
        report.lost.push(session.id);
    }

    Ok(report)
}

/// Operator `recover`: re-queue a failed session. The next wake composes
/// with the last checkpoint and a `recover` mode header.
pub fn recover_session(
    store: &mut Store,
    paths: &KenPaths,
    id: &SessionId,
    now: i64,
) -> Result<(), RecoveryError> {
    store.transaction(|tx| {
        let session = tx.get_session(id)?;
        if session.status != SessionStatus::Failed {
            return Err(RecoveryError::WrongState {
                id: id.to_string(),
                status: session.status,
                operation: "recover",
                required: "failed",
            });
        }
        tx.update_session(
            id,
            SessionPatch {
                status: Some(SessionStatus::Pending),
                result: Some(None),
                recovering: Some(true),
                ..Default::default()
            },
            now,
        )?;
        tx.append_event(&Event {
            id: 0,
            ts: now,
            session_id: Some(id.clone()),
            kind: EventKind::Wake,
            data: Some(json!({ "refs": [] }).to_string()),
        })?;
        Ok(())
    })?;
    append_engine_log(
        paths,
        "info",
        "recovery.recover",
        &format!("session={id} failed -> pending"),
    );
    Ok(())
}

/// Operator `abandon`: mark a live session failed with a synthesised result.
pub fn abandon_session(
    store: &mut Store,
    paths: &KenPaths,
    id: &SessionId,
    reason: &str,
    now: i64,
) -> Result<(), RecoveryError> {
    let synthetic = format!("abandoned by operator: {reason}");
    store.transaction(|tx| {
        let session = tx.get_session(id)?;
        if session.status.is_terminal() {
            return Err(RecoveryError::WrongState {
                id: id.to_string(),
                status: session.status,
                operation: "abandon",
                required: "a non-terminal session",
            });
        }
        tx.update_session(
            id,
            SessionPatch {
                status: Some(SessionStatus::Failed),
                result: Some(Some(synthetic.clone())),
                agent_pid: Some(None),
                ..Default::default()
            },
            now,
        )?;
        tx.append_event(&Event {
            id: 0,
            ts: now,
            session_id: Some(id.clone()),
            kind: EventKind::Failed,
            data: Some(synthetic.clone()),
        })?;
        Ok(())
    })?;
    append_engine_log(
        paths,
        "warn",
        "recovery.abandon",
        &format!("session={id} reason={reason}"),
    );
    Ok(())
}
