use crate::compose::{compose_prompt, DependencyResult};
use crate::config::Settings;
use crate::session::{Event, EventKind, Session, SessionStatus};
use crate::shared::ids::SessionId;
use crate::shared::logging::append_engine_log;
use crate::spawn::{is_process_alive, spawn_agent, SpawnedAgent};
use crate::store::{KenPaths, SessionFilter, SessionPatch, Store, StoreError};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("daemon already running with pid {pid}")]
    AlreadyRunning { pid: u32 },
    #[error("failed to write daemon lock {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// What one scheduler pass did, for logging and the `process` command.
#[derive(Debug, Default)]
pub struct IterationOutcome {
    /// Active sessions whose agent died without a terminal request.
    pub reaped: Vec<SessionId>,
    /// Sleeping sessions whose trigger fired.
    pub woken: Vec<SessionId>,
    /// The session an agent was launched for, if any.
    pub spawned: Option<SessionId>,
    /// Process handle for the launched agent; the daemon keeps it to reap
    /// the exit, one-shot callers drop it.
    pub agent: Option<SpawnedAgent>,
}

/// Depth of a session in the workflow tree (root = 0), measured by walking
/// the parent chain over a snapshot. Broken chains stop counting rather than
/// loop: referential problems are diagnose's job.
fn session_depth(snapshot: &BTreeMap<SessionId, Session>, id: &SessionId) -> usize {
    let mut depth = 0;
    let mut current = id.clone();
    while let Some(parent) = snapshot.get(&current).and_then(|s| s.parent_id.clone()) {
        depth += 1;
        if depth > snapshot.len() {
            break;
        }
        current = parent;
    }
    depth
}

/// Wake priority: deeper-in-tree first so leaves finish and parents can
/// wake; ties broken by oldest `updated_at`, then lexicographic id.
pub fn wake_order(
    snapshot: &BTreeMap<SessionId, Session>,
    pending: &mut Vec<Session>,
) {
    pending.sort_by(|a, b| {
        let depth_a = session_depth(snapshot, &a.id);
        let depth_b = session_depth(snapshot, &b.id);
        depth_b
            .cmp(&depth_a)
            .then(a.updated_at.cmp(&b.updated_at))
            .then(a.id.cmp(&b.id))
    });
}

fn snapshot(store: &Store) -> Result<BTreeMap<SessionId, Session>, StoreError> {
    Ok(store
        .all_sessions()?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect())
}

/// Run one scheduler iteration: reap dead agents, fire satisfied triggers,
/// then launch the highest-priority pending session the concurrency budget
/// allows.
pub fn run_iteration(
    store: &mut Store,
    paths: &KenPaths,
    settings: &Settings,
    now: i64,
) -> Result<IterationOutcome, SchedulerError> {
    let mut outcome = IterationOutcome::default();

    outcome.reaped = reap_dead_agents(store, paths, now)?;
    outcome.woken = fire_triggers(store, paths, now)?;

    let sessions = snapshot(store)?;
    let mut pending = store.query(&SessionFilter {
        status: Some(SessionStatus::Pending),
        ..Default::default()
    })?;
    if pending.is_empty() {
        return Ok(outcome);
    }
    wake_order(&sessions, &mut pending);

    if store.count_in_flight()? >= settings.max_active {
        append_engine_log(
            paths,
            "info",
            "scheduler.budget",
            &format!(
                "budget saturated (max_active={}), {} pending wait",
                settings.max_active,
                pending.len()
            ),
        );
        return Ok(outcome);
    }

    let next = pending.remove(0);
    let (spawned_id, agent) = launch_session(store, paths, settings, &next, now)?;
    outcome.spawned = spawned_id;
    outcome.agent = agent;
    Ok(outcome)
}

/// Active sessions whose recorded agent process is gone crashed without a
/// terminal request; fail them with a synthetic result.
fn reap_dead_agents(
    store: &mut Store,
    paths: &KenPaths,
    now: i64,
) -> Result<Vec<SessionId>, SchedulerError> {
    let active = store.query(&SessionFilter {
        status: Some(SessionStatus::Active),
        ..Default::default()
    })?;

    let mut reaped = Vec::new();
    for session in active {
        let alive = session.agent_pid.is_some_and(is_process_alive);
        if alive {
            continue;
        }
        let synthetic = match session.agent_pid {
            Some(pid) => format!("agent process {pid} exited without a terminal request"),
            None => "agent process was lost (no pid recorded)".to_string(),
        };
        let applied: Result<bool, StoreError> = store.transaction(|tx| {
            // The agent may have raced a terminal request in; re-check.
            let current = tx.get_session(&session.id)?;
            if current.status != SessionStatus::Active {
                return Ok(false);
            }
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
            Ok(true)
        });
        if applied? {
            append_engine_log(
                paths,
                "warn",
                "scheduler.agent_lost",
                &format!("session={} {synthetic}", session.id),
            );
            reaped.push(session.id);
        }
    }
    Ok(reaped)
}

/// Evaluate every sleeping session's trigger against one snapshot and move
/// the fired ones to pending. Each wake is its own transaction with a
/// trigger_satisfied and a wake event; the wake event records the ids the
/// trigger referenced so the composer can assemble Dependency Results later.
fn fire_triggers(
    store: &mut Store,
    paths: &KenPaths,
    now: i64,
) -> Result<Vec<SessionId>, SchedulerError> {
    let sessions = snapshot(store)?;
    let lookup = |id: &SessionId| sessions.get(id).map(|s| s.status);

    let mut woken = Vec::new();
    for session in sessions.values() {
        if session.status != SessionStatus::Sleeping {
            continue;
        }
        let Some(trigger) = &session.trigger else {
            continue;
        };
        if !trigger.evaluate(&lookup, now) {
            continue;
        }

        let trigger_json = serde_json::to_string(trigger).map_err(StoreError::from)?;
        let refs: Vec<&SessionId> = trigger.referenced_ids();
        let wake_data = json!({ "refs": refs }).to_string();

        store.transaction(|tx| -> Result<(), StoreError> {
            tx.update_session(
                &session.id,
                SessionPatch::status(SessionStatus::Pending),
                now,
            )?;
            tx.append_event(&Event {
                id: 0,
                ts: now,
                session_id: Some(session.id.clone()),
                kind: EventKind::TriggerSatisfied,
                data: Some(trigger_json.clone()),
            })?;
            tx.append_event(&Event {
                id: 0,
                ts: now,
                session_id: Some(session.id.clone()),
                kind: EventKind::Wake,
                data: Some(wake_data.clone()),
            })?;
            Ok(())
        })?;
        append_engine_log(
            paths,
            "info",
            "scheduler.trigger_satisfied",
            &format!("session={} trigger={}", session.id, trigger.summary()),
        );
        woken.push(session.id.clone());
    }
    Ok(woken)
}

/// The ids recorded by the most recent wake event for a session, used to
/// rebuild Dependency Results even across an engine restart.
fn latest_wake_refs(store: &Store, id: &SessionId) -> Result<Vec<SessionId>, StoreError> {
    let events = store.recent_events(Some(id), 100)?;
    for event in events.iter().rev() {
        if event.kind != EventKind::Wake {
            continue;
        }
        let Some(data) = &event.data else {
            return Ok(Vec::new());
        };
        let parsed: serde_json::Value = serde_json::from_str(data)?;
        let refs = parsed
            .get("refs")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|raw| SessionId::parse(raw).ok())
                    .collect()
            })
            .unwrap_or_default();
        return Ok(refs);
    }
    Ok(Vec::new())
}

fn dependency_results(
    store: &Store,
    refs: &[SessionId],
) -> Result<Vec<DependencyResult>, StoreError> {
    let mut results = Vec::new();
    for id in refs {
        match store.get_session(id) {
            Ok(session) => results.push(DependencyResult {
                id: session.id,
                ken_path: session.ken_path,
                status: session.status,
                result: session.result,
            }),
            Err(StoreError::SessionNotFound(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(results)
}

fn launch_session(
    store: &mut Store,
    paths: &KenPaths,
    settings: &Settings,
    session: &Session,
    now: i64,
) -> Result<(Option<SessionId>, Option<SpawnedAgent>), SchedulerError> {
    let refs = latest_wake_refs(store, &session.id)?;
    let deps = dependency_results(store, &refs)?;
    let composed = compose_prompt(paths, session, &deps);
    for warning in &composed.warnings {
        store.append_event(&Event {
            id: 0,
            ts: now,
            session_id: Some(session.id.clone()),
            kind: EventKind::Warning,
            data: Some(warning.clone()),
        })?;
        append_engine_log(
            paths,
            "warn",
            "compose.warning",
            &format!("session={} {warning}", session.id),
        );
    }

    store.update_session(&session.id, SessionPatch::status(SessionStatus::Waking), now)?;

    let mode = if session.recovering { "recover" } else { "fresh" };
    match spawn_agent(paths, &settings.agent, &session.id, &composed.prompt) {
        Ok(agent) => {
            let data = json!({
                "pid": agent.pid,
                "mode": mode,
                "prompt_digest": agent.prompt_digest,
            })
            .to_string();
            store.transaction(|tx| -> Result<(), StoreError> {
                tx.update_session(
                    &session.id,
                    SessionPatch {
                        status: Some(SessionStatus::Active),
                        agent_pid: Some(Some(agent.pid)),
                        recovering: Some(false),
                        last_heartbeat: Some(now),
                        ..Default::default()
                    },
                    now,
                )?;
                tx.append_event(&Event {
                    id: 0,
                    ts: now,
                    session_id: Some(session.id.clone()),
                    kind: EventKind::AgentSpawned,
                    data: Some(data.clone()),
                })?;
                Ok(())
            })?;
            append_engine_log(
                paths,
                "info",
                "scheduler.agent_spawned",
                &format!("session={} pid={} mode={mode}", session.id, agent.pid),
            );
            Ok((Some(session.id.clone()), Some(agent)))
        }
        Err(err) => {
            let synthetic = format!("agent launch failed: {err}");
            store.transaction(|tx| -> Result<(), StoreError> {
                tx.update_session(
                    &session.id,
                    SessionPatch {
                        status: Some(SessionStatus::Failed),
                        result: Some(Some(synthetic.clone())),
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
                "error",
                "scheduler.spawn_failed",
                &format!("session={} {err}", session.id),
            );
            Ok((None, None))
        }
    }
}

// Daemon ownership: a pid lock file under .ken/daemon/ keeps the scheduler
// loop single-instance; a stop file asks a running daemon to exit.

pub fn reserve_daemon_lock(paths: &KenPaths) -> Result<(), SchedulerError> {
    let path = paths.daemon_lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SchedulerError::Lock {
            path: parent.display().to_string(),
            source,
        })?;
    }

    match try_write_lock(&path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::AlreadyExists => {
            let holder = fs::read_to_string(&path)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok());
            if let Some(pid) = holder {
                if is_process_alive(pid) {
                    return Err(SchedulerError::AlreadyRunning { pid });
                }
            }
            // Stale lock from a dead daemon; take it over.
            let _ = fs::remove_file(&path);
            try_write_lock(&path).map_err(|source| SchedulerError::Lock {
                path: path.display().to_string(),
                source,
            })
        }
        Err(source) => Err(SchedulerError::Lock {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn try_write_lock(path: &Path) -> std::io::Result<()> {
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .and_then(|mut file| file.write_all(std::process::id().to_string().as_bytes()))
}

pub fn clear_daemon_lock(paths: &KenPaths) {
    let _ = fs::remove_file(paths.daemon_lock_path());
}

pub fn signal_stop(paths: &KenPaths) -> std::io::Result<()> {
    fs::write(paths.stop_signal_path(), b"stop")
}

/// Loop `process` forever: recover orphaned state, then iterate until the
/// stop file appears. Agent children are reaped as they exit so the daemon
/// never accumulates zombies.
pub fn run_daemon(
    store: &mut Store,
    paths: &KenPaths,
    settings: &Settings,
) -> Result<(), SchedulerError> {
    reserve_daemon_lock(paths)?;
    let _ = fs::remove_file(paths.stop_signal_path());

    crate::recovery::startup_sweep(store, paths, crate::shared::time::now_secs())?;
    append_engine_log(
        paths,
        "info",
        "daemon.started",
        &format!("pid={} max_active={}", std::process::id(), settings.max_active),
    );

    let mut agents: Vec<SpawnedAgent> = Vec::new();
    let result = loop {
        if paths.stop_signal_path().exists() {
            append_engine_log(paths, "info", "daemon.stop.signal", "stop file detected");
            break Ok(());
        }

        match run_iteration(store, paths, settings, crate::shared::time::now_secs()) {
            Ok(mut outcome) => {
                if let Some(agent) = outcome.agent.take() {
                    agents.push(agent);
                }
            }
            Err(err) => {
                // A store hiccup (e.g. a busy writer) is retried next tick.
                append_engine_log(paths, "error", "daemon.iteration", &err.to_string());
            }
        }

        agents.retain_mut(|agent| match agent.child.try_wait() {
            Ok(Some(_)) | Err(_) => false,
            Ok(None) => true,
        });

        std::thread::sleep(Duration::from_secs(settings.poll_interval_seconds.max(1)));
    };

    for agent in &mut agents {
        let _ = agent.child.try_wait();
    }
    clear_daemon_lock(paths);
    let _ = fs::remove_file(paths.stop_signal_path());
    append_engine_log(paths, "info", "daemon.stopped", "scheduler loop exited");
    result
}
