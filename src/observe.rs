use crate::config::DiagnoseThresholds;
use crate::session::{Session, SessionStatus};
use crate::shared::ids::SessionId;
use crate::shared::time::{format_rfc3339, humanize_age};
use crate::store::{Store, StoreError};
use std::collections::BTreeMap;
use std::fmt::Write as _;

fn status_marker(status: SessionStatus) -> char {
    match status {
        SessionStatus::Pending => '.',
        SessionStatus::Waking => '>',
        SessionStatus::Active => '*',
        SessionStatus::Sleeping => '~',
        SessionStatus::Complete => '+',
        SessionStatus::Failed => 'x',
    }
}

fn snapshot(store: &Store) -> Result<BTreeMap<SessionId, Session>, StoreError> {
    Ok(store
        .all_sessions()?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect())
}

/// Render the workflow tree rooted at `root`, or every root when `None`.
pub fn render_tree(
    store: &Store,
    root: Option<&SessionId>,
    now: i64,
) -> Result<String, StoreError> {
    let sessions = snapshot(store)?;
    if let Some(root) = root {
        if !sessions.contains_key(root) {
            return Err(StoreError::SessionNotFound(root.to_string()));
        }
    }

    let mut children: BTreeMap<Option<SessionId>, Vec<&Session>> = BTreeMap::new();
    for session in sessions.values() {
        children
            .entry(session.parent_id.clone())
            .or_default()
            .push(session);
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    }

    let mut out = String::new();
    match root {
        Some(root) => {
            let session = &sessions[root];
            render_subtree(&mut out, session, &children, 0, now);
        }
        None => {
            let Some(roots) = children.get(&None) else {
                return Ok("no sessions\n".to_string());
            };
            for session in roots {
                render_subtree(&mut out, session, &children, 0, now);
            }
        }
    }
    Ok(out)
}

fn render_subtree(
    out: &mut String,
    session: &Session,
    children: &BTreeMap<Option<SessionId>, Vec<&Session>>,
    depth: usize,
    now: i64,
) {
    let indent = "  ".repeat(depth);
    let mut annotations = vec![format!("age {}", humanize_age(now, session.created_at))];
    if let Some(trigger) = &session.trigger {
        annotations.push(trigger.summary());
    }
    if session.checkpoint.is_some() {
        annotations.push(format!(
            "checkpoint {}",
            humanize_age(now, session.last_heartbeat.unwrap_or(session.updated_at))
        ));
    }
    let _ = writeln!(
        out,
        "{indent}{} {} [{}] {} ({})",
        status_marker(session.status),
        session.id,
        session.status,
        session.ken_path,
        annotations.join(", "),
    );
    if let Some(kids) = children.get(&Some(session.id.clone())) {
        for child in kids {
            render_subtree(out, child, children, depth + 1, now);
        }
    }
}

/// Full detail for one session: every field verbatim plus recent events.
pub fn render_session_detail(
    store: &Store,
    id: &SessionId,
    now: i64,
) -> Result<String, StoreError> {
    let session = store.get_session(id)?;
    let mut out = String::new();
    let _ = writeln!(out, "id:         {}", session.id);
    let _ = writeln!(out, "ken:        {}", session.ken_path);
    let _ = writeln!(out, "status:     {}", session.status);
    let _ = writeln!(out, "task:       {}", session.task);
    if let Some(parent) = &session.parent_id {
        let _ = writeln!(out, "parent:     {parent}");
    }
    let _ = writeln!(out, "created:    {}", format_rfc3339(session.created_at));
    let _ = writeln!(out, "updated:    {}", format_rfc3339(session.updated_at));
    if let Some(heartbeat) = session.last_heartbeat {
        let _ = writeln!(out, "heartbeat:  {}", format_rfc3339(heartbeat));
    }
    if let Some(pid) = session.agent_pid {
        let _ = writeln!(out, "agent pid:  {pid}");
    }
    if session.recovering {
        let _ = writeln!(out, "recovering: yes");
    }
    if let Some(trigger) = &session.trigger {
        let _ = writeln!(out, "trigger:    {}", trigger.summary());
    }
    if let Some(done) = &session.done_when {
        let _ = writeln!(out, "done when:  {}", done.description);
        for criterion in &done.criteria {
            let _ = writeln!(out, "  - {criterion}");
        }
        if let Some(verify) = &done.verify {
            let _ = writeln!(out, "  verify: {verify}");
        }
    }
    if let Some(checkpoint) = &session.checkpoint {
        let _ = writeln!(out, "\ncheckpoint:\n{checkpoint}");
    }
    if let Some(result) = &session.result {
        let _ = writeln!(out, "\nresult:\n{result}");
    }

    let events = store.recent_events(Some(id), 20)?;
    if !events.is_empty() {
        let _ = writeln!(out, "\nrecent events:");
        for event in events {
            let _ = writeln!(
                out,
                "  {} {} {}",
                format_rfc3339(event.ts),
                event.kind,
                event.data.as_deref().unwrap_or(""),
            );
        }
    }
    let _ = write!(out, "\nage: {}", humanize_age(now, session.created_at));
    out.push('\n');
    Ok(out)
}

/// One entry of a blocker chain: a root cause the given session is
/// (transitively) waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocker {
    pub id: SessionId,
    pub status: SessionStatus,
    pub depth: usize,
}

/// Recursively enumerate the unsatisfied sessions behind a sleeping
/// session's trigger, leaf-first: the sessions an operator should look at
/// come before the intermediates that merely wait on them.
pub fn blocker_chain(store: &Store, id: &SessionId, now: i64) -> Result<Vec<Blocker>, StoreError> {
    let sessions = snapshot(store)?;
    if !sessions.contains_key(id) {
        return Err(StoreError::SessionNotFound(id.to_string()));
    }
    let mut chain = Vec::new();
    let mut visiting = Vec::new();
    collect_blockers(&sessions, id, now, 0, &mut visiting, &mut chain);
    Ok(chain)
}

fn collect_blockers(
    sessions: &BTreeMap<SessionId, Session>,
    id: &SessionId,
    now: i64,
    depth: usize,
    visiting: &mut Vec<SessionId>,
    chain: &mut Vec<Blocker>,
) {
    if visiting.contains(id) {
        return;
    }
    let Some(session) = sessions.get(id) else {
        return;
    };
    let Some(trigger) = &session.trigger else {
        return;
    };
    visiting.push(id.clone());
    let lookup = |wanted: &SessionId| sessions.get(wanted).map(|s| s.status);
    for blocker_id in trigger.unsatisfied_ids(&lookup, now) {
        if let Some(blocker) = sessions.get(&blocker_id) {
            // Leaf-first: descend before recording the blocker itself.
            if blocker.status == SessionStatus::Sleeping {
                collect_blockers(sessions, &blocker_id, now, depth + 1, visiting, chain);
            }
            if !chain.iter().any(|b| b.id == blocker_id) {
                chain.push(Blocker {
                    id: blocker_id,
                    status: blocker.status,
                    depth,
                });
            }
        }
    }
    visiting.pop();
}

pub fn render_blocker_chain(
    store: &Store,
    id: &SessionId,
    now: i64,
) -> Result<String, StoreError> {
    let session = store.get_session(id)?;
    if session.status != SessionStatus::Sleeping {
        return Ok(format!(
            "session {id} is {} and not waiting on anything\n",
            session.status
        ));
    }
    let chain = blocker_chain(store, id, now)?;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "session {id} sleeps on {}",
        session
            .trigger
            .as_ref()
            .map(|t| t.summary())
            .unwrap_or_else(|| "nothing".to_string()),
    );
    if chain.is_empty() {
        let _ = writeln!(out, "no unsatisfied session dependencies (time-based wait)");
    } else {
        for blocker in chain {
            let _ = writeln!(out, "  blocked by {} [{}]", blocker.id, blocker.status);
        }
    }
    Ok(out)
}

/// One finding from the diagnose ruleset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub session_id: Option<SessionId>,
    pub message: String,
}

/// Rule sweep over the store snapshot: stalled actives, starved pendings,
/// and referential / invariant problems worth an operator's attention.
pub fn diagnose(
    store: &Store,
    thresholds: &DiagnoseThresholds,
    now: i64,
) -> Result<Vec<Finding>, StoreError> {
    let sessions = snapshot(store)?;
    let mut findings = Vec::new();

    for session in sessions.values() {
        match session.status {
            SessionStatus::Active => {
                let last_sign = session
                    .last_heartbeat
                    .unwrap_or(session.updated_at)
                    .max(session.updated_at);
                if now - last_sign > thresholds.active_stall_seconds {
                    findings.push(Finding {
                        session_id: Some(session.id.clone()),
                        message: format!(
                            "active for {} without checkpoint or heartbeat",
                            humanize_age(now, last_sign)
                        ),
                    });
                }
                if session.agent_pid.is_none() {
                    findings.push(Finding {
                        session_id: Some(session.id.clone()),
                        message: "active but no agent pid recorded".to_string(),
                    });
                }
            }
            SessionStatus::Pending => {
                if now - session.updated_at > thresholds.pending_stale_seconds {
                    findings.push(Finding {
                        session_id: Some(session.id.clone()),
                        message: format!(
                            "pending for {}; scheduler may be saturated or stopped",
                            humanize_age(now, session.updated_at)
                        ),
                    });
                }
            }
            _ => {}
        }

        if let Some(parent) = &session.parent_id {
            if !sessions.contains_key(parent) {
                findings.push(Finding {
                    session_id: Some(session.id.clone()),
                    message: format!("parent {parent} does not exist"),
                });
            }
        }

        if session.trigger.is_some() != (session.status == SessionStatus::Sleeping) {
            findings.push(Finding {
                session_id: Some(session.id.clone()),
                message: format!(
                    "trigger/status invariant violated (status {})",
                    session.status
                ),
            });
        }
        if session.result.is_some() != session.status.is_terminal() {
            findings.push(Finding {
                session_id: Some(session.id.clone()),
                message: format!(
                    "result/status invariant violated (status {})",
                    session.status
                ),
            });
        }

        if let Some(trigger) = &session.trigger {
            for referenced in trigger.referenced_ids() {
                if !sessions.contains_key(referenced) {
                    findings.push(Finding {
                        session_id: Some(session.id.clone()),
                        message: format!("trigger references unknown session {referenced}"),
                    });
                }
            }
        }
    }

    Ok(findings)
}

pub fn render_findings(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "no issues found\n".to_string();
    }
    let mut out = String::new();
    for finding in findings {
        match &finding.session_id {
            Some(id) => {
                let _ = writeln!(out, "{}: {}", id, finding.message);
            }
            None => {
                let _ = writeln!(out, "{}", finding.message);
            }
        }
    }
    out
}

/// Aggregate status counts, mirroring the shape agents and operators expect
/// from `ken status`.
pub fn render_status(store: &Store) -> Result<String, StoreError> {
    let sessions = store.all_sessions()?;
    if sessions.is_empty() {
        return Ok("no sessions\n".to_string());
    }

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for session in &sessions {
        *counts.entry(session.status.as_str()).or_default() += 1;
    }

    let mut out = String::new();
    let _ = writeln!(out, "sessions: {} total", sessions.len());
    for status in ["pending", "waking", "active", "sleeping", "complete", "failed"] {
        if let Some(count) = counts.get(status) {
            let _ = writeln!(out, "  {status:<9} {count}");
        }
    }

    let live: Vec<&Session> = sessions
        .iter()
        .filter(|s| {
            matches!(
                s.status,
                SessionStatus::Active | SessionStatus::Waking | SessionStatus::Failed
            )
        })
        .collect();
    if !live.is_empty() {
        let _ = writeln!(out);
        for session in live {
            let _ = writeln!(
                out,
                "  {} {} [{}] {}",
                status_marker(session.status),
                session.id,
                session.status,
                session.task,
            );
        }
    }
    Ok(out)
}

/// Recent events, optionally scoped to one session.
pub fn render_log(
    store: &Store,
    id: Option<&SessionId>,
    limit: usize,
) -> Result<String, StoreError> {
    if let Some(id) = id {
        // Surface not-found instead of an empty log.
        store.get_session(id)?;
    }
    let events = store.recent_events(id, limit)?;
    if events.is_empty() {
        return Ok("no events\n".to_string());
    }
    let mut out = String::new();
    for event in events {
        let _ = writeln!(
            out,
            "{} {} {} {}",
            format_rfc3339(event.ts),
            event
                .session_id
                .as_ref()
                .map(|s| s.as_str())
                .unwrap_or("-"),
            event.kind,
            event.data.as_deref().unwrap_or(""),
        );
    }
    Ok(out)
}
