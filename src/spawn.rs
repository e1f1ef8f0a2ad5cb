use crate::config::AgentCommand;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::SessionId;
use crate::store::KenPaths;
use sha2::{Digest, Sha256};
use std::fs;
use std::process::{Child, Command, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to write prompt file {path}: {source}")]
    WritePrompt {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open agent output file {path}: {source}")]
    OpenOutput {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent binary `{command}` not found")]
    MissingBinary { command: String },
    #[error("failed to spawn agent `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// A launched agent process. Dropping the handle does not kill the agent;
/// the daemon keeps handles to reap exits, one-shot `process` invocations
/// let the child reparent.
#[derive(Debug)]
pub struct SpawnedAgent {
    pub pid: u32,
    pub child: Child,
    pub prompt_digest: String,
}

/// Short content digest recorded with agent_spawned events so an operator
/// can match a prompt file to the spawn that used it.
pub fn prompt_digest(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Launch the configured agent for a session. The composed prompt is written
/// to `.ken/prompts/<session>.md` and its path appended to the agent
/// command; stdout/stderr go to `.ken/agents/<session>.log`; the working
/// directory is the project root. The engine never parses agent output;
/// payloads arrive through `ken request`.
pub fn spawn_agent(
    paths: &KenPaths,
    agent: &AgentCommand,
    session_id: &SessionId,
    prompt: &str,
) -> Result<SpawnedAgent, SpawnError> {
    let prompt_path = paths.prompt_file(session_id);
    if let Some(parent) = prompt_path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    atomic_write_file(&prompt_path, prompt.as_bytes()).map_err(|source| {
        SpawnError::WritePrompt {
            path: prompt_path.display().to_string(),
            source,
        }
    })?;

    let output_path = paths.agent_output_file(session_id);
    if let Some(parent) = output_path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let open_output = || {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_path)
            .map_err(|source| SpawnError::OpenOutput {
                path: output_path.display().to_string(),
                source,
            })
    };

    let mut command = Command::new(&agent.command);
    command
        .args(&agent.args)
        .arg(&prompt_path)
        .current_dir(paths.project_root())
        .env("KEN_SESSION_ID", session_id.as_str())
        .env("KEN_PROJECT_ROOT", paths.project_root())
        .stdin(Stdio::null())
        .stdout(open_output()?)
        .stderr(open_output()?);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SpawnError::MissingBinary {
                command: agent.command.clone(),
            })
        }
        Err(source) => {
            return Err(SpawnError::Spawn {
                command: agent.command.clone(),
                source,
            })
        }
    };

    Ok(SpawnedAgent {
        pid: child.id(),
        child,
        prompt_digest: prompt_digest(prompt),
    })
}

/// Probe whether a pid refers to a live process.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::bootstrap_ken_root;
    use tempfile::tempdir;

    fn setup() -> (KenPaths, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let paths = KenPaths::new(dir.path().join(".ken"));
        bootstrap_ken_root(&paths).expect("bootstrap");
        (paths, dir)
    }

    #[cfg(unix)]
    fn stub_agent(dir: &std::path::Path, body: &str) -> AgentCommand {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("agent-stub");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write stub");
        let mut perms = fs::metadata(&script).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).expect("chmod");
        AgentCommand {
            command: script.display().to_string(),
            args: Vec::new(),
        }
    }

    #[test]
    fn digest_is_stable_and_short() {
        let a = prompt_digest("hello");
        let b = prompt_digest("hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(prompt_digest("other"), a);
    }

    #[cfg(unix)]
    #[test]
    fn spawn_writes_prompt_and_captures_output() {
        let (paths, dir) = setup();
        let agent = stub_agent(dir.path(), "cat \"$1\"; echo \"session=$KEN_SESSION_ID\"");
        let session_id = SessionId::parse("s1").expect("id");

        let mut spawned =
            spawn_agent(&paths, &agent, &session_id, "PROMPT BODY").expect("spawn");
        let status = spawned.child.wait().expect("wait");
        assert!(status.success());

        assert_eq!(
            fs::read_to_string(paths.prompt_file(&session_id)).expect("prompt"),
            "PROMPT BODY"
        );
        let output = fs::read_to_string(paths.agent_output_file(&session_id)).expect("output");
        assert!(output.contains("PROMPT BODY"));
        assert!(output.contains("session=s1"));
    }

    #[cfg(unix)]
    #[test]
    fn liveness_tracks_process_exit() {
        let (paths, dir) = setup();
        let agent = stub_agent(dir.path(), "sleep 5");
        let session_id = SessionId::parse("s2").expect("id");

        let mut spawned = spawn_agent(&paths, &agent, &session_id, "p").expect("spawn");
        assert!(is_process_alive(spawned.pid));
        spawned.child.kill().expect("kill");
        spawned.child.wait().expect("wait");
        assert!(!is_process_alive(spawned.pid));
    }

    #[test]
    fn missing_binary_is_a_distinct_error() {
        let (paths, _dir) = setup();
        let agent = AgentCommand {
            command: "definitely-not-a-real-binary-472193".to_string(),
            args: Vec::new(),
        };
        let session_id = SessionId::parse("s3").expect("id");
        let err = spawn_agent(&paths, &agent, &session_id, "p").expect_err("must fail");
        assert!(matches!(err, SpawnError::MissingBinary { .. }));
    }

    #[test]
    fn dead_pid_probe_is_false_for_zero() {
        assert!(!is_process_alive(0));
    }
}
