use crate::shared::fs_atomic::atomic_write_file;
use crate::store::KenPaths;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write settings {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// How the engine launches an agent. The composed prompt path is appended as
/// the final argument; `KEN_SESSION_ID` and `KEN_PROJECT_ROOT` are set in
/// the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AgentCommand {
    fn default() -> Self {
        AgentCommand {
            command: "claude".to_string(),
            args: vec![
                "--dangerously-skip-permissions".to_string(),
                "-p".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnoseThresholds {
    /// An active session without checkpoint or heartbeat for this long is
    /// reported as stalled.
    #[serde(default = "default_active_stall_seconds")]
    pub active_stall_seconds: i64,
    /// A pending session older than this is reported as starved.
    #[serde(default = "default_pending_stale_seconds")]
    pub pending_stale_seconds: i64,
}

fn default_active_stall_seconds() -> i64 {
    900
}

fn default_pending_stale_seconds() -> i64 {
    3600
}

impl Default for DiagnoseThresholds {
    fn default() -> Self {
        DiagnoseThresholds {
            active_stall_seconds: default_active_stall_seconds(),
            pending_stale_seconds: default_pending_stale_seconds(),
        }
    }
}

/// Engine settings, persisted at `.ken/config.yaml`. Every field has a
/// default so an absent file means a usable engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentCommand,
    /// Bound on simultaneously active+waking sessions.
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub diagnose: DiagnoseThresholds,
}

fn default_max_active() -> usize {
    2
}

fn default_poll_interval_seconds() -> u64 {
    1
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            agent: AgentCommand::default(),
            max_active: default_max_active(),
            poll_interval_seconds: default_poll_interval_seconds(),
            diagnose: DiagnoseThresholds::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active == 0 {
            return Err(ConfigError::Invalid(
                "max_active must be at least 1".to_string(),
            ));
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "agent.command must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load settings from `.ken/config.yaml`, falling back to defaults when the
/// file does not exist.
pub fn load_settings(paths: &KenPaths) -> Result<Settings, ConfigError> {
    let path = paths.settings_file();
    if !path.exists() {
        return Ok(Settings::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let settings: Settings = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    settings.validate()?;
    Ok(settings)
}

pub fn save_settings(paths: &KenPaths, settings: &Settings) -> Result<(), ConfigError> {
    settings.validate()?;
    let path = paths.settings_file();
    let encoded = serde_yaml::to_string(settings).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, encoded.as_bytes()).map_err(|source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absent_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let paths = KenPaths::new(dir.path().join(".ken"));
        let settings = load_settings(&paths).expect("load");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.max_active, 2);
        assert_eq!(settings.agent.command, "claude");
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let dir = tempdir().expect("tempdir");
        let paths = KenPaths::new(dir.path().join(".ken"));
        fs::create_dir_all(&paths.root).expect("mkdir");
        fs::write(
            paths.settings_file(),
            "max_active: 7\nagent:\n  command: agent-stub\n",
        )
        .expect("write");

        let settings = load_settings(&paths).expect("load");
        assert_eq!(settings.max_active, 7);
        assert_eq!(settings.agent.command, "agent-stub");
        assert!(settings.agent.args.is_empty());
        assert_eq!(settings.poll_interval_seconds, 1);
        assert_eq!(settings.diagnose.active_stall_seconds, 900);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let paths = KenPaths::new(dir.path().join(".ken"));
        fs::create_dir_all(&paths.root).expect("mkdir");

        let mut settings = Settings::default();
        settings.max_active = 4;
        settings.diagnose.pending_stale_seconds = 60;
        save_settings(&paths, &settings).expect("save");

        let loaded = load_settings(&paths).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn zero_max_active_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let paths = KenPaths::new(dir.path().join(".ken"));
        fs::create_dir_all(&paths.root).expect("mkdir");
        fs::write(paths.settings_file(), "max_active: 0\n").expect("write");
        assert!(matches!(
            load_settings(&paths),
            Err(ConfigError::Invalid(_))
        ));
    }
}
