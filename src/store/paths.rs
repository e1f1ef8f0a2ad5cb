use crate::shared::ids::{KenPath, SessionId};
use std::fs;
use std::path::{Path, PathBuf};

/// Filesystem layout under the engine-owned `.ken/` directory, plus the
/// read-only locations (`kens/`, `reflections/`) resolved against the
/// project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KenPaths {
    pub root: PathBuf,
}

pub const KEN_DIR_NAME: &str = ".ken";

impl KenPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn project_root(&self) -> PathBuf {
        self.root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.root.join("logs"),
            self.root.join("prompts"),
            self.root.join("agents"),
            self.root.join("daemon"),
        ]
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("store.db")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn engine_log_path(&self) -> PathBuf {
        self.root.join("logs/engine.log")
    }

    pub fn prompt_file(&self, session_id: &SessionId) -> PathBuf {
        self.root.join("prompts").join(format!("{session_id}.md"))
    }

    pub fn agent_output_file(&self, session_id: &SessionId) -> PathBuf {
        self.root.join("agents").join(format!("{session_id}.log"))
    }

    pub fn daemon_lock_path(&self) -> PathBuf {
        self.root.join("daemon/daemon.lock")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.root.join("daemon/stop")
    }

    pub fn kens_dir(&self) -> PathBuf {
        self.project_root().join("kens")
    }

    pub fn kenning_file(&self, ken_path: &KenPath) -> PathBuf {
        let mut path = self.kens_dir();
        for segment in ken_path.segments() {
            path.push(segment);
        }
        path.join("kenning.md")
    }

    pub fn reflections_dir(&self) -> PathBuf {
        self.project_root().join("reflections")
    }
}

pub fn bootstrap_ken_root(paths: &KenPaths) -> std::io::Result<()> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path)?;
    }
    Ok(())
}

/// Locate the nearest `.ken/` directory walking up from `start`.
pub fn discover_ken_root(start: &Path) -> Option<KenPaths> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(KEN_DIR_NAME);
        if candidate.is_dir() {
            return Some(KenPaths::new(candidate));
        }
        if !current.pop() {
            return None;
        }
    }
}
