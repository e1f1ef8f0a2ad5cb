use crate::config::{load_settings, save_settings, Settings};
use crate::recovery::{abandon_session, recover_session, startup_sweep, RecoveryError};
use crate::session::{DoneWhen, Session};
use crate::shared::ids::{KenPath, SessionId};
use crate::shared::time::now_secs;
use crate::store::{
    bootstrap_ken_root, discover_ken_root, KenPaths, Store, StoreError, KEN_DIR_NAME,
};
use std::fs;
use std::path::Path;

pub const EXIT_USER_ERROR: i32 = 1;
pub const EXIT_STORE_ERROR: i32 = 2;
pub const EXIT_NOT_FOUND: i32 = 3;
pub const EXIT_INVALID_STATE: i32 = 4;

/// A command failure carrying the process exit code the binary should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliError {
    pub exit_code: i32,
    pub message: String,
}

impl CliError {
    fn user(message: impl Into<String>) -> Self {
        CliError {
            exit_code: EXIT_USER_ERROR,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        let exit_code = match &err {
            StoreError::SessionNotFound(_) => EXIT_NOT_FOUND,
            StoreError::IllegalTransition { .. } => EXIT_INVALID_STATE,
            _ => EXIT_STORE_ERROR,
        };
        CliError {
            exit_code,
            message: err.to_string(),
        }
    }
}

impl From<RecoveryError> for CliError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::Store(store) => store.into(),
            RecoveryError::WrongState { .. } => CliError {
                exit_code: EXIT_INVALID_STATE,
                message: err.to_string(),
            },
        }
    }
}

impl From<crate::scheduler::SchedulerError> for CliError {
    fn from(err: crate::scheduler::SchedulerError) -> Self {
        match err {
            crate::scheduler::SchedulerError::Store(store) => store.into(),
            other => CliError::user(other.to_string()),
        }
    }
}

impl From<crate::config::ConfigError> for CliError {
    fn from(err: crate::config::ConfigError) -> Self {
        CliError::user(err.to_string())
    }
}

/// Entry point for the binary: resolve `.ken/` from the working directory
/// and dispatch.
pub fn run(args: Vec<String>) -> Result<String, CliError> {
    let cwd = std::env::current_dir()
        .map_err(|err| CliError::user(format!("cannot resolve working directory: {err}")))?;
    run_at(&cwd, args)
}

/// Same as [`run`] but rooted at an explicit directory; the seam tests use.
pub fn run_at(base: &Path, args: Vec<String>) -> Result<String, CliError> {
    match args.first().map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => Ok(help_text()),
        Some("init") => cmd_init(base),
        Some(command) => {
            let paths = discover_ken_root(base)
                .ok_or_else(|| CliError::user("not initialised: run `ken init` first"))?;
            dispatch(&paths, command, &args[1..])
        }
    }
}

fn dispatch(paths: &KenPaths, command: &str, args: &[String]) -> Result<String, CliError> {
    match command {
        "wake" => cmd_wake(paths, args),
        "process" => cmd_process(paths),
        "daemon" => cmd_daemon(paths),
        "status" => cmd_status(paths),
        "tree" => cmd_tree(paths, args),
        "session" => cmd_session(paths, args),
        "why" => cmd_why(paths, args),
        "log" => cmd_log(paths, args),
        "diagnose" => cmd_diagnose(paths),
        "recover" => cmd_recover(paths, args),
        "abandon" => cmd_abandon(paths, args),
        "request" => cmd_request(paths, args),
        other => Err(CliError::user(format!("unknown command `{other}`"))),
    }
}

fn help_text() -> String {
    [
        "Usage: ken <command> [args]",
        "",
        "Commands:",
        "  init                                 Create .ken/ and initialise the store",
        "  wake <ken_path> --task <text>        Create a root session (prints its id)",
        "       [--done-when <file>]",
        "  process                              Run one scheduler iteration",
        "  daemon                               Loop the scheduler until stopped",
        "  status                               Session counts and live sessions",
        "  tree [id]                            Workflow tree (all roots or a subtree)",
        "  session <id>                         Full session detail",
        "  why <id>                             Blocker chain for a sleeping session",
        "  log [id]                             Recent events (optionally one session)",
        "  diagnose                             Health ruleset over the store",
        "  recover <id>                         Re-queue a failed session from checkpoint",
        "  abandon <id> --reason <text>         Mark a session failed",
        "  request <json>                       Forward an agent request to the engine",
    ]
    .join("\n")
}

fn take_flag(args: &[String], flag: &str) -> Result<Option<(String, Vec<String>)>, CliError> {
    let Some(index) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    let Some(value) = args.get(index + 1) else {
        return Err(CliError::user(format!("{flag} requires a value")));
    };
    let mut rest: Vec<String> = args.to_vec();
    rest.drain(index..=index + 1);
    Ok(Some((value.clone(), rest)))
}

fn open_store(paths: &KenPaths) -> Result<Store, CliError> {
    Ok(Store::open(&paths.db_path())?)
}

fn parse_session_id(raw: &str) -> Result<SessionId, CliError> {
    SessionId::parse(raw).map_err(CliError::user)
}

fn cmd_init(base: &Path) -> Result<String, CliError> {
    let ken_dir = base.join(KEN_DIR_NAME);
    if ken_dir.exists() {
        return Err(CliError::user(format!(
            "already initialised: {} exists",
            ken_dir.display()
        )));
    }
    let paths = KenPaths::new(&ken_dir);
    bootstrap_ken_root(&paths)
        .map_err(|err| CliError::user(format!("failed to create {}: {err}", ken_dir.display())))?;
    Store::create(&paths.db_path())?;
    save_settings(&paths, &Settings::default())?;
    // Kennings are read-only inputs; reflections belong to the agents.
    // The engine only makes sure both places exist.
    fs::create_dir_all(paths.kens_dir())
        .map_err(|err| CliError::user(format!("failed to create kens/: {err}")))?;
    fs::create_dir_all(paths.reflections_dir())
        .map_err(|err| CliError::user(format!("failed to create reflections/: {err}")))?;
    Ok(format!(
        "initialised ken\nstore={}\nconfig={}",
        paths.db_path().display(),
        paths.settings_file().display()
    ))
}

fn cmd_wake(paths: &KenPaths, args: &[String]) -> Result<String, CliError> {
    let (task, rest) =
        take_flag(args, "--task")?.ok_or_else(|| CliError::user("wake requires --task <text>"))?;
    let (done_when_file, rest) = match take_flag(&rest, "--done-when")? {
        Some((value, rest)) => (Some(value), rest),
        None => (None, rest),
    };
    let [ken_path_raw] = rest.as_slice() else {
        return Err(CliError::user(
            "usage: wake <ken_path> --task <text> [--done-when <file>]",
        ));
    };
    let ken_path = KenPath::parse(ken_path_raw).map_err(CliError::user)?;

    let done_when: Option<DoneWhen> = match done_when_file {
        Some(file) => {
            let raw = fs::read_to_string(&file)
                .map_err(|err| CliError::user(format!("cannot read {file}: {err}")))?;
            Some(
                serde_yaml::from_str(&raw).map_err(|err| {
                    CliError::user(format!("invalid done-when file {file}: {err}"))
                })?,
            )
        }
        None => None,
    };

    let mut store = open_store(paths)?;
    let mut session = Session::new(ken_path, &task, None, now_secs());
    session.done_when = done_when;
    store.create_session(&session)?;
    Ok(session.id.to_string())
}

fn cmd_process(paths: &KenPaths) -> Result<String, CliError> {
    let mut store = open_store(paths)?;
    let settings = load_settings(paths)?;
    let now = now_secs();
    let sweep = startup_sweep(&mut store, paths, now)?;
    let outcome = crate::scheduler::run_iteration(&mut store, paths, &settings, now)?;

    let mut lines = Vec::new();
    for id in &sweep.reverted {
        lines.push(format!("reverted {id} to pending"));
    }
    for id in sweep.lost.iter().chain(outcome.reaped.iter()) {
        lines.push(format!("failed {id} (agent lost)"));
    }
    for id in &outcome.woken {
        lines.push(format!("woke {id}"));
    }
    match &outcome.spawned {
        Some(id) => lines.push(format!("spawned agent for {id}")),
        // The agent handle is dropped here; one-shot invocations track the
        // child by pid on later passes.
        None => lines.push("nothing to spawn".to_string()),
    }
    Ok(lines.join("\n"))
}

fn cmd_daemon(paths: &KenPaths) -> Result<String, CliError> {
    let mut store = open_store(paths)?;
    let settings = load_settings(paths)?;
    crate::scheduler::run_daemon(&mut store, paths, &settings)?;
    Ok("daemon stopped".to_string())
}

fn cmd_status(paths: &KenPaths) -> Result<String, CliError> {
    let store = open_store(paths)?;
    Ok(crate::observe::render_status(&store)?)
}

fn cmd_tree(paths: &KenPaths, args: &[String]) -> Result<String, CliError> {
    let store = open_store(paths)?;
    let root = match args {
        [] => None,
        [raw] => Some(parse_session_id(raw)?),
        _ => return Err(CliError::user("usage: tree [id]")),
    };
    Ok(crate::observe::render_tree(&store, root.as_ref(), now_secs())?)
}

fn cmd_session(paths: &KenPaths, args: &[String]) -> Result<String, CliError> {
    let [raw] = args else {
        return Err(CliError::user("usage: session <id>"));
    };
    let store = open_store(paths)?;
    Ok(crate::observe::render_session_detail(
        &store,
        &parse_session_id(raw)?,
        now_secs(),
    )?)
}

fn cmd_why(paths: &KenPaths, args: &[String]) -> Result<String, CliError> {
    let [raw] = args else {
        return Err(CliError::user("usage: why <id>"));
    };
    let store = open_store(paths)?;
    Ok(crate::observe::render_blocker_chain(
        &store,
        &parse_session_id(raw)?,
        now_secs(),
    )?)
}

fn cmd_log(paths: &KenPaths, args: &[String]) -> Result<String, CliError> {
    let store = open_store(paths)?;
    let id = match args {
        [] => None,
        [raw] => Some(parse_session_id(raw)?),
        _ => return Err(CliError::user("usage: log [id]")),
    };
    Ok(crate::observe::render_log(&store, id.as_ref(), 50)?)
}

fn cmd_diagnose(paths: &KenPaths) -> Result<String, CliError> {
    let store = open_store(paths)?;
    let settings = load_settings(paths)?;
    let findings = crate::observe::diagnose(&store, &settings.diagnose, now_secs())?;
    Ok(crate::observe::render_findings(&findings))
}

fn cmd_recover(paths: &KenPaths, args: &[String]) -> Result<String, CliError> {
    let [raw] = args else {
        return Err(CliError::user("usage: recover <id>"));
    };
    let id = parse_session_id(raw)?;
    let mut store = open_store(paths)?;
    recover_session(&mut store, paths, &id, now_secs())?;
    Ok(format!("session {id} queued for recovery"))
}

fn cmd_abandon(paths: &KenPaths, args: &[String]) -> Result<String, CliError> {
    let (reason, rest) = take_flag(args, "--reason")?
        .ok_or_else(|| CliError::user("abandon requires --reason <text>"))?;
    let [raw] = rest.as_slice() else {
        return Err(CliError::user("usage: abandon <id> --reason <text>"));
    };
    let id = parse_session_id(raw)?;
    let mut store = open_store(paths)?;
    abandon_session(&mut store, paths, &id, &reason, now_secs())?;
    Ok(format!("session {id} abandoned"))
}

fn cmd_request(paths: &KenPaths, args: &[String]) -> Result<String, CliError> {
    let [raw] = args else {
        return Err(CliError::user("usage: request <json>"));
    };
    let mut store = open_store(paths)?;
    let response = crate::handler::handle_request_line(&mut store, raw, now_secs());
    // The response line is the protocol payload; even a rejected request is
    // a successfully delivered response.
    Ok(response.to_json_line())
}
