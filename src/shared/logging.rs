use crate::store::KenPaths;
use std::fs;
use std::io::Write;

/// Append one line to the engine log. Best-effort: logging never interrupts
/// the operation that produced the line.
pub fn append_engine_log(paths: &KenPaths, level: &str, event: &str, message: &str) {
    let path = paths.engine_log_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };
    let ts = crate::shared::time::now_secs();
    let _ = writeln!(file, "{ts} {level} {event} {message}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KenPaths;
    use tempfile::tempdir;

    #[test]
    fn appends_lines_in_order() {
        let dir = tempdir().expect("tempdir");
        let paths = KenPaths::new(dir.path().join(".ken"));

        append_engine_log(&paths, "info", "daemon.started", "pid=1");
        append_engine_log(&paths, "warn", "scheduler.skip", "budget saturated");

        let raw = fs::read_to_string(paths.engine_log_path()).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("info daemon.started pid=1"));
        assert!(lines[1].contains("warn scheduler.skip budget saturated"));
    }
}
