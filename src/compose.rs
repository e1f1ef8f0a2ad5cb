use crate::kenning::parse_frames;
use crate::session::{Session, SessionStatus};
use crate::shared::ids::{KenPath, SessionId};
use crate::store::KenPaths;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Outcome of one child referenced by the trigger that woke a session,
/// surfaced to the parent in the Dependency Results section.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyResult {
    pub id: SessionId,
    pub ken_path: KenPath,
    pub status: SessionStatus,
    pub result: Option<String>,
}

/// A composed wake prompt plus any non-fatal problems encountered while
/// assembling it. The caller records the warnings as events; composition
/// itself never fails.
#[derive(Debug, Clone, PartialEq)]
pub struct Composed {
    pub prompt: String,
    pub warnings: Vec<String>,
}

/// Assemble the text delivered to an agent, in the fixed section order:
/// header, task, definition of done, communication contract, recovery
/// context, dependency results, kenning frames.
pub fn compose_prompt(
    paths: &KenPaths,
    session: &Session,
    dependency_results: &[DependencyResult],
) -> Composed {
    let mut warnings = Vec::new();
    let mut prompt = String::new();

    let mode = if session.recovering { "recover" } else { "fresh" };
    let _ = writeln!(prompt, "# Session");
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "- id: {}", session.id);
    let _ = writeln!(prompt, "- ken: {}", session.ken_path);
    let _ = writeln!(prompt, "- mode: {mode}");
    let _ = writeln!(prompt);

    let _ = writeln!(prompt, "# Task");
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "{}", session.task.trim());
    let _ = writeln!(prompt);

    if let Some(done) = &session.done_when {
        let _ = writeln!(prompt, "# Definition of done");
        let _ = writeln!(prompt);
        let _ = writeln!(prompt, "{}", done.description.trim());
        if !done.criteria.is_empty() {
            let _ = writeln!(prompt);
            for (index, criterion) in done.criteria.iter().enumerate() {
                let _ = writeln!(prompt, "{}. {}", index + 1, criterion);
            }
        }
        if let Some(verify) = &done.verify {
            let _ = writeln!(prompt);
            let _ = writeln!(prompt, "Verify with: `{verify}`");
        }
        let _ = writeln!(prompt);
    }

    prompt.push_str(&communication_contract(&session.id));

    if let Some(checkpoint) = &session.checkpoint {
        let _ = writeln!(prompt, "# Previous checkpoint");
        let _ = writeln!(prompt);
        let _ = writeln!(prompt, "{}", checkpoint);
        let _ = writeln!(prompt);
    }

    if !dependency_results.is_empty() {
        let _ = writeln!(prompt, "# Dependency results");
        let _ = writeln!(prompt);
        for dep in dependency_results {
            let _ = writeln!(prompt, "## {} ({})", dep.id, dep.ken_path);
            let _ = writeln!(prompt, "- status: {}", dep.status);
            match &dep.result {
                Some(result) => {
                    let _ = writeln!(prompt);
                    let _ = writeln!(prompt, "{}", result.trim());
                }
                None => {
                    let _ = writeln!(prompt, "- result: (none yet)");
                }
            }
            let _ = writeln!(prompt);
        }
    }

    let kenning_path = paths.kenning_file(&session.ken_path);
    match fs::read_to_string(&kenning_path) {
        Ok(markdown) => {
            let frames = parse_frames(&markdown);
            if frames.is_empty() {
                warnings.push(format!(
                    "kenning {} contains no frames",
                    kenning_path.display()
                ));
            }
            for frame in frames {
                if frame.title.is_empty() {
                    let _ = writeln!(prompt, "# Frame {}", frame.number);
                } else {
                    let _ = writeln!(prompt, "# Frame {}: {}", frame.number, frame.title);
                }
                let _ = writeln!(prompt);
                let body =
                    substitute_grounding_tokens(&frame.body, &paths.project_root(), &mut warnings);
                let _ = writeln!(prompt, "{body}");
                let _ = writeln!(prompt);
            }
        }
        Err(err) => {
            warnings.push(format!(
                "kenning {} could not be read: {err}",
                kenning_path.display()
            ));
            let _ = writeln!(prompt, "[missing kenning: {}]", session.ken_path);
        }
    }

    Composed { prompt, warnings }
}

fn communication_contract(session_id: &SessionId) -> String {
    format!(
        r#"# Communicating with the engine

Send requests as `ken request '<json>'` from the project root. Your session
id is `{session_id}`. Recognised requests:

- {{"type":"complete","session_id":"{session_id}","result":"<text>"}}
- {{"type":"fail","session_id":"{session_id}","reason":"<text>"}}
- {{"type":"sleep","session_id":"{session_id}","trigger":<trigger>,"checkpoint":"<text>"}}
- {{"type":"spawn_and_sleep","session_id":"{session_id}","children":[{{"ken":"<path>","task":"<text>"}}],"trigger":<trigger>,"checkpoint":"<text>"}}
- {{"type":"checkpoint","session_id":"{session_id}","checkpoint":"<text>"}}

Triggers: {{"all_complete":[ids]}}, {{"any_complete":[ids]}},
{{"timeout_at":"<RFC3339>"}}, {{"timeout_seconds":<n>}}, {{"any":[triggers]}}.
In spawn_and_sleep the string "__CHILDREN__" stands for the ids of the
children being created.

You must issue exactly one terminal request (complete, fail, sleep or
spawn_and_sleep) before exiting. `checkpoint` may be sent any number of
times beforehand.

"#
    )
}

/// Replace `{{file:path}}` and `{{tree:path}}` grounding tokens against the
/// project root. Missing targets become a placeholder; unknown token kinds
/// are left verbatim. Both add a warning.
pub fn substitute_grounding_tokens(
    template: &str,
    project_root: &Path,
    warnings: &mut Vec<String>,
) -> String {
    let mut rendered = String::new();
    let mut cursor = template;

    while let Some(start) = cursor.find("{{") {
        rendered.push_str(&cursor[..start]);
        let after_open = &cursor[start + 2..];
        let Some(close_offset) = after_open.find("}}") else {
            // Unclosed token: emit the rest untouched.
            rendered.push_str(&cursor[start..]);
            return rendered;
        };
        let token = after_open[..close_offset].trim();
        rendered.push_str(&resolve_grounding_token(token, project_root, warnings));
        cursor = &after_open[close_offset + 2..];
    }

    rendered.push_str(cursor);
    rendered
}

fn resolve_grounding_token(token: &str, project_root: &Path, warnings: &mut Vec<String>) -> String {
    if let Some(rel) = token.strip_prefix("file:") {
        let rel = rel.trim();
        let path = project_root.join(rel);
        return match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                warnings.push(format!("grounding file `{rel}` unavailable: {err}"));
                format!("[missing file: {rel}]")
            }
        };
    }
    if let Some(rel) = token.strip_prefix("tree:") {
        let rel = rel.trim();
        let path = project_root.join(rel);
        let mut entries = Vec::new();
        collect_tree(&path, Path::new(rel), &mut entries);
        if entries.is_empty() {
            warnings.push(format!("grounding tree `{rel}` is missing or empty"));
            return format!("[missing tree: {rel}]");
        }
        entries.sort();
        return entries.join("\n");
    }

    warnings.push(format!("unknown grounding token `{{{{{token}}}}}`"));
    format!("{{{{{token}}}}}")
}

fn collect_tree(dir: &Path, display_prefix: &Path, entries: &mut Vec<String>) {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return;
    };
    for entry in read_dir.flatten() {
        let name = entry.file_name();
        let shown = display_prefix.join(&name);
        let path = entry.path();
        if path.is_dir() {
            entries.push(format!("{}/", shown.display()));
            collect_tree(&path, &shown, entries);
        } else {
            entries.push(shown.display().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DoneWhen;
    use tempfile::tempdir;

    fn setup() -> (KenPaths, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let paths = KenPaths::new(dir.path().join(".ken"));
        fs::create_dir_all(&paths.root).expect("mkdir");
        (paths, dir)
    }

    fn write_kenning(paths: &KenPaths, ken: &str, content: &str) {
        let ken = KenPath::parse(ken).expect("ken path");
        let file = paths.kenning_file(&ken);
        fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        fs::write(file, content).expect("write kenning");
    }

    fn session(paths_ken: &str) -> Session {
        Session::with_id(
            SessionId::parse("s1").expect("id"),
            KenPath::parse(paths_ken).expect("ken"),
            "build the parser",
            None,
            100,
        )
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let (paths, _dir) = setup();
        write_kenning(&paths, "core/cli", "## Frame 1: Orientation\nframe body\n");

        let mut s = session("core/cli");
        s.done_when = Some(DoneWhen {
            description: "tests pass".to_string(),
            criteria: vec!["unit tests green".to_string()],
            verify: Some("cargo test".to_string()),
        });
        s.checkpoint = Some("got halfway".to_string());

        let deps = vec![DependencyResult {
            id: SessionId::parse("c1").expect("id"),
            ken_path: KenPath::parse("core/leaf").expect("ken"),
            status: SessionStatus::Complete,
            result: Some("r1".to_string()),
        }];

        let composed = compose_prompt(&paths, &s, &deps);
        let prompt = &composed.prompt;

        let order = [
            "# Session",
            "# Task",
            "# Definition of done",
            "# Communicating with the engine",
            "# Previous checkpoint",
            "# Dependency results",
            "# Frame 1: Orientation",
        ];
        let mut last = 0;
        for heading in order {
            let at = prompt.find(heading).unwrap_or_else(|| {
                panic!("missing section `{heading}` in:\n{prompt}")
            });
            assert!(at >= last, "section `{heading}` out of order");
            last = at;
        }
        assert!(prompt.contains("mode: fresh"));
        assert!(prompt.contains("got halfway"));
        assert!(prompt.contains("r1"));
        assert!(composed.warnings.is_empty());
    }

    #[test]
    fn recovering_session_gets_recover_mode() {
        let (paths, _dir) = setup();
        write_kenning(&paths, "core/cli", "## Frame 1: A\nbody\n");
        let mut s = session("core/cli");
        s.recovering = true;
        let composed = compose_prompt(&paths, &s, &[]);
        assert!(composed.prompt.contains("mode: recover"));
    }

    #[test]
    fn no_dependency_section_without_dependencies() {
        let (paths, _dir) = setup();
        write_kenning(&paths, "core/cli", "## Frame 1: A\nbody\n");
        let composed = compose_prompt(&paths, &session("core/cli"), &[]);
        assert!(!composed.prompt.contains("# Dependency results"));
    }

    #[test]
    fn failed_dependency_is_marked() {
        let (paths, _dir) = setup();
        write_kenning(&paths, "core/cli", "## Frame 1: A\nbody\n");
        let deps = vec![DependencyResult {
            id: SessionId::parse("c1").expect("id"),
            ken_path: KenPath::parse("core/leaf").expect("ken"),
            status: SessionStatus::Failed,
            result: Some("boom".to_string()),
        }];
        let composed = compose_prompt(&paths, &session("core/cli"), &deps);
        assert!(composed.prompt.contains("status: failed"));
        assert!(composed.prompt.contains("boom"));
    }

    #[test]
    fn missing_kenning_warns_but_composes() {
        let (paths, _dir) = setup();
        let composed = compose_prompt(&paths, &session("core/none"), &[]);
        assert!(composed.prompt.contains("[missing kenning: core/none]"));
        assert_eq!(composed.warnings.len(), 1);
    }

    #[test]
    fn empty_kenning_warns() {
        let (paths, _dir) = setup();
        write_kenning(&paths, "core/cli", "# prose only\n");
        let composed = compose_prompt(&paths, &session("core/cli"), &[]);
        assert!(composed
            .warnings
            .iter()
            .any(|w| w.contains("contains no frames")));
    }

    #[test]
    fn file_token_inlines_content() {
        let (paths, dir) = setup();
        fs::write(dir.path().join("notes.txt"), "inline me").expect("write");
        let mut warnings = Vec::new();
        let out =
            substitute_grounding_tokens("before {{file:notes.txt}} after", dir.path(), &mut warnings);
        assert_eq!(out, "before inline me after");
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_file_token_becomes_placeholder_with_warning() {
        let (_paths, dir) = setup();
        let mut warnings = Vec::new();
        let out = substitute_grounding_tokens("{{file:gone.txt}}", dir.path(), &mut warnings);
        assert_eq!(out, "[missing file: gone.txt]");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn tree_token_lists_directory() {
        let (_paths, dir) = setup();
        fs::create_dir_all(dir.path().join("src/inner")).expect("mkdir");
        fs::write(dir.path().join("src/a.rs"), "").expect("write");
        fs::write(dir.path().join("src/inner/b.rs"), "").expect("write");

        let mut warnings = Vec::new();
        let out = substitute_grounding_tokens("{{tree:src}}", dir.path(), &mut warnings);
        assert!(out.contains("src/a.rs"));
        assert!(out.contains("src/inner/"));
        assert!(out.contains("src/inner/b.rs"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn unknown_token_is_left_verbatim_with_warning() {
        let (_paths, dir) = setup();
        let mut warnings = Vec::new();
        let out = substitute_grounding_tokens("{{env:HOME}}", dir.path(), &mut warnings);
        assert_eq!(out, "{{env:HOME}}");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn unclosed_token_passes_through() {
        let (_paths, dir) = setup();
        let mut warnings = Vec::new();
        let out = substitute_grounding_tokens("text {{file:broken", dir.path(), &mut warnings);
        assert_eq!(out, "text {{file:broken");
    }
}
