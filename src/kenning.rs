/// One section of a kenning, delivered in order to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub number: u32,
    pub title: String,
    pub body: String,
}

/// Parse the frames out of a kenning markdown document.
///
/// A frame heading is `## Frame <N>: <Title>` (case-insensitive,
/// whitespace-tolerant); the body runs to the next `## ` heading or EOF.
/// Everything else (`## Meta`, `## Task`, unknown headings, prose before
/// the first frame) is ignored. No frames is not an error.
pub fn parse_frames(markdown: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut current: Option<Frame> = None;

    for line in markdown.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            if let Some(frame) = current.take() {
                frames.push(finish_frame(frame));
            }
            current = parse_frame_heading(heading);
            continue;
        }
        if let Some(frame) = current.as_mut() {
            frame.body.push_str(line);
            frame.body.push('\n');
        }
    }
    if let Some(frame) = current.take() {
        frames.push(finish_frame(frame));
    }
    frames
}

fn finish_frame(mut frame: Frame) -> Frame {
    frame.body = frame.body.trim().to_string();
    frame
}

fn parse_frame_heading(heading: &str) -> Option<Frame> {
    let trimmed = heading.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let rest = lowered.strip_prefix("frame")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }

    // Work on the original casing for the title; the lowered copy only
    // located the keyword, which is ASCII so offsets line up.
    let after_keyword = trimmed["frame".len()..].trim_start();
    let (number_part, title_part) = match after_keyword.split_once(':') {
        Some((number, title)) => (number.trim(), title.trim()),
        None => (after_keyword.trim(), ""),
    };
    let number: u32 = number_part.parse().ok()?;

    Some(Frame {
        number,
        title: title_part.to_string(),
        body: String::new(),
    })
}

/// Render frames back to markdown; `parse_frames` of the output yields the
/// same frame list.
pub fn render_frames(frames: &[Frame]) -> String {
    let mut out = String::new();
    for frame in frames {
        if !out.is_empty() {
            out.push('\n');
        }
        if frame.title.is_empty() {
            out.push_str(&format!("## Frame {}\n\n", frame.number));
        } else {
            out.push_str(&format!("## Frame {}: {}\n\n", frame.number, frame.title));
        }
        out.push_str(&frame.body);
        out.push('\n');
    }
    out
}
