// ABOUTME: Normalization of sandbox container log output for callers
// ABOUTME: Drops stream frame headers and blank lines, and evens out indentation

/// Lines of container output returned by a log request
pub const SANDBOX_LOG_LINES: usize = 1000;

/// Length of the stdout/stderr multiplexing header on raw engine output
const FRAME_HEADER_LEN: usize = 8;

/// Indentation is kept in two-space steps, up to this many
const MAX_INDENT_LEVELS: usize = 6;

/// Normalize raw container output: one non-blank line per output line,
/// tabs expanded, leading indentation rounded down to two-space steps.
pub fn normalize_logs(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    for line in raw.lines() {
        let Some(line) = strip_frame_header(line) else {
            continue;
        };
        if let Some(line) = normalize_line(line) {
            normalized.push_str(&line);
            normalized.push('\n');
        }
    }
    normalized
}

/// `None` for a line that is only a header
fn strip_frame_header(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    if bytes.len() < FRAME_HEADER_LEN || !matches!(bytes[0], 1 | 2) {
        return Some(line);
    }
    match line.get(FRAME_HEADER_LEN..) {
        Some("") => None,
        Some(rest) => Some(rest),
        // Not a header after all; the first bytes are part of a character
        None => Some(line),
    }
}

fn normalize_line(line: &str) -> Option<String> {
    let expanded = line.replace('\t', "    ");
    let content = expanded.trim_start_matches(' ');
    if content.trim().is_empty() {
        return None;
    }

    let leading = expanded.len() - content.len();
    let levels = (leading / 2).min(MAX_INDENT_LEVELS);
    Some(format!("{}{}", "  ".repeat(levels), content))
}
