//! Packet markdown parsing.
//!
//! A packet declares its scope under a `## Allowed Files` section (a bullet
//! list of backtick-quoted repository paths) and its acceptance criteria
//! under `## Validation Commands` (the first fenced code block, one shell
//! command per line, `\`-continued lines joined).

use std::collections::BTreeSet;

/// Collect the lines of the section titled `## <title>`, up to the next
/// `## ` heading.
fn section_lines<'a>(lines: &'a [&'a str], title: &str) -> Vec<&'a str> {
    let header = format!("## {title}");
    let mut in_section = false;
    let mut section = Vec::new();
    for line in lines {
        if !in_section {
            if line.trim() == header {
                in_section = true;
            }
            continue;
        }
        if line.starts_with("## ") {
            break;
        }
        section.push(*line);
    }
    section
}

/// Strip a trailing annotation like `src/a.py (new)` down to the path.
fn normalize_allowed_file(token: &str) -> String {
    let value = token.trim();
    match value.split_once(" (") {
        Some((path, _)) => path.trim().to_string(),
        None => value.to_string(),
    }
}

/// Extract the first backtick-quoted span from a bullet line, if the line
/// is of the form `- \`path\``.
fn bullet_backtick_span(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('-')?.trim_start();
    let rest = rest.strip_prefix('`')?;
    let end = rest.find('`')?;
    Some(&rest[..end])
}

/// Parse the `## Allowed Files` section into a path set.
pub fn parse_allowed_files(text: &str) -> BTreeSet<String> {
    let lines: Vec<&str> = text.lines().collect();
    section_lines(&lines, "Allowed Files")
        .iter()
        .filter_map(|line| bullet_backtick_span(line))
        .map(normalize_allowed_file)
        .collect()
}

/// Parse the `## Validation Commands` section into an ordered command list.
pub fn parse_validation_commands(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let section = section_lines(&lines, "Validation Commands");

    let mut block_lines = Vec::new();
    let mut in_code = false;
    for line in section {
        let stripped = line.trim();
        if stripped.starts_with("```") {
            if !in_code {
                in_code = true;
                continue;
            }
            break;
        }
        if in_code {
            block_lines.push(line);
        }
    }

    let mut commands = Vec::new();
    let mut current = String::new();
    for line in block_lines {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        if current.is_empty() {
            current = stripped.to_string();
        } else {
            current = format!("{current} {stripped}");
        }
        if let Some(head) = current.strip_suffix('\\') {
            current = head.trim_end().to_string();
            continue;
        }
        commands.push(std::mem::take(&mut current));
    }
    if !current.is_empty() {
        commands.push(current);
    }
    commands
}
