// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prompt and tool-source normalization.
//!
//! Normalization makes the checksum blind to formatting: re-indenting a
//! prompt or reflowing blank lines must not move an agent's identity, while
//! any change to the words themselves must.

/// Normalize a prompt template.
///
/// CRLF becomes LF, every line is trimmed, and empty lines are dropped.
///
/// # Examples
///
/// ```
/// use aidp_checksum::normalize::normalize_prompt;
///
/// let a = normalize_prompt("You are a planner.\r\n\r\n  Plan carefully.  ");
/// let b = normalize_prompt("You are a planner.\nPlan carefully.");
/// assert_eq!(a, b);
/// ```
#[must_use]
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Normalize tool source for deep-checksum hashing.
///
/// The source is dedented, doc comments and docstring literals are removed,
/// trailing whitespace is trimmed, and blank lines are dropped. Source that
/// does not scan as structurally balanced passes through untouched; the
/// mismatch then surfaces at checksum time, which is the intended signal.
#[must_use]
pub fn normalize_source(source: &str) -> String {
    let unified = source.replace("\r\n", "\n");
    if !is_balanced(&unified) {
        return source.to_string();
    }
    let dedented = dedent(&unified);
    let without_docs = strip_docstrings(&dedented);
    without_docs
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip the longest common leading whitespace from all non-blank lines.
fn dedent(source: &str) -> String {
    let margin = source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    if margin == 0 {
        return source.to_string();
    }
    source
        .lines()
        .map(|line| if line.len() >= margin { &line[margin..] } else { line.trim_start() })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Scan for balanced brackets outside string literals.
///
/// This stands in for a real parse: source we cannot make structural sense
/// of is left exactly as submitted.
fn is_balanced(source: &str) -> bool {
    let mut depth_paren: i64 = 0;
    let mut depth_bracket: i64 = 0;
    let mut depth_brace: i64 = 0;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for ch in source.chars() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => in_string = Some(ch),
            '(' => depth_paren += 1,
            ')' => depth_paren -= 1,
            '[' => depth_bracket += 1,
            ']' => depth_bracket -= 1,
            '{' => depth_brace += 1,
            '}' => depth_brace -= 1,
            _ => {}
        }
        if depth_paren < 0 || depth_bracket < 0 || depth_brace < 0 {
            return false;
        }
    }
    depth_paren == 0 && depth_bracket == 0 && depth_brace == 0 && in_string.is_none()
}

/// Remove doc comments and docstring literals.
///
/// Covers line doc comments (`///`, `//!`, `#` doc leaders are kept: they
/// may be semantic), and triple-quoted literals that open at the start of a
/// line (docstring position).
fn strip_docstrings(source: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut lines = source.lines();

    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();

        if trimmed.starts_with("///") || trimmed.starts_with("//!") {
            continue;
        }

        let docstring_delim = ["\"\"\"", "'''"]
            .into_iter()
            .find(|delim| trimmed.starts_with(delim));
        if let Some(delim) = docstring_delim {
            let rest = &trimmed[delim.len()..];
            if !rest.contains(delim) {
                // Multi-line docstring: consume up to and including the
                // closing delimiter.
                for inner in lines.by_ref() {
                    if inner.contains(delim) {
                        break;
                    }
                }
            }
            continue;
        }

        out.push(line);
    }
    out.join("\n")
}
