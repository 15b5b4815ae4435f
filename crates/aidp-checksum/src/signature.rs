// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool signature canonicalization.
//!
//! Host frameworks inject bookkeeping parameters into tool signatures
//! (`config`, `run_manager`, trailing `**kwargs`, …). Two tools with the
//! same logical signature must hash identically no matter which framework
//! wrapped them, so the canonical form strips every injected parameter and
//! re-emits `name(params) -> return`.

/// Parameter names injected by host frameworks, never part of identity.
const WRAPPER_PARAMS: &[&str] = &[
    "config",
    "callbacks",
    "run_manager",
    "tags",
    "metadata",
    "run_id",
    "parent_run_id",
    "configurable",
    "recursion_limit",
];

/// Canonicalize a signature string.
///
/// Input is expected in the common `name(p1: T1, p2: T2 = d) -> R` shape.
/// Framework wrapper parameters and variadic catchalls (`*args`,
/// `**kwargs`) are dropped; remaining parameters keep their order, kinds,
/// and annotations. A string without a parameter list is returned trimmed.
///
/// # Examples
///
/// ```
/// use aidp_checksum::signature::canonical_signature;
///
/// let raw = "fetch(path: str, config: RunnableConfig, **kwargs) -> str";
/// assert_eq!(canonical_signature(raw), "fetch(path: str) -> str");
/// ```
#[must_use]
pub fn canonical_signature(signature: &str) -> String {
    let signature = signature.trim();

    let Some(open) = signature.find('(') else {
        return signature.to_string();
    };
    let Some(close) = find_matching_paren(signature, open) else {
        return signature.to_string();
    };

    let name = signature[..open].trim();
    let params = &signature[open + 1..close];
    let ret = signature[close + 1..].trim();

    let kept: Vec<String> = split_top_level(params)
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .filter(|p| !is_wrapper_param(p))
        .collect();

    let mut out = format!("{name}({})", kept.join(", "));
    if let Some(annotation) = ret.strip_prefix("->") {
        out.push_str(" -> ");
        out.push_str(annotation.trim());
    }
    out
}

/// Returns `true` for parameters the canonical form excludes.
fn is_wrapper_param(param: &str) -> bool {
    // Catchall variadics are always framework plumbing.
    if param.starts_with('*') {
        return true;
    }
    let name = param
        .split([':', '='])
        .next()
        .unwrap_or(param)
        .trim();
    WRAPPER_PARAMS.contains(&name)
}

/// Find the `)` matching the `(` at `open`, respecting nesting.
fn find_matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0i64;
    for (i, ch) in s[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split a parameter list at commas that are not nested inside brackets.
fn split_top_level(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i64;
    let mut start = 0usize;

    for (i, ch) in params.char_indices() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < params.len() {
        parts.push(&params[start..]);
    }
    parts
}
