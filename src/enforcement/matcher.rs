//! Matching rules for tools, paths and operations.
//!
//! These are deliberately conservative:
//! - single-word tool patterns match the first token, so "sudo" fires on
//!   "sudo apt install x" but never mid-command; multi-word command
//!   patterns match by ordered token prefix, so a prohibition on "rm -rf"
//!   never fires on "npm install" just because the letters overlap
//! - path patterns match exactly, by directory-boundary prefix, or by glob;
//!   glob conversion escapes every regex metacharacter before reintroducing
//!   `*`, `?` and `**`, so a hostile pattern cannot smuggle in a
//!   pathological regex
//! - operation patterns are plain case-insensitive substrings

use regex::Regex;

/// Does `tool` fall under `pattern`?
pub fn tool_matches(pattern: &str, tool: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split_whitespace().collect();
    let tool_tokens: Vec<&str> = tool.split_whitespace().collect();

    match pattern_tokens.len() {
        0 => false,
        // First-token match covers both the bare tool name and a command
        // with arguments, without letting "sudo" fire on "sudoku".
        1 => tool_tokens.first() == Some(&pattern_tokens[0]),
        _ => {
            // Ordered token prefix: every pattern token must match the
            // corresponding tool token.
            tool_tokens.len() >= pattern_tokens.len()
                && pattern_tokens
                    .iter()
                    .zip(tool_tokens.iter())
                    .all(|(p, t)| p == t)
        }
    }
}

/// Does `path` fall under `pattern`?
pub fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    // Directory-boundary prefix: "src" matches "src/main.rs" but not
    // "srcery/main.rs".
    if !pattern.contains('*') && !pattern.contains('?') {
        let prefix = pattern.trim_end_matches('/');
        if path.starts_with(prefix)
            && path.as_bytes().get(prefix.len()) == Some(&b'/')
        {
            return true;
        }
        return false;
    }
    match glob_to_regex(pattern) {
        Some(re) => re.is_match(path),
        None => false,
    }
}

/// Does `text` contain `operation`, case-insensitively?
pub fn operation_matches(operation: &str, text: &str) -> bool {
    if operation.is_empty() {
        return false;
    }
    text.to_lowercase().contains(&operation.to_lowercase())
}

/// Convert a glob pattern to an anchored regex.
///
/// Every character is escaped first; `*`, `?` and `**` are then
/// reintroduced with their glob meanings (`*` and `?` stop at `/`,
/// `**` crosses directories).
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut regex = String::with_capacity(pattern.len() * 2 + 2);
    regex.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Optionally swallow a following slash so "src/**"
                    // also matches "src" contents at any depth.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).ok()
}
