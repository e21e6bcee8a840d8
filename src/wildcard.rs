//! `*`-glob pattern matching for model allow-lists and pricing keys.
//!
//! Only `*` is special (it matches any run of characters, including the
//! empty run); every other character is literal, so regex metacharacters in
//! model names need no escaping. Matching is case-insensitive.

/// Test whether `pattern` matches `text`.
///
/// Uses the classic two-pointer walk with single-star backtracking, which is
/// linear in practice for the short patterns used in config files.
pub fn matches(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();
    let t: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    // Position of the most recent `*` and the text position it was tried at.
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            // Backtrack: let the last `*` swallow one more character.
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    // Trailing stars match the empty run.
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Find the first pattern in `patterns` that matches `text`.
///
/// An exact (star-free, case-insensitive) match anywhere in the list wins
/// over wildcard matches; among wildcards, sequence order decides.
pub fn find_first<'a>(patterns: &'a [String], text: &str) -> Option<&'a str> {
    if let Some(exact) = patterns
        .iter()
        .find(|p| !p.contains('*') && p.eq_ignore_ascii_case(text))
    {
        return Some(exact);
    }
    patterns
        .iter()
        .find(|p| matches(p, text))
        .map(String::as_str)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
