//! Wildcard pattern matching for endpoint and URL rules.
//!
//! Policies and cache rules use `*` globs (`*.example.com`, `*/weather/*`).
//! A pattern is compiled to an anchored, case-insensitive regex; a pattern
//! without `*` is an exact (case-insensitive) match.

use regex::RegexBuilder;

/// Returns `true` when `text` matches the `*`-glob `pattern`.
///
/// Invalid patterns never match.
pub(crate) fn matches(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern.eq_ignore_ascii_case(text);
    }

    let escaped: String = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    let anchored = format!("^{escaped}$");

    match RegexBuilder::new(&anchored).case_insensitive(true).build() {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

/// Returns `true` when `text` matches any of the given patterns.
pub(crate) fn matches_any(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|p| matches(p, text))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
