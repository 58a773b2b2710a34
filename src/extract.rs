//! Typed field extraction from matched lines.
//!
//! Every coercion fails closed: a capture that does not parse comes back as
//! `None`, the same as a line that never matched.

use crate::patterns::Pattern;
use std::collections::HashMap;

/// Capture groups of the first match of `pattern` in `line`.
///
/// Named groups are keyed by name, unnamed ones by their index ("1", "2",
/// ...). Groups that did not participate in the match are left out.
pub fn extract(line: &str, pattern: &Pattern) -> Option<HashMap<String, String>> {
    let caps = pattern.regex().captures(line)?;
    let fields = pattern
        .regex()
        .capture_names()
        .enumerate()
        .skip(1)
        .filter_map(|(index, name)| {
            let value = caps.get(index)?.as_str().to_string();
            let key = name.map_or_else(|| index.to_string(), str::to_string);
            Some((key, value))
        })
        .collect();
    Some(fields)
}

/// A single text field. Falls back to the first unnamed group when `group`
/// is not a named group of the pattern.
pub fn extract_text(line: &str, pattern: &Pattern, group: &str) -> Option<String> {
    let caps = pattern.regex().captures(line)?;
    caps.name(group)
        .or_else(|| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn extract_int(line: &str, pattern: &Pattern, group: &str) -> Option<i64> {
    extract_text(line, pattern, group)?.trim().parse().ok()
}

/// An integer percentage in 0..=100.
pub fn extract_percentage(line: &str, pattern: &Pattern, group: &str) -> Option<u8> {
    let value = extract_int(line, pattern, group)?;
    u8::try_from(value).ok().filter(|v| *v <= 100)
}
