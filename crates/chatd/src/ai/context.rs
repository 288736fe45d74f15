// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Context extraction and language heuristic for the AI response pipeline.

use std::sync::OnceLock;

use regex::Regex;

/// Closed set of Portuguese function-word markers (see GLOSSARY). Membership
/// is a heuristic: it only selects between two prompt templates and has no
/// correctness consequence beyond that.
const PORTUGUESE_MARKERS: &[&str] =
    &["como", "está", "olá", "bom dia", "boa tarde", "obrigado", "não", "qual", "para"];

fn user_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| build_static_regex(r"^[^:\[\]\n]+: .*$"))
}

fn system_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| build_static_regex(r"^\[.*\]$"))
}

/// Compile a pattern known at compile time to be valid. Falls back to a
/// regex that matches nothing rather than panicking if it somehow isn't —
/// a typo here should degrade context extraction, not take the process down.
fn build_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| {
        tracing::error!(pattern, err = %e, "static regex pattern failed to compile");
        // "$.^" is a trivially valid pattern that never matches.
        Regex::new("$.^").unwrap_or_else(|_| unreachable!("literal pattern always compiles"))
    })
}

/// Does `line` look like a `<name>: <text>` or `[<text>]` history entry?
pub fn looks_like_message(line: &str) -> bool {
    user_line_re().is_match(line) || system_line_re().is_match(line)
}

/// Keep the tail-most `take_last` lines of `history` that look like
/// messages, preserving their relative order.
pub fn extract_context(history: &str, take_last: usize) -> Vec<String> {
    let filtered: Vec<&str> = history.lines().filter(|l| looks_like_message(l)).collect();
    let start = filtered.len().saturating_sub(take_last);
    filtered[start..].iter().map(|s| s.to_string()).collect()
}

/// Closed-set membership heuristic for whether `text` looks Portuguese.
pub fn looks_portuguese(text: &str) -> bool {
    let normalized = text.to_lowercase();
    let words: Vec<&str> = normalized.split_whitespace().collect();
    PORTUGUESE_MARKERS.iter().any(|marker| {
        if marker.contains(' ') {
            normalized.contains(marker)
        } else {
            words.iter().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == *marker)
        }
    })
}

/// The last history entry that looks like a user message (`<name>: <text>`),
/// used by the simplified fallback request.
pub fn last_user_line(context_lines: &[String]) -> Option<&str> {
    context_lines.iter().rev().find(|l| user_line_re().is_match(l)).map(String::as_str)
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
