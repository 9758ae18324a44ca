//! Post-processing: deterministic cleanup of model-generated summaries.
//!
//! Models asked for "a concise summary, no Markdown" still sometimes wrap the
//! answer in fences, echo the `Resumo:` label from the prompt, or overshoot
//! the length limit. The rules here fix those quirks without a second model
//! call, and the final truncation guarantees the length bound the QR stage
//! relies on.
//!
//! ## Rule Order
//!
//! Line endings are normalised before fence stripping so the fence regex sees
//! `\n` only; whitespace is collapsed before truncation so the limit counts
//! visible characters.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules and truncate to `max_chars` characters.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip outer Markdown fences
/// 3. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Drop a leading `Resumo:` label echoed from the prompt
/// 5. Collapse all whitespace runs to a single space
/// 6. Truncate at a sentence or word boundary
pub fn clean_summary(input: &str, max_chars: usize) -> String {
    let s = normalise_line_endings(input);
    let s = strip_markdown_fences(&s);
    let s = remove_invisible_chars(&s);
    let s = strip_summary_label(&s);
    let s = collapse_whitespace(&s);
    truncate_at_boundary(&s, max_chars)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\n(.*)\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 3: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Drop echoed label ────────────────────────────────────────────────

static RE_SUMMARY_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:\*\*)?resumo(?:\*\*)?\s*:\s*(?:\*\*)?").unwrap());

fn strip_summary_label(input: &str) -> String {
    RE_SUMMARY_LABEL.replace(input, "").to_string()
}

// ── Rule 5: Collapse whitespace ──────────────────────────────────────────────

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Rule 6: Boundary-aware truncation ────────────────────────────────────────

/// Truncate `input` to at most `max_chars` characters (Unicode scalar values).
///
/// Prefers the last sentence end (`.`, `!`, `?`, `;`) in the second half of
/// the allowed window; otherwise cuts at the last space. Never splits a word,
/// except when the first word alone exceeds the limit, in which case it is
/// hard-cut.
pub fn truncate_at_boundary(input: &str, max_chars: usize) -> String {
    let input = input.trim();
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }

    // Byte offset just past the `max_chars`-th character.
    let window_end = input
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(input.len());
    let window = &input[..window_end];

    // A boundary only counts if the character after it starts a new word.
    let next_is_space = |byte_idx: usize| {
        input[byte_idx..]
            .chars()
            .next()
            .is_none_or(char::is_whitespace)
    };

    let half = window.chars().count() / 2;
    let sentence_end = window
        .char_indices()
        .enumerate()
        .filter(|(n, (_, c))| *n >= half && matches!(c, '.' | '!' | '?' | ';'))
        .map(|(_, (i, c))| i + c.len_utf8())
        .filter(|&end| next_is_space(end))
        .last();
    if let Some(end) = sentence_end {
        return window[..end].trim_end().to_string();
    }

    if next_is_space(window_end) {
        return window.trim_end().to_string();
    }
    match window.rfind(char::is_whitespace) {
        Some(space) if !window[..space].trim().is_empty() => window[..space].trim_end().to_string(),
        _ => window.to_string(),
    }
}
