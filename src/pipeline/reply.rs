//! Post-processing: recover a JSON document from raw model text.
//!
//! Even when asked for bare JSON, chat models routinely wrap the object in
//! ` ```json ... ``` ` fences or add a sentence before it. These rules run
//! before `serde_json` sees the text:
//!
//! 1. Normalise line endings (CRLF → LF) and strip a BOM
//! 2. Strip outer markdown fences (with or without a language tag)
//! 3. If the text still does not start with `{` or `[`, cut from the first
//!    opening brace to the last matching closing one
//!
//! Anything that still fails to parse is the caller's malformed-reply case.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\n?(.*?)\n?```\s*$").expect("valid fence regex")
});

/// Apply the cleanup rules and return the text most likely to be JSON.
pub fn clean_json_text(input: &str) -> String {
    let s = input.replace("\r\n", "\n").replace('\u{FEFF}', "");
    let s = strip_fences(s.trim());
    let trimmed = s.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed.to_string();
    }
    extract_embedded(trimmed).unwrap_or(trimmed).to_string()
}

/// Clean `input` and deserialise it, returning a readable reason on failure.
pub fn parse_json<T: DeserializeOwned>(input: &str) -> Result<T, String> {
    let cleaned = clean_json_text(input);
    if cleaned.is_empty() {
        return Err("empty response".to_string());
    }
    serde_json::from_str(&cleaned).map_err(|e| format!("{e} in {}", preview(&cleaned)))
}

fn strip_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn extract_embedded(input: &str) -> Option<&str> {
    let start = input.find(['{', '['])?;
    let close = if input[start..].starts_with('{') { '}' } else { ']' };
    let end = input.rfind(close)?;
    (end > start).then(|| &input[start..=end])
}

fn preview(s: &str) -> String {
    const MAX: usize = 120;
    if s.chars().count() <= MAX {
        format!("{s:?}")
    } else {
        let head: String = s.chars().take(MAX).collect();
        format!("{head:?}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn strips_json_fence() {
        let input = "```json\n{\"a\": 1}\n```";
        assert_eq!(clean_json_text(input), "{\"a\": 1}");
    }

    #[test]
    fn strips_bare_fence() {
        let input = "```\n[1, 2]\n```\n";
        assert_eq!(clean_json_text(input), "[1, 2]");
    }

    #[test]
    fn passthrough_plain_json() {
        assert_eq!(clean_json_text("  {\"a\":true}  "), "{\"a\":true}");
    }

    #[test]
    fn extracts_object_after_prose() {
        let input = "Sure! Here is the plan:\n{\"prompt\": \"x\"}\nHope that helps.";
        assert_eq!(clean_json_text(input), "{\"prompt\": \"x\"}");
    }

    #[test]
    fn crlf_and_bom_are_normalised() {
        let input = "\u{FEFF}```json\r\n{\"a\": 1}\r\n```";
        let v: Value = parse_json(input).expect("parse");
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn parse_failure_has_reason() {
        let err = parse_json::<Value>("I cannot help with that.").expect_err("not json");
        assert!(!err.is_empty());
        let err = parse_json::<Value>("").expect_err("empty");
        assert_eq!(err, "empty response");
    }
}
