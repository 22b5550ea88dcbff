//! Typed shapes of the JSON replies and their tolerant parsers.
//!
//! Models are asked for bare JSON but answer with fences, prose, numeric
//! strings and missing keys often enough that every parser here starts
//! from [`crate::pipeline::reply::parse_json`] and treats individual
//! fields leniently. Only the fields a stage cannot work without make a
//! reply `Malformed`.

use super::ServiceReply;
use crate::element::{BoundingBox, ElementType, TextContent, Verdict};
use crate::pipeline::reply::parse_json;
use crate::prompts::DEFAULT_BACKGROUND_COLOR;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

// ── Plan ─────────────────────────────────────────────────────────────────

/// Analyst reply. Every field is optional; the orchestrator fills gaps
/// with deterministic defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub is_white_interior: Option<bool>,
    #[serde(default)]
    pub cleaning_goal: Option<String>,
}

pub fn parse_plan(text: &str) -> ServiceReply<Plan> {
    match parse_json::<Plan>(text) {
        Ok(plan) => ServiceReply::Parsed(Plan {
            prompt: non_empty(plan.prompt),
            is_white_interior: plan.is_white_interior,
            cleaning_goal: non_empty(plan.cleaning_goal),
        }),
        Err(reason) => ServiceReply::malformed(text, reason),
    }
}

// ── Critique ─────────────────────────────────────────────────────────────

/// Critic reply. `score` is required; without it the reply is malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Critique {
    /// 0–100.
    pub score: u8,
    pub verdict: Verdict,
    pub reason: String,
    pub improved_prompt: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCritique {
    #[serde(default)]
    score: Option<Value>,
    #[serde(default)]
    verdict: Option<String>,
    #[serde(default, alias = "feedback")]
    reason: Option<String>,
    #[serde(default, alias = "improved_prompt")]
    improved_prompt: Option<String>,
}

pub fn parse_critique(text: &str) -> ServiceReply<Critique> {
    let raw = match parse_json::<RawCritique>(text) {
        Ok(raw) => raw,
        Err(reason) => return ServiceReply::malformed(text, reason),
    };
    let Some(score) = raw.score.as_ref().and_then(score_from_value) else {
        return ServiceReply::malformed(text, "missing or non-numeric score");
    };
    ServiceReply::Parsed(Critique {
        score,
        verdict: raw
            .verdict
            .as_deref()
            .map(Verdict::parse_lenient)
            .unwrap_or(Verdict::Retry),
        reason: raw.reason.unwrap_or_default(),
        improved_prompt: non_empty(raw.improved_prompt),
    })
}

/// Accept `87`, `87.4` or `"87"`; clamp into 0..=100.
fn score_from_value(v: &Value) -> Option<u8> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() {
        return None;
    }
    Some(n.round().clamp(0.0, 100.0) as u8)
}

// ── Text ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawText {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "color")]
    hex_color: Option<String>,
    #[serde(default, alias = "bold")]
    is_bold: Option<bool>,
    #[serde(default, alias = "line_count")]
    line_count: Option<u32>,
    #[serde(default)]
    runs: Vec<RawRun>,
}

#[derive(Deserialize)]
struct RawRun {
    #[serde(default)]
    text: String,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    bold: Option<bool>,
}

/// Transcription reply, either flat (`text`, `hexColor`, `isBold`) or as
/// styled `runs`. Runs are concatenated and the first run's style wins
/// where the flat fields are absent. Malformed when no text was read.
pub fn parse_text(text: &str) -> ServiceReply<TextContent> {
    let raw = match parse_json::<RawText>(text) {
        Ok(raw) => raw,
        Err(reason) => return ServiceReply::malformed(text, reason),
    };
    let first = raw.runs.first();
    let transcript = match non_empty(raw.text) {
        Some(t) => t,
        None => raw.runs.iter().map(|r| r.text.as_str()).collect::<String>(),
    };
    if transcript.trim().is_empty() {
        return ServiceReply::malformed(text, "no text was transcribed");
    }
    ServiceReply::Parsed(TextContent {
        text: transcript.trim().to_string(),
        color: non_empty(raw.hex_color).or_else(|| first.and_then(|r| non_empty(r.color.clone()))),
        is_bold: raw
            .is_bold
            .or_else(|| first.and_then(|r| r.bold))
            .unwrap_or(false),
        line_count: raw.line_count,
    })
}

// ── Detection ────────────────────────────────────────────────────────────

/// One region reported by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedElement {
    #[serde(rename = "type", deserialize_with = "lenient_type")]
    pub element_type: ElementType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "box_2d", alias = "box", alias = "bbox")]
    pub bbox: BoundingBox,
    #[serde(default, alias = "zOrder")]
    pub z_order: i32,
}

/// Whole-slide layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub background_color: String,
    pub elements: Vec<DetectedElement>,
}

impl Detection {
    /// Parse a detection document, skipping entries that cannot be used.
    ///
    /// Accepts the `{backgroundColor, elements}` object or a bare array of
    /// elements. The reply is malformed only when no element list can be
    /// found at all.
    pub fn parse(text: &str) -> ServiceReply<Detection> {
        let value = match parse_json::<Value>(text) {
            Ok(v) => v,
            Err(reason) => return ServiceReply::malformed(text, reason),
        };
        let (background, entries) = match value {
            Value::Array(items) => (None, items),
            Value::Object(mut map) => {
                let background = map
                    .get("backgroundColor")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                match map.remove("elements") {
                    Some(Value::Array(items)) => (background, items),
                    _ => return ServiceReply::malformed(text, "no \"elements\" array"),
                }
            }
            _ => return ServiceReply::malformed(text, "expected an object or array"),
        };

        let mut elements = Vec::with_capacity(entries.len());
        for (i, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<DetectedElement>(entry) {
                Ok(el) => elements.push(el),
                Err(e) => warn!("Skipping detected element #{}: {}", i, e),
            }
        }

        ServiceReply::Parsed(Detection {
            background_color: background.unwrap_or_else(|| DEFAULT_BACKGROUND_COLOR.to_string()),
            elements,
        })
    }
}

fn lenient_type<'de, D: Deserializer<'de>>(d: D) -> Result<ElementType, D::Error> {
    let s = String::deserialize(d)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
