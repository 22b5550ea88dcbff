//! Data model for one detected slide element.
//!
//! An [`Element`] is the unit of work: it is created once from the detection
//! result, lives in the [`crate::store::ElementStore`] for the whole run, and
//! is only ever mutated through the store's merge entry point by the worker
//! currently holding it.
//!
//! ## Status lifecycle
//!
//! ```text
//! PENDING ──▶ PROCESSING ──▶ COMPLETED
//!    ▲                  └──▶ FAILED
//!    └────── manual rerun / reset ◀──┘
//! ```
//!
//! [`Element::transition_to`] enforces the forward edges; the backward edge
//! exists only through [`Element::reopen`] and [`Element::reset`], which are
//! reached from explicit user actions.

use crate::error::ElementError;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Upper bound of the normalised box coordinate space.
pub const BOX_SCALE: f64 = 1000.0;

// ── Identity ─────────────────────────────────────────────────────────────

/// Stable identifier of an element for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    /// Id assigned to the `index`-th detected element (`el-0`, `el-1`, …).
    pub fn from_index(index: usize) -> Self {
        Self(format!("el-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Type ─────────────────────────────────────────────────────────────────

/// Kind of visual region the detector found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ElementType {
    /// Readable text. Transcribed, never cleaned.
    Text,
    /// Geometric backgrounds, cards, lines.
    Shape,
    /// Small symbols, logos, arrows.
    Icon,
    /// Photos, screenshots, illustrations.
    Image,
}

impl ElementType {
    /// Whether the element goes through the cleaning loop.
    pub fn is_visual(self) -> bool {
        !matches!(self, ElementType::Text)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::Text => "TEXT",
            ElementType::Shape => "SHAPE",
            ElementType::Icon => "ICON",
            ElementType::Image => "IMAGE",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Ok(ElementType::Text),
            "SHAPE" => Ok(ElementType::Shape),
            "ICON" => Ok(ElementType::Icon),
            "IMAGE" => Ok(ElementType::Image),
            other => Err(format!("unknown element type '{other}'")),
        }
    }
}

// ── Box ──────────────────────────────────────────────────────────────────

/// Bounding rectangle normalised to `[0, 1000]` on both axes.
///
/// Serialised as the detector's `[ymin, xmin, ymax, xmax]` array. Every
/// constructor clamps coordinates into range and orders each pair, so an
/// out-of-range or inverted box from the model never reaches the geometry
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub ymin: f64,
    pub xmin: f64,
    pub ymax: f64,
    pub xmax: f64,
}

impl BoundingBox {
    pub fn new(ymin: f64, xmin: f64, ymax: f64, xmax: f64) -> Self {
        let clamp = |v: f64| {
            if v.is_nan() {
                0.0
            } else {
                v.clamp(0.0, BOX_SCALE)
            }
        };
        let (y0, y1) = (clamp(ymin), clamp(ymax));
        let (x0, x1) = (clamp(xmin), clamp(xmax));
        Self {
            ymin: y0.min(y1),
            xmin: x0.min(x1),
            ymax: y0.max(y1),
            xmax: x0.max(x1),
        }
    }

    /// True when the box has strictly positive extent on both axes.
    pub fn is_proper(&self) -> bool {
        self.ymin < self.ymax && self.xmin < self.xmax
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.ymin, b.xmin, b.ymax, b.xmax]
    }
}

// ── Status ───────────────────────────────────────────────────────────────

/// Processing state of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ElementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ElementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ElementStatus::Completed | ElementStatus::Failed)
    }

    /// Forward edges of the lifecycle. Going back to `Pending` is not a
    /// transition; it is a manual reopen or reset.
    pub fn can_transition_to(self, next: ElementStatus) -> bool {
        matches!(
            (self, next),
            (ElementStatus::Pending, ElementStatus::Processing)
                | (ElementStatus::Processing, ElementStatus::Completed)
                | (ElementStatus::Processing, ElementStatus::Failed)
        )
    }
}

impl fmt::Display for ElementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ElementStatus::Pending => "PENDING",
            ElementStatus::Processing => "PROCESSING",
            ElementStatus::Completed => "COMPLETED",
            ElementStatus::Failed => "FAILED",
        })
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ElementStatus,
    pub to: ElementStatus,
}

// ── History ──────────────────────────────────────────────────────────────

/// The Critic's self-reported verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Retry,
}

impl Verdict {
    /// Anything other than an explicit `PASS` counts as a retry request.
    pub fn parse_lenient(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("PASS") {
            Verdict::Pass
        } else {
            Verdict::Retry
        }
    }
}

/// One completed iteration of the self-correction loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number within the current attempt budget.
    pub attempt: u32,
    /// Cleaner model used for this attempt.
    pub model: String,
    /// Prompt sent to the Cleaner.
    pub prompt: String,
    pub verdict: Verdict,
    pub score: u8,
    /// The Critic's diagnostic.
    pub feedback: String,
    /// Whether the attempt met the local pass condition.
    pub passed: bool,
    /// Unix epoch milliseconds when the attempt was recorded.
    pub timestamp_ms: u64,
}

impl AttemptRecord {
    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

// ── Text ─────────────────────────────────────────────────────────────────

/// What the transcription stage read from a TEXT element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
    /// `#RRGGBB`, when the model reported one.
    pub color: Option<String>,
    pub is_bold: bool,
    pub line_count: Option<u32>,
}

// ── Element ──────────────────────────────────────────────────────────────

/// One detected visual region of the source slide and its extraction state.
///
/// Pixel buffers are held behind `Arc` so snapshots handed to observers are
/// cheap to clone.
#[derive(Debug, Clone)]
pub struct Element {
    pub id: ElementId,
    pub element_type: ElementType,
    pub description: Option<String>,
    pub bbox: BoundingBox,
    /// Stacking order reported by the detector (lower is further back).
    pub z_order: i32,

    status: ElementStatus,
    /// Completed self-correction iterations in the current attempt budget.
    pub attempts: u32,

    // Planning state from the Analyst, carried across iterations and reruns.
    pub active_prompt: Option<String>,
    pub cleaning_goal: Option<String>,
    pub is_white_interior: bool,

    history: Vec<AttemptRecord>,
    pub last_qa_score: Option<u8>,
    pub last_qa_feedback: Option<String>,
    pub failure: Option<ElementError>,

    pub original_crop: Option<Arc<RgbaImage>>,
    pub cleaned_image: Option<Arc<RgbaImage>>,
    /// Transcription of a TEXT element.
    pub text: Option<TextContent>,
    /// Wall-clock time of the most recent processing run.
    pub processing_ms: Option<u64>,
}

impl Element {
    pub fn new(
        id: ElementId,
        element_type: ElementType,
        description: Option<String>,
        bbox: BoundingBox,
        z_order: i32,
    ) -> Self {
        Self {
            id,
            element_type,
            description,
            bbox,
            z_order,
            status: ElementStatus::Pending,
            attempts: 0,
            active_prompt: None,
            cleaning_goal: None,
            is_white_interior: false,
            history: Vec::new(),
            last_qa_score: None,
            last_qa_feedback: None,
            failure: None,
            original_crop: None,
            cleaned_image: None,
            text: None,
            processing_ms: None,
        }
    }

    pub fn status(&self) -> ElementStatus {
        self.status
    }

    pub fn history(&self) -> &[AttemptRecord] {
        &self.history
    }

    /// Short log prefix, e.g. `[el-4]`.
    pub fn label(&self) -> String {
        format!("[{}]", self.id)
    }

    /// Move along a forward edge of the lifecycle.
    pub fn transition_to(&mut self, next: ElementStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark the element FAILED with a reason. Only valid while processing.
    pub fn fail(&mut self, error: ElementError) -> Result<(), TransitionError> {
        self.transition_to(ElementStatus::Failed)?;
        self.failure = Some(error);
        Ok(())
    }

    /// Append a completed attempt and mirror its critique into the
    /// `last_qa_*` fields. History is append-only.
    pub fn record_attempt(&mut self, record: AttemptRecord) {
        self.last_qa_score = Some(record.score);
        self.last_qa_feedback = Some(record.feedback.clone());
        self.history.push(record);
    }

    /// Reopen a terminal element for a manual rerun.
    ///
    /// Grants a fresh attempt budget and keeps history plus the Analyst's
    /// planning state. A prompt override replaces the active prompt, which
    /// also means the Analyst will not run again.
    pub fn reopen(&mut self, prompt_override: Option<String>) -> Result<(), TransitionError> {
        if !self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                to: ElementStatus::Pending,
            });
        }
        self.status = ElementStatus::Pending;
        self.attempts = 0;
        self.failure = None;
        if let Some(prompt) = prompt_override {
            self.active_prompt = Some(prompt);
        }
        Ok(())
    }

    /// Discard every derived field and return to PENDING, optionally with a
    /// corrected box. Not allowed while a worker holds the element.
    pub fn reset(&mut self, bbox: Option<BoundingBox>) -> Result<(), TransitionError> {
        if self.status == ElementStatus::Processing {
            return Err(TransitionError {
                from: self.status,
                to: ElementStatus::Pending,
            });
        }
        if let Some(b) = bbox {
            self.bbox = b;
        }
        self.status = ElementStatus::Pending;
        self.attempts = 0;
        self.active_prompt = None;
        self.cleaning_goal = None;
        self.is_white_interior = false;
        self.history.clear();
        self.last_qa_score = None;
        self.last_qa_feedback = None;
        self.failure = None;
        self.original_crop = None;
        self.cleaned_image = None;
        self.text = None;
        self.processing_ms = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> Element {
        Element::new(
            ElementId::from_index(0),
            ElementType::Shape,
            Some("blue card".into()),
            BoundingBox::new(100.0, 100.0, 200.0, 300.0),
            1,
        )
    }

    fn record(attempt: u32, score: u8) -> AttemptRecord {
        AttemptRecord {
            attempt,
            model: "m".into(),
            prompt: "p".into(),
            verdict: Verdict::Retry,
            score,
            feedback: format!("attempt {attempt}"),
            passed: false,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn box_is_clamped_and_ordered() {
        let b = BoundingBox::new(1200.0, -5.0, 300.0, 50.0);
        assert_eq!(b.ymin, 300.0);
        assert_eq!(b.ymax, 1000.0);
        assert_eq!(b.xmin, 0.0);
        assert_eq!(b.xmax, 50.0);
        assert!(b.is_proper());
    }

    #[test]
    fn box_nan_becomes_zero() {
        let b = BoundingBox::new(f64::NAN, 10.0, 20.0, 30.0);
        assert_eq!(b.ymin, 0.0);
    }

    #[test]
    fn box_deserialises_from_array_with_clamping() {
        let b: BoundingBox = serde_json::from_str("[10, 20, 1500, 40]").expect("box");
        assert_eq!(b, BoundingBox::new(10.0, 20.0, 1000.0, 40.0));
        let back = serde_json::to_string(&b).expect("ser");
        assert_eq!(back, "[10.0,20.0,1000.0,40.0]");
    }

    #[test]
    fn element_type_parses_case_insensitively() {
        assert_eq!("icon".parse::<ElementType>(), Ok(ElementType::Icon));
        assert_eq!(" IMAGE ".parse::<ElementType>(), Ok(ElementType::Image));
        assert!("CHART".parse::<ElementType>().is_err());
        assert!(!ElementType::Text.is_visual());
        assert!(ElementType::Shape.is_visual());
    }

    #[test]
    fn forward_transitions_only() {
        let mut el = shape();
        assert!(el.transition_to(ElementStatus::Completed).is_err());
        el.transition_to(ElementStatus::Processing).expect("start");
        assert!(el.transition_to(ElementStatus::Processing).is_err());
        el.transition_to(ElementStatus::Completed).expect("complete");
        assert!(el.transition_to(ElementStatus::Failed).is_err());
        assert!(el.transition_to(ElementStatus::Pending).is_err());
    }

    #[test]
    fn reopen_requires_terminal_state_and_keeps_history() {
        let mut el = shape();
        assert!(el.reopen(None).is_err());

        el.transition_to(ElementStatus::Processing).expect("start");
        el.cleaning_goal = Some("goal".into());
        el.is_white_interior = true;
        el.record_attempt(record(1, 40));
        el.attempts = 1;
        el.fail(ElementError::MaxAttemptsReached {
            id: el.id.clone(),
            attempts: 1,
        })
        .expect("fail");

        el.reopen(Some("manual prompt".into())).expect("reopen");
        assert_eq!(el.status(), ElementStatus::Pending);
        assert_eq!(el.attempts, 0);
        assert_eq!(el.history().len(), 1);
        assert_eq!(el.active_prompt.as_deref(), Some("manual prompt"));
        assert_eq!(el.cleaning_goal.as_deref(), Some("goal"));
        assert!(el.is_white_interior);
        assert!(el.failure.is_none());
    }

    #[test]
    fn reset_clears_everything_but_identity() {
        let mut el = shape();
        el.transition_to(ElementStatus::Processing).expect("start");
        el.active_prompt = Some("p".into());
        el.record_attempt(record(1, 90));
        el.text = Some(TextContent {
            text: "stale".into(),
            color: None,
            is_bold: false,
            line_count: None,
        });
        el.transition_to(ElementStatus::Completed).expect("done");

        let nudged = BoundingBox::new(110.0, 100.0, 210.0, 300.0);
        el.reset(Some(nudged)).expect("reset");
        assert_eq!(el.status(), ElementStatus::Pending);
        assert_eq!(el.bbox, nudged);
        assert!(el.history().is_empty());
        assert!(el.active_prompt.is_none());
        assert!(el.last_qa_score.is_none());
        assert!(el.text.is_none());
    }

    #[test]
    fn reset_refused_while_processing() {
        let mut el = shape();
        el.transition_to(ElementStatus::Processing).expect("start");
        assert!(el.reset(None).is_err());
    }

    #[test]
    fn record_attempt_mirrors_last_critique() {
        let mut el = shape();
        el.record_attempt(record(1, 40));
        el.record_attempt(record(2, 70));
        assert_eq!(el.last_qa_score, Some(70));
        assert_eq!(el.last_qa_feedback.as_deref(), Some("attempt 2"));
        assert_eq!(
            el.history().iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn verdict_is_lenient() {
        assert_eq!(Verdict::parse_lenient("pass"), Verdict::Pass);
        assert_eq!(Verdict::parse_lenient("RETRY"), Verdict::Retry);
        assert_eq!(Verdict::parse_lenient("maybe"), Verdict::Retry);
    }
}
