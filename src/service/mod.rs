//! The external vision/generation capability the pipeline depends on.
//!
//! [`VisionService`] is the only seam between the extraction core and the
//! network. The orchestrator calls it through `Arc<dyn VisionService>`, so
//! tests substitute a scripted implementation and the production crate uses
//! [`provider::ProviderVisionService`].
//!
//! JSON-shaped replies come back as [`ServiceReply`]: either a typed payload
//! or an explicit `Malformed` variant carrying the raw text. Callers decide
//! what malformed means for their stage (a fallback for the Analyst, a
//! stage failure for the Critic) by matching on the variant.

pub mod payload;
pub mod provider;

pub use payload::{Critique, DetectedElement, Detection, Plan};

use crate::element::{ElementType, TextContent};
use crate::error::StageError;
use async_trait::async_trait;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Tokens consumed by one service call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(model: impl Into<String>, input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            model: model.into(),
            input_tokens,
            output_tokens,
        }
    }
}

/// A service result together with what it cost.
#[derive(Debug, Clone)]
pub struct Metered<T> {
    pub value: T,
    pub usage: TokenUsage,
}

impl<T> Metered<T> {
    pub fn new(value: T, usage: TokenUsage) -> Self {
        Self { value, usage }
    }
}

/// Outcome of parsing a JSON-shaped reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceReply<T> {
    Parsed(T),
    /// The text did not contain the expected structure.
    Malformed { raw: String, reason: String },
}

impl<T> ServiceReply<T> {
    pub fn malformed(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        ServiceReply::Malformed {
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    /// Treat a malformed reply as a failed call.
    pub fn into_result(self) -> Result<T, StageError> {
        match self {
            ServiceReply::Parsed(v) => Ok(v),
            ServiceReply::Malformed { reason, .. } => Err(StageError::Malformed(reason)),
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────────────

/// Input of the Analyst call.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub model: &'a str,
    pub crop: &'a RgbaImage,
    pub element_type: ElementType,
    pub description: Option<&'a str>,
    pub background_color: &'a str,
}

/// Input of the Cleaner call.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    /// Square, white-padded crop.
    pub image: &'a RgbaImage,
    /// Full erase instruction text.
    pub instruction: &'a str,
}

/// Input of the Critic call.
#[derive(Debug, Clone, Copy)]
pub struct CritiqueRequest<'a> {
    pub model: &'a str,
    pub original: &'a RgbaImage,
    pub candidate: &'a RgbaImage,
    pub cleaning_goal: &'a str,
}

/// Input of the TEXT transcription call.
#[derive(Debug, Clone, Copy)]
pub struct TextRequest<'a> {
    pub model: &'a str,
    pub crop: &'a RgbaImage,
}

/// Input of the one-shot layout detection.
#[derive(Debug, Clone, Copy)]
pub struct DetectRequest<'a> {
    pub model: &'a str,
    pub slide: &'a RgbaImage,
}

// ── Trait ────────────────────────────────────────────────────────────────

/// Image-capable AI service used by every stage.
///
/// Implementations perform exactly one remote call per method invocation
/// and do not retry; retry and timeout policy belong to the caller.
#[async_trait]
pub trait VisionService: Send + Sync {
    /// Plan erase instructions for one element.
    async fn plan(&self, request: PlanRequest<'_>) -> Result<Metered<ServiceReply<Plan>>, StageError>;

    /// Produce a cleaned candidate. A reply without image data is
    /// [`StageError::MissingImage`].
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<Metered<RgbaImage>, StageError>;

    /// Score a candidate against the original crop.
    async fn critique(
        &self,
        request: CritiqueRequest<'_>,
    ) -> Result<Metered<ServiceReply<Critique>>, StageError>;

    /// Read the text, colour and weight of a TEXT element's crop.
    async fn analyze_text(
        &self,
        request: TextRequest<'_>,
    ) -> Result<Metered<ServiceReply<TextContent>>, StageError> {
        let _ = request;
        Err(StageError::Transport(
            "this service does not support text transcription".into(),
        ))
    }

    /// Decompose a whole slide into elements.
    async fn detect(
        &self,
        request: DetectRequest<'_>,
    ) -> Result<Metered<ServiceReply<Detection>>, StageError> {
        let _ = request;
        Err(StageError::Transport(
            "this service does not support layout detection".into(),
        ))
    }
}
