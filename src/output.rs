//! Output types returned by a decomposition run, and writing them to disk.

use crate::element::{
    AttemptRecord, BoundingBox, Element, ElementId, ElementStatus, ElementType, TextContent,
};
use crate::error::{DecomposeError, ElementError};
use crate::service::TokenUsage;
use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// File name of the JSON manifest written next to the assets.
pub const MANIFEST_FILE: &str = "manifest.json";

// ── Usage ────────────────────────────────────────────────────────────────

/// Aggregated token counts for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub calls: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Token usage per model, sorted by model name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageStats {
    pub by_model: BTreeMap<String, TokenCounts>,
}

impl UsageStats {
    pub fn record(&mut self, usage: &TokenUsage) {
        let entry = self.by_model.entry(usage.model.clone()).or_default();
        entry.calls += 1;
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
    }

    pub fn total(&self) -> TokenCounts {
        self.by_model
            .values()
            .fold(TokenCounts::default(), |acc, c| TokenCounts {
                calls: acc.calls + c.calls,
                input_tokens: acc.input_tokens + c.input_tokens,
                output_tokens: acc.output_tokens + c.output_tokens,
            })
    }
}

// ── Stats ────────────────────────────────────────────────────────────────

/// Aggregate statistics for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_elements: usize,
    /// SHAPE, ICON and IMAGE elements.
    pub visual_elements: usize,
    /// TEXT elements, transcribed rather than cleaned.
    pub text_elements: usize,
    pub completed: usize,
    pub failed: usize,
    /// Highest number of elements observed in PROCESSING at once.
    pub peak_concurrency: usize,
    pub total_duration_ms: u64,
    pub usage: UsageStats,
}

impl RunStats {
    /// Count element states. Duration and usage are filled by the caller.
    pub fn from_elements(elements: &[Element]) -> Self {
        let visual_elements = elements.iter().filter(|e| e.element_type.is_visual()).count();
        Self {
            total_elements: elements.len(),
            visual_elements,
            text_elements: elements.len() - visual_elements,
            completed: count(elements, ElementStatus::Completed),
            failed: count(elements, ElementStatus::Failed),
            ..Default::default()
        }
    }
}

fn count(elements: &[Element], status: ElementStatus) -> usize {
    elements.iter().filter(|e| e.status() == status).count()
}

// ── Reports ──────────────────────────────────────────────────────────────

/// Everything known about one element, minus pixel buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementReport {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub description: Option<String>,
    #[serde(rename = "box_2d")]
    pub bbox: BoundingBox,
    pub z_order: i32,
    pub status: ElementStatus,
    pub attempts: u32,
    pub active_prompt: Option<String>,
    pub cleaning_goal: Option<String>,
    pub is_white_interior: bool,
    pub history: Vec<AttemptRecord>,
    pub last_qa_score: Option<u8>,
    pub last_qa_feedback: Option<String>,
    pub failure: Option<ElementError>,
    pub processing_ms: Option<u64>,
    /// Transcript of a COMPLETED TEXT element.
    pub text: Option<TextContent>,
    /// Asset file name relative to the output directory, for COMPLETED elements.
    pub asset: Option<String>,
}

impl From<&Element> for ElementReport {
    fn from(e: &Element) -> Self {
        Self {
            id: e.id.clone(),
            element_type: e.element_type,
            description: e.description.clone(),
            bbox: e.bbox,
            z_order: e.z_order,
            status: e.status(),
            attempts: e.attempts,
            active_prompt: e.active_prompt.clone(),
            cleaning_goal: e.cleaning_goal.clone(),
            is_white_interior: e.is_white_interior,
            history: e.history().to_vec(),
            last_qa_score: e.last_qa_score,
            last_qa_feedback: e.last_qa_feedback.clone(),
            failure: e.failure.clone(),
            processing_ms: e.processing_ms,
            text: e.text.clone(),
            asset: (e.status() == ElementStatus::Completed && e.cleaned_image.is_some())
                .then(|| asset_file_name(&e.id)),
        }
    }
}

/// `el-3` → `el-3.png`.
pub fn asset_file_name(id: &ElementId) -> String {
    format!("{id}.png")
}

/// Complete result of decomposing one slide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionOutput {
    pub source: String,
    pub image_width: u32,
    pub image_height: u32,
    pub background_color: String,
    /// Elements in detection order.
    pub elements: Vec<ElementReport>,
    pub stats: RunStats,
    /// Human-readable run log.
    pub log: Vec<String>,
    /// Transparent assets of COMPLETED elements.
    #[serde(skip)]
    pub assets: BTreeMap<ElementId, Arc<RgbaImage>>,
}

impl DecompositionOutput {
    /// Write every asset as `<id>.png` plus `manifest.json` into `dir`.
    ///
    /// Each file is written to a temporary sibling and renamed into place,
    /// so a crash never leaves a truncated PNG behind.
    pub async fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<(), DecomposeError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DecomposeError::OutputWriteFailed {
                path: dir.clone(),
                source: e,
            })?;

        for (id, image) in &self.assets {
            let path = dir.join(asset_file_name(id));
            let image = Arc::clone(image);
            let target = path.clone();
            tokio::task::spawn_blocking(move || {
                let mut buf = Vec::new();
                image
                    .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                write_atomic(&target, &buf)
            })
            .await
            .map_err(|e| DecomposeError::Internal(format!("Write task panicked: {e}")))?
            .map_err(|e| DecomposeError::OutputWriteFailed {
                path: path.clone(),
                source: e,
            })?;
            debug!("Wrote {}", path.display());
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| DecomposeError::Internal(format!("manifest serialisation: {e}")))?;
        let target = manifest_path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &json))
            .await
            .map_err(|e| DecomposeError::Internal(format!("Write task panicked: {e}")))?
            .map_err(|e| DecomposeError::OutputWriteFailed {
                path: manifest_path.clone(),
                source: e,
            })?;

        info!(
            "Wrote {} assets and {} to {}",
            self.assets.len(),
            MANIFEST_FILE,
            dir.display()
        );
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
