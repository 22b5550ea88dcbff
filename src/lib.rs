//! # edgequake-slide2assets
//!
//! Decompose a rasterised presentation slide into isolated, transparent
//! element assets using vision and image-generation models.
//!
//! ## Why this crate?
//!
//! A flattened slide (a screenshot, an exported PNG) cannot be edited: the
//! card behind a heading, the icon next to a bullet and the photo under a
//! caption are all one bitmap. This crate asks a vision model where each
//! element is, then rebuilds every non-text element on its own as a clean
//! asset with a transparent background. Each element goes through a small
//! self-correcting loop: one model erases everything that is not the target,
//! a second model grades the result and rewrites the instructions until the
//! grade passes or the attempt budget runs out.
//!
//! ## Pipeline Overview
//!
//! ```text
//! slide
//!  │
//!  ├─ 1. Input     resolve local file or download from URL, decode to RGBA
//!  ├─ 2. Detect    one call: element types + normalised boxes
//!  ├─ 3. Schedule  N workers drain a FIFO queue of elements
//!  │      per element:
//!  │      ├─ crop      box → padded pixel rect, downscale
//!  │      ├─ TEXT      one transcription call (text, colour, weight)
//!  │      ├─ Analyst   plan erase instructions (once)
//!  │      └─ loop ≤ 4  Cleaner → unpad → transparency → Critic
//!  └─ 4. Output    <id>.png assets + manifest.json + run stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_slide2assets::{decompose, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Providers resolved from GEMINI_API_KEY / EDGEQUAKE_LLM_PROVIDER
//!     let config = PipelineConfig::default();
//!     let output = decompose("slide.png", &config).await?;
//!     output.write_to_dir("assets").await?;
//!     eprintln!("{} completed, {} failed",
//!         output.stats.completed,
//!         output.stats.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Bringing your own service
//!
//! Everything that talks to a model goes through the [`VisionService`]
//! trait. Pass an implementation with
//! [`PipelineConfigBuilder::service`], or build a [`Session`] directly with
//! a decoded image and a known layout.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `slide2assets` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! ## Default Models
//!
//! | Stage | Model |
//! |-------|-------|
//! | Detection, Critic | `gemini-3-pro-preview` |
//! | Analyst, TEXT transcription | `gemini-3-flash-preview` |
//! | Cleaner (SHAPE) | `gemini-3-pro-image-preview` (premium) |
//! | Cleaner (ICON, IMAGE) | `gemini-2.5-flash-image` |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod decompose;
pub mod element;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod store;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ModelRouting, PipelineConfig, PipelineConfigBuilder};
pub use decompose::{
    decompose, decompose_sync, decompose_to_dir, decompose_with_layout, detect, detect_layout,
};
pub use element::{
    AttemptRecord, BoundingBox, Element, ElementId, ElementStatus, ElementType, TextContent,
    Verdict,
};
pub use error::{DecomposeError, ElementError, Stage, StageError};
pub use output::{DecompositionOutput, ElementReport, RunStats, UsageStats};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use service::{
    Critique, DetectedElement, Detection, Metered, Plan, ServiceReply, TokenUsage, VisionService,
};
pub use session::Session;
pub use store::{ElementEvent, ElementStore};
pub use stream::element_events;
