//! Error types for the edgequake-slide2assets library.
//!
//! Three distinct error types reflect three distinct failure scopes:
//!
//! * [`DecomposeError`] — **Fatal**: the run cannot proceed at all (bad input
//!   image, provider not configured, detection unusable). Returned as
//!   `Err(DecomposeError)` from the top-level `decompose*` functions.
//!
//! * [`ElementError`] — **Non-fatal**: a single element failed (degenerate
//!   box, stage retries exhausted, QA never passed) but every other element
//!   is unaffected. Stored on the [`crate::element::Element`] so callers can
//!   inspect partial success rather than losing the whole slide to one bad
//!   element.
//!
//! * [`StageError`] — one failed call to the vision service. Never surfaces
//!   on its own: the stage-level retry wrapper either recovers from it or
//!   folds it into [`ElementError::StageExhausted`].

use crate::element::ElementId;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-slide2assets library.
///
/// Element-level failures use [`ElementError`] and are stored on the element
/// rather than propagated here.
#[derive(Debug, Error)]
pub enum DecomposeError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Image file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes were read but could not be decoded as an image.
    #[error("'{source_name}' is not a decodable image: {detail}")]
    NotAnImage { source_name: String, detail: String },

    // ── Service errors ────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("Vision provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The single detection call failed or returned an unusable layout.
    #[error("Element detection failed: {detail}")]
    DetectionFailed { detail: String },

    // ── Session errors ────────────────────────────────────────────────────
    /// No element with this id exists in the session.
    #[error("Unknown element '{id}'")]
    ElementNotFound { id: ElementId },

    /// A manual action was requested while the element was in a state that
    /// does not allow it (e.g. rerunning an element that is still processing).
    #[error("Element '{id}' cannot {action} while {status}")]
    InvalidElementState {
        id: ElementId,
        action: &'static str,
        status: String,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output asset or the manifest.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The service calls the orchestrator makes per element: the three
/// cleaning stages for visual elements, one transcription for TEXT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Stage {
    Analyst,
    Cleaner,
    Critic,
    Text,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Analyst => f.write_str("Analyst"),
            Stage::Cleaner => f.write_str("Cleaner"),
            Stage::Critic => f.write_str("Critic"),
            Stage::Text => f.write_str("Text"),
        }
    }
}

/// A non-fatal error for a single element.
///
/// Stored on the element when it transitions to FAILED. The run continues
/// for every other element. Messages omit the id; log lines prefix it.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum ElementError {
    /// The padded, clamped crop rectangle has no area.
    #[error("geometry error: {detail}")]
    Geometry { id: ElementId, detail: String },

    /// The routed model requires an entitlement the caller lacks.
    #[error("model '{model}' requires premium access")]
    Entitlement { id: ElementId, model: String },

    /// A stage failed on every attempt of its retry budget.
    #[error("critical error in {stage} stage after {retries} retries: {detail}")]
    StageExhausted {
        id: ElementId,
        stage: Stage,
        retries: u32,
        detail: String,
    },

    /// The self-correction loop ran out of attempts without a passing score.
    #[error("max attempts ({attempts}) reached without passing QA; manual fix required")]
    MaxAttemptsReached { id: ElementId, attempts: u32 },

    /// The worker panicked while holding the element.
    #[error("internal error while processing: {detail}")]
    Panicked { id: ElementId, detail: String },
}

impl ElementError {
    pub fn id(&self) -> &ElementId {
        match self {
            ElementError::Geometry { id, .. }
            | ElementError::Entitlement { id, .. }
            | ElementError::StageExhausted { id, .. }
            | ElementError::MaxAttemptsReached { id, .. }
            | ElementError::Panicked { id, .. } => id,
        }
    }
}

/// One failed invocation of the vision service.
///
/// Every variant is retryable at stage level; the orchestrator treats them
/// uniformly.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    /// Network, HTTP or provider failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not return within its stage timeout.
    #[error("{stage} stage timed out after {secs}s")]
    Timeout { stage: Stage, secs: u64 },

    /// The reply was not the JSON shape the stage expects.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The generation reply carried no inline image.
    #[error("generation returned no image data")]
    MissingImage,

    /// Image bytes were returned but could not be decoded.
    #[error("could not decode generated image: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_exhausted_display() {
        let e = ElementError::StageExhausted {
            id: ElementId::from_index(3),
            stage: Stage::Critic,
            retries: 2,
            detail: "malformed response: missing score".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("Critic"), "got: {msg}");
        assert!(msg.contains("critical error"), "got: {msg}");
    }

    #[test]
    fn max_attempts_display() {
        let e = ElementError::MaxAttemptsReached {
            id: ElementId::from_index(0),
            attempts: 4,
        };
        assert!(e.to_string().contains("max attempts (4)"));
    }

    #[test]
    fn panicked_keeps_its_id() {
        let e = ElementError::Panicked {
            id: ElementId::from_index(7),
            detail: "index out of bounds".into(),
        };
        assert_eq!(e.id(), &ElementId::from_index(7));
        assert!(e.to_string().contains("index out of bounds"));
    }

    #[test]
    fn timeout_display() {
        let e = StageError::Timeout {
            stage: Stage::Cleaner,
            secs: 120,
        };
        assert!(e.to_string().contains("Cleaner"));
        assert!(e.to_string().contains("120s"));
    }

    #[test]
    fn element_error_serialises() {
        let e = ElementError::Entitlement {
            id: ElementId::from_index(1),
            model: "gemini-3-pro-image-preview".into(),
        };
        let json = serde_json::to_string(&e).expect("serialise");
        assert!(json.contains("Entitlement"));
        assert!(json.contains("el-1"));
    }
}
