//! Progress-callback trait for per-element extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as workers move elements through the pipeline.
//!
//! Callbacks suit a host that wants a push interface (a terminal progress
//! bar, a WebSocket). For pull-style observation of every state merge, see
//! [`crate::stream::element_events`].
//!
//! # Example
//!
//! ```rust
//! use edgequake_slide2assets::{ElementId, ExtractionProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: Arc<AtomicUsize>,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_element_complete(&self, id: &ElementId, attempts: u32, score: u8) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{id} passed QA with {score} after {attempts} attempt(s)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     completed: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::element::{ElementId, ElementType};
use std::sync::Arc;

/// Called by the workers as they process each element.
///
/// Implementations must be `Send + Sync`: every method except the run-level
/// ones may be called concurrently from different workers. All methods have
/// default no-op implementations so callers only override what they care
/// about.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once before any worker starts.
    ///
    /// # Arguments
    /// * `total` — number of elements queued for processing
    fn on_run_start(&self, total: usize) {
        let _ = total;
    }

    /// Called when a worker takes an element.
    fn on_element_start(&self, id: &ElementId, element_type: ElementType) {
        let _ = (id, element_type);
    }

    /// Called after every scored self-correction iteration.
    ///
    /// # Arguments
    /// * `attempt` — 1-based attempt number
    /// * `max`     — attempt budget
    /// * `score`   — the Critic's score for this attempt
    fn on_attempt(&self, id: &ElementId, attempt: u32, max: u32, score: u8) {
        let _ = (id, attempt, max, score);
    }

    /// Called when an element passes QA.
    fn on_element_complete(&self, id: &ElementId, attempts: u32, score: u8) {
        let _ = (id, attempts, score);
    }

    /// Called when a TEXT element has been transcribed.
    fn on_text_complete(&self, id: &ElementId) {
        let _ = id;
    }

    /// Called when an element ends FAILED.
    ///
    /// # Arguments
    /// * `reason` — human-readable failure description
    fn on_element_failed(&self, id: &ElementId, reason: String) {
        let _ = (id, reason);
    }

    /// Called once after every worker has finished.
    fn on_run_complete(&self, total: usize, completed: usize) {
        let _ = (total, completed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
