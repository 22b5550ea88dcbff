//! One decomposition run over one slide.
//!
//! A [`Session`] owns the decoded slide, the element store and the service
//! handle. [`Session::run_all`] drains every pending element through the
//! worker pool, cleaning visual elements and transcribing TEXT. The manual
//! actions (`rerun`, `set_retry_prompt`, `reset`) let a caller nudge
//! individual elements afterwards without rebuilding anything.

use crate::config::PipelineConfig;
use crate::element::{BoundingBox, Element, ElementId, ElementStatus};
use crate::error::DecomposeError;
use crate::orchestrator::Orchestrator;
use crate::output::{DecompositionOutput, ElementReport, RunStats};
use crate::scheduler::{Scheduler, WorkQueue};
use crate::service::{Detection, VisionService};
use crate::store::ElementStore;
use image::RgbaImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub struct Session {
    source: String,
    slide: Arc<RgbaImage>,
    background_color: String,
    store: Arc<ElementStore>,
    config: Arc<PipelineConfig>,
    orchestrator: Orchestrator,
    busy_ms: AtomicU64,
}

impl Session {
    /// Create a session from a decoded slide and its detected layout.
    ///
    /// Elements are numbered `el-0`, `el-1`, … in detection order and start
    /// PENDING.
    pub fn new(
        slide: RgbaImage,
        detection: Detection,
        service: Arc<dyn VisionService>,
        config: PipelineConfig,
    ) -> Self {
        let store = Arc::new(ElementStore::new());
        for (i, d) in detection.elements.into_iter().enumerate() {
            store.insert(Element::new(
                ElementId::from_index(i),
                d.element_type,
                d.description,
                d.bbox,
                d.z_order,
            ));
        }
        let config = Arc::new(config);
        let orchestrator = Orchestrator::new(
            service,
            Arc::clone(&store),
            Arc::clone(&config),
            detection.background_color.as_str(),
        );
        Self {
            source: String::new(),
            slide: Arc::new(slide),
            background_color: detection.background_color,
            store,
            config,
            orchestrator,
            busy_ms: AtomicU64::new(0),
        }
    }

    /// Name of the input, carried into the output manifest.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn store(&self) -> &Arc<ElementStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn background_color(&self) -> &str {
        &self.background_color
    }

    pub fn elements(&self) -> Vec<Element> {
        self.store.snapshots()
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.orchestrator.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&self.slide),
        )
    }

    /// Process every PENDING element to a terminal state, in detection
    /// order.
    pub async fn run_all(&self) -> RunStats {
        let started = Instant::now();
        let pending = self
            .store
            .ids_where(|e| e.status() == ElementStatus::Pending);
        let total = pending.len();
        info!("Extracting {} element(s)", total);
        if let Some(cb) = &self.config.progress_callback {
            cb.on_run_start(total);
        }

        self.scheduler().run(WorkQueue::new(pending)).await;

        self.busy_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        let stats = self.stats();
        if let Some(cb) = &self.config.progress_callback {
            cb.on_run_complete(total, stats.completed);
        }
        stats
    }

    /// Reopen a COMPLETED or FAILED element and drive it again.
    ///
    /// The attempt budget starts over; history, the cleaning goal and the
    /// white-interior flag are kept. With `prompt_override` the override is
    /// used as-is; without it the last improved prompt is reused. Either way
    /// the Analyst does not run again. A TEXT element is transcribed again
    /// and ignores the override.
    pub async fn rerun(
        &self,
        id: &ElementId,
        prompt_override: Option<String>,
    ) -> Result<ElementStatus, DecomposeError> {
        let with_override = prompt_override.is_some();
        let is_text = self
            .store
            .snapshot(id)
            .is_some_and(|e| !e.element_type.is_visual());
        self.store
            .update(id, |e| e.reopen(prompt_override))
            .ok_or_else(|| DecomposeError::ElementNotFound { id: id.clone() })?
            .map_err(|t| DecomposeError::InvalidElementState {
                id: id.clone(),
                action: "rerun",
                status: t.from.to_string(),
            })?;
        self.store.append_log(format!(
            "[{}] Manual rerun{}",
            id,
            match (with_override, is_text) {
                (true, true) => " (prompt override ignored for TEXT)",
                (true, false) => " with prompt override",
                _ => "",
            }
        ));

        let started = Instant::now();
        self.scheduler().run(WorkQueue::new([id.clone()])).await;
        self.busy_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        self.store
            .snapshot(id)
            .map(|e| e.status())
            .ok_or_else(|| DecomposeError::ElementNotFound { id: id.clone() })
    }

    /// Store a prompt for the next rerun without starting it.
    pub fn set_retry_prompt(&self, id: &ElementId, prompt: impl Into<String>) -> Result<(), DecomposeError> {
        let prompt = prompt.into();
        self.store
            .update(id, |e| {
                if e.status() == ElementStatus::Processing {
                    return Err(e.status());
                }
                e.active_prompt = Some(prompt);
                Ok(())
            })
            .ok_or_else(|| DecomposeError::ElementNotFound { id: id.clone() })?
            .map_err(|status| DecomposeError::InvalidElementState {
                id: id.clone(),
                action: "take a new prompt",
                status: status.to_string(),
            })
    }

    /// Return an element to PENDING with every derived field cleared,
    /// optionally moving its box. The next `run_all` picks it up again.
    pub fn reset(&self, id: &ElementId, bbox: Option<BoundingBox>) -> Result<(), DecomposeError> {
        self.store
            .update(id, |e| e.reset(bbox))
            .ok_or_else(|| DecomposeError::ElementNotFound { id: id.clone() })?
            .map_err(|t| DecomposeError::InvalidElementState {
                id: id.clone(),
                action: "reset",
                status: t.from.to_string(),
            })?;
        self.store.append_log(format!("[{}] Reset", id));
        Ok(())
    }

    /// Current statistics across every run of this session.
    pub fn stats(&self) -> RunStats {
        let mut stats = RunStats::from_elements(&self.store.snapshots());
        stats.peak_concurrency = self.store.peak_processing();
        stats.total_duration_ms = self.busy_ms.load(Ordering::Relaxed);
        stats.usage = self.store.usage();
        stats
    }

    /// Snapshot of the session as an output document.
    pub fn output(&self) -> DecompositionOutput {
        let elements = self.store.snapshots();
        let assets = elements
            .iter()
            .filter(|e| e.status() == ElementStatus::Completed)
            .filter_map(|e| e.cleaned_image.as_ref().map(|img| (e.id.clone(), Arc::clone(img))))
            .collect();
        DecompositionOutput {
            source: self.source.clone(),
            image_width: self.slide.width(),
            image_height: self.slide.height(),
            background_color: self.background_color.clone(),
            elements: elements.iter().map(ElementReport::from).collect(),
            stats: self.stats(),
            log: self.store.log(),
            assets,
        }
    }
}
