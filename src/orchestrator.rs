//! Per-element state machine: Analyst → (Cleaner → transparency → Critic)*
//! for visual elements, a single transcription call for TEXT.
//!
//! The orchestrator receives an element that a worker has already moved to
//! PROCESSING and cropped, and drives it to COMPLETED or FAILED. It reads
//! the element once at the start and from then on writes through
//! [`ElementStore::update`] only; it never touches another element.
//!
//! ## Loop policy
//!
//! ```text
//!  Analyst (only if no prompt yet)
//!     │
//!     ▼
//!  ┌─ Cleaner ─▶ unpad ─▶ remove_background ─▶ Critic ─┐
//!  │                                                   │ attempts += 1
//!  │   PASS && score ≥ threshold ─────────────▶ COMPLETED
//!  └── cooldown ◀── improvedPrompt ◀── attempts < max  │
//!                                      attempts == max ─▶ FAILED
//! ```
//!
//! TEXT elements have no cleaning model; they take one `analyze_text` call
//! and complete with the transcript stored on the element.
//!
//! Every stage call is wrapped in a timeout and a bounded retry. A stage
//! that exhausts its retries fails the element without consuming an
//! attempt; only a scored iteration advances `attempts`.

use crate::config::PipelineConfig;
use crate::element::{AttemptRecord, Element, ElementId, ElementStatus, Verdict};
use crate::error::{ElementError, Stage};
use crate::pipeline::square::{pad_to_square, unpad};
use crate::pipeline::transparency::{remove_background, TransparencyMode};
use crate::prompts::{cleaner_instruction, fallback_cleaning_prompt, DEFAULT_CLEANING_GOAL};
use crate::retry::{with_retry, with_timeout, RetryExhausted, RetryPolicy};
use crate::service::{
    Critique, CritiqueRequest, GenerateRequest, PlanRequest, ServiceReply, TextRequest,
    VisionService,
};
use crate::store::ElementStore;
use image::RgbaImage;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How an element reached COMPLETED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A cleaned candidate passed QA.
    Passed { attempts: u32, score: u8 },
    /// A TEXT element was transcribed.
    Transcribed,
}

/// Planning state the loop runs with.
#[derive(Debug, Clone)]
struct ActivePlan {
    prompt: String,
    cleaning_goal: String,
    is_white_interior: bool,
}

/// Drives single elements through the stage loop. Cheap to clone; one
/// instance is shared by all workers of a session.
#[derive(Clone)]
pub struct Orchestrator {
    service: Arc<dyn VisionService>,
    store: Arc<ElementStore>,
    config: Arc<PipelineConfig>,
    background_color: Arc<str>,
}

impl Orchestrator {
    pub fn new(
        service: Arc<dyn VisionService>,
        store: Arc<ElementStore>,
        config: Arc<PipelineConfig>,
        background_color: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            service,
            store,
            config,
            background_color: background_color.into(),
        }
    }

    /// Run element `id` to a terminal state and return that state.
    ///
    /// The element must be PROCESSING with `original_crop` set. Returns
    /// `None` for an unknown id.
    pub async fn drive(&self, id: &ElementId) -> Option<ElementStatus> {
        let snapshot = self.store.snapshot(id)?;
        let started = Instant::now();
        let result = match self.config.routing.model_for(snapshot.element_type) {
            Some(model) => self.extract(&snapshot, model.to_string()).await,
            None => self.transcribe(&snapshot).await,
        };
        Some(self.finish(id, result, started.elapsed().as_millis() as u64))
    }

    /// Fail a PROCESSING element before any stage ran (geometry problems).
    pub fn abort(&self, error: ElementError) -> ElementStatus {
        let id = error.id().clone();
        self.finish(&id, Err(error), 0)
    }

    fn finish(
        &self,
        id: &ElementId,
        result: Result<Outcome, ElementError>,
        elapsed_ms: u64,
    ) -> ElementStatus {
        let label = format!("[{id}]");
        let callback = self.config.progress_callback.as_ref();
        match result {
            Ok(outcome) => {
                let transition = self.store.update(id, |e| {
                    e.processing_ms = Some(elapsed_ms);
                    e.transition_to(ElementStatus::Completed)
                });
                if let Some(Err(e)) = transition {
                    warn!("{} {}", label, e);
                }
                match outcome {
                    Outcome::Passed { attempts, score } => {
                        self.store.append_log(format!(
                            "{} Completed: QA score {} after {} attempt(s)",
                            label, score, attempts
                        ));
                        if let Some(cb) = callback {
                            cb.on_element_complete(id, attempts, score);
                        }
                    }
                    Outcome::Transcribed => {
                        self.store.append_log(format!("{} Completed: text transcribed", label));
                        if let Some(cb) = callback {
                            cb.on_text_complete(id);
                        }
                    }
                }
                ElementStatus::Completed
            }
            Err(error) => {
                let reason = error.to_string();
                let transition = self.store.update(id, |e| {
                    e.processing_ms = Some(elapsed_ms);
                    e.fail(error)
                });
                if let Some(Err(e)) = transition {
                    warn!("{} {}", label, e);
                }
                self.store.append_log(format!("{} FAILED: {}", label, reason));
                if let Some(cb) = callback {
                    cb.on_element_failed(id, reason);
                }
                ElementStatus::Failed
            }
        }
    }

    fn stage_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_stage_retries, self.config.stage_backoff())
    }

    fn exhausted(&self, id: &ElementId, stage: Stage, e: RetryExhausted) -> ElementError {
        ElementError::StageExhausted {
            id: id.clone(),
            stage,
            retries: e.attempts.saturating_sub(1),
            detail: e.last.to_string(),
        }
    }

    fn source_crop(&self, element: &Element) -> Result<Arc<RgbaImage>, ElementError> {
        element
            .original_crop
            .clone()
            .ok_or_else(|| ElementError::Geometry {
                id: element.id.clone(),
                detail: "no source crop was prepared".into(),
            })
    }

    fn check_entitlement(&self, id: &ElementId, model: &str) -> Result<(), ElementError> {
        if self.config.is_entitlement_missing(model) {
            return Err(ElementError::Entitlement {
                id: id.clone(),
                model: model.to_string(),
            });
        }
        Ok(())
    }

    async fn extract(&self, element: &Element, model: String) -> Result<Outcome, ElementError> {
        let id = &element.id;
        let label = element.label();
        let config = &self.config;

        self.check_entitlement(id, &model)?;
        let crop = self.source_crop(element)?;

        let plan = match &element.active_prompt {
            Some(prompt) => ActivePlan {
                prompt: prompt.clone(),
                cleaning_goal: element
                    .cleaning_goal
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CLEANING_GOAL.to_string()),
                is_white_interior: element.is_white_interior,
            },
            None => self.analyst(element, &crop).await?,
        };
        let mode = TransparencyMode::for_interior(plan.is_white_interior);
        let (square, _) = pad_to_square(&crop);

        let mut prompt = plan.prompt;
        let mut attempts = element.attempts;
        let max = config.max_attempts;

        while attempts < max {
            let raw = self.clean(id, &model, &square, &prompt, &crop).await?;
            let tolerance = config.transparency_tolerance;
            let for_critic = Arc::clone(&raw);
            let cleaned = tokio::task::spawn_blocking(move || remove_background(&raw, mode, tolerance))
                .await
                .map_err(|e| ElementError::StageExhausted {
                    id: id.clone(),
                    stage: Stage::Cleaner,
                    retries: 0,
                    detail: format!("background removal panicked: {e}"),
                })?;

            let critique = self
                .critic(&label, &crop, &for_critic, &plan.cleaning_goal)
                .await
                .map_err(|e| self.exhausted(id, Stage::Critic, e))?;

            attempts += 1;
            let passed =
                critique.verdict == Verdict::Pass && critique.score >= config.qa_threshold;
            let record = AttemptRecord {
                attempt: attempts,
                model: model.clone(),
                prompt: prompt.clone(),
                verdict: critique.verdict,
                score: critique.score,
                feedback: critique.reason.clone(),
                passed,
                timestamp_ms: AttemptRecord::now_ms(),
            };
            let cleaned = Arc::new(cleaned);
            self.store.update(id, |e| {
                e.attempts = attempts;
                e.record_attempt(record);
                e.cleaned_image = Some(cleaned);
            });
            self.store.append_log(format!(
                "{} Attempt {}/{}: score {} ({:?}) {}",
                label, attempts, max, critique.score, critique.verdict, critique.reason
            ));
            if let Some(cb) = &config.progress_callback {
                cb.on_attempt(id, attempts, max, critique.score);
            }

            if passed {
                return Ok(Outcome::Passed {
                    attempts,
                    score: critique.score,
                });
            }

            if let Some(improved) = critique.improved_prompt {
                prompt = improved;
            }
            let next = prompt.clone();
            self.store.update(id, |e| e.active_prompt = Some(next));

            if attempts < max {
                debug!("{} cooling down for {:?}", label, config.cooldown());
                sleep(config.cooldown()).await;
            }
        }

        Err(ElementError::MaxAttemptsReached {
            id: id.clone(),
            attempts,
        })
    }

    // ── Stages ───────────────────────────────────────────────────────────

    /// Plan the erase. A malformed reply falls back to a templated prompt.
    async fn analyst(&self, element: &Element, crop: &RgbaImage) -> Result<ActivePlan, ElementError> {
        let id = &element.id;
        let label = element.label();
        let request = PlanRequest {
            model: &self.config.analyst_model,
            crop,
            element_type: element.element_type,
            description: element.description.as_deref(),
            background_color: &self.background_color,
        };
        let limit = self.config.stage_timeout(Stage::Analyst);
        let service = &self.service;
        let store = &self.store;

        let reply = with_retry(self.stage_policy(), &format!("{label} Analyst"), move |_| async move {
            let reply = with_timeout(Stage::Analyst, limit, service.plan(request)).await?;
            store.record_usage(&reply.usage);
            Ok(reply.value)
        })
        .await
        .map_err(|e| self.exhausted(id, Stage::Analyst, e))?;

        let fallback_prompt =
            || fallback_cleaning_prompt(element.element_type, element.description.as_deref());
        let plan = match reply {
            ServiceReply::Parsed(plan) => ActivePlan {
                prompt: plan.prompt.unwrap_or_else(fallback_prompt),
                cleaning_goal: plan
                    .cleaning_goal
                    .unwrap_or_else(|| DEFAULT_CLEANING_GOAL.to_string()),
                is_white_interior: plan.is_white_interior.unwrap_or(false),
            },
            ServiceReply::Malformed { reason, .. } => {
                self.store.append_log(format!(
                    "{} Analyst reply unusable ({}); using template prompt",
                    label, reason
                ));
                ActivePlan {
                    prompt: fallback_prompt(),
                    cleaning_goal: DEFAULT_CLEANING_GOAL.to_string(),
                    is_white_interior: false,
                }
            }
        };

        let stored = plan.clone();
        self.store.update(id, |e| {
            e.active_prompt = Some(stored.prompt);
            e.cleaning_goal = Some(stored.cleaning_goal);
            e.is_white_interior = stored.is_white_interior;
        });
        self.store.append_log(format!(
            "{} Analyst plan ready (white interior: {})",
            label, plan.is_white_interior
        ));
        Ok(plan)
    }

    /// Generate a candidate and map it back onto the crop's dimensions.
    async fn clean(
        &self,
        id: &ElementId,
        model: &str,
        square: &RgbaImage,
        prompt: &str,
        crop: &RgbaImage,
    ) -> Result<Arc<RgbaImage>, ElementError> {
        let label = format!("[{id}]");
        let instruction = cleaner_instruction(prompt);
        let request = GenerateRequest {
            model,
            image: square,
            instruction: &instruction,
        };
        let limit = self.config.stage_timeout(Stage::Cleaner);
        let service = &self.service;
        let store = &self.store;

        let generated = with_retry(self.stage_policy(), &format!("{label} Cleaner"), move |_| async move {
            let reply = with_timeout(Stage::Cleaner, limit, service.generate(request)).await?;
            store.record_usage(&reply.usage);
            Ok(reply.value)
        })
        .await
        .map_err(|e| self.exhausted(id, Stage::Cleaner, e))?;

        let (w, h) = crop.dimensions();
        let restored = tokio::task::spawn_blocking(move || unpad(&generated, w, h))
            .await
            .map_err(|e| ElementError::StageExhausted {
                id: id.clone(),
                stage: Stage::Cleaner,
                retries: 0,
                detail: format!("unpad task panicked: {e}"),
            })?;
        Ok(Arc::new(restored))
    }

    /// Score the raw candidate against the crop. Malformed replies retry.
    async fn critic(
        &self,
        label: &str,
        original: &RgbaImage,
        candidate: &RgbaImage,
        cleaning_goal: &str,
    ) -> Result<Critique, RetryExhausted> {
        let request = CritiqueRequest {
            model: &self.config.critic_model,
            original,
            candidate,
            cleaning_goal,
        };
        let limit = self.config.stage_timeout(Stage::Critic);
        let service = &self.service;
        let store = &self.store;

        with_retry(self.stage_policy(), &format!("{label} Critic"), move |_| async move {
            let reply = with_timeout(Stage::Critic, limit, service.critique(request)).await?;
            store.record_usage(&reply.usage);
            reply.value.into_result()
        })
        .await
    }

    /// Read a TEXT crop. Malformed replies retry like the Critic's.
    async fn transcribe(&self, element: &Element) -> Result<Outcome, ElementError> {
        let id = &element.id;
        let label = element.label();
        let model = self.config.text_model.as_str();
        self.check_entitlement(id, model)?;
        let crop = self.source_crop(element)?;

        let request = TextRequest { model, crop: &crop };
        let limit = self.config.stage_timeout(Stage::Text);
        let service = &self.service;
        let store = &self.store;

        let text = with_retry(self.stage_policy(), &format!("{label} Text"), move |_| async move {
            let reply = with_timeout(Stage::Text, limit, service.analyze_text(request)).await?;
            store.record_usage(&reply.usage);
            reply.value.into_result()
        })
        .await
        .map_err(|e| self.exhausted(id, Stage::Text, e))?;

        self.store.append_log(format!(
            "{} Text read: {} char(s), colour {}, bold {}",
            label,
            text.text.chars().count(),
            text.color.as_deref().unwrap_or("unknown"),
            text.is_bold
        ));
        self.store.update(id, |e| e.text = Some(text));
        Ok(Outcome::Transcribed)
    }
}
