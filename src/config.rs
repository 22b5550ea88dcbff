//! Configuration types for slide decomposition.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. A config is immutable for the duration of a
//! run; workers share it behind an `Arc`.

use crate::element::ElementType;
use crate::error::{DecomposeError, Stage};
use crate::progress::ProgressCallback;
use crate::service::VisionService;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Fast image-editing model.
pub const MODEL_IMAGE_CLEANING_FAST: &str = "gemini-2.5-flash-image";
/// High-quality image-editing model; gated behind premium access.
pub const MODEL_IMAGE_CLEANING_PRO: &str = "gemini-3-pro-image-preview";
/// Default model for detection and the Critic.
pub const MODEL_REASONING: &str = "gemini-3-pro-preview";
/// Default model for the Analyst and for TEXT transcription.
pub const MODEL_ANALYST: &str = "gemini-3-flash-preview";

/// Which Cleaner model handles each visual element type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRouting {
    pub shape: String,
    pub icon: String,
    pub image: String,
}

impl Default for ModelRouting {
    fn default() -> Self {
        Self {
            shape: MODEL_IMAGE_CLEANING_PRO.to_string(),
            icon: MODEL_IMAGE_CLEANING_FAST.to_string(),
            image: MODEL_IMAGE_CLEANING_FAST.to_string(),
        }
    }
}

impl ModelRouting {
    /// The Cleaner model for `element_type`. TEXT is transcribed, not cleaned.
    pub fn model_for(&self, element_type: ElementType) -> Option<&str> {
        match element_type {
            ElementType::Text => None,
            ElementType::Shape => Some(&self.shape),
            ElementType::Icon => Some(&self.icon),
            ElementType::Image => Some(&self.image),
        }
    }
}

/// Configuration for one decomposition run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_slide2assets::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .concurrency(4)
///     .premium_access(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_attempts, 4);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Cleaner model per element type.
    pub routing: ModelRouting,

    /// Models that require [`PipelineConfig::premium_access`]. An element
    /// routed to one of these without access fails before any stage runs.
    pub premium_models: Vec<String>,

    /// Whether the caller holds the entitlement for `premium_models`. Default: false.
    pub premium_access: bool,

    /// Model for the one-shot layout detection. Default: `gemini-3-pro-preview`.
    pub detection_model: String,

    /// Model for the Analyst stage. Default: `gemini-3-flash-preview`.
    pub analyst_model: String,

    /// Model for the Critic stage. Default: `gemini-3-pro-preview`.
    pub critic_model: String,

    /// Model that transcribes TEXT elements. Default: `gemini-3-flash-preview`.
    pub text_model: String,

    /// Provider name for the JSON stages (e.g. "gemini", "openai").
    /// If None, auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed vision service. Takes precedence over `provider_name`.
    pub service: Option<Arc<dyn VisionService>>,

    /// Base URL of the image-generation endpoint. If None, the public
    /// Generative Language API is used.
    pub image_endpoint: Option<String>,

    /// Minimum Critic score that counts as a pass. Default: 85.
    ///
    /// The Critic must also say `PASS`; the score is checked locally and a
    /// `PASS` verdict below the threshold is still a retry.
    pub qa_threshold: u8,

    /// Self-correction iterations per attempt budget. Default: 4.
    pub max_attempts: u32,

    /// Immediate re-invocations of a failed stage call. Default: 2.
    ///
    /// Exhausting them fails the element with a critical error without
    /// consuming a self-correction attempt.
    pub max_stage_retries: u32,

    /// Fixed delay between stage retries, in milliseconds. Default: 1000.
    pub stage_backoff_ms: u64,

    /// Pause between self-correction iterations, in milliseconds. Default: 1000.
    pub cooldown_ms: u64,

    /// Number of concurrent workers. Default: 3.
    ///
    /// Each worker drives one element at a time through up to
    /// `1 + 2 * max_attempts` model calls, so a small pool already keeps the
    /// service busy; raise it only if you are not hitting rate limits.
    pub concurrency: usize,

    /// Pixels of context added around every detection box. Default: 50.
    pub crop_padding: u32,

    /// Longest edge of a crop sent to the models. Default: 1024.
    pub max_crop_dimension: u32,

    /// Longest edge of the slide sent to detection. Default: 1536.
    pub detection_max_dimension: u32,

    /// Near-white tolerance for background removal. Default: 8.
    pub transparency_tolerance: u8,

    /// Per-call timeouts in seconds. Defaults: 60 / 120 / 120 / 120 / 60.
    pub analyst_timeout_secs: u64,
    pub cleaner_timeout_secs: u64,
    pub critic_timeout_secs: u64,
    pub detection_timeout_secs: u64,
    pub text_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Sampling temperature for the JSON stages. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens for JSON-stage replies. Default: 4096.
    pub max_tokens: usize,

    /// Optional per-element progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            routing: ModelRouting::default(),
            premium_models: vec![MODEL_IMAGE_CLEANING_PRO.to_string()],
            premium_access: false,
            detection_model: MODEL_REASONING.to_string(),
            analyst_model: MODEL_ANALYST.to_string(),
            critic_model: MODEL_REASONING.to_string(),
            text_model: MODEL_ANALYST.to_string(),
            provider_name: None,
            service: None,
            image_endpoint: None,
            qa_threshold: 85,
            max_attempts: 4,
            max_stage_retries: 2,
            stage_backoff_ms: 1000,
            cooldown_ms: 1000,
            concurrency: 3,
            crop_padding: 50,
            max_crop_dimension: 1024,
            detection_max_dimension: 1536,
            transparency_tolerance: 8,
            analyst_timeout_secs: 60,
            cleaner_timeout_secs: 120,
            critic_timeout_secs: 120,
            detection_timeout_secs: 120,
            text_timeout_secs: 60,
            download_timeout_secs: 120,
            temperature: 0.1,
            max_tokens: 4096,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("routing", &self.routing)
            .field("premium_models", &self.premium_models)
            .field("premium_access", &self.premium_access)
            .field("detection_model", &self.detection_model)
            .field("analyst_model", &self.analyst_model)
            .field("critic_model", &self.critic_model)
            .field("text_model", &self.text_model)
            .field("provider_name", &self.provider_name)
            .field("service", &self.service.as_ref().map(|_| "<dyn VisionService>"))
            .field("qa_threshold", &self.qa_threshold)
            .field("max_attempts", &self.max_attempts)
            .field("max_stage_retries", &self.max_stage_retries)
            .field("concurrency", &self.concurrency)
            .field("crop_padding", &self.crop_padding)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ExtractionProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Whether `model` needs an entitlement the caller does not hold.
    pub fn is_entitlement_missing(&self, model: &str) -> bool {
        !self.premium_access && self.premium_models.iter().any(|m| m == model)
    }

    /// Timeout applied to one call of `stage`.
    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        Duration::from_secs(match stage {
            Stage::Analyst => self.analyst_timeout_secs,
            Stage::Cleaner => self.cleaner_timeout_secs,
            Stage::Critic => self.critic_timeout_secs,
            Stage::Text => self.text_timeout_secs,
        })
    }

    pub fn stage_backoff(&self) -> Duration {
        Duration::from_millis(self.stage_backoff_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn routing(mut self, routing: ModelRouting) -> Self {
        self.config.routing = routing;
        self
    }

    pub fn shape_model(mut self, model: impl Into<String>) -> Self {
        self.config.routing.shape = model.into();
        self
    }

    pub fn icon_model(mut self, model: impl Into<String>) -> Self {
        self.config.routing.icon = model.into();
        self
    }

    pub fn image_model(mut self, model: impl Into<String>) -> Self {
        self.config.routing.image = model.into();
        self
    }

    pub fn premium_models(mut self, models: Vec<String>) -> Self {
        self.config.premium_models = models;
        self
    }

    pub fn premium_access(mut self, v: bool) -> Self {
        self.config.premium_access = v;
        self
    }

    pub fn detection_model(mut self, model: impl Into<String>) -> Self {
        self.config.detection_model = model.into();
        self
    }

    pub fn analyst_model(mut self, model: impl Into<String>) -> Self {
        self.config.analyst_model = model.into();
        self
    }

    pub fn critic_model(mut self, model: impl Into<String>) -> Self {
        self.config.critic_model = model.into();
        self
    }

    pub fn text_model(mut self, model: impl Into<String>) -> Self {
        self.config.text_model = model.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn service(mut self, service: Arc<dyn VisionService>) -> Self {
        self.config.service = Some(service);
        self
    }

    pub fn image_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.image_endpoint = Some(url.into());
        self
    }

    pub fn qa_threshold(mut self, score: u8) -> Self {
        self.config.qa_threshold = score;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn max_stage_retries(mut self, n: u32) -> Self {
        self.config.max_stage_retries = n;
        self
    }

    pub fn stage_backoff_ms(mut self, ms: u64) -> Self {
        self.config.stage_backoff_ms = ms;
        self
    }

    pub fn cooldown_ms(mut self, ms: u64) -> Self {
        self.config.cooldown_ms = ms;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn crop_padding(mut self, px: u32) -> Self {
        self.config.crop_padding = px;
        self
    }

    pub fn max_crop_dimension(mut self, px: u32) -> Self {
        self.config.max_crop_dimension = px.max(16);
        self
    }

    pub fn detection_max_dimension(mut self, px: u32) -> Self {
        self.config.detection_max_dimension = px.max(64);
        self
    }

    pub fn transparency_tolerance(mut self, t: u8) -> Self {
        self.config.transparency_tolerance = t;
        self
    }

    pub fn analyst_timeout_secs(mut self, secs: u64) -> Self {
        self.config.analyst_timeout_secs = secs;
        self
    }

    pub fn cleaner_timeout_secs(mut self, secs: u64) -> Self {
        self.config.cleaner_timeout_secs = secs;
        self
    }

    pub fn critic_timeout_secs(mut self, secs: u64) -> Self {
        self.config.critic_timeout_secs = secs;
        self
    }

    pub fn detection_timeout_secs(mut self, secs: u64) -> Self {
        self.config.detection_timeout_secs = secs;
        self
    }

    pub fn text_timeout_secs(mut self, secs: u64) -> Self {
        self.config.text_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, DecomposeError> {
        let c = &self.config;
        if c.qa_threshold > 100 {
            return Err(DecomposeError::InvalidConfig(format!(
                "QA threshold must be 0–100, got {}",
                c.qa_threshold
            )));
        }
        if c.max_attempts == 0 {
            return Err(DecomposeError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.concurrency == 0 {
            return Err(DecomposeError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        let timeouts = [
            c.analyst_timeout_secs,
            c.cleaner_timeout_secs,
            c.critic_timeout_secs,
            c.detection_timeout_secs,
            c.text_timeout_secs,
        ];
        if timeouts.contains(&0) {
            return Err(DecomposeError::InvalidConfig(
                "Stage timeouts must be ≥ 1s".into(),
            ));
        }
        for (kind, model) in [
            ("shape", &c.routing.shape),
            ("icon", &c.routing.icon),
            ("image", &c.routing.image),
        ] {
            if model.trim().is_empty() {
                return Err(DecomposeError::InvalidConfig(format!(
                    "No cleaner model routed for {kind} elements"
                )));
            }
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let c = PipelineConfig::default();
        assert_eq!(c.qa_threshold, 85);
        assert_eq!(c.max_attempts, 4);
        assert_eq!(c.max_stage_retries, 2);
        assert_eq!(c.concurrency, 3);
        assert_eq!(c.crop_padding, 50);
        assert_eq!(c.transparency_tolerance, 8);
        assert_eq!(c.stage_timeout(Stage::Analyst), Duration::from_secs(60));
        assert_eq!(c.stage_timeout(Stage::Critic), Duration::from_secs(120));
        assert_eq!(c.stage_timeout(Stage::Text), Duration::from_secs(60));
        assert_eq!(c.text_model, MODEL_ANALYST);
    }

    #[test]
    fn routing_by_type() {
        let r = ModelRouting::default();
        assert_eq!(r.model_for(ElementType::Shape), Some(MODEL_IMAGE_CLEANING_PRO));
        assert_eq!(r.model_for(ElementType::Icon), Some(MODEL_IMAGE_CLEANING_FAST));
        assert_eq!(r.model_for(ElementType::Text), None);
    }

    #[test]
    fn entitlement_gate() {
        let c = PipelineConfig::default();
        assert!(c.is_entitlement_missing(MODEL_IMAGE_CLEANING_PRO));
        assert!(!c.is_entitlement_missing(MODEL_IMAGE_CLEANING_FAST));

        let c = PipelineConfig::builder().premium_access(true).build().expect("build");
        assert!(!c.is_entitlement_missing(MODEL_IMAGE_CLEANING_PRO));
    }

    #[test]
    fn builder_rejects_bad_values() {
        assert!(PipelineConfig::builder().qa_threshold(101).build().is_err());
        assert!(PipelineConfig::builder().max_attempts(0).build().is_err());
        assert!(PipelineConfig::builder().critic_timeout_secs(0).build().is_err());
        assert!(PipelineConfig::builder().text_timeout_secs(0).build().is_err());
        assert!(PipelineConfig::builder().icon_model("  ").build().is_err());
    }

    #[test]
    fn builder_clamps() {
        let c = PipelineConfig::builder()
            .concurrency(0)
            .temperature(9.0)
            .build()
            .expect("build");
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }
}
