//! Shared fixtures for the integration tests: a scripted vision service,
//! a synthetic slide and layout builders.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_slide2assets::service::{
    CritiqueRequest, DetectRequest, GenerateRequest, PlanRequest, TextRequest,
};
use edgequake_slide2assets::{
    BoundingBox, Critique, DetectedElement, Detection, ElementType, Metered, Plan,
    PipelineConfig, PipelineConfigBuilder, ServiceReply, StageError, TextContent, TokenUsage,
    Verdict, VisionService,
};
use image::{Rgba, RgbaImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_PROMPT: &str = "Erase everything except the target.";
pub const TARGET: Rgba<u8> = Rgba([200, 30, 30, 255]);

/// One recorded call to the service.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Plan,
    Generate { model: String, instruction: String },
    Critique { goal: String },
    Text,
    Detect,
}

/// Vision service that answers from per-stage scripts.
///
/// An empty script falls back to a good answer: a parsed plan, a cleaned
/// image, a passing critique with score 95 and a short black transcript.
#[derive(Default)]
pub struct ScriptedService {
    plans: Mutex<VecDeque<Result<ServiceReply<Plan>, StageError>>>,
    generate_errors: Mutex<VecDeque<StageError>>,
    generate_panics: AtomicUsize,
    generated: Option<fn(u32, u32) -> RgbaImage>,
    critiques: Mutex<VecDeque<Result<ServiceReply<Critique>, StageError>>>,
    texts: Mutex<VecDeque<Result<ServiceReply<TextContent>, StageError>>>,
    detection: Mutex<Option<ServiceReply<Detection>>>,
    generate_delay: Duration,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(self, plans: Vec<Result<ServiceReply<Plan>, StageError>>) -> Self {
        *self.plans.lock().unwrap() = plans.into();
        self
    }

    pub fn with_generate_errors(self, errors: Vec<StageError>) -> Self {
        *self.generate_errors.lock().unwrap() = errors.into();
        self
    }

    /// The next `n` generate calls panic instead of answering.
    pub fn with_generate_panics(self, n: usize) -> Self {
        self.generate_panics.store(n, Ordering::SeqCst);
        self
    }

    /// Draw generated candidates with `draw(width, height)` instead of
    /// [`cleaned_square`].
    pub fn with_generated(mut self, draw: fn(u32, u32) -> RgbaImage) -> Self {
        self.generated = Some(draw);
        self
    }

    pub fn with_texts(self, texts: Vec<Result<ServiceReply<TextContent>, StageError>>) -> Self {
        *self.texts.lock().unwrap() = texts.into();
        self
    }

    pub fn with_critiques(self, critiques: Vec<Result<ServiceReply<Critique>, StageError>>) -> Self {
        *self.critiques.lock().unwrap() = critiques.into();
        self
    }

    pub fn with_detection(self, detection: ServiceReply<Detection>) -> Self {
        *self.detection.lock().unwrap() = Some(detection);
        self
    }

    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = delay;
        self
    }

    /// Push more critiques after construction (for reruns).
    pub fn push_critiques(&self, critiques: Vec<Result<ServiceReply<Critique>, StageError>>) {
        self.critiques.lock().unwrap().extend(critiques);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn plan_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Plan))
    }

    pub fn generate_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Generate { .. }))
    }

    pub fn critique_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Critique { .. }))
    }

    pub fn text_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Text))
    }

    pub fn instructions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Generate { instruction, .. } => Some(instruction),
                _ => None,
            })
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl VisionService for ScriptedService {
    async fn plan(&self, request: PlanRequest<'_>) -> Result<Metered<ServiceReply<Plan>>, StageError> {
        self.record(Call::Plan);
        let next = self.plans.lock().unwrap().pop_front();
        let reply = next.unwrap_or_else(|| {
            Ok(ServiceReply::Parsed(Plan {
                prompt: Some(DEFAULT_PROMPT.into()),
                is_white_interior: Some(false),
                cleaning_goal: Some("Only the target remains.".into()),
            }))
        })?;
        Ok(Metered::new(reply, TokenUsage::new(request.model, 100, 20)))
    }

    async fn generate(&self, request: GenerateRequest<'_>) -> Result<Metered<RgbaImage>, StageError> {
        self.record(Call::Generate {
            model: request.model.to_string(),
            instruction: request.instruction.to_string(),
        });
        let panics_left = self
            .generate_panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if panics_left {
            panic!("scripted generate panic");
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.generate_delay.is_zero() {
            tokio::time::sleep(self.generate_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.generate_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let (w, h) = request.image.dimensions();
        let draw = self.generated.unwrap_or(cleaned_square);
        Ok(Metered::new(draw(w, h), TokenUsage::new(request.model, 300, 1290)))
    }

    async fn critique(
        &self,
        request: CritiqueRequest<'_>,
    ) -> Result<Metered<ServiceReply<Critique>>, StageError> {
        self.record(Call::Critique {
            goal: request.cleaning_goal.to_string(),
        });
        let next = self.critiques.lock().unwrap().pop_front();
        let reply = next.unwrap_or_else(|| Ok(ServiceReply::Parsed(critique(95, Verdict::Pass, None))))?;
        Ok(Metered::new(reply, TokenUsage::new(request.model, 200, 40)))
    }

    async fn analyze_text(
        &self,
        request: TextRequest<'_>,
    ) -> Result<Metered<ServiceReply<TextContent>>, StageError> {
        self.record(Call::Text);
        let next = self.texts.lock().unwrap().pop_front();
        let reply = next.unwrap_or_else(|| Ok(ServiceReply::Parsed(text("Sample text"))))?;
        Ok(Metered::new(reply, TokenUsage::new(request.model, 150, 30)))
    }

    async fn detect(&self, request: DetectRequest<'_>) -> Result<Metered<ServiceReply<Detection>>, StageError> {
        self.record(Call::Detect);
        let reply = self
            .detection
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| StageError::Transport("no detection scripted".into()))?;
        Ok(Metered::new(reply, TokenUsage::new(request.model, 500, 80)))
    }
}

/// White square with a solid block in the middle half.
pub fn cleaned_square(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| {
        let inside = x >= w / 4 && x < w * 3 / 4 && y >= h / 4 && y < h * 3 / 4;
        if inside {
            TARGET
        } else {
            Rgba([255, 255, 255, 255])
        }
    })
}

/// White square with a solid frame around a white centre.
pub fn ringed_square(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| {
        let within = |lo: u32, hi: u32| {
            x >= w * lo / 8 && x < w * hi / 8 && y >= h * lo / 8 && y < h * hi / 8
        };
        if within(2, 6) && !within(3, 5) {
            TARGET
        } else {
            Rgba([255, 255, 255, 255])
        }
    })
}

pub fn text(content: &str) -> TextContent {
    TextContent {
        text: content.to_string(),
        color: Some("#000000".into()),
        is_bold: false,
        line_count: Some(1),
    }
}

pub fn critique(score: u8, verdict: Verdict, improved: Option<&str>) -> Critique {
    Critique {
        score,
        verdict,
        reason: format!("scored {score}"),
        improved_prompt: improved.map(str::to_string),
    }
}

pub fn parsed(c: Critique) -> Result<ServiceReply<Critique>, StageError> {
    Ok(ServiceReply::Parsed(c))
}

/// 1000×600 light-grey slide.
pub fn slide() -> RgbaImage {
    RgbaImage::from_pixel(1000, 600, Rgba([240, 240, 240, 255]))
}

/// Elements of the given types laid out left to right in non-overlapping
/// columns.
pub fn layout(types: &[ElementType]) -> Detection {
    let n = types.len().max(1) as f64;
    let width = 1000.0 / n;
    let elements = types
        .iter()
        .enumerate()
        .map(|(i, &element_type)| DetectedElement {
            element_type,
            description: Some(format!("{} number {i}", element_type.as_str().to_lowercase())),
            bbox: BoundingBox::new(100.0, i as f64 * width + 5.0, 400.0, (i + 1) as f64 * width - 5.0),
            z_order: i as i32,
        })
        .collect();
    Detection {
        background_color: "#F0F0F0".into(),
        elements,
    }
}

/// Route library logs to the test harness; `RUST_LOG=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builder with no waiting between retries or attempts.
pub fn fast_config(service: Arc<ScriptedService>) -> PipelineConfigBuilder {
    init_tracing();
    PipelineConfig::builder()
        .service(service)
        .stage_backoff_ms(0)
        .cooldown_ms(0)
}
