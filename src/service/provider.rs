//! Production [`VisionService`]: edgequake-llm chat providers for the JSON
//! stages and a thin Gemini REST client for image generation.
//!
//! The chat stages (Analyst, Critic, transcription, detection) only need text out of a
//! multimodal prompt, which every edgequake-llm provider supports. Image
//! *output* is not part of the chat abstraction, so the Cleaner talks to the
//! Generative Language `generateContent` endpoint directly and picks the
//! first inline image out of the reply.

use super::payload::{parse_critique, parse_plan, parse_text};
use super::{
    Critique, CritiqueRequest, DetectRequest, Detection, GenerateRequest, Metered, Plan,
    PlanRequest, ServiceReply, TextRequest, TokenUsage, VisionService,
};
use crate::element::TextContent;
use crate::config::PipelineConfig;
use crate::error::{DecomposeError, StageError};
use crate::pipeline::encode::{decode_base64, encode_png};
use crate::prompts;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Public Generative Language API base.
pub const DEFAULT_IMAGE_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Vision service backed by real providers.
pub struct ProviderVisionService {
    provider_name: Option<String>,
    /// One chat provider per model, created on first use.
    providers: Mutex<HashMap<String, Arc<dyn LLMProvider>>>,
    images: GeminiImageClient,
    options: CompletionOptions,
}

impl ProviderVisionService {
    /// Resolve providers for every model the config names.
    ///
    /// Fails early with [`DecomposeError::ProviderNotConfigured`] so a
    /// missing key is reported once instead of as one failure per element.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, DecomposeError> {
        let images = GeminiImageClient::from_env(config.image_endpoint.as_deref())?;
        let service = Self {
            provider_name: config.provider_name.clone(),
            providers: Mutex::new(HashMap::new()),
            images,
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
        };
        for model in [
            &config.analyst_model,
            &config.critic_model,
            &config.text_model,
            &config.detection_model,
        ] {
            let provider = resolve_provider(config.provider_name.as_deref(), model)?;
            service.cache().insert(model.clone(), provider);
        }
        Ok(service)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn LLMProvider>>> {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn provider_for(&self, model: &str) -> Result<Arc<dyn LLMProvider>, StageError> {
        if let Some(p) = self.cache().get(model) {
            return Ok(Arc::clone(p));
        }
        let provider = resolve_provider(self.provider_name.as_deref(), model)
            .map_err(|e| StageError::Transport(e.to_string()))?;
        self.cache().insert(model.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// One chat round trip: system prompt, then a user turn with images.
    async fn chat_json(
        &self,
        model: &str,
        system: String,
        user_text: &str,
        images: Vec<ImageData>,
    ) -> Result<Metered<String>, StageError> {
        let provider = self.provider_for(model)?;
        let messages = vec![
            ChatMessage::system(system.as_str()),
            ChatMessage::user_with_images(user_text, images),
        ];
        let response = provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| StageError::Transport(e.to_string()))?;
        debug!(
            "{}: {} input tokens, {} output tokens",
            model, response.prompt_tokens, response.completion_tokens
        );
        Ok(Metered::new(
            response.content,
            TokenUsage::new(model, response.prompt_tokens, response.completion_tokens),
        ))
    }
}

fn encode(img: &RgbaImage) -> Result<ImageData, StageError> {
    encode_png(img).map_err(|e| StageError::Transport(format!("could not encode image: {e}")))
}

#[async_trait]
impl VisionService for ProviderVisionService {
    async fn plan(&self, request: PlanRequest<'_>) -> Result<Metered<ServiceReply<Plan>>, StageError> {
        let system = prompts::analyst_prompt(
            request.element_type,
            request.description,
            request.background_color,
        );
        let reply = self
            .chat_json(
                request.model,
                system,
                "Plan the erase instructions for this element.",
                vec![encode(request.crop)?],
            )
            .await?;
        Ok(Metered::new(parse_plan(&reply.value), reply.usage))
    }

    async fn generate(&self, request: GenerateRequest<'_>) -> Result<Metered<RgbaImage>, StageError> {
        let input = encode(request.image)?;
        let reply = self
            .images
            .generate(request.model, &input, request.instruction)
            .await?;
        let data = reply.value;
        let image = tokio::task::spawn_blocking(move || decode_base64(&data))
            .await
            .map_err(|e| StageError::Decode(format!("decode task panicked: {e}")))?
            .map_err(StageError::Decode)?;
        Ok(Metered::new(image, reply.usage))
    }

    async fn critique(
        &self,
        request: CritiqueRequest<'_>,
    ) -> Result<Metered<ServiceReply<Critique>>, StageError> {
        let reply = self
            .chat_json(
                request.model,
                prompts::critic_prompt(request.cleaning_goal),
                "First image: Original Reference Crop. Second image: Cleaned Candidate Result.",
                vec![encode(request.original)?, encode(request.candidate)?],
            )
            .await?;
        Ok(Metered::new(parse_critique(&reply.value), reply.usage))
    }

    async fn analyze_text(
        &self,
        request: TextRequest<'_>,
    ) -> Result<Metered<ServiceReply<TextContent>>, StageError> {
        let reply = self
            .chat_json(
                request.model,
                prompts::TEXT_EXTRACTION_PROMPT.to_string(),
                "Transcribe this text crop.",
                vec![encode(request.crop)?],
            )
            .await?;
        Ok(Metered::new(parse_text(&reply.value), reply.usage))
    }

    async fn detect(
        &self,
        request: DetectRequest<'_>,
    ) -> Result<Metered<ServiceReply<Detection>>, StageError> {
        let reply = self
            .chat_json(
                request.model,
                prompts::DETECTION_PROMPT.to_string(),
                prompts::DETECTION_INSTRUCTION,
                vec![encode(request.slide)?],
            )
            .await?;
        Ok(Metered::new(Detection::parse(&reply.value), reply.usage))
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_chat_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, DecomposeError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        DecomposeError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the chat provider for `model`, from most-specific to least.
///
/// 1. **Named provider** (`--provider` / `PipelineConfig::provider_name`).
/// 2. **`EDGEQUAKE_LLM_PROVIDER`**, with `EDGEQUAKE_MODEL` overriding the
///    stage model when set.
/// 3. **`GEMINI_API_KEY` / `GOOGLE_API_KEY`** present → the `gemini`
///    provider, since the default stage models are Gemini models.
/// 4. **[`ProviderFactory::from_env`]** auto-detection.
pub fn resolve_provider(
    provider_name: Option<&str>,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, DecomposeError> {
    if let Some(name) = provider_name {
        return create_chat_provider(name, model);
    }

    if let Ok(prov) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        if !prov.is_empty() {
            let model = std::env::var("EDGEQUAKE_MODEL")
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| model.to_string());
            return create_chat_provider(&prov, &model);
        }
    }

    if gemini_key().is_some() {
        return create_chat_provider("gemini", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| DecomposeError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, or EDGEQUAKE_LLM_PROVIDER with the matching API key.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

fn gemini_key() -> Option<String> {
    ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.is_empty())
}

// ── Image generation client ──────────────────────────────────────────────

/// Minimal client for the `models/{model}:generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiImageClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GeminiImageClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Build from `GEMINI_API_KEY` (or `GOOGLE_API_KEY`).
    pub fn from_env(endpoint: Option<&str>) -> Result<Self, DecomposeError> {
        let key = gemini_key().ok_or_else(|| DecomposeError::ProviderNotConfigured {
            provider: "gemini".to_string(),
            hint: "Image cleaning needs GEMINI_API_KEY (or GOOGLE_API_KEY) to be set.".to_string(),
        })?;
        Ok(Self::new(endpoint.unwrap_or(DEFAULT_IMAGE_ENDPOINT), key))
    }

    fn url(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, model)
    }

    /// Send one image plus instructions; return the first inline image as
    /// base64.
    pub async fn generate(
        &self,
        model: &str,
        image: &ImageData,
        instruction: &str,
    ) -> Result<Metered<String>, StageError> {
        let body = GenerateContentRequest::new(image, instruction);
        let response = self
            .http
            .post(self.url(model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| StageError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StageError::Transport(e.to_string()))?;
        if !status.is_success() {
            let head: String = text.chars().take(200).collect();
            return Err(StageError::Transport(format!("HTTP {status}: {head}")));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&text)
            .map_err(|e| StageError::Transport(format!("unreadable generation reply: {e}")))?;
        let usage = parsed.usage(model);
        let data = parsed.first_inline_image().ok_or(StageError::MissingImage)?;
        Ok(Metered::new(data.to_string(), usage))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineDataRef<'a>,
    },
    Text {
        text: &'a str,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineDataRef<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: [&'static str; 2],
    image_config: ImageConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageConfig {
    aspect_ratio: &'static str,
}

impl<'a> GenerateContentRequest<'a> {
    fn new(image: &'a ImageData, instruction: &'a str) -> Self {
        Self {
            contents: vec![RequestContent {
                role: "user",
                parts: vec![
                    RequestPart::Inline {
                        inline_data: InlineDataRef {
                            mime_type: &image.mime_type,
                            data: &image.data,
                        },
                    },
                    RequestPart::Text { text: instruction },
                ],
            }],
            generation_config: GenerationConfig {
                response_modalities: ["TEXT", "IMAGE"],
                image_config: ImageConfig { aspect_ratio: "1:1" },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: usize,
    #[serde(default)]
    candidates_token_count: usize,
}

impl GenerateContentResponse {
    fn first_inline_image(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .find_map(|p| p.inline_data.as_ref())
            .map(|d| d.data.as_str())
            .filter(|d| !d.is_empty())
    }

    fn usage(&self, model: &str) -> TokenUsage {
        let meta = self.usage_metadata.as_ref();
        TokenUsage::new(
            model,
            meta.map_or(0, |m| m.prompt_token_count),
            meta.map_or(0, |m| m.candidates_token_count),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shape() {
        let image = ImageData::new("QUJD", "image/png");
        let body = serde_json::to_value(GenerateContentRequest::new(&image, "Erase the label"))
            .expect("serialise");
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[0]["inlineData"]["data"], "QUJD");
        assert_eq!(parts[1]["text"], "Erase the label");
        assert_eq!(body["generationConfig"]["imageConfig"]["aspectRatio"], "1:1");
    }

    #[test]
    fn first_inline_image_skips_text_parts() {
        let reply: GenerateContentResponse = serde_json::from_str(
            r#"{
                "candidates": [{"content": {"parts": [
                    {"text": "Here you go"},
                    {"inlineData": {"mimeType": "image/png", "data": "AAAA"}},
                    {"inlineData": {"mimeType": "image/png", "data": "BBBB"}}
                ]}}],
                "usageMetadata": {"promptTokenCount": 1290, "candidatesTokenCount": 1300}
            }"#,
        )
        .expect("parse");
        assert_eq!(reply.first_inline_image(), Some("AAAA"));
        let usage = reply.usage("gemini-2.5-flash-image");
        assert_eq!(usage.input_tokens, 1290);
        assert_eq!(usage.output_tokens, 1300);
    }

    #[test]
    fn text_only_reply_has_no_image() {
        let reply: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [{"text": "I can't edit that."}]}}]}"#,
        )
        .expect("parse");
        assert_eq!(reply.first_inline_image(), None);
        assert_eq!(reply.usage("m").input_tokens, 0);

        let empty: GenerateContentResponse = serde_json::from_str("{}").expect("parse");
        assert_eq!(empty.first_inline_image(), None);
    }

    #[test]
    fn endpoint_url() {
        let client = GeminiImageClient::new("http://localhost:9000/v1beta/", "k");
        assert_eq!(
            client.url("gemini-2.5-flash-image"),
            "http://localhost:9000/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
    }
}
