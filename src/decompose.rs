//! Top-level entry points: load a slide, detect its layout, extract every
//! element.
//!
//! These functions wire the pieces together for the common case. Library
//! users that already have a decoded image or a layout (or their own
//! [`VisionService`]) can build a [`Session`] directly instead.

use crate::config::PipelineConfig;
use crate::error::DecomposeError;
use crate::output::{DecompositionOutput, RunStats};
use crate::pipeline::crop::fit_within;
use crate::pipeline::input;
use crate::service::provider::ProviderVisionService;
use crate::service::{DetectRequest, Detection, Metered, ServiceReply, VisionService};
use crate::session::Session;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

/// Decompose a slide image file or URL into isolated element assets.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(DecompositionOutput)` once every element is COMPLETED or
/// FAILED. Element failures are reported per element
/// (`output.stats.failed`), never as an `Err`.
///
/// # Errors
/// Returns `Err(DecomposeError)` only for fatal errors:
/// - File not found / unreadable / not an image
/// - No provider configured
/// - Layout detection failed
pub async fn decompose(
    input_str: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<DecompositionOutput, DecomposeError> {
    let input_str = input_str.as_ref();
    info!("Starting decomposition: {}", input_str);

    // ── Step 1: Resolve input ────────────────────────────────────────────
    let loaded = input::load_image(input_str, config.download_timeout_secs).await?;

    // ── Step 2: Get/create service ───────────────────────────────────────
    let service = resolve_service(config)?;

    // ── Step 3: Detect layout ────────────────────────────────────────────
    let detection = detect_metered(service.as_ref(), &loaded.image, config).await?;

    // ── Step 4: Extract ──────────────────────────────────────────────────
    let session = Session::new(loaded.image, detection.value, service, config.clone())
        .with_source(loaded.source);
    session.store().record_usage(&detection.usage);
    session.run_all().await;
    Ok(session.output())
}

/// Like [`decompose`], with a layout supplied by the caller instead of the
/// detection call.
pub async fn decompose_with_layout(
    input_str: impl AsRef<str>,
    detection: Detection,
    config: &PipelineConfig,
) -> Result<DecompositionOutput, DecomposeError> {
    let loaded = input::load_image(input_str.as_ref(), config.download_timeout_secs).await?;
    let service = resolve_service(config)?;
    let session = Session::new(loaded.image, detection, service, config.clone())
        .with_source(loaded.source);
    session.run_all().await;
    Ok(session.output())
}

/// Decompose and write `<id>.png` assets plus `manifest.json` into `dir`.
pub async fn decompose_to_dir(
    input_str: impl AsRef<str>,
    dir: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<RunStats, DecomposeError> {
    let output = decompose(input_str, config).await?;
    output.write_to_dir(dir).await?;
    Ok(output.stats)
}

/// Synchronous wrapper around [`decompose`].
///
/// Creates a temporary tokio runtime internally.
pub fn decompose_sync(
    input_str: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<DecompositionOutput, DecomposeError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| DecomposeError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(decompose(input_str, config))
}

/// Run only the layout detection for a slide.
pub async fn detect(
    input_str: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<Detection, DecomposeError> {
    let loaded = input::load_image(input_str.as_ref(), config.download_timeout_secs).await?;
    let service = resolve_service(config)?;
    detect_layout(service.as_ref(), &loaded.image, config).await
}

/// Send the slide, downscaled to `detection_max_dimension`, to the detector.
///
/// A single call with a timeout and no retry; any failure is fatal for the
/// run. Boxes are normalised, so downscaling does not change them.
pub async fn detect_layout(
    service: &dyn VisionService,
    slide: &RgbaImage,
    config: &PipelineConfig,
) -> Result<Detection, DecomposeError> {
    Ok(detect_metered(service, slide, config).await?.value)
}

async fn detect_metered(
    service: &dyn VisionService,
    slide: &RgbaImage,
    config: &PipelineConfig,
) -> Result<Metered<Detection>, DecomposeError> {
    let (w, h) = slide.dimensions();
    let (nw, nh) = fit_within(w, h, config.detection_max_dimension);
    let scaled;
    let view = if (nw, nh) == (w, h) {
        slide
    } else {
        scaled = imageops::resize(slide, nw, nh, FilterType::Triangle);
        &scaled
    };

    let request = DetectRequest {
        model: &config.detection_model,
        slide: view,
    };
    let limit = Duration::from_secs(config.detection_timeout_secs);
    let reply = match timeout(limit, service.detect(request)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            return Err(DecomposeError::DetectionFailed {
                detail: e.to_string(),
            })
        }
        Err(_) => {
            return Err(DecomposeError::DetectionFailed {
                detail: format!("timed out after {}s", limit.as_secs()),
            })
        }
    };

    match reply.value {
        ServiceReply::Parsed(detection) => {
            info!(
                "Detected {} element(s) on {} background",
                detection.elements.len(),
                detection.background_color
            );
            Ok(Metered::new(detection, reply.usage))
        }
        ServiceReply::Malformed { reason, .. } => {
            Err(DecomposeError::DetectionFailed { detail: reason })
        }
    }
}

/// Pick the service: a pre-built one from the config, else real providers.
fn resolve_service(config: &PipelineConfig) -> Result<Arc<dyn VisionService>, DecomposeError> {
    if let Some(service) = &config.service {
        return Ok(Arc::clone(service));
    }
    Ok(Arc::new(ProviderVisionService::from_config(config)?))
}
