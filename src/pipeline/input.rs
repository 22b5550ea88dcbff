//! Input resolution: turn a user-supplied path or URL into a decoded slide.
//!
//! The slide is small enough (a single raster, typically a few MB) to be held
//! in memory, so URLs are downloaded straight into a buffer rather than to a
//! temporary file. Decoding runs in `spawn_blocking`: a 4K PNG takes long
//! enough to decode that it would otherwise stall a Tokio worker thread.

use crate::error::DecomposeError;
use image::RgbaImage;
use std::path::PathBuf;
use tracing::{debug, info};

/// A decoded slide plus a printable name for where it came from.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub source: String,
    pub image: RgbaImage,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to image bytes and decode them to RGBA8.
pub async fn load_image(input: &str, timeout_secs: u64) -> Result<LoadedImage, DecomposeError> {
    if input.trim().is_empty() {
        return Err(DecomposeError::InvalidInput {
            input: input.to_string(),
        });
    }

    let bytes = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(input).await?
    };

    let source = input.to_string();
    let name = source.clone();
    let image = tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes)
            .map(|img| img.to_rgba8())
            .map_err(|e| DecomposeError::NotAnImage {
                source_name: name,
                detail: e.to_string(),
            })
    })
    .await
    .map_err(|e| DecomposeError::Internal(format!("Decode task panicked: {}", e)))??;

    info!("Loaded slide {} ({}x{})", source, image.width(), image.height());
    Ok(LoadedImage { source, image })
}

/// Read a local file, mapping I/O failures to the fatal error variants.
async fn read_local(path_str: &str) -> Result<Vec<u8>, DecomposeError> {
    let path = PathBuf::from(path_str);

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!("Read local image: {} ({} bytes)", path.display(), bytes.len());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(DecomposeError::PermissionDenied { path })
        }
        Err(_) => Err(DecomposeError::FileNotFound { path }),
    }
}

/// Download a URL into memory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, DecomposeError> {
    info!("Downloading slide from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| DecomposeError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DecomposeError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            DecomposeError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(DecomposeError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| DecomposeError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    Ok(bytes.to_vec())
}
