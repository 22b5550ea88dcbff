//! Image encoding: `RgbaImage` ⇄ base64 PNG wrapped in `ImageData`.
//!
//! Vision APIs accept images as base64 payloads embedded in the JSON request
//! body. PNG is used in both directions because it is lossless and keeps the
//! alpha channel: the Critic must see exactly what the Cleaner produced, and
//! a JPEG round trip would smear the white backdrop into off-white noise that
//! the transparency stage could no longer recognise.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use tracing::debug;

/// Encode an RGBA buffer as a base64 PNG ready for a vision request.
///
/// `detail: "high"` keeps small artefacts (letter remnants, thin borders)
/// visible to models that tile their input.
pub fn encode_png(img: &RgbaImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded {}x{} image → {} bytes base64", img.width(), img.height(), b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Decode base64 image data (optionally a `data:` URI) into RGBA8.
pub fn decode_base64(data: &str) -> Result<RgbaImage, String> {
    let payload = strip_data_uri(data);
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("invalid base64: {e}"))?;
    decode_bytes(&bytes)
}

/// Decode raw encoded image bytes (PNG, JPEG, WebP) into RGBA8.
pub fn decode_bytes(bytes: &[u8]) -> Result<RgbaImage, String> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| e.to_string())
}

/// `data:image/png;base64,AAAA` → `AAAA`; anything else is returned as is.
fn strip_data_uri(data: &str) -> &str {
    if data.starts_with("data:") {
        if let Some((_, payload)) = data.split_once(',') {
            return payload;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn encode_small_image() {
        let img = RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255]));
        let data = encode_png(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        assert!(!data.data.is_empty());
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert!(!decoded.is_empty());
    }

    #[test]
    fn alpha_survives_round_trip() {
        let mut img = RgbaImage::from_pixel(4, 3, Rgba([10, 20, 30, 255]));
        img.put_pixel(1, 1, Rgba([255, 255, 255, 0]));
        let data = encode_png(&img).expect("encode");
        let back = decode_base64(&data.data).expect("decode");
        assert_eq!(back, img);
    }

    #[test]
    fn data_uri_prefix_is_accepted() {
        let img = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255]));
        let data = encode_png(&img).expect("encode");
        let uri = format!("data:image/png;base64,{}", data.data);
        assert_eq!(decode_base64(&uri).expect("decode"), img);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode_base64("not base64 at all!").is_err());
        assert!(decode_bytes(b"\x00\x01\x02").is_err());
    }
}
