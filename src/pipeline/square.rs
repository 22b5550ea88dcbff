//! Square padding for the generation model, and its inverse.
//!
//! Image-generation models are asked for a 1:1 output, so every crop is
//! letterboxed onto a white square before the Cleaner call. The model is free
//! to answer at a different resolution than it was given (a 300 px square can
//! come back as 1024 px), so [`unpad`] cannot simply cut the recorded insets
//! back out. It instead locates the original content as a *fraction* of the
//! returned square:
//!
//! ```text
//! content_w = original_w / max(original_w, original_h) * output_w
//! content_h = original_h / max(original_w, original_h) * output_h
//! ```
//!
//! centres that region and resamples it back to the original size. Cutting
//! with the input-space insets instead makes the restored element look zoomed
//! in whenever the output resolution differs.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Where the original content sits inside the padded square.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquareInsets {
    pub left: u32,
    pub top: u32,
    pub size: u32,
}

/// Centre `image` on a solid white square whose side is its longer edge.
pub fn pad_to_square(image: &RgbaImage) -> (RgbaImage, SquareInsets) {
    let (w, h) = image.dimensions();
    let size = w.max(h);
    let insets = SquareInsets {
        left: (size - w) / 2,
        top: (size - h) / 2,
        size,
    };

    let mut square = RgbaImage::from_pixel(size, size, WHITE);
    imageops::replace(
        &mut square,
        image,
        i64::from(insets.left),
        i64::from(insets.top),
    );
    (square, insets)
}

/// Recover an `original_width × original_height` image from a square
/// generation output of arbitrary resolution.
pub fn unpad(square: &RgbaImage, original_width: u32, original_height: u32) -> RgbaImage {
    let (out_w, out_h) = square.dimensions();
    let target_w = original_width.max(1);
    let target_h = original_height.max(1);
    if out_w == 0 || out_h == 0 {
        return RgbaImage::from_pixel(target_w, target_h, WHITE);
    }

    let longest = f64::from(target_w.max(target_h));
    let src_w = (f64::from(target_w) / longest * f64::from(out_w))
        .round()
        .clamp(1.0, f64::from(out_w)) as u32;
    let src_h = (f64::from(target_h) / longest * f64::from(out_h))
        .round()
        .clamp(1.0, f64::from(out_h)) as u32;
    let src_x = (out_w - src_w) / 2;
    let src_y = (out_h - src_h) / 2;

    let region = imageops::crop_imm(square, src_x, src_y, src_w, src_h).to_image();
    if region.dimensions() == (target_w, target_h) {
        return region;
    }
    imageops::resize(&region, target_w, target_h, FilterType::Triangle)
}
