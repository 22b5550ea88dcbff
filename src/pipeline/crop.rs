//! Box-to-pixel mapping and source cropping.
//!
//! Detection boxes live in a resolution-independent `[0, 1000]` space. Before
//! any generative call the box is mapped onto the actual slide pixels,
//! expanded by a fixed padding so the models see a little surrounding
//! context, clamped to the image, and cut out.
//!
//! Large crops are downscaled so the longest edge is at most
//! `max_crop_dimension`; the generation models do not benefit from more
//! pixels and upload size stays bounded.

use crate::element::{BoundingBox, BOX_SCALE};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use thiserror::Error;
use tracing::debug;

/// Integer pixel rectangle, always contained in the image it was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

/// The padded, clamped region has no area.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("degenerate crop region {width}x{height} px for box {bbox:?} on {image_width}x{image_height} image")]
pub struct DegenerateRegion {
    pub width: i64,
    pub height: i64,
    pub bbox: BoundingBox,
    pub image_width: u32,
    pub image_height: u32,
}

/// Map a normalised box to a padded pixel rectangle inside the image.
///
/// `pixel = normalized / 1000 * dimension`, then `padding` pixels are added
/// on every side and the result is clamped to `[0, width] × [0, height]`.
/// The near edge is floored and the far edge ceiled so fractional boxes never
/// lose a partially covered pixel.
pub fn crop_region(
    image_width: u32,
    image_height: u32,
    bbox: &BoundingBox,
    padding: u32,
) -> Result<PixelRect, DegenerateRegion> {
    let w = f64::from(image_width);
    let h = f64::from(image_height);
    let pad = f64::from(padding);

    let x1 = (bbox.xmin / BOX_SCALE * w - pad).max(0.0).floor();
    let y1 = (bbox.ymin / BOX_SCALE * h - pad).max(0.0).floor();
    let x2 = (bbox.xmax / BOX_SCALE * w + pad).min(w).ceil();
    let y2 = (bbox.ymax / BOX_SCALE * h + pad).min(h).ceil();

    let width = (x2 - x1) as i64;
    let height = (y2 - y1) as i64;
    if width <= 0 || height <= 0 {
        return Err(DegenerateRegion {
            width,
            height,
            bbox: *bbox,
            image_width,
            image_height,
        });
    }

    Ok(PixelRect {
        x: x1 as u32,
        y: y1 as u32,
        width: width as u32,
        height: height as u32,
    })
}

/// Cut `rect` out of `image`, downscaling uniformly if either side exceeds
/// `max_dimension`.
pub fn crop_and_downscale(image: &RgbaImage, rect: PixelRect, max_dimension: u32) -> RgbaImage {
    let crop = imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
    let (w, h) = crop.dimensions();
    if w <= max_dimension && h <= max_dimension {
        return crop;
    }

    let (nw, nh) = fit_within(w, h, max_dimension);
    debug!("Downscaling crop {}x{} -> {}x{}", w, h, nw, nh);
    imageops::resize(&crop, nw, nh, FilterType::Triangle)
}

/// Dimensions scaled by `max_dimension / max(w, h)`, never below 1 px.
pub fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height).max(1);
    if longest <= max_dimension {
        return (width, height);
    }
    let scale = f64::from(max_dimension) / f64::from(longest);
    let nw = (f64::from(width) * scale).round().max(1.0) as u32;
    let nh = (f64::from(height) * scale).round().max(1.0) as u32;
    (nw.min(max_dimension), nh.min(max_dimension))
}
