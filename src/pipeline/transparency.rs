//! White-backdrop removal for Cleaner output.
//!
//! The Cleaner is instructed to render the isolated element on pure
//! `#FFFFFF`. This stage turns that backdrop transparent. A pixel counts as
//! background when its alpha is non-zero and each of R, G, B exceeds
//! `255 - tolerance`.
//!
//! * [`TransparencyMode::All`] clears every background pixel. Used when the
//!   Analyst reported the element's own interior is not white.
//! * [`TransparencyMode::Flood`] clears only background pixels 4-connected to
//!   the image border through other background pixels, so a white card or
//!   the white face of an icon survives.

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default colour tolerance: only near-white anti-aliasing noise qualifies.
pub const DEFAULT_TOLERANCE: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransparencyMode {
    All,
    Flood,
}

impl TransparencyMode {
    /// Mode to use given the Analyst's `isWhiteInterior` flag.
    pub fn for_interior(is_white_interior: bool) -> Self {
        if is_white_interior {
            TransparencyMode::Flood
        } else {
            TransparencyMode::All
        }
    }
}

/// Return a copy of `image` with its white backdrop made transparent.
pub fn remove_background(image: &RgbaImage, mode: TransparencyMode, tolerance: u8) -> RgbaImage {
    let mut out = image.clone();
    let threshold = 255u8.saturating_sub(tolerance);

    match mode {
        TransparencyMode::All => {
            for pixel in out.pixels_mut() {
                if is_backdrop(pixel.0, threshold) {
                    pixel.0[3] = 0;
                }
            }
        }
        TransparencyMode::Flood => {
            let (w, h) = image.dimensions();
            if w == 0 || h == 0 {
                return out;
            }
            let idx = |x: u32, y: u32| (y as usize) * (w as usize) + x as usize;
            let mut visited = vec![false; (w as usize) * (h as usize)];
            let mut queue = VecDeque::new();

            let seed = |x: u32, y: u32, visited: &mut [bool], queue: &mut VecDeque<(u32, u32)>| {
                if !visited[idx(x, y)] && is_backdrop(image.get_pixel(x, y).0, threshold) {
                    visited[idx(x, y)] = true;
                    queue.push_back((x, y));
                }
            };
            for x in 0..w {
                seed(x, 0, &mut visited, &mut queue);
                seed(x, h - 1, &mut visited, &mut queue);
            }
            for y in 0..h {
                seed(0, y, &mut visited, &mut queue);
                seed(w - 1, y, &mut visited, &mut queue);
            }

            while let Some((x, y)) = queue.pop_front() {
                out.get_pixel_mut(x, y).0[3] = 0;

                let neighbours = [
                    (x.checked_add(1).filter(|&nx| nx < w), Some(y)),
                    (x.checked_sub(1), Some(y)),
                    (Some(x), y.checked_add(1).filter(|&ny| ny < h)),
                    (Some(x), y.checked_sub(1)),
                ];
                for (nx, ny) in neighbours {
                    if let (Some(nx), Some(ny)) = (nx, ny) {
                        seed(nx, ny, &mut visited, &mut queue);
                    }
                }
            }
        }
    }

    out
}

fn is_backdrop(p: [u8; 4], threshold: u8) -> bool {
    p[3] > 0 && p[0] > threshold && p[1] > threshold && p[2] > threshold
}
