//! Pixel and payload transforms used around every model call.
//!
//! Each submodule implements exactly one transformation and holds no state,
//! so every function is safe to call from any worker concurrently.
//!
//! ## Data Flow (per element)
//!
//! ```text
//! slide ──▶ crop ──▶ square ──▶ encode ──▶ (Cleaner) ──▶ square⁻¹ ──▶ transparency
//!          (box→px)  (pad)      (base64)                  (unpad)      (flood / all)
//! ```
//!
//! 1. [`input`]  — resolve a path or URL and decode the slide
//! 2. [`crop`]   — map a normalised box to a padded pixel rectangle and cut it out
//! 3. [`square`] — pad to a white square for the 1:1 generator and invert it afterwards
//! 4. [`encode`] — PNG + base64 in both directions
//! 5. [`transparency`] — clear the white isolation backdrop
//! 6. [`reply`]  — recover JSON from model text

pub mod crop;
pub mod encode;
pub mod input;
pub mod reply;
pub mod square;
pub mod transparency;
