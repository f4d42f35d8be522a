//! Pipeline stages for tariff extraction.
//!
//! Each submodule implements one transformation step over explicit
//! intermediate types, so every stage can be tested on its own and the
//! unreliable ones (source, detector, vision model) can be swapped for fakes.
//!
//! ## Data Flow
//!
//! ```text
//! acquire ──▶ render ──▶ detect ──▶ crop ──▶ encode ──▶ parse ──▶ validate
//! (source)   (pdfium)   (ONNX)    (pixels)  (base64)   (VLM)    (records)
//! ```
//!
//! 1. [`acquire`]  — fetch a country's PDFs into a local workspace
//! 2. [`render`]   — rasterise pages; runs in `spawn_blocking`
//! 3. [`detect`]   — locate tables, then floor + NMS in [`detect::localize`]
//! 4. [`crop`]     — cut padded regions out of the page
//! 5. [`encode`]   — PNG + base64 for the multimodal request body
//! 6. [`parse`]    — vision-model call with retry and quarantine; the only
//!    stage talking to a rate-limited API
//! 7. [`validate`] — rows → canonical records or rejections

pub mod acquire;
pub mod crop;
pub mod detect;
pub mod encode;
pub mod parse;
pub mod render;
pub mod validate;
