//! Image encoding: crop → base64 PNG wrapped in `ImageData`.
//!
//! PNG because it is lossless; JPEG ringing around thin table rules and
//! small digits is exactly what makes a vision model misread a charge.
//! `detail: "high"` lets GPT-4-class models tile the image instead of
//! squashing it into a single 512 px overview.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a table crop for the vision model, downscaling it first if its
/// longest edge exceeds `max_edge`.
pub fn encode_region(img: &DynamicImage, max_edge: u32) -> Result<ImageData, image::ImageError> {
    let png = png_bytes(&fit_within(img, max_edge))?;
    let b64 = STANDARD.encode(&png);
    debug!("Encoded region → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Raw PNG bytes, also used when artifacts are retained on disk.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

fn fit_within(img: &DynamicImage, max_edge: u32) -> std::borrow::Cow<'_, DynamicImage> {
    if img.width().max(img.height()) <= max_edge {
        std::borrow::Cow::Borrowed(img)
    } else {
        std::borrow::Cow::Owned(img.resize(max_edge, max_edge, FilterType::Lanczos3))
    }
}
