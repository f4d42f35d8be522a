//! PDF rasterisation: render every page of a document to a `DynamicImage`.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and does CPU-heavy work. `tokio::task::spawn_blocking` keeps that
//! off the async worker threads.
//!
//! ## DPI and pixel cap
//!
//! Pages are rendered at the configured DPI, but the longest edge is capped
//! at `max_rendered_pixels`. Tariff sheets are sometimes A3 or wider; the
//! cap keeps memory bounded and keeps crops in the size range vision models
//! read best.

use crate::error::StageError;
use crate::model::{RasterPage, SourceDocument};
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info, warn};

/// Pages that rendered, plus one error per page that did not.
#[derive(Debug, Default)]
pub struct RenderedDocument {
    pub pages: Vec<RasterPage>,
    pub failures: Vec<StageError>,
}

/// Turns a source document into page images.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// `Err` means the document as a whole could not be opened; failures on
    /// single pages go into [`RenderedDocument::failures`].
    async fn render(&self, document: &SourceDocument) -> Result<RenderedDocument, StageError>;
}

/// pdfium-backed renderer.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    dpi: u32,
    max_pixels: u32,
}

impl PdfiumRenderer {
    pub fn new(dpi: u32, max_pixels: u32) -> Self {
        Self { dpi, max_pixels }
    }
}

#[async_trait]
impl PageRenderer for PdfiumRenderer {
    async fn render(&self, document: &SourceDocument) -> Result<RenderedDocument, StageError> {
        let path = document.path.clone();
        let name = document.display_name();
        let (dpi, max_pixels) = (self.dpi, self.max_pixels);

        tokio::task::spawn_blocking(move || render_blocking(&path, &name, dpi, max_pixels))
            .await
            .map_err(|e| StageError::Render {
                page: None,
                detail: format!("render task panicked: {e}"),
            })?
    }
}

/// Pixel width for a page `width_pts` wide at `dpi`, capped at `max_pixels`.
pub fn target_width(width_pts: f32, dpi: u32, max_pixels: u32) -> i32 {
    let px = (width_pts / 72.0 * dpi as f32).round() as i32;
    px.clamp(1, max_pixels as i32)
}

fn render_blocking(
    pdf_path: &Path,
    name: &str,
    dpi: u32,
    max_pixels: u32,
) -> Result<RenderedDocument, StageError> {
    let pdfium = pdfium_auto::bind_pdfium_silent().map_err(|e| StageError::Render {
        page: None,
        detail: format!("pdfium unavailable: {e}"),
    })?;

    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| StageError::Render {
            page: None,
            detail: format!("cannot open {}: {e:?}", pdf_path.display()),
        })?;

    let pages = document.pages();
    let total = pages.len() as usize;
    info!("{}: {} pages", name, total);

    let mut out = RenderedDocument::default();
    for idx in 0..total {
        let page_number = idx + 1;
        let page = match pages.get(idx as u16) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}: page {} unreadable: {:?}", name, page_number, e);
                out.failures.push(StageError::Render {
                    page: Some(page_number),
                    detail: format!("{e:?}"),
                });
                continue;
            }
        };

        let config = PdfRenderConfig::new()
            .set_target_width(target_width(page.width().value, dpi, max_pixels))
            .set_maximum_height(max_pixels as i32);

        match page.render_with_config(&config) {
            Ok(bitmap) => {
                let image = bitmap.as_image();
                debug!(
                    "{}: page {} → {}x{} px",
                    name,
                    page_number,
                    image.width(),
                    image.height()
                );
                out.pages.push(RasterPage::new(name, page_number, image));
            }
            Err(e) => {
                warn!("{}: page {} failed to render: {:?}", name, page_number, e);
                out.failures.push(StageError::Render {
                    page: Some(page_number),
                    detail: format!("{e:?}"),
                });
            }
        };
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_width_follows_dpi() {
        // US letter is 612 pt wide.
        assert_eq!(target_width(612.0, 72, 4000), 612);
        assert_eq!(target_width(612.0, 150, 4000), 1275);
    }

    #[test]
    fn target_width_is_capped() {
        // A3 landscape at 300 DPI would be ~4960 px.
        assert_eq!(target_width(1190.0, 300, 2000), 2000);
        assert_eq!(target_width(0.0, 150, 2000), 1);
    }
}
