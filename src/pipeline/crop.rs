//! Region extraction: cut detected tables out of their page image.

use crate::model::{Detection, RasterPage, TableRegion};
use image::{DynamicImage, Rgba, RgbaImage};
use tracing::{debug, warn};

/// Pixels of white space between stitched regions.
const STITCH_GAP: u32 = 16;

/// Crop every detection on `page`, in the order given.
///
/// `detections` is expected to be the output of
/// [`crate::pipeline::detect::localize`], so the region index is the
/// confidence rank on the page. Degenerate boxes are skipped.
pub fn extract_regions(
    page: &RasterPage,
    detections: &[Detection],
    padding: u32,
) -> Vec<TableRegion> {
    detections
        .iter()
        .enumerate()
        .filter_map(|(index, det)| crop_region(page, det, index, padding))
        .collect()
}

/// Crop one detection with `padding` pixels on each side, clamped to the page.
pub fn crop_region(
    page: &RasterPage,
    det: &Detection,
    region_index: usize,
    padding: u32,
) -> Option<TableRegion> {
    let pad = padding as f32;
    let x0 = (det.bbox.x - pad).floor().max(0.0) as u32;
    let y0 = (det.bbox.y - pad).floor().max(0.0) as u32;
    let x1 = ((det.bbox.x + det.bbox.width + pad).ceil() as u32).min(page.width);
    let y1 = ((det.bbox.y + det.bbox.height + pad).ceil() as u32).min(page.height);

    if x1 <= x0 || y1 <= y0 {
        warn!(
            "{} p{}: skipping empty region {} ({:?})",
            page.document, page.page_number, region_index, det.bbox
        );
        return None;
    }

    let image = page.image.crop_imm(x0, y0, x1 - x0, y1 - y0);
    debug!(
        "{} p{} r{}: cropped {}x{} at ({}, {}), confidence {:.2}",
        page.document,
        page.page_number,
        region_index,
        x1 - x0,
        y1 - y0,
        x0,
        y0,
        det.confidence
    );

    Some(TableRegion {
        document: page.document.clone(),
        page_number: page.page_number,
        region_index,
        bbox: det.bbox,
        confidence: det.confidence,
        image,
    })
}

/// Stack regions top to bottom on a white canvas, left-aligned.
///
/// Used when a page's tables are sent to the model as one image. Returns
/// `None` for an empty slice.
pub fn stitch_vertical(regions: &[TableRegion]) -> Option<DynamicImage> {
    let width = regions.iter().map(|r| r.image.width()).max()?;
    let height = regions.iter().map(|r| r.image.height()).sum::<u32>()
        + STITCH_GAP * (regions.len() as u32 - 1);

    let mut canvas = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
    let mut y = 0i64;
    for region in regions {
        image::imageops::overlay(&mut canvas, &region.image.to_rgba8(), 0, y);
        y += (region.image.height() + STITCH_GAP) as i64;
    }
    Some(DynamicImage::ImageRgba8(canvas))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BoundingBox;

    fn page(w: u32, h: u32) -> RasterPage {
        let img = RgbaImage::from_pixel(w, h, Rgba([10, 20, 30, 255]));
        RasterPage::new("tariff.pdf", 1, DynamicImage::ImageRgba8(img))
    }

    fn det(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x, y, w, h),
            confidence: 0.9,
            class_id: 0,
        }
    }

    #[test]
    fn crop_adds_padding() {
        let r = crop_region(&page(200, 200), &det(50.0, 50.0, 20.0, 10.0), 0, 5).unwrap();
        assert_eq!((r.image.width(), r.image.height()), (30, 20));
        assert_eq!(r.region_index, 0);
        assert_eq!(r.document, "tariff.pdf");
    }

    #[test]
    fn crop_clamps_to_page() {
        let r = crop_region(&page(100, 100), &det(90.0, -5.0, 40.0, 30.0), 2, 8).unwrap();
        assert_eq!((r.image.width(), r.image.height()), (18, 33));
        assert_eq!(r.region_index, 2);
    }

    #[test]
    fn degenerate_box_is_skipped() {
        assert!(crop_region(&page(100, 100), &det(150.0, 150.0, 10.0, 10.0), 0, 0).is_none());
    }

    #[test]
    fn extract_keeps_rank_order() {
        let regions = extract_regions(
            &page(300, 300),
            &[det(0.0, 0.0, 50.0, 50.0), det(100.0, 100.0, 50.0, 50.0)],
            0,
        );
        let idx: Vec<_> = regions.iter().map(|r| r.region_index).collect();
        assert_eq!(idx, vec![0, 1]);
    }

    #[test]
    fn stitch_stacks_with_gap() {
        let p = page(300, 300);
        let regions = extract_regions(
            &p,
            &[det(0.0, 0.0, 100.0, 40.0), det(0.0, 100.0, 60.0, 20.0)],
            0,
        );
        let img = stitch_vertical(&regions).unwrap();
        assert_eq!(img.width(), 100);
        assert_eq!(img.height(), 40 + 20 + STITCH_GAP);
        assert!(stitch_vertical(&[]).is_none());
    }
}
