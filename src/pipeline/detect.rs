//! Table localisation on rendered pages.
//!
//! Split in two:
//!
//! * a [`TableDetector`] backend that turns one page image into raw
//!   candidate boxes (the ONNX model in production, fakes in tests), and
//! * [`localize`], a pure function applying the confidence floor, sorting,
//!   non-maximum suppression and the per-page cap.
//!
//! Only the output of [`localize`] is ever cropped and sent to the parser.

use crate::error::{StageError, TariffError};
use crate::model::{BoundingBox, Detection, RasterPage};
use async_trait::async_trait;
use image::RgbImage;
use ndarray::Array;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Produces raw table candidates for a page.
#[async_trait]
pub trait TableDetector: Send + Sync {
    async fn detect(&self, page: &RasterPage) -> Result<Vec<Detection>, StageError>;
}

/// Floor → sort by descending confidence → NMS → cap.
///
/// NMS is class-agnostic: any two overlapping boxes describe the same
/// table, whatever sub-class the detector assigned them. A box is suppressed
/// when its IoU with an already-kept box exceeds `iou_threshold`.
pub fn localize(
    candidates: Vec<Detection>,
    confidence_floor: f32,
    iou_threshold: f32,
    max_regions: usize,
) -> Vec<Detection> {
    let mut sorted: Vec<Detection> = candidates
        .into_iter()
        .filter(|d| d.confidence.is_finite() && d.confidence >= confidence_floor)
        .filter(|d| d.bbox.area() > 0.0)
        .collect();

    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::with_capacity(sorted.len());
    for det in sorted {
        if keep.len() >= max_regions {
            break;
        }
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

// ── ONNX backend ─────────────────────────────────────────────────────────

/// YOLO-family table detector run through ONNX Runtime.
///
/// Holds `pool_size` sessions; each inference checks one out on the blocking
/// pool and returns it when done, so the session count is also the
/// concurrency bound.
pub struct OnnxTableDetector {
    pool: Arc<Mutex<Vec<Session>>>,
    permits: Arc<Semaphore>,
    input_size: u32,
}

impl OnnxTableDetector {
    pub fn load(model_path: &Path, input_size: u32, pool_size: usize) -> Result<Self, TariffError> {
        let unavailable = |reason: String| TariffError::DetectorUnavailable {
            path: model_path.to_path_buf(),
            reason,
        };

        if !model_path.is_file() {
            return Err(unavailable("model file not found".into()));
        }

        info!(
            "Loading table detector from {:?} ({} session(s))",
            model_path, pool_size
        );
        let mut sessions = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let session = Session::builder()
                .map_err(|e| unavailable(e.to_string()))?
                .commit_from_file(model_path)
                .map_err(|e| unavailable(e.to_string()))?;
            sessions.push(session);
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(sessions.len())),
            pool: Arc::new(Mutex::new(sessions)),
            input_size,
        })
    }
}

#[async_trait]
impl TableDetector for OnnxTableDetector {
    async fn detect(&self, page: &RasterPage) -> Result<Vec<Detection>, StageError> {
        let fail = |detail: String| StageError::Detection {
            page: page.page_number,
            detail,
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let session = self
            .pool
            .lock()
            .map_err(|_| fail("session pool poisoned".into()))?
            .pop()
            .ok_or_else(|| fail("no detector session available".into()))?;

        let pool = Arc::clone(&self.pool);
        let image = Arc::clone(&page.image);
        let input_size = self.input_size;

        tokio::task::spawn_blocking(move || {
            let mut session = session;
            let rgb = image.to_rgb8();
            let result = infer(&mut session, &rgb, input_size);
            if let Ok(mut p) = pool.lock() {
                p.push(session);
            }
            result
        })
        .await
        .map_err(|e| fail(format!("detector task panicked: {e}")))?
        .map_err(fail)
    }
}

/// Resize to the model input, CHW-normalise to `[0, 1]`.
fn preprocess(image: &RgbImage, input_size: u32) -> Array<f32, ndarray::Dim<[usize; 4]>> {
    let resized = image::imageops::resize(
        image,
        input_size,
        input_size,
        image::imageops::FilterType::Triangle,
    );

    let size = input_size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        input[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
        input[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
        input[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
    }
    input
}

fn infer(session: &mut Session, image: &RgbImage, input_size: u32) -> Result<Vec<Detection>, String> {
    let input = preprocess(image, input_size);
    let tensor = TensorRef::from_array_view(input.view()).map_err(|e| e.to_string())?;
    let outputs = session
        .run(ort::inputs![tensor])
        .map_err(|e| e.to_string())?;

    let (shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| format!("failed to extract tensor: {e}"))?;

    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    let detections = decode_output(
        &dims,
        data,
        input_size,
        image.width(),
        image.height(),
    )?;
    debug!("Detector produced {} raw candidates", detections.len());
    Ok(detections)
}

/// Decode a `(1, 4 + classes, anchors)` YOLO output into page-pixel boxes.
///
/// Box features are centre-format in model-input pixels; they are rescaled
/// to the source image and clamped to its bounds.
pub fn decode_output(
    dims: &[usize],
    data: &[f32],
    input_size: u32,
    image_width: u32,
    image_height: u32,
) -> Result<Vec<Detection>, String> {
    let [_, features, anchors] = dims else {
        return Err(format!("expected 3D output tensor, got {}D", dims.len()));
    };
    let (features, anchors) = (*features, *anchors);
    if features < 5 {
        return Err(format!("output has {features} features, need at least 5"));
    }
    if data.len() < features * anchors {
        return Err("output tensor shorter than its shape".into());
    }

    let num_classes = features - 4;
    let sx = image_width as f32 / input_size as f32;
    let sy = image_height as f32 / input_size as f32;
    let (max_x, max_y) = (image_width as f32, image_height as f32);

    let mut out = Vec::new();
    for anchor in 0..anchors {
        let feature = |f: usize| data[f * anchors + anchor];

        let (class_id, confidence) = (0..num_classes)
            .map(|c| (c, feature(4 + c)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        if confidence <= 0.0 {
            continue;
        }

        let (cx, cy, w, h) = (feature(0), feature(1), feature(2), feature(3));
        let x1 = ((cx - w / 2.0) * sx).clamp(0.0, max_x);
        let y1 = ((cy - h / 2.0) * sy).clamp(0.0, max_y);
        let x2 = ((cx + w / 2.0) * sx).clamp(0.0, max_x);
        let y2 = ((cy + h / 2.0) * sy).clamp(0.0, max_y);

        out.push(Detection {
            bbox: BoundingBox::from_corners(x1, y1, x2, y2),
            confidence,
            class_id,
        });
    }
    Ok(out)
}
