//! Entities that flow through one pipeline run.
//!
//! ```text
//! SourceDocument ─▶ RasterPage ─▶ Detection ─▶ TableRegion ─▶ RawExtraction ─▶ TariffRecord
//! ```
//!
//! Image-bearing types ([`RasterPage`], [`TableRegion`]) are in-memory only;
//! everything else is serialisable and ends up in storage or in the
//! [`RunSummary`].

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::StageError;

/// A tariff PDF fetched for one country.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Stable identifier of the document within its source (file name, URL, portal id).
    pub source_id: String,
    pub country: String,
    /// Shipping line the source is configured for, if known up front.
    pub line: Option<String>,
    /// `inbound` / `outbound` label reported by a portal index.
    pub direction: Option<String>,
    /// Local PDF path.
    pub path: PathBuf,
    pub fetched_at: DateTime<Utc>,
}

impl SourceDocument {
    /// Short name used in logs and error reports.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source_id.clone())
    }
}

/// One rasterised page of a [`SourceDocument`].
#[derive(Debug, Clone)]
pub struct RasterPage {
    pub document: String,
    /// 1-indexed page number.
    pub page_number: usize,
    pub image: Arc<DynamicImage>,
    pub width: u32,
    pub height: u32,
}

impl RasterPage {
    pub fn new(document: impl Into<String>, page_number: usize, image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        Self {
            document: document.into(),
            page_number,
            image: Arc::new(image),
            width,
            height,
        }
    }
}

/// Axis-aligned box in page pixel coordinates (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from corner coordinates `(x1, y1, x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1.min(x2), y1.min(y2), (x2 - x1).abs(), (y2 - y1).abs())
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over Union with another box.
    #[inline]
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A candidate table found by the detector, before cropping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    pub class_id: usize,
}

/// A cropped table image ready for the parser.
#[derive(Debug, Clone)]
pub struct TableRegion {
    pub document: String,
    pub page_number: usize,
    /// 0-indexed position in the page's confidence-ordered region list.
    pub region_index: usize,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub image: DynamicImage,
}

impl TableRegion {
    pub fn reference(&self) -> RegionRef {
        RegionRef {
            document: self.document.clone(),
            page: self.page_number,
            region: self.region_index,
            confidence: self.confidence,
        }
    }
}

/// Lightweight pointer back to the region an extraction came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRef {
    pub document: String,
    pub page: usize,
    pub region: usize,
    pub confidence: f32,
}

impl fmt::Display for RegionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} p{} r{}", self.document, self.page, self.region)
    }
}

/// Outcome label stored with every raw extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Parsed,
    StructuralError,
    RetryExhausted,
    RejectedByModel,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Parsed => "parsed",
            ExtractionStatus::StructuralError => "structural_error",
            ExtractionStatus::RetryExhausted => "retry_exhausted",
            ExtractionStatus::RejectedByModel => "rejected_by_model",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parsed" => Some(ExtractionStatus::Parsed),
            "structural_error" => Some(ExtractionStatus::StructuralError),
            "retry_exhausted" => Some(ExtractionStatus::RetryExhausted),
            "rejected_by_model" => Some(ExtractionStatus::RejectedByModel),
            _ => None,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        !matches!(self, ExtractionStatus::Parsed)
    }
}

/// Audit record of one vision-model exchange. Always persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExtraction {
    pub region: RegionRef,
    pub prompt_version: String,
    pub model_id: String,
    /// Model text on success; the last upstream error message when no
    /// answer was ever received.
    pub raw_output: String,
    pub latency_ms: u64,
    pub attempts: u32,
    pub status: ExtractionStatus,
    pub reason: Option<String>,
}

/// `(country, port, line, equipment)` — unique in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub country: String,
    pub port: String,
    pub line: String,
    pub equipment: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.country, self.port, self.line, self.equipment
        )
    }
}

/// Canonical, validated tariff row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffRecord {
    pub country: String,
    pub port: String,
    pub line: String,
    pub equipment: String,
    /// ISO-4217 style three letter code.
    pub currency: String,
    /// Canonical bucket id → free days.
    pub free_days: BTreeMap<String, u32>,
    /// Equipment → canonical bucket id → charge per day.
    pub demurrage: BTreeMap<String, BTreeMap<String, f64>>,
    pub last_updated: DateTime<Utc>,
}

impl TariffRecord {
    pub fn key(&self) -> NaturalKey {
        NaturalKey {
            country: self.country.clone(),
            port: self.port.clone(),
            line: self.line.clone(),
            equipment: self.equipment.clone(),
        }
    }

    /// Deterministic serialisation of every non-key attribute except the
    /// timestamp. Two records with equal fingerprints are the same tariff.
    pub fn fingerprint(&self) -> String {
        serde_json::json!({
            "currency": self.currency,
            "free_days": self.free_days,
            "demurrage": self.demurrage,
        })
        .to_string()
    }

    pub fn same_attributes(&self, other: &TariffRecord) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

/// A stage failure folded into the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    /// `acquire`, `render`, `detect`, `parse`, `persist` or `storage`.
    pub stage: String,
    pub document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<usize>,
    pub code: String,
    pub message: String,
}

impl RunError {
    pub fn new(stage: &str, document: Option<&str>, error: &StageError) -> Self {
        Self {
            stage: stage.to_string(),
            document: document.map(str::to_string),
            page: None,
            region: None,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    /// A source location that could not be read. Not tied to a document.
    pub fn acquisition(location: &str, message: impl Into<String>) -> Self {
        Self {
            stage: "acquire".to_string(),
            document: Some(location.to_string()),
            page: None,
            region: None,
            code: "acquisition_failed".to_string(),
            message: message.into(),
        }
    }

    pub fn at_page(mut self, page: usize) -> Self {
        self.page = Some(page);
        self
    }

    pub fn at_region(mut self, page: usize, region: usize) -> Self {
        self.page = Some(page);
        self.region = Some(region);
        self
    }
}

/// Result of one orchestrator run, returned to the caller as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub country: String,
    pub documents_processed: usize,
    pub pages_rendered: usize,
    pub regions_detected: usize,
    pub regions_quarantined: usize,
    /// Records inserted or updated.
    pub records_persisted: usize,
    /// Records whose stored copy was already identical.
    pub records_unchanged: usize,
    pub records_rejected: usize,
    pub errors: Vec<RunError>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            country: country.into(),
            ..Default::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(amount: f64) -> TariffRecord {
        TariffRecord {
            country: "India".into(),
            port: "Nhava Sheva".into(),
            line: "COSCO".into(),
            equipment: "20GP".into(),
            currency: "USD".into(),
            free_days: BTreeMap::from([("0-5".into(), 5), ("6-10".into(), 3)]),
            demurrage: BTreeMap::from([(
                "20GP".into(),
                BTreeMap::from([("0-5".into(), 0.0), ("6-10".into(), amount)]),
            )]),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn bbox_iou() {
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BoundingBox::new(50.0, 50.0, 100.0, 100.0);
        let iou = a.iou(&b);
        assert!(iou > 0.14 && iou < 0.15, "got {iou}");

        assert!((a.iou(&a) - 1.0).abs() < 1e-6);

        let far = BoundingBox::new(500.0, 500.0, 10.0, 10.0);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn bbox_from_corners_normalises_order() {
        let b = BoundingBox::from_corners(30.0, 40.0, 10.0, 20.0);
        assert_eq!(b, BoundingBox::new(10.0, 20.0, 20.0, 20.0));
    }

    #[test]
    fn fingerprint_ignores_timestamp() {
        let a = record(50.0);
        let mut b = record(50.0);
        b.last_updated = a.last_updated + chrono::Duration::seconds(10);
        assert!(a.same_attributes(&b));
        assert!(!a.same_attributes(&record(60.0)));
    }

    #[test]
    fn natural_key_display() {
        assert_eq!(record(1.0).key().to_string(), "India/Nhava Sheva/COSCO/20GP");
    }

    #[test]
    fn extraction_status_round_trip_names() {
        for s in [
            ExtractionStatus::Parsed,
            ExtractionStatus::StructuralError,
            ExtractionStatus::RetryExhausted,
            ExtractionStatus::RejectedByModel,
        ] {
            assert_eq!(ExtractionStatus::parse(s.as_str()), Some(s));
        }
        assert!(!ExtractionStatus::Parsed.is_quarantined());
        assert!(ExtractionStatus::RetryExhausted.is_quarantined());
    }
}
