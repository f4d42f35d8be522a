//! In-process fakes for the pipeline's unreliable collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tariff_extract::pipeline::acquire::Acquisition;
use tariff_extract::{
    BoundingBox, Detection, DocumentSource, PageRenderer, Pipeline, PipelineConfig,
    PipelineResources, RasterPage, RenderedDocument, SourceDocument, StageError, TableDetector,
    TariffError, TariffStore, VisionCallError, VisionModel, VisionSlot,
};

/// Serves a fixed list of document names for one country.
pub struct FakeSource {
    pub country: String,
    pub documents: Vec<String>,
}

impl FakeSource {
    pub fn new(country: &str, documents: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            country: country.to_string(),
            documents: documents.iter().map(|d| d.to_string()).collect(),
        })
    }
}

#[async_trait]
impl DocumentSource for FakeSource {
    fn has_country(&self, country: &str) -> bool {
        self.country.eq_ignore_ascii_case(country)
    }

    async fn acquire(
        &self,
        country: &str,
        _filter: Option<&str>,
        workspace: &Path,
    ) -> Result<Acquisition, TariffError> {
        Ok(Acquisition {
            documents: self
                .documents
                .iter()
                .map(|name| SourceDocument {
                    source_id: name.clone(),
                    country: country.to_string(),
                    line: Some("COSCO".into()),
                    direction: None,
                    path: workspace.join(name),
                    fetched_at: Utc::now(),
                })
                .collect(),
            failures: Vec::new(),
        })
    }
}

/// Blank pages; documents whose name starts with `broken` fail to open.
pub struct FakeRenderer {
    pub pages: usize,
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn render(&self, document: &SourceDocument) -> Result<RenderedDocument, StageError> {
        let name = document.display_name();
        if name.starts_with("broken") {
            return Err(StageError::Render {
                page: None,
                detail: "not a PDF".into(),
            });
        }
        Ok(RenderedDocument {
            pages: (1..=self.pages)
                .map(|p| RasterPage::new(name.clone(), p, DynamicImage::new_rgb8(800, 600)))
                .collect(),
            failures: Vec::new(),
        })
    }
}

/// Counts overlapping calls and remembers the highest overlap seen.
#[derive(Default)]
pub struct InFlight {
    current: AtomicU32,
    peak: AtomicU32,
    delay_ms: AtomicU64,
}

impl InFlight {
    pub async fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    pub fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn set_delay_ms(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }
}

/// Returns the same candidates for every page, or only for `only_page`.
pub struct FakeDetector {
    pub candidates: Vec<Detection>,
    pub only_page: Option<usize>,
    pub in_flight: InFlight,
}

impl FakeDetector {
    pub fn with(candidates: &[(f32, f32, f32, f32, f32)]) -> Arc<Self> {
        Arc::new(Self {
            candidates: candidates
                .iter()
                .map(|&(x, y, w, h, confidence)| Detection {
                    bbox: BoundingBox::new(x, y, w, h),
                    confidence,
                    class_id: 0,
                })
                .collect(),
            only_page: None,
            in_flight: InFlight::default(),
        })
    }

    pub fn on_page(page: usize, candidates: &[(f32, f32, f32, f32, f32)]) -> Arc<Self> {
        let mut detector = Arc::into_inner(Self::with(candidates)).unwrap();
        detector.only_page = Some(page);
        Arc::new(detector)
    }
}

#[async_trait]
impl TableDetector for FakeDetector {
    async fn detect(&self, page: &RasterPage) -> Result<Vec<Detection>, StageError> {
        self.in_flight.enter().await;
        self.in_flight.leave();
        match self.only_page {
            Some(p) if p != page.page_number => Ok(Vec::new()),
            _ => Ok(self.candidates.clone()),
        }
    }
}

/// Replays scripted replies, then repeats `fallback`.
pub struct FakeModel {
    replies: Mutex<VecDeque<Result<String, VisionCallError>>>,
    fallback: Mutex<Result<String, VisionCallError>>,
    calls: AtomicU32,
    pub in_flight: InFlight,
}

impl FakeModel {
    pub fn always(reply: Result<String, VisionCallError>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(reply),
            calls: AtomicU32::new(0),
            in_flight: InFlight::default(),
        })
    }

    pub fn set_reply(&self, reply: Result<String, VisionCallError>) {
        *self.fallback.lock().unwrap() = reply;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionModel for FakeModel {
    fn model_id(&self) -> String {
        "fake/vision".into()
    }

    async fn complete(
        &self,
        _instruction: &str,
        _images: Vec<ImageData>,
    ) -> Result<String, VisionCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.enter().await;
        self.in_flight.leave();
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        self.fallback.lock().unwrap().clone()
    }
}

/// One COSCO row for Nhava Sheva with a 6-10 day charge of `amount`.
pub fn cosco_reply(amount: f64) -> String {
    serde_json::json!([{
        "country": "India",
        "port": "Nhava Sheva",
        "line": "COSCO",
        "equipment_type": "20GP",
        "currency": "USD",
        "free_days": { "0-5": 5 },
        "demurrage": { "6-10": amount }
    }])
    .to_string()
}

/// The Nhava Sheva row with two free-day buckets and a zero-valued charge.
pub fn scenario_a_reply() -> String {
    serde_json::json!([{
        "country": "India",
        "port": "Nhava Sheva",
        "line": "COSCO",
        "equipment_type": "20GP",
        "currency": "USD",
        "free_days": { "0-5": 5, "6-10": 3 },
        "demurrage": { "20GP": { "0-5": 0, "6-10": 50 } }
    }])
    .to_string()
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig::builder()
        .max_attempts(3)
        .retry_backoff_ms(1)
        .max_backoff_ms(2)
        .build()
        .unwrap()
}

pub fn pipeline(
    config: PipelineConfig,
    source: Arc<FakeSource>,
    detector: Arc<FakeDetector>,
    vision: VisionSlot,
    store: TariffStore,
) -> Pipeline {
    pipeline_with_pages(1, config, source, detector, vision, store)
}

pub fn pipeline_with_pages(
    pages: usize,
    config: PipelineConfig,
    source: Arc<FakeSource>,
    detector: Arc<FakeDetector>,
    vision: VisionSlot,
    store: TariffStore,
) -> Pipeline {
    Pipeline::new(
        config,
        PipelineResources::new(source, Arc::new(FakeRenderer { pages }), detector, vision, store),
    )
}

/// One document, two pages, a single 0.92 table on page 1 only.
pub fn scenario_a_pipeline(model: Arc<FakeModel>, store: TariffStore) -> Pipeline {
    pipeline_with_pages(
        2,
        test_config(),
        FakeSource::new("India", &["india.pdf"]),
        FakeDetector::on_page(1, &[(100.0, 100.0, 400.0, 200.0, 0.92)]),
        VisionSlot::Ready(model),
        store,
    )
}

/// Single document, single table at 0.92, answering with `model`.
pub fn india_pipeline(model: Arc<FakeModel>, store: TariffStore) -> Pipeline {
    pipeline(
        test_config(),
        FakeSource::new("India", &["india.pdf"]),
        FakeDetector::with(&[(100.0, 100.0, 400.0, 200.0, 0.92)]),
        VisionSlot::Ready(model),
        store,
    )
}
