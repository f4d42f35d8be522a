//! Pipeline orchestration: one country in, one [`RunSummary`] out.
//!
//! [`PipelineResources`] holds the long-lived collaborators (source,
//! renderer, detector, vision model, store). They are created once by
//! [`PipelineResources::init`] and injected into a [`Pipeline`]; tests build
//! them from fakes with [`PipelineResources::new`].
//!
//! A run processes documents concurrently and isolates failures per
//! document, page and region. Only these end a run with `Err`:
//! - invalid or unknown country
//! - storage unreachable at start
//! - zero documents acquired
//! - regions to parse but no vision-model credential

use crate::config::{PipelineConfig, RetentionPolicy};
use crate::error::{StageError, TariffError};
use crate::model::{RegionRef, RunError, RunSummary, SourceDocument, TableRegion};
use crate::pipeline::acquire::{claim_name, ConfiguredSource, DocumentSource};
use crate::pipeline::crop::{extract_regions, stitch_vertical};
use crate::pipeline::detect::{localize, OnnxTableDetector, TableDetector};
use crate::pipeline::encode::{encode_region, png_bytes};
use crate::pipeline::parse::{
    LlmVisionModel, ParseOutcome, RetryPolicy, StructuredParser, VisionModel,
};
use crate::pipeline::render::{PageRenderer, PdfiumRenderer};
use crate::pipeline::validate::{validate_rows, Validated};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::store::{StoreError, TariffStore, UpsertOutcome};
use chrono::Utc;
use edgequake_llm::{ImageData, LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Model used when a provider is named without one.
const DEFAULT_VISION_MODEL: &str = "gpt-4o";

// ── Resources ────────────────────────────────────────────────────────────

/// The vision model, or why there is none.
///
/// A missing credential is only fatal once a run has regions to parse, so it
/// is carried as a value instead of failing start-up.
#[derive(Clone)]
pub enum VisionSlot {
    Ready(Arc<dyn VisionModel>),
    Unavailable { provider: String, hint: String },
}

/// Long-lived collaborators shared by every run.
pub struct PipelineResources {
    pub source: Arc<dyn DocumentSource>,
    pub renderer: Arc<dyn PageRenderer>,
    pub detector: Arc<dyn TableDetector>,
    pub vision: VisionSlot,
    pub store: TariffStore,
}

impl PipelineResources {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        renderer: Arc<dyn PageRenderer>,
        detector: Arc<dyn TableDetector>,
        vision: VisionSlot,
        store: TariffStore,
    ) -> Self {
        Self {
            source,
            renderer,
            detector,
            vision,
            store,
        }
    }

    /// Open storage, load the detector and resolve the vision provider.
    pub async fn init(config: &PipelineConfig) -> Result<Self, TariffError> {
        let path = config.storage_path.clone();
        let store = tokio::task::spawn_blocking(move || TariffStore::open(&path))
            .await
            .map_err(|e| TariffError::Internal(e.to_string()))?
            .map_err(|e| storage_unavailable(&config.storage_path, e))?;

        let model_path = config.detector_model_path.clone();
        let (input_size, pool) = (config.detector_input_size, config.detector_concurrency);
        let detector = tokio::task::spawn_blocking(move || {
            OnnxTableDetector::load(&model_path, input_size, pool)
        })
        .await
        .map_err(|e| TariffError::Internal(e.to_string()))??;

        let vision = resolve_vision(config);
        if let VisionSlot::Unavailable { provider, .. } = &vision {
            warn!(
                "Vision provider '{}' not configured; runs that find tables will fail",
                provider
            );
        }

        Ok(Self {
            source: Arc::new(ConfiguredSource::new(
                config.sources.clone(),
                config.fetch_timeout_secs,
            )?),
            renderer: Arc::new(PdfiumRenderer::new(config.dpi, config.max_rendered_pixels)),
            detector: Arc::new(detector),
            vision,
            store,
        })
    }

    /// Flush storage. Detector sessions are released on drop.
    pub async fn shutdown(&self) {
        if let Err(e) = self.store.call(|s| s.checkpoint()).await {
            warn!("Storage checkpoint on shutdown failed: {}", e);
        }
        info!("Pipeline resources released");
    }
}

/// Resolve the vision model, from most to least specific: a pre-built
/// provider, a named provider, `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`,
/// `OPENAI_API_KEY`, then full auto-detection.
fn resolve_vision(config: &PipelineConfig) -> VisionSlot {
    let model = config.model.as_deref().unwrap_or(DEFAULT_VISION_MODEL);

    let resolved: Result<(Arc<dyn LLMProvider>, String), (String, String)> =
        if let Some(provider) = &config.provider {
            Ok((Arc::clone(provider), format!("custom/{model}")))
        } else if let Some(name) = &config.provider_name {
            create_provider(name, model)
        } else if let (Ok(prov), Ok(m)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !m.is_empty() {
                create_provider(&prov, &m)
            } else {
                auto_detect(model)
            }
        } else {
            auto_detect(model)
        };

    match resolved {
        Ok((provider, model_id)) => {
            info!("Vision model: {}", model_id);
            VisionSlot::Ready(Arc::new(LlmVisionModel::new(
                provider,
                model_id,
                config.temperature,
                config.max_tokens,
                config.api_timeout_secs,
            )))
        }
        Err((provider, hint)) => VisionSlot::Unavailable { provider, hint },
    }
}

fn create_provider(name: &str, model: &str) -> Result<(Arc<dyn LLMProvider>, String), (String, String)> {
    ProviderFactory::create_llm_provider(name, model)
        .map(|p| (p, format!("{name}/{model}")))
        .map_err(|e| (name.to_string(), e.to_string()))
}

fn auto_detect(model: &str) -> Result<(Arc<dyn LLMProvider>, String), (String, String)> {
    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", model);
    }
    ProviderFactory::from_env()
        .map(|(llm, _embedding)| (llm, "auto".to_string()))
        .map_err(|e| {
            (
                "auto".to_string(),
                format!(
                    "No vision provider could be detected from the environment.\n\
                     Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                     Error: {e}"
                ),
            )
        })
}

fn storage_unavailable(path: &Path, e: StoreError) -> TariffError {
    TariffError::StorageUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Trim, collapse whitespace and reject names no source could match.
pub fn validate_country(input: &str) -> Result<String, TariffError> {
    let name = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let invalid = |reason: &str| TariffError::InvalidCountry {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.chars().count() > 64 {
        return Err(invalid("longer than 64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_alphabetic() || matches!(c, ' ' | '-' | '\'' | '.' | '&' | '(' | ')'))
    {
        return Err(invalid("only letters, spaces and - ' . & ( ) are allowed"));
    }
    Ok(name)
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Per-run state shared by document tasks.
struct RunContext {
    run_id: String,
    country: String,
    parser: Option<Arc<StructuredParser>>,
    detect_permits: Arc<Semaphore>,
    artifacts: Option<PathBuf>,
    progress: ProgressCallback,
}

/// Counters and errors for one document.
#[derive(Debug, Default)]
struct DocumentReport {
    opened: bool,
    pages: usize,
    regions: usize,
    quarantined: usize,
    persisted: usize,
    unchanged: usize,
    rejected: usize,
    errors: Vec<RunError>,
}

/// One vision-model request: a region, or a page of stitched regions.
struct ParseJob {
    region: RegionRef,
    image: ImageData,
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    resources: PipelineResources,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, resources: PipelineResources) -> Self {
        Self {
            config: Arc::new(config),
            resources,
        }
    }

    /// Build resources from the configuration and wrap them.
    pub async fn from_config(config: PipelineConfig) -> Result<Self, TariffError> {
        let resources = PipelineResources::init(&config).await?;
        Ok(Self::new(config, resources))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &TariffStore {
        &self.resources.store
    }

    pub async fn shutdown(&self) {
        self.resources.shutdown().await;
    }

    /// Acquire, extract and persist every tariff document for `country`.
    ///
    /// # Errors
    /// Returns `Err(TariffError)` only for run-level failures; everything
    /// per-document ends up in [`RunSummary::errors`].
    pub async fn run(
        &self,
        country: &str,
        source_filter: Option<&str>,
        progress: Option<ProgressCallback>,
    ) -> Result<RunSummary, TariffError> {
        let start = Instant::now();
        let progress = progress.unwrap_or_else(|| Arc::new(NoopProgressCallback));
        let store = &self.resources.store;

        // ── Step 1: Validate request ─────────────────────────────────────
        let country = validate_country(country)?;
        if !self.resources.source.has_country(&country) {
            return Err(TariffError::UnknownCountry { country });
        }

        store
            .call(|s| s.health_check())
            .await
            .map_err(|e| storage_unavailable(store.path(), e))?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let mut summary = RunSummary::new(&run_id, &country);
        {
            let (id, c) = (run_id.clone(), country.clone());
            store
                .call(move |s| s.begin_run(&id, &c))
                .await
                .map_err(|e| storage_unavailable(store.path(), e))?;
        }
        info!("Run {} started for {}", run_id, country);

        // ── Step 2: Acquire ──────────────────────────────────────────────
        let (workspace, _temp): (PathBuf, Option<TempDir>) = match self.config.retention {
            RetentionPolicy::Purge => {
                let tmp = TempDir::new()
                    .map_err(|e| TariffError::Internal(format!("temp dir: {e}")))?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
            RetentionPolicy::Retain => (self.config.artifact_dir.join(&country), None),
        };

        let acquisition = self
            .resources
            .source
            .acquire(&country, source_filter, &workspace)
            .await?;
        summary.errors.extend(acquisition.failures);
        let documents = acquisition.documents;

        if documents.is_empty() {
            summary.duration_ms = start.elapsed().as_millis() as u64;
            self.finish(&summary).await;
            warn!("Run {}: no documents for {}", run_id, country);
            return Err(TariffError::NoDocuments {
                country,
                summary: Box::new(summary),
            });
        }
        info!("Run {}: {} document(s) acquired", run_id, documents.len());
        progress.on_run_start(&country, documents.len());

        // ── Step 3: Process documents ────────────────────────────────────
        let parser = match &self.resources.vision {
            VisionSlot::Ready(model) => Some(Arc::new(StructuredParser::new(
                Arc::clone(model),
                Arc::new(Semaphore::new(self.config.parser_concurrency)),
                self.config.prompt.clone(),
                RetryPolicy {
                    max_attempts: self.config.max_attempts,
                    backoff_ms: self.config.retry_backoff_ms,
                    max_backoff_ms: self.config.max_backoff_ms,
                },
            ))),
            VisionSlot::Unavailable { .. } => None,
        };

        let ctx = RunContext {
            run_id: run_id.clone(),
            country: country.clone(),
            parser,
            detect_permits: Arc::new(Semaphore::new(self.config.detector_concurrency)),
            artifacts: match self.config.retention {
                RetentionPolicy::Retain => Some(workspace.clone()),
                RetentionPolicy::Purge => None,
            },
            progress: Arc::clone(&progress),
        };

        let mut claimed = HashSet::new();
        let stems: Vec<String> = documents
            .iter()
            .map(|doc| claim_name(&mut claimed, &artifact_stem(doc)))
            .collect();

        let jobs: Vec<_> = documents
            .iter()
            .zip(&stems)
            .map(|(doc, stem)| self.process_document(&ctx, doc, stem))
            .collect();
        let results: Vec<Result<DocumentReport, TariffError>> = stream::iter(jobs)
        .buffer_unordered(self.config.document_concurrency)
        .collect()
        .await;

        // ── Step 4: Summarise ────────────────────────────────────────────
        let mut fatal = None;
        for result in results {
            match result {
                Ok(report) => {
                    summary.documents_processed += usize::from(report.opened);
                    summary.pages_rendered += report.pages;
                    summary.regions_detected += report.regions;
                    summary.regions_quarantined += report.quarantined;
                    summary.records_persisted += report.persisted;
                    summary.records_unchanged += report.unchanged;
                    summary.records_rejected += report.rejected;
                    summary.errors.extend(report.errors);
                }
                Err(e) if fatal.is_none() => fatal = Some(e),
                Err(e) => warn!("Run {}: {}", run_id, e),
            }
        }
        summary.duration_ms = start.elapsed().as_millis() as u64;
        self.finish(&summary).await;

        if let Some(e) = fatal {
            error!("Run {} failed: {}", run_id, e);
            return Err(e);
        }

        progress.on_run_complete(summary.documents_processed, summary.records_persisted);
        info!(
            "Run {} complete: {} docs, {} pages, {} regions ({} quarantined), \
             {} persisted, {} unchanged, {} rejected, {} errors in {}ms",
            run_id,
            summary.documents_processed,
            summary.pages_rendered,
            summary.regions_detected,
            summary.regions_quarantined,
            summary.records_persisted,
            summary.records_unchanged,
            summary.records_rejected,
            summary.errors.len(),
            summary.duration_ms
        );
        Ok(summary)
    }

    async fn finish(&self, summary: &RunSummary) {
        let s = summary.clone();
        if let Err(e) = self.resources.store.call(move |st| st.finish_run(&s)).await {
            warn!("Run {}: could not store summary: {}", summary.run_id, e);
        }
    }

    async fn process_document(
        &self,
        ctx: &RunContext,
        doc: &SourceDocument,
        stem: &str,
    ) -> Result<DocumentReport, TariffError> {
        let name = doc.display_name();
        let store = &self.resources.store;
        let mut report = DocumentReport::default();
        ctx.progress.on_document_start(&name);

        {
            let (run_id, d) = (ctx.run_id.clone(), doc.clone());
            if let Err(e) = store.call(move |s| s.record_document(&run_id, &d)).await {
                warn!("{}: could not record document: {}", name, e);
            }
        }

        // ── Render ───────────────────────────────────────────────────────
        let rendered = match self.resources.renderer.render(doc).await {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: {}", name, e);
                ctx.progress.on_document_error(&name, &e.to_string());
                report.errors.push(RunError::new("render", Some(&name), &e));
                return Ok(report);
            }
        };
        report.opened = true;
        report.pages = rendered.pages.len();
        for e in &rendered.failures {
            let mut err = RunError::new("render", Some(&name), e);
            if let StageError::Render { page: Some(p), .. } = e {
                err = err.at_page(*p);
            }
            report.errors.push(err);
        }

        let doc_dir = ctx.artifacts.as_ref().map(|root| root.join(stem));

        // ── Detect + crop ────────────────────────────────────────────────
        let detect_timeout = Duration::from_secs(self.config.detect_timeout_secs);
        let mut regions: Vec<TableRegion> = Vec::new();
        for page in &rendered.pages {
            let page_png = match &doc_dir {
                Some(dir) => {
                    save_png(
                        (*page.image).clone(),
                        dir.join(format!("page-{}.png", page.page_number)),
                    )
                    .await
                }
                None => None,
            };
            {
                let (run_id, p, a) = (ctx.run_id.clone(), page.clone(), page_png.clone());
                if let Err(e) = store.call(move |s| s.record_page(&run_id, &p, a.as_deref())).await {
                    warn!("{} p{}: could not record page: {}", name, page.page_number, e);
                }
            }

            let detected = {
                let _permit = ctx
                    .detect_permits
                    .acquire()
                    .await
                    .map_err(|e| TariffError::Internal(e.to_string()))?;
                match tokio::time::timeout(detect_timeout, self.resources.detector.detect(page)).await {
                    Ok(r) => r,
                    Err(_) => Err(StageError::Detection {
                        page: page.page_number,
                        detail: format!("timed out after {}s", detect_timeout.as_secs()),
                    }),
                }
            };
            let candidates = match detected {
                Ok(c) => c,
                Err(e) => {
                    warn!("{} p{}: {}", name, page.page_number, e);
                    report
                        .errors
                        .push(RunError::new("detect", Some(&name), &e).at_page(page.page_number));
                    continue;
                }
            };

            let kept = localize(
                candidates,
                self.config.confidence_floor,
                self.config.nms_iou_threshold,
                self.config.max_regions_per_page,
            );
            debug!("{} p{}: {} table(s)", name, page.page_number, kept.len());

            for region in extract_regions(page, &kept, self.config.region_padding) {
                let crop_png = match &doc_dir {
                    Some(dir) => {
                        save_png(
                            region.image.clone(),
                            dir.join(format!(
                                "page-{}-region-{}.png",
                                region.page_number, region.region_index
                            )),
                        )
                        .await
                    }
                    None => None,
                };
                let (run_id, r, a) = (ctx.run_id.clone(), region.clone(), crop_png);
                if let Err(e) = store.call(move |s| s.record_region(&run_id, &r, a.as_deref())).await {
                    warn!("{}: could not record region: {}", region.reference(), e);
                }
                regions.push(region);
            }
        }
        report.regions = regions.len();

        if regions.is_empty() {
            ctx.progress.on_document_complete(&name, 0);
            return Ok(report);
        }

        // ── Parse ────────────────────────────────────────────────────────
        let Some(parser) = ctx.parser.clone() else {
            let VisionSlot::Unavailable { provider, hint } = &self.resources.vision else {
                return Err(TariffError::Internal("parser missing".into()));
            };
            let err = TariffError::ProviderNotConfigured {
                provider: provider.clone(),
                hint: hint.clone(),
            };
            ctx.progress.on_document_error(&name, &err.to_string());
            return Err(err);
        };

        let jobs = self.parse_jobs(&regions, &name, &mut report.errors);
        let line = doc.line.clone();
        let mut outcomes: Vec<ParseOutcome> = stream::iter(jobs.into_iter().map(|job| {
            let parser = Arc::clone(&parser);
            let country = ctx.country.clone();
            let line = line.clone();
            async move {
                parser
                    .parse(job.region, vec![job.image], &country, line.as_deref())
                    .await
            }
        }))
        .buffer_unordered(self.config.parser_concurrency)
        .collect()
        .await;
        outcomes.sort_by_key(|o| (o.extraction().region.page, o.extraction().region.region));

        // ── Validate + persist ───────────────────────────────────────────
        for outcome in outcomes {
            self.persist_outcome(ctx, &name, outcome, &mut report).await;
        }

        ctx.progress.on_document_complete(&name, report.persisted);
        Ok(report)
    }

    /// One job per region, or one per page when stitching is enabled.
    fn parse_jobs(
        &self,
        regions: &[TableRegion],
        name: &str,
        errors: &mut Vec<RunError>,
    ) -> Vec<ParseJob> {
        let images: Vec<(RegionRef, Cow<'_, DynamicImage>)> = if self.config.stitch_page_regions {
            regions
                .chunk_by(|a, b| a.page_number == b.page_number)
                .filter_map(|group| {
                    let image = stitch_vertical(group)?;
                    let mut reference = group[0].reference();
                    reference.confidence = group
                        .iter()
                        .map(|r| r.confidence)
                        .fold(f32::INFINITY, f32::min);
                    Some((reference, Cow::Owned(image)))
                })
                .collect()
        } else {
            regions
                .iter()
                .map(|r| (r.reference(), Cow::Borrowed(&r.image)))
                .collect()
        };

        let mut jobs = Vec::with_capacity(images.len());
        for (region, image) in images {
            match encode_region(&image, self.config.max_rendered_pixels) {
                Ok(image) => jobs.push(ParseJob { region, image }),
                Err(e) => {
                    let (page, index) = (region.page, region.region);
                    let err = StageError::Encode {
                        page,
                        region: index,
                        detail: e.to_string(),
                    };
                    errors.push(RunError::new("parse", Some(name), &err).at_region(page, index));
                }
            }
        }
        jobs
    }

    async fn persist_outcome(
        &self,
        ctx: &RunContext,
        name: &str,
        outcome: ParseOutcome,
        report: &mut DocumentReport,
    ) {
        let store = &self.resources.store;
        let region = outcome.extraction().region.clone();

        let (extraction, validated) = match outcome {
            ParseOutcome::Quarantined { extraction, error } => {
                report.quarantined += 1;
                report.errors.push(
                    RunError::new("parse", Some(name), &error).at_region(region.page, region.region),
                );
                (extraction, Vec::new())
            }
            ParseOutcome::Parsed { extraction, rows } => {
                let validated = validate_rows(&rows, &self.config.buckets, Utc::now());
                (extraction, validated)
            }
        };

        let run_id = ctx.run_id.clone();
        let written = store
            .call(move |s| {
                let recorded = s.record_extraction(&run_id, &extraction);
                let extraction_id = recorded.as_ref().ok().copied();
                let mut results = Vec::with_capacity(validated.len());
                for v in validated {
                    match v {
                        Validated::Record(record) => {
                            let key = record.key().to_string();
                            results.push(Written::Record(key, s.upsert(&record).map_err(|e| e.to_string())));
                        }
                        Validated::Rejected(rejection) => {
                            if let Err(e) = s.record_rejection(&run_id, extraction_id, &rejection) {
                                warn!("could not store rejection: {}", e);
                            }
                            results.push(Written::Rejected);
                        }
                    }
                }
                Ok((recorded.err().map(|e| e.to_string()), results))
            })
            .await;

        let (audit_failure, results) = match written {
            Ok(w) => w,
            Err(e) => {
                let err = StageError::Persistence {
                    key: region.to_string(),
                    detail: e.to_string(),
                };
                report.errors.push(RunError::new("persist", Some(name), &err));
                return;
            }
        };
        if let Some(detail) = audit_failure {
            warn!("{}: raw extraction could not be stored: {}", region, detail);
            let err = StageError::Persistence {
                key: region.to_string(),
                detail,
            };
            report.errors.push(
                RunError::new("storage", Some(name), &err).at_region(region.page, region.region),
            );
        }

        for result in results {
            match result {
                Written::Rejected => report.rejected += 1,
                Written::Record(_, Ok(UpsertOutcome::Unchanged)) => report.unchanged += 1,
                Written::Record(_, Ok(_)) => report.persisted += 1,
                Written::Record(key, Err(detail)) => {
                    warn!("{}: failed to persist {}: {}", region, key, detail);
                    let err = StageError::Persistence { key, detail };
                    report.errors.push(
                        RunError::new("persist", Some(name), &err).at_region(region.page, region.region),
                    );
                }
            }
        }
    }
}

enum Written {
    Record(String, Result<UpsertOutcome, String>),
    Rejected,
}

/// Directory name for a document's retained images.
fn artifact_stem(doc: &SourceDocument) -> String {
    doc.path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| doc.source_id.replace(['/', '\\', ':'], "_"))
}

/// Write a PNG on the blocking pool; failures are logged, not fatal.
async fn save_png(image: DynamicImage, path: PathBuf) -> Option<PathBuf> {
    let result = tokio::task::spawn_blocking(move || -> Result<PathBuf, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let bytes = png_bytes(&image).map_err(|e| e.to_string())?;
        std::fs::write(&path, bytes).map_err(|e| e.to_string())?;
        Ok(path)
    })
    .await;

    match result {
        Ok(Ok(path)) => Some(path),
        Ok(Err(e)) => {
            warn!("Could not retain artifact: {}", e);
            None
        }
        Err(e) => {
            warn!("Artifact task failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_names() {
        assert_eq!(validate_country("  India ").unwrap(), "India");
        assert_eq!(validate_country("Côte d'Ivoire").unwrap(), "Côte d'Ivoire");
        assert_eq!(validate_country("United   States").unwrap(), "United States");
        assert!(matches!(
            validate_country("   "),
            Err(TariffError::InvalidCountry { .. })
        ));
        assert!(validate_country("India; DROP TABLE").is_err());
        assert!(validate_country(&"a".repeat(65)).is_err());
    }

    #[test]
    fn artifact_stem_uses_file_name() {
        let doc = SourceDocument {
            source_id: "abc".into(),
            country: "India".into(),
            line: None,
            direction: None,
            path: PathBuf::from("/tmp/India IB.pdf"),
            fetched_at: Utc::now(),
        };
        assert_eq!(artifact_stem(&doc), "India IB");
    }
}
