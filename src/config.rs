//! Configuration types for tariff extraction runs.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`] or loaded from a YAML file with
//! [`PipelineConfig::from_yaml_file`]. The CLI layers its flags on top of the
//! file through the same builder, so clamping and validation live in one
//! place.

use crate::buckets::BucketVocabulary;
use crate::error::TariffError;
use crate::pipeline::acquire::SourceLocation;
use crate::prompts::PromptTemplate;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What happens to rendered pages, crops and downloaded PDFs after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Images stay in memory; downloads go to a temp dir removed after the run. (default)
    #[default]
    Purge,
    /// PDFs, page PNGs and crop PNGs are written under `artifact_dir`.
    Retain,
}

/// Configuration for one pipeline.
///
/// # Example
/// ```rust
/// use tariff_extract::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .confidence_floor(0.6)
///     .parser_concurrency(2)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Rendering DPI. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Longest rendered edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Detections below this confidence never reach the parser. Default: 0.5.
    pub confidence_floor: f32,

    /// IoU above which the lower-confidence box is suppressed. Default: 0.45.
    pub nms_iou_threshold: f32,

    /// Cap on regions kept per page after NMS. Default: 20.
    pub max_regions_per_page: usize,

    /// ONNX table-detection model. Default: `models/table-detector.onnx`.
    pub detector_model_path: PathBuf,

    /// Square input edge the detector was exported with. Default: 640.
    pub detector_input_size: u32,

    /// Pixels added around each crop so ruled borders are not cut. Default: 8.
    pub region_padding: u32,

    /// Send all regions of a page as one vertically stitched image. Default: false.
    pub stitch_page_regions: bool,

    /// Documents processed at once. Default: 4.
    pub document_concurrency: usize,

    /// Concurrent detector inferences (and ONNX sessions). Default: 2.
    pub detector_concurrency: usize,

    /// Concurrent vision-model calls across the whole run. Default: 4.
    ///
    /// This is the externally rate-limited resource; it is bounded on its own
    /// regardless of `document_concurrency`.
    pub parser_concurrency: usize,

    /// Vision model identifier, e.g. "gpt-4o". Default: provider default.
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "azure").
    pub provider_name: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the model may generate per region. Default: 4096.
    pub max_tokens: usize,

    /// Total attempts per region on transient failures. Default: 3.
    pub max_attempts: u32,

    /// Backoff base in milliseconds; doubles after each failed attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Upper bound for a single backoff sleep. Default: 8000.
    pub max_backoff_ms: u64,

    /// Versioned extraction instruction.
    pub prompt: PromptTemplate,

    /// SQLite file. Default: `tariffs.db`.
    pub storage_path: PathBuf,

    pub retention: RetentionPolicy,

    /// Root for retained artifacts. Default: `artifacts`.
    pub artifact_dir: PathBuf,

    /// Per-request timeout for document downloads. Default: 120.
    pub fetch_timeout_secs: u64,

    /// Per-image detector timeout. Default: 30.
    pub detect_timeout_secs: u64,

    /// Per-call vision-model timeout. Default: 60.
    pub api_timeout_secs: u64,

    /// Canonical bucket ids accepted by the validator.
    pub buckets: BucketVocabulary,

    /// Per-country source locations.
    pub sources: BTreeMap<String, Vec<SourceLocation>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_rendered_pixels: 2000,
            confidence_floor: 0.5,
            nms_iou_threshold: 0.45,
            max_regions_per_page: 20,
            detector_model_path: PathBuf::from("models/table-detector.onnx"),
            detector_input_size: 640,
            region_padding: 8,
            stitch_page_regions: false,
            document_concurrency: 4,
            detector_concurrency: 2,
            parser_concurrency: 4,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            max_attempts: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 8000,
            prompt: PromptTemplate::default(),
            storage_path: PathBuf::from("tariffs.db"),
            retention: RetentionPolicy::default(),
            artifact_dir: PathBuf::from("artifacts"),
            fetch_timeout_secs: 120,
            detect_timeout_secs: 30,
            api_timeout_secs: 60,
            buckets: BucketVocabulary::default(),
            sources: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("confidence_floor", &self.confidence_floor)
            .field("nms_iou_threshold", &self.nms_iou_threshold)
            .field("detector_model_path", &self.detector_model_path)
            .field("document_concurrency", &self.document_concurrency)
            .field("detector_concurrency", &self.detector_concurrency)
            .field("parser_concurrency", &self.parser_concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("prompt_version", &self.prompt.version)
            .field("storage_path", &self.storage_path)
            .field("retention", &self.retention)
            .field("countries", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Builder pre-filled from a YAML file.
    pub fn builder_from_yaml_file(path: &Path) -> Result<PipelineConfigBuilder, TariffError> {
        let raw = std::fs::read_to_string(path).map_err(|e| TariffError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let file: FileConfig = serde_yaml::from_str(&raw).map_err(|e| TariffError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // Relative paths in the file are relative to the file itself.
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        file.apply(Self::builder(), base)
    }

    /// Load and validate a YAML configuration file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, TariffError> {
        Self::builder_from_yaml_file(path)?.build()
    }

    /// Source locations for a country, matched case-insensitively.
    pub fn sources_for(&self, country: &str) -> Option<&[SourceLocation]> {
        self.sources
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(country))
            .map(|(_, locs)| locs.as_slice())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn confidence_floor(mut self, floor: f32) -> Self {
        self.config.confidence_floor = floor;
        self
    }

    pub fn nms_iou_threshold(mut self, iou: f32) -> Self {
        self.config.nms_iou_threshold = iou;
        self
    }

    pub fn max_regions_per_page(mut self, n: usize) -> Self {
        self.config.max_regions_per_page = n.max(1);
        self
    }

    pub fn detector_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.detector_model_path = path.into();
        self
    }

    pub fn detector_input_size(mut self, px: u32) -> Self {
        self.config.detector_input_size = px;
        self
    }

    pub fn region_padding(mut self, px: u32) -> Self {
        self.config.region_padding = px;
        self
    }

    pub fn stitch_page_regions(mut self, v: bool) -> Self {
        self.config.stitch_page_regions = v;
        self
    }

    pub fn document_concurrency(mut self, n: usize) -> Self {
        self.config.document_concurrency = n.max(1);
        self
    }

    pub fn detector_concurrency(mut self, n: usize) -> Self {
        self.config.detector_concurrency = n.max(1);
        self
    }

    pub fn parser_concurrency(mut self, n: usize) -> Self {
        self.config.parser_concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn prompt(mut self, prompt: PromptTemplate) -> Self {
        self.config.prompt = prompt;
        self
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_path = path.into();
        self
    }

    pub fn retention(mut self, policy: RetentionPolicy) -> Self {
        self.config.retention = policy;
        self
    }

    pub fn artifact_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.artifact_dir = path.into();
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn detect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.detect_timeout_secs = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn buckets(mut self, buckets: BucketVocabulary) -> Self {
        self.config.buckets = buckets;
        self
    }

    pub fn source(mut self, country: impl Into<String>, location: SourceLocation) -> Self {
        self.config
            .sources
            .entry(country.into())
            .or_default()
            .push(location);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, TariffError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.confidence_floor) {
            return Err(TariffError::InvalidConfig(format!(
                "confidence floor must be within 0–1, got {}",
                c.confidence_floor
            )));
        }
        if !(c.nms_iou_threshold > 0.0 && c.nms_iou_threshold <= 1.0) {
            return Err(TariffError::InvalidConfig(format!(
                "NMS IoU threshold must be within (0, 1], got {}",
                c.nms_iou_threshold
            )));
        }
        if c.max_attempts == 0 {
            return Err(TariffError::InvalidConfig(
                "max attempts must be ≥ 1".into(),
            ));
        }
        if c.detector_input_size < 32 {
            return Err(TariffError::InvalidConfig(format!(
                "detector input size must be ≥ 32, got {}",
                c.detector_input_size
            )));
        }
        if c.api_timeout_secs == 0 || c.fetch_timeout_secs == 0 || c.detect_timeout_secs == 0 {
            return Err(TariffError::InvalidConfig(
                "timeouts must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

/// On-disk YAML layout. Every key is optional; absent keys keep defaults.
///
/// ```yaml
/// storage_path: tariffs.db
/// confidence_floor: 0.5
/// model: gpt-4o
/// sources:
///   India:
///     - kind: portal
///       line: COSCO
///       index_url: https://example.com/tariff/info
///       download_url: https://example.com/tariff/download
///   Kenya:
///     - kind: directory
///       path: ./pdfs/kenya
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub dpi: Option<u32>,
    pub max_rendered_pixels: Option<u32>,
    pub confidence_floor: Option<f32>,
    pub nms_iou_threshold: Option<f32>,
    pub max_regions_per_page: Option<usize>,
    pub detector_model_path: Option<PathBuf>,
    pub detector_input_size: Option<u32>,
    pub region_padding: Option<u32>,
    pub stitch_page_regions: Option<bool>,
    pub document_concurrency: Option<usize>,
    pub detector_concurrency: Option<usize>,
    pub parser_concurrency: Option<usize>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub prompt_file: Option<PathBuf>,
    pub storage_path: Option<PathBuf>,
    pub retention: Option<RetentionPolicy>,
    pub artifact_dir: Option<PathBuf>,
    pub fetch_timeout_secs: Option<u64>,
    pub detect_timeout_secs: Option<u64>,
    pub api_timeout_secs: Option<u64>,
    pub buckets: Option<BucketVocabulary>,
    pub sources: BTreeMap<String, Vec<SourceLocation>>,
}

impl FileConfig {
    fn apply(
        self,
        mut b: PipelineConfigBuilder,
        base: &Path,
    ) -> Result<PipelineConfigBuilder, TariffError> {
        let rel = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

        if let Some(v) = self.dpi {
            b = b.dpi(v);
        }
        if let Some(v) = self.max_rendered_pixels {
            b = b.max_rendered_pixels(v);
        }
        if let Some(v) = self.confidence_floor {
            b = b.confidence_floor(v);
        }
        if let Some(v) = self.nms_iou_threshold {
            b = b.nms_iou_threshold(v);
        }
        if let Some(v) = self.max_regions_per_page {
            b = b.max_regions_per_page(v);
        }
        if let Some(v) = self.detector_model_path {
            b = b.detector_model_path(rel(v));
        }
        if let Some(v) = self.detector_input_size {
            b = b.detector_input_size(v);
        }
        if let Some(v) = self.region_padding {
            b = b.region_padding(v);
        }
        if let Some(v) = self.stitch_page_regions {
            b = b.stitch_page_regions(v);
        }
        if let Some(v) = self.document_concurrency {
            b = b.document_concurrency(v);
        }
        if let Some(v) = self.detector_concurrency {
            b = b.detector_concurrency(v);
        }
        if let Some(v) = self.parser_concurrency {
            b = b.parser_concurrency(v);
        }
        if let Some(v) = self.model {
            b = b.model(v);
        }
        if let Some(v) = self.provider {
            b = b.provider_name(v);
        }
        if let Some(v) = self.temperature {
            b = b.temperature(v);
        }
        if let Some(v) = self.max_tokens {
            b = b.max_tokens(v);
        }
        if let Some(v) = self.max_attempts {
            b = b.max_attempts(v);
        }
        if let Some(v) = self.retry_backoff_ms {
            b = b.retry_backoff_ms(v);
        }
        if let Some(v) = self.max_backoff_ms {
            b = b.max_backoff_ms(v);
        }
        if let Some(v) = self.prompt_file {
            b = b.prompt(PromptTemplate::from_file(&rel(v))?);
        }
        if let Some(v) = self.storage_path {
            b = b.storage_path(rel(v));
        }
        if let Some(v) = self.retention {
            b = b.retention(v);
        }
        if let Some(v) = self.artifact_dir {
            b = b.artifact_dir(rel(v));
        }
        if let Some(v) = self.fetch_timeout_secs {
            b = b.fetch_timeout_secs(v);
        }
        if let Some(v) = self.detect_timeout_secs {
            b = b.detect_timeout_secs(v);
        }
        if let Some(v) = self.api_timeout_secs {
            b = b.api_timeout_secs(v);
        }
        if let Some(v) = self.buckets {
            b = b.buckets(v);
        }
        for (country, locations) in self.sources {
            for loc in locations {
                b = b.source(country.clone(), loc.relative_to(base));
            }
        }
        Ok(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::acquire::SourceKind;

    #[test]
    fn defaults_build() {
        let c = PipelineConfig::builder().build().unwrap();
        assert_eq!(c.confidence_floor, 0.5);
        assert_eq!(c.max_attempts, 3);
        assert_eq!(c.retry_backoff_ms, 500);
        assert_eq!(c.retention, RetentionPolicy::Purge);
        assert_eq!(c.prompt.version, crate::prompts::DEFAULT_PROMPT_VERSION);
    }

    #[test]
    fn builder_clamps() {
        let c = PipelineConfig::builder()
            .dpi(10)
            .parser_concurrency(0)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 72);
        assert_eq!(c.parser_concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn build_rejects_bad_thresholds() {
        assert!(PipelineConfig::builder()
            .confidence_floor(1.5)
            .build()
            .is_err());
        assert!(PipelineConfig::builder()
            .nms_iou_threshold(0.0)
            .build()
            .is_err());
        assert!(PipelineConfig::builder().max_attempts(0).build().is_err());
    }

    #[test]
    fn yaml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tariff.yaml");
        std::fs::write(
            &path,
            r#"
confidence_floor: 0.7
max_attempts: 5
storage_path: data/tariffs.db
retention: retain
sources:
  India:
    - kind: portal
      line: COSCO
      index_url: https://example.com/info
      download_url: https://example.com/download
  Kenya:
    - kind: directory
      path: pdfs/kenya
"#,
        )
        .unwrap();

        let c = PipelineConfig::from_yaml_file(&path).unwrap();
        assert_eq!(c.confidence_floor, 0.7);
        assert_eq!(c.max_attempts, 5);
        assert_eq!(c.storage_path, dir.path().join("data/tariffs.db"));
        assert_eq!(c.retention, RetentionPolicy::Retain);

        let india = c.sources_for("india").unwrap();
        assert_eq!(india.len(), 1);
        assert_eq!(india[0].line.as_deref(), Some("COSCO"));

        let kenya = c.sources_for("Kenya").unwrap();
        match &kenya[0].kind {
            SourceKind::Directory { path } => assert_eq!(path, &dir.path().join("pdfs/kenya")),
            other => panic!("unexpected source {other:?}"),
        }
        assert!(c.sources_for("Chile").is_none());
    }

    #[test]
    fn yaml_unknown_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "confidence_flor: 0.7\n").unwrap();
        let err = PipelineConfig::from_yaml_file(&path).unwrap_err();
        assert!(matches!(err, TariffError::ConfigFile { .. }));
    }
}
