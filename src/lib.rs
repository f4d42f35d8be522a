//! # tariff-extract
//!
//! Extract demurrage & detention tariffs from shipping-line PDFs into a
//! queryable SQLite table.
//!
//! ## Why this crate?
//!
//! Carrier tariff sheets are published as scanned or designed PDFs, one
//! layout per carrier and per country. Text extraction scrambles their
//! tables. This crate rasterises each page, finds the tables with an ONNX
//! object detector, crops them, and asks a vision-capable model to read each
//! crop into rows. The rows are validated against a fixed schema and upserted
//! on a natural key, so re-running over unchanged PDFs changes nothing.
//!
//! ## Pipeline Overview
//!
//! ```text
//! country
//!  │
//!  ├─ 1. Acquire   directories, URLs or a carrier portal → local PDFs
//!  ├─ 2. Render    rasterise pages via pdfium (spawn_blocking)
//!  ├─ 3. Detect    ONNX table detector, confidence floor + NMS
//!  ├─ 4. Crop      padded table regions
//!  ├─ 5. Parse     vision model with retry; bad output is quarantined
//!  ├─ 6. Validate  rows → TariffRecord | Rejection
//!  └─ 7. Persist   idempotent upsert on (country, port, line, equipment)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tariff_extract::{Pipeline, PipelineConfig, SourceLocation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = PipelineConfig::builder()
//!         .source("India", SourceLocation::directory("tariffs/india"))
//!         .build()?;
//!     let pipeline = Pipeline::from_config(config).await?;
//!     let summary = pipeline.run("India", None, None).await?;
//!     println!("{} records persisted", summary.records_persisted);
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `tariff-extract` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod buckets;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod server;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use buckets::{BucketSpec, BucketVocabulary};
pub use config::{PipelineConfig, PipelineConfigBuilder, RetentionPolicy};
pub use error::{StageError, TariffError};
pub use model::{
    BoundingBox, Detection, NaturalKey, RasterPage, RawExtraction, RegionRef, RunError,
    RunSummary, SourceDocument, TableRegion, TariffRecord,
};
pub use pipeline::acquire::{Acquisition, DocumentSource, SourceKind, SourceLocation};
pub use pipeline::detect::TableDetector;
pub use pipeline::parse::{VisionCallError, VisionModel};
pub use pipeline::render::{PageRenderer, RenderedDocument};
pub use pipeline::validate::{RejectReason, Rejection, Validated};
pub use progress::{ProgressCallback, RunProgressCallback};
pub use prompts::PromptTemplate;
pub use run::{Pipeline, PipelineResources, VisionSlot};
pub use store::{TariffStore, UpsertOutcome};
