//! Error types for the tariff extraction pipeline.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`TariffError`] — **Fatal**: the run cannot proceed at all (no
//!   documents, storage unreachable, detector model missing, no vision-model
//!   credential). Returned as `Err(TariffError)` from
//!   [`crate::run::Pipeline::run`].
//!
//! * [`StageError`] — **Non-fatal**: one page, region or record failed but
//!   the rest of the batch is fine. Folded into
//!   [`crate::model::RunSummary::errors`] with its stage label so callers can
//!   inspect partial success instead of losing the whole run.
//!
//! Row-level validation failures are neither: they are
//! [`crate::pipeline::validate::RejectReason`] values and are counted, not
//! reported as errors.

use crate::model::RunSummary;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by a pipeline run.
#[derive(Debug, Error)]
pub enum TariffError {
    // ── Request errors ───────────────────────────────────────────────────
    /// The country name is empty or contains characters no source accepts.
    #[error("Invalid country '{input}': {reason}")]
    InvalidCountry { input: String, reason: String },

    /// No source is configured for this country.
    #[error("No tariff source is configured for country '{country}'")]
    UnknownCountry { country: String },

    // ── Acquisition errors ───────────────────────────────────────────────
    /// Acquisition finished but produced nothing to process. Carries the
    /// summary so callers still see the acquisition errors.
    #[error("No tariff documents could be acquired for '{country}'")]
    NoDocuments {
        country: String,
        summary: Box<RunSummary>,
    },

    /// The source could not be reached at all.
    #[error("Acquisition failed for '{country}': {reason}")]
    AcquisitionFailed { country: String, reason: String },

    // ── Model errors ─────────────────────────────────────────────────────
    /// The table detector model could not be loaded.
    #[error("Table detector unavailable ({path:?}): {reason}")]
    DetectorUnavailable { path: PathBuf, reason: String },

    /// The vision-model provider is not initialised (missing API key etc.).
    #[error("Vision model provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Storage errors ───────────────────────────────────────────────────
    /// The storage file cannot be opened or queried.
    #[error("Storage unavailable at '{path}': {reason}")]
    StorageUnavailable { path: PathBuf, reason: String },

    // ── Config errors ────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The YAML configuration file could not be read or parsed.
    #[error("Failed to load configuration '{path}': {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    // ── Catch-all ────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TariffError {
    /// True for errors caused by the request itself rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TariffError::InvalidCountry { .. }
                | TariffError::UnknownCountry { .. }
                | TariffError::NoDocuments { .. }
                | TariffError::AcquisitionFailed { .. }
        )
    }
}

/// A non-fatal error for a single page, region or record.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageError {
    /// The document or one of its pages could not be rasterised.
    #[error("rasterisation failed for page {page:?}: {detail}")]
    Render { page: Option<usize>, detail: String },

    /// The detector raised on one page image.
    #[error("table detection failed on page {page}: {detail}")]
    Detection { page: usize, detail: String },

    /// A crop could not be encoded for the model.
    #[error("region {region} on page {page} could not be encoded: {detail}")]
    Encode {
        page: usize,
        region: usize,
        detail: String,
    },

    /// Every attempt ended in a timeout / rate limit / transient failure.
    #[error("vision model failed after {attempts} attempts: {detail}")]
    ParseTransientExhausted { attempts: u32, detail: String },

    /// The model answered, but not in the expected key/value shape.
    #[error("unparseable model output: {detail}")]
    ParseStructural { detail: String },

    /// The provider refused the request permanently (auth, bad request).
    #[error("vision model rejected the request: {detail}")]
    ParseRejected { detail: String },

    /// A single record could not be written.
    #[error("failed to persist record {key}: {detail}")]
    Persistence { key: String, detail: String },
}

impl StageError {
    /// Short machine-readable reason code, also stored with quarantined extractions.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Render { .. } => "render_error",
            StageError::Detection { .. } => "detection_error",
            StageError::Encode { .. } => "encode_error",
            StageError::ParseTransientExhausted { .. } => "retry_exhausted",
            StageError::ParseStructural { .. } => "structural_error",
            StageError::ParseRejected { .. } => "rejected_by_model",
            StageError::Persistence { .. } => "persistence_error",
        }
    }
}
