//! Progress callbacks for orchestrator runs.
//!
//! Pass an [`Arc<dyn RunProgressCallback>`] to
//! [`crate::run::Pipeline::run`] to receive per-document events. The CLI
//! turns them into a progress bar; the HTTP server passes the no-op.
//!
//! # Example
//!
//! ```rust
//! use tariff_extract::RunProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl RunProgressCallback for Counter {
//!     fn on_document_complete(&self, _document: &str, records: usize) {
//!         self.0.fetch_add(records, Ordering::SeqCst);
//!     }
//! }
//! ```

use std::sync::Arc;

/// Events emitted while a run progresses.
///
/// Documents are processed concurrently, so the document-level methods may
/// be called from several tasks at once. All methods default to no-ops.
pub trait RunProgressCallback: Send + Sync {
    /// Acquisition finished; `documents` will be processed.
    fn on_run_start(&self, country: &str, documents: usize) {
        let _ = (country, documents);
    }

    fn on_document_start(&self, document: &str) {
        let _ = document;
    }

    /// `records` is the number of records inserted or updated.
    fn on_document_complete(&self, document: &str, records: usize) {
        let _ = (document, records);
    }

    /// The document could not be processed at all (e.g. it would not open).
    fn on_document_error(&self, document: &str, error: &str) {
        let _ = (document, error);
    }

    fn on_run_complete(&self, documents: usize, records: usize) {
        let _ = (documents, records);
    }
}

/// Used when no callback is supplied.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn RunProgressCallback>;
