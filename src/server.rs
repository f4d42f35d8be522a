//! HTTP surface over a shared [`Pipeline`].
//!
//! | Route | |
//! |---|---|
//! | `POST /upload?country=..[&source=..]` | one synchronous run → `RunSummary` |
//! | `GET /fetch[?country=..]` | persisted tariff records |
//! | `GET /quarantine[?limit=..]` | raw extractions that did not parse |
//! | `GET /health` | liveness, version, storage check |

use crate::error::TariffError;
use crate::model::{RunSummary, TariffRecord};
use crate::run::Pipeline;
use crate::store::{QuarantinedExtraction, StoreError};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_QUARANTINE_LIMIT: usize = 100;

/// Shared state: the pipeline plus a lock that serialises runs.
pub struct AppState {
    pipeline: Arc<Pipeline>,
    run_lock: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Arc<Self> {
        Arc::new(Self {
            pipeline: Arc::new(pipeline),
            run_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/fetch", get(fetch))
        .route("/quarantine", get(quarantine))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Handlers ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    country: Option<String>,
    source: Option<String>,
}

async fn upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
) -> Result<Json<RunSummary>, ApiError> {
    let country = query.country.unwrap_or_default();
    info!("Upload requested for '{}'", country);

    // The run lives in its own task so a dropped connection does not cancel it.
    let st = Arc::clone(&state);
    let handle = tokio::spawn(async move {
        let _guard = st.run_lock.lock().await;
        st.pipeline.run(&country, query.source.as_deref(), None).await
    });

    let summary = handle
        .await
        .map_err(|e| ApiError::from(TariffError::Internal(format!("run task: {e}"))))??;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    country: Option<String>,
}

async fn fetch(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FetchQuery>,
) -> Result<Json<Vec<TariffRecord>>, ApiError> {
    let records = state
        .pipeline
        .store()
        .call(move |s| match query.country.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => s.fetch_by_country(c),
            _ => s.fetch_all(),
        })
        .await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct QuarantineQuery {
    limit: Option<usize>,
}

async fn quarantine(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QuarantineQuery>,
) -> Result<Json<Vec<QuarantinedExtraction>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_QUARANTINE_LIMIT);
    let items = state
        .pipeline
        .store()
        .call(move |s| s.list_quarantine(limit))
        .await?;
    Ok(Json(items))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub records: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    let records = state
        .pipeline
        .store()
        .call(|s| {
            s.health_check()?;
            s.count_records()
        })
        .await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        records,
    }))
}

// ── Errors ───────────────────────────────────────────────────────────────

/// Maps pipeline errors onto status codes and a JSON body.
#[derive(Debug)]
pub enum ApiError {
    Run(TariffError),
    Store(StoreError),
}

impl From<TariffError> for ApiError {
    fn from(e: TariffError) -> Self {
        ApiError::Run(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Run(e) => match e {
                TariffError::InvalidCountry { .. } => StatusCode::BAD_REQUEST,
                TariffError::UnknownCountry { .. } => StatusCode::NOT_FOUND,
                TariffError::NoDocuments { .. } | TariffError::AcquisitionFailed { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                TariffError::StorageUnavailable { .. }
                | TariffError::DetectorUnavailable { .. }
                | TariffError::ProviderNotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
                TariffError::InvalidConfig(_)
                | TariffError::ConfigFile { .. }
                | TariffError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Run(e) => match e {
                TariffError::InvalidCountry { .. } => "invalid_country",
                TariffError::UnknownCountry { .. } => "unknown_country",
                TariffError::NoDocuments { .. } => "no_documents",
                TariffError::AcquisitionFailed { .. } => "acquisition_failed",
                TariffError::DetectorUnavailable { .. } => "detector_unavailable",
                TariffError::ProviderNotConfigured { .. } => "provider_not_configured",
                TariffError::StorageUnavailable { .. } => "storage_unavailable",
                TariffError::InvalidConfig(_) | TariffError::ConfigFile { .. } => "invalid_config",
                TariffError::Internal(_) => "internal",
            },
            ApiError::Store(_) => "storage_unavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let body = match self {
            ApiError::Run(TariffError::NoDocuments { summary, .. }) => json!({
                "error": code,
                "message": "no tariff documents could be acquired",
                "summary": summary,
            }),
            ApiError::Run(e) => {
                if !e.is_client_error() {
                    error!("Run failed: {}", e);
                }
                json!({ "error": code, "message": e.to_string() })
            }
            ApiError::Store(e) => {
                error!("Storage error: {}", e);
                json!({ "error": code, "message": e.to_string() })
            }
        };
        (status, Json(body)).into_response()
    }
}
