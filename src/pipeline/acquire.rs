//! Source acquisition: turn a country name into local tariff PDFs.
//!
//! pdfium needs a file-system path, so every remote document is written to a
//! per-run workspace directory first. The orchestrator owns that directory:
//! a `TempDir` under the purge policy, `artifact_dir/<country>` under retain.
//! Downloads are named after their source file, suffixed `-2`, `-3`, ... when
//! two sources of the same run share a name.
//! Every file is checked for the `%PDF` magic bytes before it is handed on,
//! so a portal returning an HTML error page shows up as an acquisition
//! failure rather than a pdfium crash.
//!
//! Three location kinds are supported:
//!
//! * `directory` — all `*.pdf` files in a local folder
//! * `url` — a single direct PDF link
//! * `portal` — a JSON index endpoint (`?country=&timestamp=`) listing an
//!   inbound and an outbound tariff PDF, each downloaded by id

use crate::error::TariffError;
use crate::model::{RunError, SourceDocument};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, REFERER, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Source configuration ─────────────────────────────────────────────────

/// One configured place tariff PDFs for a country can be found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Optional label used by the run's source filter.
    #[serde(default)]
    pub name: Option<String>,
    /// Shipping line publishing the documents, passed to the parser as a hint.
    #[serde(default)]
    pub line: Option<String>,
    #[serde(flatten)]
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Directory {
        path: PathBuf,
    },
    Url {
        url: String,
    },
    Portal {
        index_url: String,
        download_url: String,
    },
}

impl SourceLocation {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            line: None,
            kind: SourceKind::Directory { path: path.into() },
        }
    }

    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.line = Some(line.into());
        self
    }

    /// Human-readable label for logs and run errors.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.kind {
            SourceKind::Directory { path } => path.display().to_string(),
            SourceKind::Url { url } => url.clone(),
            SourceKind::Portal { index_url, .. } => index_url.clone(),
        }
    }

    /// True when `filter` names this location or its shipping line.
    pub fn matches_filter(&self, filter: &str) -> bool {
        let filter = filter.trim();
        [self.name.as_deref(), self.line.as_deref()]
            .into_iter()
            .flatten()
            .any(|v| v.eq_ignore_ascii_case(filter))
    }

    /// Resolve a relative directory path against `base`.
    pub fn relative_to(mut self, base: &Path) -> Self {
        if let SourceKind::Directory { path } = &mut self.kind {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        self
    }
}

// ── Acquisition seam ─────────────────────────────────────────────────────

/// Outcome of acquiring one country: the documents that made it, plus one
/// error per location that could not be read.
#[derive(Debug, Default)]
pub struct Acquisition {
    pub documents: Vec<SourceDocument>,
    pub failures: Vec<RunError>,
}

/// Produces source documents for a country.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Whether any location is configured for `country`.
    fn has_country(&self, country: &str) -> bool;

    /// Fetch every document for `country` into `workspace`.
    ///
    /// Per-location failures are reported in [`Acquisition::failures`]; only
    /// a problem with the workspace itself is returned as `Err`.
    async fn acquire(
        &self,
        country: &str,
        filter: Option<&str>,
        workspace: &Path,
    ) -> Result<Acquisition, TariffError>;
}

/// Production source backed by the `sources:` configuration section.
pub struct ConfiguredSource {
    sources: BTreeMap<String, Vec<SourceLocation>>,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl ConfiguredSource {
    pub fn new(
        sources: BTreeMap<String, Vec<SourceLocation>>,
        timeout_secs: u64,
    ) -> Result<Self, TariffError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TariffError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            sources,
            client,
            timeout_secs,
        })
    }

    fn locations(&self, country: &str) -> Option<&[SourceLocation]> {
        self.sources
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(country))
            .map(|(_, locs)| locs.as_slice())
    }

    /// Documents of one location. `Err` means nothing could be read from it;
    /// a portal file that fails on its own lands in `failures` instead.
    async fn acquire_location(
        &self,
        country: &str,
        location: &SourceLocation,
        workspace: &Path,
        claimed: &mut HashSet<String>,
    ) -> Result<Acquisition, TariffError> {
        let fail = |reason: String| TariffError::AcquisitionFailed {
            country: country.to_string(),
            reason,
        };
        let mut out = Acquisition::default();

        match &location.kind {
            SourceKind::Directory { path } => {
                let dir = path.clone();
                let files = tokio::task::spawn_blocking(move || list_pdfs(&dir))
                    .await
                    .map_err(|e| fail(format!("directory scan failed: {e}")))?
                    .map_err(fail)?;
                out.documents = files
                    .into_iter()
                    .map(|p| document(country, location, None, &p, file_label(&p)))
                    .collect();
            }
            SourceKind::Url { url } => {
                let name = claim_name(claimed, &filename_from_url(url));
                let path = download_pdf(&self.client, url, &[], workspace, &name, self.timeout_secs)
                    .await
                    .map_err(fail)?;
                out.documents
                    .push(document(country, location, None, &path, url.clone()));
            }
            SourceKind::Portal {
                index_url,
                download_url,
            } => {
                let Some(entry) = self
                    .fetch_portal_index(country, index_url)
                    .await
                    .map_err(fail)?
                else {
                    warn!("Portal {} has no tariff content for {}", index_url, country);
                    return Ok(out);
                };

                for (direction, id, name) in entry.files() {
                    let ts = Utc::now().timestamp_millis().to_string();
                    let url = reqwest::Url::parse_with_params(
                        download_url,
                        &[("id", id.as_str()), ("timestamp", ts.as_str())],
                    )
                    .map_err(|e| fail(format!("bad download URL '{download_url}': {e}")))?;

                    let name = claim_name(claimed, &name);
                    match download_pdf(
                        &self.client,
                        url.as_str(),
                        &portal_headers(),
                        workspace,
                        &name,
                        self.timeout_secs,
                    )
                    .await
                    {
                        Ok(path) => out
                            .documents
                            .push(document(country, location, Some(direction), &path, id)),
                        Err(e) => {
                            let label = format!("{} ({direction})", location.label());
                            warn!("Source {} failed: {}", label, e);
                            out.failures
                                .push(RunError::acquisition(&label, fail(e).to_string()));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn fetch_portal_index(
        &self,
        country: &str,
        index_url: &str,
    ) -> Result<Option<PortalEntry>, String> {
        let ts = Utc::now().timestamp_millis().to_string();
        let query = [("country", country), ("timestamp", ts.as_str())];
        info!("Fetching tariff index for {} from {}", country, index_url);

        let mut response = self
            .client
            .get(index_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| describe_request_error(e, self.timeout_secs))?;

        // The portal answers bare clients with 403; a plain JSON client passes.
        if response.status() == StatusCode::FORBIDDEN {
            debug!("Index returned 403, retrying with browser headers");
            let mut req = self.client.get(index_url).query(&query);
            for (k, v) in portal_headers() {
                req = req.header(k, v);
            }
            response = req
                .send()
                .await
                .map_err(|e| describe_request_error(e, self.timeout_secs))?;
        }

        if !response.status().is_success() {
            return Err(format!("index returned HTTP {}", response.status()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("index is not JSON: {e}"))?;
        parse_portal_index(&body)
    }
}

#[async_trait]
impl DocumentSource for ConfiguredSource {
    fn has_country(&self, country: &str) -> bool {
        self.locations(country).is_some_and(|l| !l.is_empty())
    }

    async fn acquire(
        &self,
        country: &str,
        filter: Option<&str>,
        workspace: &Path,
    ) -> Result<Acquisition, TariffError> {
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|e| TariffError::Internal(format!("cannot create workspace: {e}")))?;

        let mut out = Acquisition::default();
        let Some(locations) = self.locations(country) else {
            return Ok(out);
        };
        let mut claimed = HashSet::new();

        for location in locations {
            if let Some(f) = filter {
                if !location.matches_filter(f) {
                    continue;
                }
            }
            match self
                .acquire_location(country, location, workspace, &mut claimed)
                .await
            {
                Ok(acq) => {
                    info!(
                        "Acquired {} document(s) from {}",
                        acq.documents.len(),
                        location.label()
                    );
                    out.documents.extend(acq.documents);
                    out.failures.extend(acq.failures);
                }
                Err(e) => {
                    warn!("Source {} failed: {}", location.label(), e);
                    out.failures
                        .push(RunError::acquisition(&location.label(), e.to_string()));
                }
            }
        }
        Ok(out)
    }
}

// ── Portal index ─────────────────────────────────────────────────────────

/// The `data.content` object of a portal index response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortalEntry {
    pub country: String,
    pub in_pdf_name: String,
    pub out_pdf_name: String,
    pub in_idds_pdf_uuid: String,
    pub out_idds_pdf_uuid: String,
}

impl PortalEntry {
    /// `(direction, id, file name)` for every PDF the entry lists.
    fn files(&self) -> Vec<(String, String, String)> {
        [
            ("inbound", &self.in_idds_pdf_uuid, &self.in_pdf_name),
            ("outbound", &self.out_idds_pdf_uuid, &self.out_pdf_name),
        ]
        .into_iter()
        .filter(|(_, id, _)| !id.trim().is_empty())
        .map(|(dir, id, name)| {
            let name = if name.trim().is_empty() {
                format!("{dir}-{id}.pdf")
            } else {
                sanitize_filename(name)
            };
            (dir.to_string(), id.clone(), name)
        })
        .collect()
    }
}

/// Interpret a portal index body.
///
/// `Ok(None)` means the portal answered but has nothing for the country.
pub fn parse_portal_index(body: &Value) -> Result<Option<PortalEntry>, String> {
    let code = match body.get("code") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if code != "200" {
        let msg = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message");
        return Err(format!("portal returned code '{code}': {msg}"));
    }

    match body.get("data").and_then(|d| d.get("content")) {
        None | Some(Value::Null) => Ok(None),
        Some(content) => serde_json::from_value(content.clone())
            .map(Some)
            .map_err(|e| format!("unexpected index content: {e}")),
    }
}

fn portal_headers() -> Vec<(reqwest::header::HeaderName, &'static str)> {
    vec![
        (ACCEPT, "application/json, text/plain, */*"),
        (
            USER_AGENT,
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
        ),
        (
            REFERER,
            "https://elines.coscoshipping.com/ebusiness/demurrageDetentionTariff",
        ),
    ]
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn document(
    country: &str,
    location: &SourceLocation,
    direction: Option<String>,
    path: &Path,
    source_id: String,
) -> SourceDocument {
    SourceDocument {
        source_id,
        country: country.to_string(),
        line: location.line.clone(),
        direction,
        path: path.to_path_buf(),
        fetched_at: Utc::now(),
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// All PDF files directly inside `dir`, sorted by name.
fn list_pdfs(dir: &Path) -> Result<Vec<PathBuf>, String> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| format!("cannot read {}: {e}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_pdf = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if !path.is_file() || !is_pdf {
            continue;
        }
        if has_pdf_magic(&path) {
            files.push(path);
        } else {
            warn!("Skipping {}: missing %PDF header", path.display());
        }
    }
    files.sort();
    Ok(files)
}

fn has_pdf_magic(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == b"%PDF")
        .unwrap_or(false)
}

/// Download `url` into `dir/name`, rejecting anything that is not a PDF.
async fn download_pdf(
    client: &reqwest::Client,
    url: &str,
    headers: &[(reqwest::header::HeaderName, &'static str)],
    dir: &Path,
    name: &str,
    timeout_secs: u64,
) -> Result<PathBuf, String> {
    info!("Downloading PDF from: {}", url);

    let mut req = client.get(url);
    for (k, v) in headers {
        req = req.header(k.clone(), *v);
    }
    let response = req
        .send()
        .await
        .map_err(|e| describe_request_error(e, timeout_secs))?;

    if !response.status().is_success() {
        return Err(format!("download of {url} returned HTTP {}", response.status()));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| format!("download of {url} failed: {e}"))?;

    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        return Err(format!("{url} did not return a PDF"));
    }

    let path = dir.join(name);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| format!("failed to write {}: {e}", path.display()))?;

    debug!("Downloaded {} bytes to {}", bytes.len(), path.display());
    Ok(path)
}

fn describe_request_error(e: reqwest::Error, timeout_secs: u64) -> String {
    if e.is_timeout() {
        format!("request timed out after {timeout_secs}s")
    } else {
        e.to_string()
    }
}

/// Last path segment of a URL if it looks like a file name.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .map(|last| sanitize_filename(&last))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}

/// `name`, or `name-2`, `name-3`, ... when an earlier call already took it.
/// Comparison ignores ASCII case.
pub(crate) fn claim_name(claimed: &mut HashSet<String>, name: &str) -> String {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (name, String::new()),
    };
    let mut candidate = name.to_string();
    let mut n = 1;
    while !claimed.insert(candidate.to_ascii_lowercase()) {
        n += 1;
        candidate = format!("{stem}-{n}{ext}");
    }
    candidate
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    if cleaned.to_ascii_lowercase().ends_with(".pdf") {
        cleaned
    } else {
        format!("{cleaned}.pdf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_pdf(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"%PDF-1.7\n%fake\n").unwrap();
    }

    #[test]
    fn portal_index_content() {
        let body = json!({
            "code": "200",
            "data": { "content": {
                "country": "India",
                "inPdfName": "India IB.pdf",
                "outPdfName": "India OB.pdf",
                "inIddsPdfUuid": "abc",
                "outIddsPdfUuid": ""
            }}
        });
        let entry = parse_portal_index(&body).unwrap().unwrap();
        let files = entry.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "inbound");
        assert_eq!(files[0].1, "abc");
        assert_eq!(files[0].2, "India IB.pdf");
    }

    #[test]
    fn portal_index_empty_and_error() {
        let empty = json!({ "code": "200", "data": { "content": null } });
        assert_eq!(parse_portal_index(&empty).unwrap(), None);

        let err = json!({ "code": "500", "message": "busy" });
        assert!(parse_portal_index(&err).unwrap_err().contains("busy"));
    }

    #[test]
    fn filter_matches_name_or_line() {
        let loc = SourceLocation::directory("/tmp").with_line("COSCO");
        assert!(loc.matches_filter("cosco"));
        assert!(!loc.matches_filter("MSC"));
    }

    #[test]
    fn filenames_are_sanitised() {
        assert_eq!(
            filename_from_url("https://x.example/tariffs/india.pdf?v=2"),
            "india.pdf"
        );
        assert_eq!(filename_from_url("https://x.example/"), "downloaded.pdf");
        assert_eq!(sanitize_filename("a/b"), "a_b.pdf");
    }

    #[test]
    fn claimed_names_get_a_counter() {
        let mut claimed = HashSet::new();
        assert_eq!(claim_name(&mut claimed, "tariff.pdf"), "tariff.pdf");
        assert_eq!(claim_name(&mut claimed, "Tariff.PDF"), "Tariff-2.PDF");
        assert_eq!(claim_name(&mut claimed, "tariff.pdf"), "tariff-3.pdf");
        assert_eq!(claim_name(&mut claimed, "India IB"), "India IB");
        assert_eq!(claim_name(&mut claimed, "India IB"), "India IB-2");
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    fn url_location(url: String) -> SourceLocation {
        SourceLocation {
            name: None,
            line: Some("COSCO".into()),
            kind: SourceKind::Url { url },
        }
    }

    #[tokio::test]
    async fn same_basename_downloads_keep_both_files() {
        use axum::routing::get;

        let base = serve(
            axum::Router::new()
                .route("/a/tariff.pdf", get(|| async { &b"%PDF-1.7
%inbound
"[..] }))
                .route("/b/tariff.pdf", get(|| async { &b"%PDF-1.7
%outbound
"[..] })),
        )
        .await;
        let sources = BTreeMap::from([(
            "India".to_string(),
            vec![
                url_location(format!("{base}/a/tariff.pdf")),
                url_location(format!("{base}/b/tariff.pdf")),
            ],
        )]);
        let source = ConfiguredSource::new(sources, 5).unwrap();
        let work = tempfile::tempdir().unwrap();

        let acq = source.acquire("India", None, work.path()).await.unwrap();
        assert!(acq.failures.is_empty());
        assert_eq!(acq.documents.len(), 2);
        let (a, b) = (&acq.documents[0].path, &acq.documents[1].path);
        assert_ne!(a, b);
        assert_eq!(std::fs::read(a).unwrap(), b"%PDF-1.7
%inbound
");
        assert_eq!(std::fs::read(b).unwrap(), b"%PDF-1.7
%outbound
");
        assert_eq!(b.file_name().unwrap(), "tariff-2.pdf");
    }

    #[tokio::test]
    async fn one_failed_portal_file_keeps_the_other() {
        use axum::extract::Query;
        use axum::response::IntoResponse;
        use axum::routing::get;
        use std::collections::HashMap;

        async fn index() -> axum::Json<Value> {
            axum::Json(json!({
                "code": "200",
                "data": { "content": {
                    "country": "India",
                    "inPdfName": "India.pdf",
                    "outPdfName": "India.pdf",
                    "inIddsPdfUuid": "in-1",
                    "outIddsPdfUuid": "out-1"
                }}
            }))
        }

        async fn download(Query(q): Query<HashMap<String, String>>) -> axum::response::Response {
            match q.get("id").map(String::as_str) {
                Some("in-1") => b"%PDF-1.7
%inbound
".to_vec().into_response(),
                _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }

        let base = serve(
            axum::Router::new()
                .route("/index", get(index))
                .route("/download", get(download)),
        )
        .await;
        let sources = BTreeMap::from([(
            "India".to_string(),
            vec![SourceLocation {
                name: Some("cosco-portal".into()),
                line: Some("COSCO".into()),
                kind: SourceKind::Portal {
                    index_url: format!("{base}/index"),
                    download_url: format!("{base}/download"),
                },
            }],
        )]);
        let source = ConfiguredSource::new(sources, 5).unwrap();
        let work = tempfile::tempdir().unwrap();

        let acq = source.acquire("India", None, work.path()).await.unwrap();
        assert_eq!(acq.documents.len(), 1);
        assert_eq!(acq.documents[0].direction.as_deref(), Some("inbound"));
        assert_eq!(acq.documents[0].source_id, "in-1");
        assert_eq!(acq.failures.len(), 1);
        assert_eq!(acq.failures[0].stage, "acquire");
        assert_eq!(
            acq.failures[0].document.as_deref(),
            Some("cosco-portal (outbound)")
        );
        assert!(acq.failures[0].message.contains("HTTP 500"));
    }

    #[tokio::test]
    async fn directory_source_lists_only_pdfs() {
        let dir = tempfile::tempdir().unwrap();
        write_pdf(dir.path(), "b.pdf");
        write_pdf(dir.path(), "a.PDF");
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        std::fs::write(dir.path().join("fake.pdf"), "<html>").unwrap();

        let sources = BTreeMap::from([(
            "India".to_string(),
            vec![SourceLocation::directory(dir.path()).with_line("COSCO")],
        )]);
        let source = ConfiguredSource::new(sources, 5).unwrap();
        assert!(source.has_country("india"));
        assert!(!source.has_country("Chile"));

        let work = tempfile::tempdir().unwrap();
        let acq = source.acquire("India", None, work.path()).await.unwrap();
        let names: Vec<_> = acq.documents.iter().map(|d| d.source_id.clone()).collect();
        assert_eq!(names, vec!["a.PDF", "b.pdf"]);
        assert!(acq.failures.is_empty());
        assert_eq!(acq.documents[0].line.as_deref(), Some("COSCO"));

        let filtered = source
            .acquire("India", Some("MSC"), work.path())
            .await
            .unwrap();
        assert!(filtered.documents.is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_a_failure_not_an_error() {
        let sources = BTreeMap::from([(
            "Kenya".to_string(),
            vec![SourceLocation::directory("/definitely/not/here")],
        )]);
        let source = ConfiguredSource::new(sources, 5).unwrap();
        let work = tempfile::tempdir().unwrap();
        let acq = source.acquire("Kenya", None, work.path()).await.unwrap();
        assert!(acq.documents.is_empty());
        assert_eq!(acq.failures.len(), 1);
        assert_eq!(acq.failures[0].stage, "acquire");
    }
}
