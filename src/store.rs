//! SQLite persistence for runs, audit data and tariff records.
//!
//! Schema:
//! - runs: one row per orchestrator run, with its final summary
//! - source_documents / raster_pages / table_regions: what a run looked at
//! - raw_extractions: every vision-model exchange, parsed or quarantined
//! - rejections: rows the validator refused, linked to their extraction
//! - tariff_records: canonical records, unique on the natural key
//!
//! All access goes through one connection behind a mutex, so writes are
//! serialised. Async callers use [`TariffStore::call`] to run store work on
//! the blocking pool.

use crate::model::{
    ExtractionStatus, RasterPage, RawExtraction, RegionRef, RunSummary, SourceDocument,
    TableRegion, TariffRecord,
};
use crate::pipeline::validate::Rejection;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    country TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    summary_json TEXT
);

CREATE TABLE IF NOT EXISTS source_documents (
    id INTEGER PRIMARY KEY,
    run_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    country TEXT NOT NULL,
    line TEXT,
    direction TEXT,
    path TEXT NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raster_pages (
    id INTEGER PRIMARY KEY,
    run_id TEXT NOT NULL,
    document TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    artifact_path TEXT
);

CREATE TABLE IF NOT EXISTS table_regions (
    id INTEGER PRIMARY KEY,
    run_id TEXT NOT NULL,
    document TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    region_index INTEGER NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    width REAL NOT NULL,
    height REAL NOT NULL,
    confidence REAL NOT NULL,
    artifact_path TEXT
);

CREATE TABLE IF NOT EXISTS raw_extractions (
    id INTEGER PRIMARY KEY,
    run_id TEXT NOT NULL,
    document TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    region_index INTEGER NOT NULL,
    confidence REAL NOT NULL,
    prompt_version TEXT NOT NULL,
    model_id TEXT NOT NULL,
    raw_output TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    status TEXT NOT NULL,
    reason TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rejections (
    id INTEGER PRIMARY KEY,
    run_id TEXT NOT NULL,
    extraction_id INTEGER REFERENCES raw_extractions(id),
    reason TEXT NOT NULL,
    row_index INTEGER NOT NULL,
    detail TEXT NOT NULL,
    raw_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tariff_records (
    id INTEGER PRIMARY KEY,
    country TEXT NOT NULL,
    port TEXT NOT NULL,
    line TEXT NOT NULL,
    equipment TEXT NOT NULL,
    currency TEXT NOT NULL,
    free_days_json TEXT NOT NULL,
    demurrage_json TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    updated_at_us INTEGER NOT NULL,
    UNIQUE(country, port, line, equipment)
);

CREATE INDEX IF NOT EXISTS idx_records_country ON tariff_records(country);
CREATE INDEX IF NOT EXISTS idx_extractions_status ON raw_extractions(status);
CREATE INDEX IF NOT EXISTS idx_rejections_run ON rejections(run_id);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialisation: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("storage task failed: {0}")]
    Join(String),
}

/// What an upsert did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored attributes were already identical; timestamp untouched.
    Unchanged,
}

/// A quarantined extraction as listed for audit.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedExtraction {
    pub id: i64,
    pub run_id: String,
    pub created_at: String,
    #[serde(flatten)]
    pub extraction: RawExtraction,
}

/// A stored rejection with its provenance.
#[derive(Debug, Clone, Serialize)]
pub struct StoredRejection {
    pub id: i64,
    pub run_id: String,
    pub extraction_id: Option<i64>,
    #[serde(flatten)]
    pub rejection: Rejection,
}

/// Cloneable handle to the SQLite file.
#[derive(Clone)]
pub struct TariffStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for TariffStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TariffStore").field("path", &self.path).finish()
    }
}

impl TariffStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn, path.to_path_buf())
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against this store on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&TariffStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut conn)
    }

    /// Cheap query proving the file is readable and writable.
    pub fn health_check(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT count(*) FROM runs", [], |r| r.get::<_, i64>(0))?;
            conn.execute_batch("BEGIN IMMEDIATE; ROLLBACK;")?;
            Ok(())
        })
    }

    /// Fold the WAL back into the main file.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
    }

    // ── Tariff records ───────────────────────────────────────────────────

    /// Insert, update in place, or leave untouched.
    ///
    /// The stored timestamp only moves on insert or on a real change, and
    /// always moves forward for a given key.
    pub fn upsert(&self, record: &TariffRecord) -> Result<UpsertOutcome, StoreError> {
        let fingerprint = record.fingerprint();
        let free_days = serde_json::to_string(&record.free_days)?;
        let demurrage = serde_json::to_string(&record.demurrage)?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT fingerprint, updated_at_us FROM tariff_records
                     WHERE country = ?1 AND port = ?2 AND line = ?3 AND equipment = ?4",
                    params![record.country, record.port, record.line, record.equipment],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let now = Utc::now().timestamp_micros();
            let outcome = match existing {
                Some((stored, _)) if stored == fingerprint => UpsertOutcome::Unchanged,
                Some((_, previous)) => {
                    tx.execute(
                        "UPDATE tariff_records
                         SET currency = ?5, free_days_json = ?6, demurrage_json = ?7,
                             fingerprint = ?8, updated_at_us = ?9
                         WHERE country = ?1 AND port = ?2 AND line = ?3 AND equipment = ?4",
                        params![
                            record.country,
                            record.port,
                            record.line,
                            record.equipment,
                            record.currency,
                            free_days,
                            demurrage,
                            fingerprint,
                            now.max(previous + 1),
                        ],
                    )?;
                    UpsertOutcome::Updated
                }
                None => {
                    tx.execute(
                        "INSERT INTO tariff_records
                         (country, port, line, equipment, currency, free_days_json,
                          demurrage_json, fingerprint, updated_at_us)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            record.country,
                            record.port,
                            record.line,
                            record.equipment,
                            record.currency,
                            free_days,
                            demurrage,
                            fingerprint,
                            now,
                        ],
                    )?;
                    UpsertOutcome::Inserted
                }
            };
            tx.commit()?;
            debug!("upsert {}: {:?}", record.key(), outcome);
            Ok(outcome)
        })
    }

    /// Every stored record, ordered by natural key.
    pub fn fetch_all(&self) -> Result<Vec<TariffRecord>, StoreError> {
        self.query_records(None)
    }

    pub fn fetch_by_country(&self, country: &str) -> Result<Vec<TariffRecord>, StoreError> {
        self.query_records(Some(country))
    }

    fn query_records(&self, country: Option<&str>) -> Result<Vec<TariffRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT country, port, line, equipment, currency, free_days_json,
                        demurrage_json, updated_at_us
                 FROM tariff_records
                 WHERE ?1 IS NULL OR country = ?1 COLLATE NOCASE
                 ORDER BY country, port, line, equipment",
            )?;
            let rows = stmt.query_map(params![country], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, i64>(7)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (country, port, line, equipment, currency, fd, dm, ts) = row?;
                out.push(TariffRecord {
                    country,
                    port,
                    line,
                    equipment,
                    currency,
                    free_days: serde_json::from_str(&fd)?,
                    demurrage: serde_json::from_str(&dm)?,
                    last_updated: from_micros(ts),
                });
            }
            Ok(out)
        })
    }

    pub fn count_records(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT count(*) FROM tariff_records", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }

    // ── Run audit trail ──────────────────────────────────────────────────

    pub fn begin_run(&self, run_id: &str, country: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (run_id, country, started_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id) DO NOTHING",
                params![run_id, country, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn finish_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        let json = serde_json::to_string(summary)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (run_id, country, started_at, finished_at, summary_json)
                 VALUES (?1, ?2, ?3, ?3, ?4)
                 ON CONFLICT(run_id) DO UPDATE SET
                    finished_at = excluded.finished_at,
                    summary_json = excluded.summary_json",
                params![summary.run_id, summary.country, Utc::now().to_rfc3339(), json],
            )?;
            Ok(())
        })
    }

    /// Finished runs, most recent first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT summary_json FROM runs WHERE summary_json IS NOT NULL
                 ORDER BY finished_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for json in rows {
                out.push(serde_json::from_str(&json?)?);
            }
            Ok(out)
        })
    }

    pub fn record_document(&self, run_id: &str, doc: &SourceDocument) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO source_documents
                 (run_id, source_id, country, line, direction, path, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    doc.source_id,
                    doc.country,
                    doc.line,
                    doc.direction,
                    doc.path.display().to_string(),
                    doc.fetched_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_page(
        &self,
        run_id: &str,
        page: &RasterPage,
        artifact: Option<&Path>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO raster_pages
                 (run_id, document, page_number, width, height, artifact_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    page.document,
                    page.page_number as i64,
                    page.width,
                    page.height,
                    artifact.map(|p| p.display().to_string()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_region(
        &self,
        run_id: &str,
        region: &TableRegion,
        artifact: Option<&Path>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO table_regions
                 (run_id, document, page_number, region_index, x, y, width, height,
                  confidence, artifact_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    region.document,
                    region.page_number as i64,
                    region.region_index as i64,
                    region.bbox.x as f64,
                    region.bbox.y as f64,
                    region.bbox.width as f64,
                    region.bbox.height as f64,
                    region.confidence as f64,
                    artifact.map(|p| p.display().to_string()),
                ],
            )?;
            Ok(())
        })
    }

    /// Store one model exchange and return its id.
    pub fn record_extraction(&self, run_id: &str, ex: &RawExtraction) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO raw_extractions
                 (run_id, document, page_number, region_index, confidence, prompt_version,
                  model_id, raw_output, latency_ms, attempts, status, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    run_id,
                    ex.region.document,
                    ex.region.page as i64,
                    ex.region.region as i64,
                    ex.region.confidence as f64,
                    ex.prompt_version,
                    ex.model_id,
                    ex.raw_output,
                    ex.latency_ms as i64,
                    ex.attempts,
                    ex.status.as_str(),
                    ex.reason,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn record_rejection(
        &self,
        run_id: &str,
        extraction_id: Option<i64>,
        rejection: &Rejection,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&rejection.raw)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rejections
                 (run_id, extraction_id, reason, row_index, detail, raw_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    extraction_id,
                    rejection.reason.code(),
                    rejection.row_index as i64,
                    rejection.detail,
                    raw,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Extractions that did not parse, newest first.
    pub fn list_quarantine(&self, limit: usize) -> Result<Vec<QuarantinedExtraction>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, created_at, document, page_number, region_index,
                        confidence, prompt_version, model_id, raw_output, latency_ms,
                        attempts, status, reason
                 FROM raw_extractions
                 WHERE status != 'parsed'
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], quarantine_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn list_rejections(&self, run_id: Option<&str>) -> Result<Vec<StoredRejection>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, extraction_id, reason, row_index, detail, raw_json
                 FROM rejections
                 WHERE ?1 IS NULL OR run_id = ?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, run_id, extraction_id, reason, row_index, detail, raw) = row?;
                out.push(StoredRejection {
                    id,
                    run_id,
                    extraction_id,
                    rejection: Rejection {
                        reason: serde_json::from_value(serde_json::Value::String(reason))?,
                        row_index: row_index as usize,
                        detail,
                        raw: serde_json::from_str(&raw)?,
                    },
                });
            }
            Ok(out)
        })
    }
}

fn quarantine_row(r: &Row<'_>) -> rusqlite::Result<QuarantinedExtraction> {
    let status: String = r.get(12)?;
    Ok(QuarantinedExtraction {
        id: r.get(0)?,
        run_id: r.get(1)?,
        created_at: r.get(2)?,
        extraction: RawExtraction {
            region: RegionRef {
                document: r.get(3)?,
                page: r.get::<_, i64>(4)? as usize,
                region: r.get::<_, i64>(5)? as usize,
                confidence: r.get::<_, f64>(6)? as f32,
            },
            prompt_version: r.get(7)?,
            model_id: r.get(8)?,
            raw_output: r.get(9)?,
            latency_ms: r.get::<_, i64>(10)? as u64,
            attempts: r.get(11)?,
            status: ExtractionStatus::parse(&status).unwrap_or(ExtractionStatus::StructuralError),
            reason: r.get(13)?,
        },
    })
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(us).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::validate::RejectReason;
    use std::collections::BTreeMap;

    fn record(port: &str, amount: f64) -> TariffRecord {
        TariffRecord {
            country: "India".into(),
            port: port.into(),
            line: "COSCO".into(),
            equipment: "20GP".into(),
            currency: "USD".into(),
            free_days: BTreeMap::from([("0-5".into(), 5)]),
            demurrage: BTreeMap::from([(
                "20GP".into(),
                BTreeMap::from([("6-10".into(), amount)]),
            )]),
            last_updated: Utc::now(),
        }
    }

    fn extraction(status: ExtractionStatus) -> RawExtraction {
        RawExtraction {
            region: RegionRef {
                document: "india.pdf".into(),
                page: 2,
                region: 1,
                confidence: 0.8,
            },
            prompt_version: "v1".into(),
            model_id: "fake".into(),
            raw_output: "not json".into(),
            latency_ms: 12,
            attempts: 1,
            status,
            reason: Some("structural_error: nope".into()),
        }
    }

    #[test]
    fn upsert_insert_unchanged_update() {
        let store = TariffStore::in_memory().unwrap();
        assert_eq!(store.upsert(&record("Nhava Sheva", 50.0)).unwrap(), UpsertOutcome::Inserted);
        let first = store.fetch_all().unwrap()[0].last_updated;

        assert_eq!(store.upsert(&record("Nhava Sheva", 50.0)).unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.fetch_all().unwrap()[0].last_updated, first);

        assert_eq!(store.upsert(&record("Nhava Sheva", 60.0)).unwrap(), UpsertOutcome::Updated);
        let all = store.fetch_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].demurrage["20GP"]["6-10"], 60.0);
        assert!(all[0].last_updated > first);
    }

    #[test]
    fn natural_key_is_unique() {
        let store = TariffStore::in_memory().unwrap();
        for amount in [10.0, 20.0, 30.0, 30.0] {
            store.upsert(&record("Chennai", amount)).unwrap();
        }
        store.upsert(&record("Mundra", 10.0)).unwrap();
        assert_eq!(store.count_records().unwrap(), 2);

        let ports: Vec<_> = store.fetch_all().unwrap().into_iter().map(|r| r.port).collect();
        assert_eq!(ports, vec!["Chennai", "Mundra"]);
    }

    #[test]
    fn fetch_by_country_is_case_insensitive() {
        let store = TariffStore::in_memory().unwrap();
        store.upsert(&record("Chennai", 10.0)).unwrap();
        assert_eq!(store.fetch_by_country("india").unwrap().len(), 1);
        assert!(store.fetch_by_country("Kenya").unwrap().is_empty());
    }

    #[test]
    fn quarantine_lists_only_unparsed() {
        let store = TariffStore::in_memory().unwrap();
        store.record_extraction("r1", &extraction(ExtractionStatus::Parsed)).unwrap();
        store
            .record_extraction("r1", &extraction(ExtractionStatus::RetryExhausted))
            .unwrap();

        let q = store.list_quarantine(10).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].extraction.status, ExtractionStatus::RetryExhausted);
        assert_eq!(q[0].extraction.raw_output, "not json");
        assert_eq!(q[0].extraction.region.page, 2);
    }

    #[test]
    fn rejections_round_trip() {
        let store = TariffStore::in_memory().unwrap();
        let id = store
            .record_extraction("r1", &extraction(ExtractionStatus::Parsed))
            .unwrap();
        let rejection = Rejection {
            reason: RejectReason::UnknownBucket,
            row_index: 3,
            detail: "'1-4' does not match".into(),
            raw: serde_json::json!({"port": "Chennai"}),
        };
        store.record_rejection("r1", Some(id), &rejection).unwrap();

        let stored = store.list_rejections(Some("r1")).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].extraction_id, Some(id));
        assert_eq!(stored[0].rejection, rejection);
        assert!(store.list_rejections(Some("r2")).unwrap().is_empty());
    }

    #[test]
    fn runs_are_recorded() {
        let store = TariffStore::in_memory().unwrap();
        store.begin_run("r1", "India").unwrap();
        let mut summary = RunSummary::new("r1", "India");
        summary.records_persisted = 4;
        store.finish_run(&summary).unwrap();

        let runs = store.list_runs(5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].records_persisted, 4);
    }

    #[test]
    fn file_store_health_and_bad_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = TariffStore::open(&dir.path().join("nested/tariffs.db")).unwrap();
        store.health_check().unwrap();

        // A directory cannot be opened as a database.
        assert!(TariffStore::open(dir.path()).is_err());
    }

    #[tokio::test]
    async fn call_runs_on_blocking_pool() {
        let store = TariffStore::in_memory().unwrap();
        let outcome = store
            .call(|s| s.upsert(&record("Chennai", 10.0)))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
    }
}
