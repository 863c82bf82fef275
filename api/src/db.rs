use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use roadwatch_pipeline::analysis::AnalysisReport;
use rusqlite::{params, Connection, Result as SqlResult};
use serde::Serialize;
use tracing::{debug, info};

/// One analysed still image, as kept in the scan log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub severity_score: f64,
    pub severity_level: String,
    pub crack_count: i64,
    pub avg_confidence: f64,
    pub inference_time_ms: f64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// `geotag`, `hint` or `simulated`.
    pub position_source: Option<String>,
}

impl ScanRecord {
    /// Build an unsaved record (`id == 0`) from an analysis report.
    pub fn from_report(report: &AnalysisReport) -> Self {
        let position_source = report.position.and_then(|fix| {
            serde_json::to_value(fix.source)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
        });
        Self {
            id: 0,
            timestamp: Utc::now(),
            severity_score: report.severity.score,
            severity_level: report.severity.level.as_str().to_owned(),
            crack_count: report.severity.crack_count as i64,
            avg_confidence: f64::from(report.severity.avg_confidence),
            inference_time_ms: report.inference_time_ms,
            lat: report.position.map(|p| p.lat),
            lon: report.position.map(|p| p.lon),
            position_source,
        }
    }
}

/// Append-only SQLite log of still-image analyses.
///
/// WAL mode keeps `recent` reads from blocking concurrent appends.
pub struct ScanLog {
    conn: Mutex<Connection>,
}

impl ScanLog {
    /// Open (or create) the log at `path`, creating its parent directory.
    pub fn open(path: &Path) -> SqlResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|_e| rusqlite::Error::InvalidPath(parent.into()))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scans (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_ms      INTEGER NOT NULL,
                severity_score    REAL    NOT NULL,
                severity_level    TEXT    NOT NULL,
                crack_count       INTEGER NOT NULL,
                avg_confidence    REAL    NOT NULL,
                inference_time_ms REAL    NOT NULL,
                lat               REAL,
                lon               REAL,
                position_source   TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_scans_time ON scans(timestamp_ms);",
        )?;

        info!(path = %path.display(), "scan log opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `record`, ignoring its `id`. Returns the new row id.
    pub fn append(&self, record: &ScanRecord) -> SqlResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO scans (timestamp_ms, severity_score, severity_level, crack_count,
                                avg_confidence, inference_time_ms, lat, lon, position_source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.timestamp.timestamp_millis(),
                record.severity_score,
                record.severity_level,
                record.crack_count,
                record.avg_confidence,
                record.inference_time_ms,
                record.lat,
                record.lon,
                record.position_source,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, severity = record.severity_score, "scan appended");
        Ok(id)
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> SqlResult<Vec<ScanRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp_ms, severity_score, severity_level, crack_count,
                    avg_confidence, inference_time_ms, lat, lon, position_source
             FROM scans ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let ms: i64 = row.get(1)?;
            Ok(ScanRecord {
                id: row.get(0)?,
                timestamp: Utc.timestamp_millis_opt(ms).single().unwrap_or_default(),
                severity_score: row.get(2)?,
                severity_level: row.get(3)?,
                crack_count: row.get(4)?,
                avg_confidence: row.get(5)?,
                inference_time_ms: row.get(6)?,
                lat: row.get(7)?,
                lon: row.get(8)?,
                position_source: row.get(9)?,
            })
        })?;
        rows.collect()
    }
}
