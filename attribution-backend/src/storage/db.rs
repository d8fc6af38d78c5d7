//! SQLite schema and queries behind the resolver.
//!
//! Times are stored as UTC milliseconds. Structured registration and report
//! payloads live in JSON columns; everything the queries filter on has its
//! own column.

use crate::error::StorageError;
use attribution_types::*;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use uuid::Uuid;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` inside a transaction, committing only when it succeeds.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sources (
            source_id INTEGER PRIMARY KEY AUTOINCREMENT,
            reporting_origin TEXT NOT NULL,
            source_origin TEXT NOT NULL,
            source_type TEXT NOT NULL,
            registration_json TEXT NOT NULL,
            source_time INTEGER NOT NULL,
            expiry_time INTEGER NOT NULL,
            event_report_window_time INTEGER NOT NULL,
            aggregatable_report_window_time INTEGER NOT NULL,
            debug_cookie_set INTEGER NOT NULL DEFAULT 0,
            num_event_reports INTEGER NOT NULL DEFAULT 0,
            remaining_aggregatable_budget INTEGER NOT NULL,
            remaining_aggregatable_debug_budget INTEGER NOT NULL DEFAULT 0,
            dedup_keys_json TEXT NOT NULL DEFAULT '[]',
            aggregatable_dedup_keys_json TEXT NOT NULL DEFAULT '[]',
            priority INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sources_origin ON sources(source_origin, expiry_time)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS source_destinations (
            source_id INTEGER NOT NULL,
            destination TEXT NOT NULL,
            PRIMARY KEY (source_id, destination),
            FOREIGN KEY (source_id) REFERENCES sources(source_id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_destinations ON source_destinations(destination)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reports (
            report_id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_report_id TEXT NOT NULL,
            report_type TEXT NOT NULL,
            reporting_origin TEXT NOT NULL,
            source_id INTEGER,
            trigger_time INTEGER NOT NULL,
            report_time INTEGER NOT NULL,
            initial_report_time INTEGER NOT NULL,
            failed_send_attempts INTEGER NOT NULL DEFAULT 0,
            attribution_info_json TEXT NOT NULL,
            data_json TEXT NOT NULL,
            FOREIGN KEY (source_id) REFERENCES sources(source_id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reports_time ON reports(report_time)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rate_limits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scope TEXT NOT NULL,
            source_origin TEXT NOT NULL,
            destination TEXT NOT NULL,
            reporting_origin TEXT NOT NULL,
            time INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rate_limits ON rate_limits(scope, source_origin, destination, time)",
        [],
    )?;
    Ok(())
}

// =====================================================
// Conversions
// =====================================================

pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn parse_origin(raw: &str) -> Result<SuitableOrigin, StorageError> {
    SuitableOrigin::parse(raw).ok_or_else(|| StorageError::Corrupt(format!("origin {}", raw)))
}

fn source_type_from_str(raw: &str) -> Result<SourceType, StorageError> {
    match raw {
        "navigation" => Ok(SourceType::Navigation),
        "event" => Ok(SourceType::Event),
        other => Err(StorageError::Corrupt(format!("source type {}", other))),
    }
}

// =====================================================
// Sources
// =====================================================

const SOURCE_COLUMNS: &str = "source_id, reporting_origin, source_origin, source_type,
    registration_json, source_time, expiry_time, event_report_window_time,
    aggregatable_report_window_time, debug_cookie_set, num_event_reports,
    remaining_aggregatable_budget, remaining_aggregatable_debug_budget,
    dedup_keys_json, aggregatable_dedup_keys_json";

struct SourceRow {
    source_id: i64,
    reporting_origin: String,
    source_origin: String,
    source_type: String,
    registration_json: String,
    source_time: i64,
    expiry_time: i64,
    event_report_window_time: i64,
    aggregatable_report_window_time: i64,
    debug_cookie_set: bool,
    num_event_reports: u32,
    remaining_aggregatable_budget: i64,
    remaining_aggregatable_debug_budget: i64,
    dedup_keys_json: String,
    aggregatable_dedup_keys_json: String,
}

impl SourceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            source_id: row.get(0)?,
            reporting_origin: row.get(1)?,
            source_origin: row.get(2)?,
            source_type: row.get(3)?,
            registration_json: row.get(4)?,
            source_time: row.get(5)?,
            expiry_time: row.get(6)?,
            event_report_window_time: row.get(7)?,
            aggregatable_report_window_time: row.get(8)?,
            debug_cookie_set: row.get(9)?,
            num_event_reports: row.get(10)?,
            remaining_aggregatable_budget: row.get(11)?,
            remaining_aggregatable_debug_budget: row.get(12)?,
            dedup_keys_json: row.get(13)?,
            aggregatable_dedup_keys_json: row.get(14)?,
        })
    }

    fn into_source(self) -> Result<StoredSource, StorageError> {
        Ok(StoredSource {
            source_id: StoredSourceId(self.source_id),
            reporting_origin: parse_origin(&self.reporting_origin)?,
            source_origin: parse_origin(&self.source_origin)?,
            source_type: source_type_from_str(&self.source_type)?,
            registration: serde_json::from_str(&self.registration_json)?,
            source_time: from_millis(self.source_time)?,
            expiry_time: from_millis(self.expiry_time)?,
            event_report_window_time: from_millis(self.event_report_window_time)?,
            aggregatable_report_window_time: from_millis(self.aggregatable_report_window_time)?,
            debug_cookie_set: self.debug_cookie_set,
            num_event_reports: self.num_event_reports,
            remaining_aggregatable_budget: self.remaining_aggregatable_budget,
            remaining_aggregatable_debug_budget: self.remaining_aggregatable_debug_budget,
            dedup_keys: serde_json::from_str(&self.dedup_keys_json)?,
            aggregatable_dedup_keys: serde_json::from_str(&self.aggregatable_dedup_keys_json)?,
        })
    }
}

/// Inserts `source` (its `source_id` is ignored) and returns the new id.
pub fn insert_source(conn: &Connection, source: &StoredSource) -> Result<StoredSourceId, StorageError> {
    conn.execute(
        "INSERT INTO sources (reporting_origin, source_origin, source_type, registration_json,
            source_time, expiry_time, event_report_window_time, aggregatable_report_window_time,
            debug_cookie_set, num_event_reports, remaining_aggregatable_budget,
            remaining_aggregatable_debug_budget, dedup_keys_json, aggregatable_dedup_keys_json,
            priority)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            source.reporting_origin.as_str(),
            source.source_origin.as_str(),
            source.source_type.as_str(),
            serde_json::to_string(&source.registration)?,
            to_millis(source.source_time),
            to_millis(source.expiry_time),
            to_millis(source.event_report_window_time),
            to_millis(source.aggregatable_report_window_time),
            source.debug_cookie_set,
            source.num_event_reports,
            source.remaining_aggregatable_budget,
            source.remaining_aggregatable_debug_budget,
            serde_json::to_string(&source.dedup_keys)?,
            serde_json::to_string(&source.aggregatable_dedup_keys)?,
            source.registration.priority,
        ],
    )?;
    let id = conn.last_insert_rowid();
    for destination in &source.registration.destinations {
        conn.execute(
            "INSERT OR IGNORE INTO source_destinations (source_id, destination) VALUES (?1, ?2)",
            params![id, destination.as_str()],
        )?;
    }
    Ok(StoredSourceId(id))
}

/// Writes back the attribution state of a source.
pub fn update_source_attribution_state(
    conn: &Connection,
    source: &StoredSource,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE sources SET num_event_reports = ?1, remaining_aggregatable_budget = ?2,
            dedup_keys_json = ?3, aggregatable_dedup_keys_json = ?4
         WHERE source_id = ?5",
        params![
            source.num_event_reports,
            source.remaining_aggregatable_budget,
            serde_json::to_string(&source.dedup_keys)?,
            serde_json::to_string(&source.aggregatable_dedup_keys)?,
            source.source_id.0,
        ],
    )?;
    Ok(())
}

pub fn count_active_sources(
    conn: &Connection,
    source_origin: &SuitableOrigin,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sources WHERE source_origin = ?1 AND active = 1 AND expiry_time > ?2",
        params![source_origin.as_str(), to_millis(now)],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Distinct destinations of active sources for a (source, reporting) origin pair.
pub fn active_destinations(
    conn: &Connection,
    source_origin: &SuitableOrigin,
    reporting_origin: &SuitableOrigin,
    now: DateTime<Utc>,
) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT d.destination FROM source_destinations d
         JOIN sources s ON s.source_id = d.source_id
         WHERE s.source_origin = ?1 AND s.reporting_origin = ?2
           AND s.active = 1 AND s.expiry_time > ?3",
    )?;
    let rows = stmt
        .query_map(
            params![source_origin.as_str(), reporting_origin.as_str(), to_millis(now)],
            |row| row.get(0),
        )?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// Active sources registered by `reporting_origin` for `destination`, best first.
pub fn matching_sources(
    conn: &Connection,
    destination: &SuitableOrigin,
    reporting_origin: &SuitableOrigin,
    now: DateTime<Utc>,
) -> Result<Vec<StoredSource>, StorageError> {
    let sql = format!(
        "SELECT {} FROM sources s
         JOIN source_destinations d ON d.source_id = s.source_id
         WHERE d.destination = ?1 AND s.reporting_origin = ?2
           AND s.active = 1 AND s.expiry_time > ?3
         ORDER BY s.priority DESC, s.source_time DESC, s.source_id DESC",
        SOURCE_COLUMNS
            .split(',')
            .map(|c| format!("s.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![destination.as_str(), reporting_origin.as_str(), to_millis(now)],
            SourceRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(SourceRow::into_source).collect()
}

pub fn active_sources(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: Option<usize>,
) -> Result<Vec<StoredSource>, StorageError> {
    let sql = format!(
        "SELECT {} FROM sources WHERE active = 1 AND expiry_time > ?1
         ORDER BY source_time DESC, source_id DESC LIMIT ?2",
        SOURCE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![to_millis(now), sql_limit(limit)], SourceRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(SourceRow::into_source).collect()
}

pub fn source_debug_budget(
    conn: &Connection,
    source_id: StoredSourceId,
) -> Result<Option<i64>, StorageError> {
    let budget = conn
        .query_row(
            "SELECT remaining_aggregatable_debug_budget FROM sources WHERE source_id = ?1",
            params![source_id.0],
            |row| row.get(0),
        )
        .optional()?;
    Ok(budget)
}

pub fn set_source_debug_budget(
    conn: &Connection,
    source_id: StoredSourceId,
    budget: i64,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE sources SET remaining_aggregatable_debug_budget = ?1 WHERE source_id = ?2",
        params![budget, source_id.0],
    )?;
    Ok(())
}

/// (id, reporting origin, source origin, source time) of every source.
pub fn source_index(
    conn: &Connection,
) -> Result<Vec<(i64, String, String, i64)>, StorageError> {
    let mut stmt =
        conn.prepare("SELECT source_id, reporting_origin, source_origin, source_time FROM sources")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_source(conn: &Connection, id: i64) -> Result<(), StorageError> {
    conn.execute("DELETE FROM sources WHERE source_id = ?1", params![id])?;
    Ok(())
}

// =====================================================
// Rate Limits
// =====================================================

pub const SCOPE_SOURCE: &str = "source";
pub const SCOPE_ATTRIBUTION: &str = "attribution";

pub fn insert_rate_limit(
    conn: &Connection,
    scope: &str,
    source_origin: &SuitableOrigin,
    destination: &SuitableOrigin,
    reporting_origin: &SuitableOrigin,
    time: DateTime<Utc>,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO rate_limits (scope, source_origin, destination, reporting_origin, time)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            scope,
            source_origin.as_str(),
            destination.as_str(),
            reporting_origin.as_str(),
            to_millis(time)
        ],
    )?;
    Ok(())
}

/// Distinct reporting origins other than `excluding` recorded for the pair
/// since `since`.
pub fn count_other_reporting_origins(
    conn: &Connection,
    scope: &str,
    source_origin: &SuitableOrigin,
    destination: &SuitableOrigin,
    excluding: &SuitableOrigin,
    since: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let count = conn.query_row(
        "SELECT COUNT(DISTINCT reporting_origin) FROM rate_limits
         WHERE scope = ?1 AND source_origin = ?2 AND destination = ?3
           AND reporting_origin != ?4 AND time >= ?5",
        params![
            scope,
            source_origin.as_str(),
            destination.as_str(),
            excluding.as_str(),
            to_millis(since)
        ],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// (id, reporting origin, source origin, destination, time) of every rate-limit row.
pub fn rate_limit_index(
    conn: &Connection,
) -> Result<Vec<(i64, String, String, String, i64)>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT id, reporting_origin, source_origin, destination, time FROM rate_limits",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_rate_limit(conn: &Connection, id: i64) -> Result<(), StorageError> {
    conn.execute("DELETE FROM rate_limits WHERE id = ?1", params![id])?;
    Ok(())
}

// =====================================================
// Reports
// =====================================================

const REPORT_COLUMNS: &str = "report_id, external_report_id, reporting_origin, report_time,
    initial_report_time, failed_send_attempts, attribution_info_json, data_json";

struct ReportRow {
    report_id: i64,
    external_report_id: String,
    reporting_origin: String,
    report_time: i64,
    initial_report_time: i64,
    failed_send_attempts: u32,
    attribution_info_json: String,
    data_json: String,
}

impl ReportRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            report_id: row.get(0)?,
            external_report_id: row.get(1)?,
            reporting_origin: row.get(2)?,
            report_time: row.get(3)?,
            initial_report_time: row.get(4)?,
            failed_send_attempts: row.get(5)?,
            attribution_info_json: row.get(6)?,
            data_json: row.get(7)?,
        })
    }

    fn into_report(self) -> Result<AttributionReport, StorageError> {
        Ok(AttributionReport {
            id: ReportId(self.report_id),
            external_report_id: Uuid::parse_str(&self.external_report_id)
                .map_err(|e| StorageError::Corrupt(format!("report id: {}", e)))?,
            reporting_origin: parse_origin(&self.reporting_origin)?,
            report_time: from_millis(self.report_time)?,
            initial_report_time: from_millis(self.initial_report_time)?,
            failed_send_attempts: self.failed_send_attempts,
            attribution_info: serde_json::from_str(&self.attribution_info_json)?,
            data: serde_json::from_str(&self.data_json)?,
        })
    }
}

fn report_source_id(report: &AttributionReport) -> Option<i64> {
    match &report.data {
        ReportData::EventLevel(data) => Some(data.source.source_id.0),
        ReportData::AggregatableAttribution(data) => Some(data.source.source_id.0),
        ReportData::NullAggregatable(_) => None,
    }
}

/// Inserts `report` (its `id` is ignored) and returns the new id.
pub fn insert_report(conn: &Connection, report: &AttributionReport) -> Result<ReportId, StorageError> {
    conn.execute(
        "INSERT INTO reports (external_report_id, report_type, reporting_origin, source_id,
            trigger_time, report_time, initial_report_time, failed_send_attempts,
            attribution_info_json, data_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            report.external_report_id.to_string(),
            report.report_type().as_str(),
            report.reporting_origin.as_str(),
            report_source_id(report),
            to_millis(report.attribution_info.time),
            to_millis(report.report_time),
            to_millis(report.initial_report_time),
            report.failed_send_attempts,
            serde_json::to_string(&report.attribution_info)?,
            serde_json::to_string(&report.data)?,
        ],
    )?;
    Ok(ReportId(conn.last_insert_rowid()))
}

fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

pub fn reports_due(
    conn: &Connection,
    max_report_time: DateTime<Utc>,
    limit: Option<usize>,
) -> Result<Vec<AttributionReport>, StorageError> {
    let sql = format!(
        "SELECT {} FROM reports WHERE report_time <= ?1 ORDER BY report_time, report_id LIMIT ?2",
        REPORT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![to_millis(max_report_time), sql_limit(limit)],
            ReportRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ReportRow::into_report).collect()
}

pub fn report_by_id(conn: &Connection, id: ReportId) -> Result<Option<AttributionReport>, StorageError> {
    let sql = format!("SELECT {} FROM reports WHERE report_id = ?1", REPORT_COLUMNS);
    let row = conn
        .query_row(&sql, params![id.0], ReportRow::from_row)
        .optional()?;
    row.map(ReportRow::into_report).transpose()
}

pub fn update_report_for_send_failure(
    conn: &Connection,
    id: ReportId,
    new_report_time: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let changed = conn.execute(
        "UPDATE reports SET report_time = ?1, failed_send_attempts = failed_send_attempts + 1
         WHERE report_id = ?2",
        params![to_millis(new_report_time), id.0],
    )?;
    Ok(changed == 1)
}

pub fn set_report_time(
    conn: &Connection,
    id: ReportId,
    report_time: DateTime<Utc>,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE reports SET report_time = ?1 WHERE report_id = ?2",
        params![to_millis(report_time), id.0],
    )?;
    Ok(())
}

pub fn delete_report(conn: &Connection, id: ReportId) -> Result<bool, StorageError> {
    let changed = conn.execute("DELETE FROM reports WHERE report_id = ?1", params![id.0])?;
    Ok(changed == 1)
}

pub fn next_report_time(
    conn: &Connection,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    let ms: Option<i64> = conn.query_row(
        "SELECT MIN(report_time) FROM reports WHERE report_time > ?1",
        params![to_millis(after)],
        |row| row.get(0),
    )?;
    ms.map(from_millis).transpose()
}

pub fn min_report_time(conn: &Connection) -> Result<Option<DateTime<Utc>>, StorageError> {
    let ms: Option<i64> = conn.query_row("SELECT MIN(report_time) FROM reports", [], |row| {
        row.get(0)
    })?;
    ms.map(from_millis).transpose()
}

pub fn overdue_report_ids(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<ReportId>, StorageError> {
    let mut stmt = conn.prepare("SELECT report_id FROM reports WHERE report_time < ?1")?;
    let rows = stmt
        .query_map(params![to_millis(now)], |row| row.get(0).map(ReportId))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// (id, reporting origin, trigger time, attribution info json) of every report.
pub fn report_index(conn: &Connection) -> Result<Vec<(i64, String, i64, String)>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT report_id, reporting_origin, trigger_time, attribution_info_json FROM reports",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// =====================================================
// Data Keys
// =====================================================

pub fn reporting_origins(conn: &Connection) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT reporting_origin FROM sources
         UNION SELECT reporting_origin FROM reports
         UNION SELECT reporting_origin FROM rate_limits
         ORDER BY 1",
    )?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

pub fn delete_by_reporting_origin(conn: &Connection, origin: &SuitableOrigin) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM reports WHERE reporting_origin = ?1",
        params![origin.as_str()],
    )?;
    conn.execute(
        "DELETE FROM sources WHERE reporting_origin = ?1",
        params![origin.as_str()],
    )?;
    conn.execute(
        "DELETE FROM rate_limits WHERE reporting_origin = ?1",
        params![origin.as_str()],
    )?;
    Ok(())
}
