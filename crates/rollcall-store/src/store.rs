//! SQLite-backed attendance store.
//!
//! The `UNIQUE(session_id, student_id)` constraint is the single arbiter of
//! the at-most-one-record invariant. `mark` never does check-then-create:
//! creation is decided by `INSERT ... ON CONFLICT DO NOTHING`, so concurrent
//! callers — including callers in other processes sharing the database
//! file — observe exactly one `Created` per key.

use crate::records::{
    AttendanceRecord, AttendanceStatus, CheckInMethod, MarkOutcome, SessionInfo, StoreError,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS students (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id          INTEGER PRIMARY KEY,
    course      TEXT NOT NULL,
    date        TEXT NOT NULL,
    starts_at   TEXT NOT NULL,
    ends_at     TEXT NOT NULL,
    UNIQUE(course, date)
);

CREATE TABLE IF NOT EXISTS attendance (
    id                 TEXT PRIMARY KEY,
    session_id         INTEGER NOT NULL REFERENCES sessions(id),
    student_id         TEXT NOT NULL REFERENCES students(id),
    status             TEXT NOT NULL,
    check_in_time      TEXT NOT NULL,
    method             TEXT NOT NULL,
    confidence         REAL NOT NULL,
    liveness_verified  INTEGER NOT NULL,
    recorded_by        TEXT,
    UNIQUE(session_id, student_id)
);

CREATE INDEX IF NOT EXISTS idx_attendance_session ON attendance(session_id);
";

/// Everything `mark` needs to create a record, should it win the race.
#[derive(Debug, Clone)]
pub struct MarkRequest<'a> {
    pub session_id: i64,
    pub identity: &'a str,
    pub status: AttendanceStatus,
    pub confidence: f32,
    pub liveness_verified: bool,
    pub method: CheckInMethod,
    pub recorded_by: Option<&'a str>,
}

pub struct AttendanceStore {
    conn: Mutex<Connection>,
}

impl AttendanceStore {
    /// Open (and migrate) the attendance database at `path`.
    ///
    /// WAL mode plus a busy timeout let independent connections — other
    /// threads or other processes — contend on `mark` without spurious
    /// `SQLITE_BUSY` failures.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Insert a student if absent. Existing rows are left untouched.
    pub fn ensure_student(&self, id: &str, name: &str) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO students (id, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![id, name, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted == 1)
    }

    pub fn student_exists(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM students WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    /// Create an attendance session for a course sitting.
    pub fn create_session(
        &self,
        course: &str,
        date: &str,
        starts_at: &str,
        ends_at: &str,
    ) -> Result<SessionInfo> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (course, date, starts_at, ends_at) VALUES (?1, ?2, ?3, ?4)",
            params![course, date, starts_at, ends_at],
        )?;
        let id = conn.last_insert_rowid();
        Ok(SessionInfo {
            id,
            course: course.to_string(),
            date: date.to_string(),
            starts_at: starts_at.to_string(),
            ends_at: ends_at.to_string(),
        })
    }

    pub fn session_exists(&self, id: i64) -> Result<bool> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM sessions WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    /// Record attendance for `(session, identity)`, at most once.
    ///
    /// Exactly one concurrent caller observes `Created`; every other caller
    /// observes `AlreadyExists` carrying the record the winner created.
    /// `SessionNotFound` / `IdentityNotFound` are reported with no side
    /// effect.
    pub fn mark(&self, req: &MarkRequest<'_>) -> Result<MarkOutcome> {
        let conn = self.lock();

        let session_found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![req.session_id],
                |r| r.get(0),
            )
            .optional()?;
        if session_found.is_none() {
            return Err(StoreError::SessionNotFound(req.session_id));
        }

        let student_found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM students WHERE id = ?1",
                params![req.identity],
                |r| r.get(0),
            )
            .optional()?;
        if student_found.is_none() {
            return Err(StoreError::IdentityNotFound(req.identity.to_string()));
        }

        // The unique constraint, not the lookups above, decides the race.
        let inserted = conn.execute(
            "INSERT INTO attendance
                 (id, session_id, student_id, status, check_in_time,
                  method, confidence, liveness_verified, recorded_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(session_id, student_id) DO NOTHING",
            params![
                uuid::Uuid::new_v4().to_string(),
                req.session_id,
                req.identity,
                req.status.as_str(),
                Utc::now().to_rfc3339(),
                req.method.as_str(),
                req.confidence as f64,
                req.liveness_verified,
                req.recorded_by,
            ],
        )?;

        let record = Self::fetch_record(&conn, req.session_id, req.identity)?;

        if inserted == 1 {
            tracing::info!(
                session = req.session_id,
                identity = req.identity,
                confidence = req.confidence,
                "attendance recorded"
            );
            Ok(MarkOutcome::Created(record))
        } else {
            tracing::debug!(
                session = req.session_id,
                identity = req.identity,
                "attendance already recorded"
            );
            Ok(MarkOutcome::AlreadyExists(record))
        }
    }

    /// Fetch the attendance record for `(session, identity)`, if any.
    pub fn record_for(&self, session_id: i64, identity: &str) -> Result<Option<AttendanceRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, session_id, student_id, status, check_in_time,
                    method, confidence, liveness_verified, recorded_by
             FROM attendance WHERE session_id = ?1 AND student_id = ?2",
            params![session_id, identity],
            Self::row_to_record,
        )
        .optional()?
        .transpose()
    }

    /// All attendance records for a session, ordered by check-in time.
    pub fn records_for_session(&self, session_id: i64) -> Result<Vec<AttendanceRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, student_id, status, check_in_time,
                    method, confidence, liveness_verified, recorded_by
             FROM attendance WHERE session_id = ?1
             ORDER BY check_in_time, student_id",
        )?;
        let rows = stmt.query_map(params![session_id], Self::row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    fn fetch_record(conn: &Connection, session_id: i64, identity: &str) -> Result<AttendanceRecord> {
        conn.query_row(
            "SELECT id, session_id, student_id, status, check_in_time,
                    method, confidence, liveness_verified, recorded_by
             FROM attendance WHERE session_id = ?1 AND student_id = ?2",
            params![session_id, identity],
            Self::row_to_record,
        )?
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Result<AttendanceRecord>> {
        let status_raw: String = row.get(3)?;
        let time_raw: String = row.get(4)?;
        let method_raw: String = row.get(5)?;
        let confidence: f64 = row.get(6)?;

        Ok((|| {
            Ok(AttendanceRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                student_id: row.get(2)?,
                status: AttendanceStatus::parse(&status_raw)?,
                check_in_time: DateTime::parse_from_rfc3339(&time_raw)
                    .map_err(|e| {
                        StoreError::InvalidDbValue(format!("check_in_time {time_raw:?}: {e}"))
                    })?
                    .with_timezone(&Utc),
                method: CheckInMethod::parse(&method_raw)?,
                confidence: confidence as f32,
                liveness_verified: row.get(7)?,
                recorded_by: row.get(8)?,
            })
        })())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
