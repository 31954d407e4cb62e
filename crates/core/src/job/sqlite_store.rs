//! SQLite-backed job store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use super::{ArchivalJob, EventOutcome, JobEvent, JobFilter, JobStore, JobStoreError};

/// Closed states release their torrents.
const CLOSED_STATES: &str = "('done', 'degraded', 'cancelled', 'abandoned')";
const TERMINAL_STATES: &str = "('done', 'degraded', 'error', 'cancelled', 'abandoned')";

/// SQLite-backed job store.
///
/// Each job is stored as one JSON document plus a few indexed columns.
/// Torrent membership lives in `job_torrents` so open jobs can be found
/// by any of their hashes.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Database(e.to_string())
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

impl SqliteJobStore {
    /// Create a new SQLite job store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, JobStoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite job store (useful for testing).
    pub fn in_memory() -> Result<Self, JobStoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                primary_hash TEXT NOT NULL,
                state TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_torrents (
                job_id TEXT NOT NULL,
                hash TEXT NOT NULL,
                PRIMARY KEY (job_id, hash)
            );

            CREATE TABLE IF NOT EXISTS job_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                at TEXT NOT NULL,
                transition TEXT NOT NULL,
                outcome TEXT NOT NULL,
                subject TEXT,
                message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
            CREATE INDEX IF NOT EXISTS idx_job_torrents_hash ON job_torrents(hash);
            CREATE INDEX IF NOT EXISTS idx_job_events_job_id ON job_events(job_id);
            "#,
        )
        .map_err(db_err)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, JobStoreError> {
        self.conn
            .lock()
            .map_err(|_| JobStoreError::Database("connection lock poisoned".to_string()))
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref state) = filter.state {
            conditions.push("json_extract(state, '$.type') = ?".to_string());
            params.push(Box::new(state.clone()));
        }

        if filter.in_flight {
            conditions.push(format!(
                "json_extract(state, '$.type') NOT IN {}",
                TERMINAL_STATES
            ));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<ArchivalJob> {
        let body: String = row.get(0)?;
        serde_json::from_str(&body)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<JobEvent> {
        let at: String = row.get(2)?;
        let outcome: String = row.get(4)?;
        Ok(JobEvent {
            id: row.get(0)?,
            job_id: row.get(1)?,
            at: parse_timestamp(2, &at)?,
            transition: row.get(3)?,
            outcome: EventOutcome::parse(&outcome),
            subject: row.get(5)?,
            message: row.get(6)?,
        })
    }

    fn write_torrents(conn: &Connection, job: &ArchivalJob) -> rusqlite::Result<()> {
        conn.execute("DELETE FROM job_torrents WHERE job_id = ?", params![job.id])?;
        for hash in job.torrent_hashes() {
            conn.execute(
                "INSERT OR IGNORE INTO job_torrents (job_id, hash) VALUES (?, ?)",
                params![job.id, hash],
            )?;
        }
        Ok(())
    }

    fn encode(job: &ArchivalJob) -> Result<(String, String), JobStoreError> {
        let state = serde_json::to_string(&job.state).map_err(db_err)?;
        let body = serde_json::to_string(job).map_err(db_err)?;
        Ok((state, body))
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: &ArchivalJob) -> Result<(), JobStoreError> {
        let mut conn = self.lock()?;
        let (state, body) = Self::encode(job)?;

        let tx = conn.transaction().map_err(db_err)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO jobs (id, primary_hash, state, body, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    job.id,
                    job.primary.hash,
                    state,
                    body,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(JobStoreError::AlreadyExists(job.id.clone()));
        }
        Self::write_torrents(&tx, job).map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn get(&self, id: &str) -> Result<Option<ArchivalJob>, JobStoreError> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT body FROM jobs WHERE id = ?",
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_err)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<ArchivalJob>, JobStoreError> {
        let conn = self.lock()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT body FROM jobs {} ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
            where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn find_open_for_torrent(&self, hash: &str) -> Result<Option<ArchivalJob>, JobStoreError> {
        let conn = self.lock()?;

        let sql = format!(
            "SELECT j.body FROM jobs j JOIN job_torrents t ON t.job_id = j.id \
             WHERE t.hash = ? AND json_extract(j.state, '$.type') NOT IN {} \
             ORDER BY j.created_at ASC LIMIT 1",
            CLOSED_STATES
        );
        conn.query_row(&sql, params![hash], Self::row_to_job)
            .optional()
            .map_err(db_err)
    }

    fn save(&self, job: &ArchivalJob) -> Result<(), JobStoreError> {
        let mut conn = self.lock()?;
        let (state, body) = Self::encode(job)?;

        let tx = conn.transaction().map_err(db_err)?;
        let updated = tx
            .execute(
                "UPDATE jobs SET state = ?, body = ?, updated_at = ? WHERE id = ?",
                params![state, body, job.updated_at.to_rfc3339(), job.id],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(JobStoreError::NotFound(job.id.clone()));
        }
        Self::write_torrents(&tx, job).map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn append_event(&self, event: &JobEvent) -> Result<i64, JobStoreError> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO job_events (job_id, at, transition, outcome, subject, message) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                event.job_id,
                event.at.to_rfc3339(),
                event.transition,
                event.outcome.as_str(),
                event.subject,
                event.message,
            ],
        )
        .map_err(db_err)?;

        Ok(conn.last_insert_rowid())
    }

    fn events(&self, job_id: &str) -> Result<Vec<JobEvent>, JobStoreError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, job_id, at, transition, outcome, subject, message FROM job_events WHERE job_id = ? ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![job_id], Self::row_to_event)
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn delete(&self, id: &str) -> Result<ArchivalJob, JobStoreError> {
        let mut conn = self.lock()?;

        let job = conn
            .query_row(
                "SELECT body FROM jobs WHERE id = ?",
                params![id],
                Self::row_to_job,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM job_events WHERE job_id = ?", params![id])
            .map_err(db_err)?;
        tx.execute("DELETE FROM job_torrents WHERE job_id = ?", params![id])
            .map_err(db_err)?;
        tx.execute("DELETE FROM jobs WHERE id = ?", params![id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        Ok(job)
    }
}
