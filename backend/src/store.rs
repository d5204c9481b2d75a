//! Local session cache.
//!
//! Mirrors confirmed ledger submissions together with the fields the
//! contract does not keep (duration, notes). One row per transaction hash.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;

use crate::validation::{AttendanceStatus, TherapyKind};

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER,
        transaction_hash TEXT NOT NULL UNIQUE,
        therapist_address TEXT NOT NULL,
        beneficiary_name TEXT NOT NULL,
        beneficiary_pin TEXT NOT NULL,
        therapy_type TEXT NOT NULL,
        status TEXT NOT NULL,
        duration_minutes INTEGER,
        notes TEXT,
        yyyymm INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
    );

    CREATE INDEX IF NOT EXISTS idx_beneficiary ON sessions(beneficiary_name, beneficiary_pin);
    CREATE INDEX IF NOT EXISTS idx_yyyymm ON sessions(yyyymm);
    CREATE INDEX IF NOT EXISTS idx_transaction_hash ON sessions(transaction_hash);
    CREATE INDEX IF NOT EXISTS idx_therapy_type ON sessions(therapy_type);
    CREATE INDEX IF NOT EXISTS idx_created_at ON sessions(created_at);
";

const ROW_COLUMNS: &str = "id, session_id, transaction_hash, therapist_address, beneficiary_name, \
     beneficiary_pin, therapy_type, status, duration_minutes, notes, yyyymm, created_at";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("a session with transaction hash {0} is already cached")]
    DuplicateTransaction(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache task failed: {0}")]
    Task(String),

    #[error("cache connection lock poisoned")]
    Poisoned,
}

/// A confirmed submission, ready to be mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionRow {
    pub session_id: Option<u32>,
    pub transaction_hash: String,
    pub therapist_address: String,
    pub beneficiary_name: String,
    pub beneficiary_pin: String,
    pub therapy_type: TherapyKind,
    pub status: AttendanceStatus,
    pub duration_minutes: Option<u32>,
    pub notes: Option<String>,
    pub yyyymm: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRow {
    pub id: i64,
    pub session_id: Option<u32>,
    pub transaction_hash: String,
    pub therapist_address: String,
    pub beneficiary_name: String,
    pub beneficiary_pin: String,
    pub therapy_type: String,
    pub status: String,
    pub duration_minutes: Option<u32>,
    pub notes: Option<String>,
    pub yyyymm: u32,
    pub created_at: String,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            transaction_hash: row.get(2)?,
            therapist_address: row.get(3)?,
            beneficiary_name: row.get(4)?,
            beneficiary_pin: row.get(5)?,
            therapy_type: row.get(6)?,
            status: row.get(7)?,
            duration_minutes: row.get(8)?,
            notes: row.get(9)?,
            yyyymm: row.get(10)?,
            created_at: row.get(11)?,
        })
    }
}

/// Center-wide counts for one month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyStats {
    pub completadas: u32,
    pub no_asistio: u32,
    pub canceladas: u32,
    pub by_type: BTreeMap<TherapyKind, u32>,
}

impl MonthlyStats {
    pub fn zero() -> Self {
        Self {
            completadas: 0,
            no_asistio: 0,
            canceladas: 0,
            by_type: TherapyKind::ALL.into_iter().map(|kind| (kind, 0)).collect(),
        }
    }

    pub fn total(&self) -> u32 {
        self.completadas + self.no_asistio + self.canceladas
    }
}

/// SQLite-backed cache. Cloning shares the connection.
#[derive(Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl CacheStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(conn)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self::from_connection(conn))
    }

    /// Drop the sessions table so every later query fails.
    #[cfg(test)]
    pub(crate) async fn break_schema(&self) {
        self.run_blocking(|conn| Ok(conn.execute_batch("DROP TABLE sessions")?))
            .await
            .unwrap();
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| CacheError::Poisoned)?;
            f(&conn)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
    }

    /// Insert a row and return its surrogate id. A second row with the same
    /// transaction hash is rejected.
    pub async fn insert(&self, session: NewSessionRow) -> Result<i64, CacheError> {
        self.run_blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO sessions (
                    session_id, transaction_hash, therapist_address, beneficiary_name,
                    beneficiary_pin, therapy_type, status, duration_minutes, notes, yyyymm
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session.session_id,
                    session.transaction_hash,
                    session.therapist_address,
                    session.beneficiary_name,
                    session.beneficiary_pin,
                    session.therapy_type.as_str(),
                    session.status.as_str(),
                    session.duration_minutes,
                    session.notes,
                    session.yyyymm,
                ],
            );
            match inserted {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(CacheError::DuplicateTransaction(session.transaction_hash))
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    pub async fn find_by_hash(&self, hash: &str) -> Result<Option<SessionRow>, CacheError> {
        let hash = hash.to_string();
        self.run_blocking(move |conn| {
            let sql = format!("SELECT {ROW_COLUMNS} FROM sessions WHERE transaction_hash = ?1");
            Ok(conn
                .query_row(&sql, params![hash], SessionRow::from_row)
                .optional()?)
        })
        .await
    }

    /// Rows for one beneficiary and month, oldest first.
    pub async fn list_for_beneficiary(
        &self,
        name: &str,
        pin: &str,
        yyyymm: u32,
    ) -> Result<Vec<SessionRow>, CacheError> {
        let (name, pin) = (name.to_string(), pin.to_string());
        self.run_blocking(move |conn| {
            let sql = format!(
                "SELECT {ROW_COLUMNS} FROM sessions
                 WHERE beneficiary_name = ?1 AND beneficiary_pin = ?2 AND yyyymm = ?3
                 ORDER BY created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![name, pin, yyyymm], SessionRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn monthly_stats(&self, yyyymm: u32) -> Result<MonthlyStats, CacheError> {
        self.run_blocking(move |conn| {
            let mut stats = MonthlyStats::zero();

            let mut by_status =
                conn.prepare("SELECT status, COUNT(*) FROM sessions WHERE yyyymm = ?1 GROUP BY status")?;
            let rows = by_status.query_map(params![yyyymm], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match AttendanceStatus::parse(&status) {
                    Some(AttendanceStatus::Completada) => stats.completadas += count,
                    Some(AttendanceStatus::NoAsistio) => stats.no_asistio += count,
                    Some(AttendanceStatus::Cancelada) => stats.canceladas += count,
                    None => {}
                }
            }

            let mut by_type = conn.prepare(
                "SELECT therapy_type, COUNT(*) FROM sessions WHERE yyyymm = ?1 GROUP BY therapy_type",
            )?;
            let rows = by_type.query_map(params![yyyymm], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (kind, count) = row?;
                if let Some(kind) = TherapyKind::parse(&kind) {
                    *stats.by_type.entry(kind).or_insert(0) += count;
                }
            }

            Ok(stats)
        })
        .await
    }
}
