//! SQLite persistence: enrolled face vectors and the transaction log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facelog_core::{Embedding, SinkError, Subject, Transaction, TransactionSink};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS employees (
    id   TEXT PRIMARY KEY,
    name TEXT
);
CREATE TABLE IF NOT EXISTS face_vectors (
    emp_id        TEXT PRIMARY KEY REFERENCES employees(id) ON DELETE CASCADE,
    vector        BLOB NOT NULL,
    model_version TEXT,
    updated_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS transactions (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    emp_id    TEXT,
    camera_id TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_timestamp ON transactions(timestamp);
";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// An enrolled reference vector.
#[derive(Debug, Clone)]
pub struct FaceVectorRecord {
    pub emp_id: String,
    pub embedding: Embedding,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, DbError> {
        conn.call(|c| {
            c.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Insert the employee if missing; a given name overwrites the stored one.
    pub async fn upsert_employee(&self, id: &str, name: Option<&str>) -> Result<(), DbError> {
        let id = id.to_string();
        let name = name.map(str::to_string);
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO employees (id, name) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET name = COALESCE(excluded.name, employees.name)",
                    rusqlite::params![id, name],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Insert or replace the reference vector for an employee.
    pub async fn upsert_face_vector(&self, emp_id: &str, embedding: &Embedding) -> Result<(), DbError> {
        let emp_id = emp_id.to_string();
        let blob = embedding.to_le_bytes();
        let model_version = embedding.model_version.clone();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO face_vectors (emp_id, vector, model_version, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(emp_id) DO UPDATE SET
                        vector = excluded.vector,
                        model_version = excluded.model_version,
                        updated_at = excluded.updated_at",
                    rusqlite::params![emp_id, blob, model_version, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn face_vector(&self, emp_id: &str) -> Result<Option<FaceVectorRecord>, DbError> {
        let emp_id = emp_id.to_string();
        let record = self
            .conn
            .call(move |c| {
                let record = c
                    .query_row(
                        "SELECT emp_id, vector, model_version, updated_at
                         FROM face_vectors WHERE emp_id = ?1",
                        rusqlite::params![emp_id],
                        face_vector_row,
                    )
                    .optional()?;
                Ok(record)
            })
            .await?;
        Ok(record)
    }

    /// Every enrolled vector, ordered by employee id.
    pub async fn face_vectors(&self) -> Result<Vec<FaceVectorRecord>, DbError> {
        let records = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT emp_id, vector, model_version, updated_at
                     FROM face_vectors ORDER BY emp_id",
                )?;
                let rows = stmt
                    .query_map([], face_vector_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(records)
    }

    pub async fn insert_transaction(&self, transaction: &Transaction) -> Result<(), DbError> {
        let emp_id = transaction.subject.identity_id().map(str::to_string);
        let camera_id = transaction.camera_id.clone();
        let timestamp = transaction.timestamp.to_rfc3339();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO transactions (emp_id, camera_id, timestamp) VALUES (?1, ?2, ?3)",
                    rusqlite::params![emp_id, camera_id, timestamp],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most recent transactions first.
    pub async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, DbError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT emp_id, camera_id, timestamp FROM transactions
                     ORDER BY timestamp DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], |row| {
                        let emp_id: Option<String> = row.get(0)?;
                        Ok(Transaction {
                            subject: emp_id.map_or(Subject::Unknown, Subject::Employee),
                            camera_id: row.get(1)?,
                            timestamp: parse_timestamp(row.get(2)?, 2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}

fn face_vector_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FaceVectorRecord> {
    let blob: Vec<u8> = row.get(1)?;
    let mut embedding = Embedding::from_le_bytes(&blob)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Blob, Box::new(e)))?;
    embedding.model_version = row.get(2)?;
    Ok(FaceVectorRecord {
        emp_id: row.get(0)?,
        embedding,
        updated_at: parse_timestamp(row.get(3)?, 3)?,
    })
}

fn parse_timestamp(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

#[async_trait]
impl TransactionSink for SqliteStore {
    async fn record(&self, transaction: &Transaction) -> Result<(), SinkError> {
        self.insert_transaction(transaction)
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}
