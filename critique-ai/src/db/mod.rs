//! Database access for critique-ai
//!
//! One SQLite file in the root folder holds jobs, the event log, versioned
//! analyses, group sessions and settings.

pub mod analyses;
pub mod events;
pub mod group_results;
pub mod jobs;
pub mod settings;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

/// Database file name inside the root folder
pub const DB_FILE_NAME: &str = "critique.db";

const BUSY_TIMEOUT_MS: u64 = 5000;

/// Open (creating if needed) the service database and its tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    tracing::debug!("Connecting to database: {}", db_path.display());

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("Failed to open database pool")?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create all tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            subject_url TEXT NOT NULL,
            user_context TEXT,
            analysis_type TEXT NOT NULL,
            status TEXT NOT NULL,
            current_stage TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
            error TEXT,
            attempt INTEGER NOT NULL DEFAULT 1,
            result_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
        r#"
        CREATE TABLE IF NOT EXISTS group_jobs (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            subject_ids TEXT NOT NULL,
            subject_urls TEXT NOT NULL,
            group_context TEXT,
            prompt TEXT,
            session_id TEXT,
            status TEXT NOT NULL,
            current_stage TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
            error TEXT,
            attempt INTEGER NOT NULL DEFAULT 1,
            result_session_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_group_jobs_status ON group_jobs(status)",
        r#"
        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            job_id TEXT,
            group_job_id TEXT,
            attempt INTEGER NOT NULL,
            event_name TEXT NOT NULL,
            stage TEXT NOT NULL,
            phase TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT 'null',
            started_at TEXT NOT NULL,
            ended_at TEXT,
            duration_ms INTEGER,
            recorded_at TEXT NOT NULL,
            CHECK ((job_id IS NULL) <> (group_job_id IS NULL))
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_events_job ON events(job_id, seq)",
        "CREATE INDEX IF NOT EXISTS idx_events_group_job ON events(group_job_id, seq)",
        "CREATE INDEX IF NOT EXISTS idx_events_recorded_at ON events(recorded_at)",
        r#"
        CREATE TABLE IF NOT EXISTS analysis_results (
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            analysis_type TEXT NOT NULL,
            analysis_hash TEXT NOT NULL,
            version INTEGER NOT NULL CHECK (version >= 1),
            status TEXT NOT NULL,
            payload TEXT NOT NULL,
            overall_quality INTEGER NOT NULL,
            is_partial_result INTEGER NOT NULL DEFAULT 0,
            job_id TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (subject_id, analysis_type, version)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_analysis_hash ON analysis_results(analysis_hash, created_at)",
        r#"
        CREATE TABLE IF NOT EXISTS group_analysis_results (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL UNIQUE,
            group_id TEXT NOT NULL,
            group_job_id TEXT,
            status TEXT NOT NULL,
            prompt TEXT,
            group_context TEXT,
            summary TEXT NOT NULL,
            insights TEXT NOT NULL DEFAULT '[]',
            recommendations TEXT NOT NULL DEFAULT '[]',
            patterns TEXT NOT NULL,
            overall_quality INTEGER NOT NULL DEFAULT 0,
            is_partial_result INTEGER NOT NULL DEFAULT 0,
            parent_session_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!("Database tables initialized");

    Ok(())
}

/// Timestamp column format: RFC3339, microseconds, `Z` suffix (sorts lexically)
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(value: &str) -> critique_common::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            critique_common::Error::Internal(format!("Invalid timestamp '{}': {}", value, e))
        })
}

pub fn parse_opt_ts(value: Option<String>) -> critique_common::Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_uuid(value: &str) -> critique_common::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value)
        .map_err(|e| critique_common::Error::Internal(format!("Invalid UUID '{}': {}", value, e)))
}

pub(crate) fn parse_opt_uuid(value: Option<String>) -> critique_common::Result<Option<uuid::Uuid>> {
    value.as_deref().map(parse_uuid).transpose()
}

/// Parse a stored enum column
pub(crate) fn parse_column<T>(column: &str, value: &str) -> critique_common::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse::<T>()
        .map_err(|e| critique_common::Error::Internal(format!("Column {}: {}", column, e)))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: &str,
) -> critique_common::Result<T> {
    serde_json::from_str(value).map_err(|e| {
        critique_common::Error::Internal(format!("Failed to deserialize {}: {}", column, e))
    })
}

pub(crate) fn to_json<T: serde::Serialize>(column: &str, value: &T) -> critique_common::Result<String> {
    serde_json::to_string(value).map_err(|e| {
        critique_common::Error::Internal(format!("Failed to serialize {}: {}", column, e))
    })
}
