//! Database Test Utilities

use anyhow::Result;
use chrono::{DateTime, Utc};
use critique_ai::db;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Create temporary test database with all tables
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test_critique.db");
    let pool = db::init_database_pool(&db_path).await?;
    Ok((temp_dir, pool))
}

/// Backdate every event of one job or group job
pub async fn backdate_events(pool: &SqlitePool, subject_id: uuid::Uuid, to: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE events SET recorded_at = ?, started_at = ? WHERE job_id = ? OR group_job_id = ?",
    )
    .bind(db::fmt_ts(to))
    .bind(db::fmt_ts(to))
    .bind(subject_id.to_string())
    .bind(subject_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await?;
    Ok(count)
}
