//! Versioned analysis persistence

use super::{fmt_ts, from_json, parse_column, parse_opt_uuid, parse_ts, parse_uuid, to_json};
use crate::models::{AnalysisResult, ResultStatus};
use chrono::{DateTime, Utc};
use critique_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn analysis_from_row(row: &SqliteRow) -> Result<AnalysisResult> {
    Ok(AnalysisResult {
        id: parse_uuid(row.get::<String, _>("id").as_str())?,
        subject_id: row.get("subject_id"),
        analysis_type: row.get("analysis_type"),
        analysis_hash: row.get("analysis_hash"),
        version: row.get("version"),
        status: parse_column::<ResultStatus>("status", row.get::<String, _>("status").as_str())?,
        payload: from_json("payload", row.get::<String, _>("payload").as_str())?,
        overall_quality: row.get::<i64, _>("overall_quality").clamp(0, 100) as u8,
        is_partial_result: row.get("is_partial_result"),
        job_id: parse_opt_uuid(row.get("job_id"))?,
        created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
    })
}

/// Insert a new version, numbered `MAX(version) + 1` in the same statement
///
/// With `dedup_since` set, nothing is inserted when a completed row with the
/// same hash exists at or after that instant. Returns the assigned version,
/// or `None` when the dedup guard suppressed the insert. A concurrent writer
/// claiming the same version surfaces as a unique violation.
pub async fn insert_next_version(
    pool: &SqlitePool,
    result: &AnalysisResult,
    dedup_since: Option<DateTime<Utc>>,
) -> Result<Option<i64>> {
    let payload = to_json("payload", &result.payload)?;

    let version: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO analysis_results (
            id, subject_id, analysis_type, analysis_hash, version, status,
            payload, overall_quality, is_partial_result, job_id, created_at
        )
        SELECT ?1, ?2, ?3, ?4,
               (SELECT COALESCE(MAX(version), 0) + 1 FROM analysis_results
                WHERE subject_id = ?2 AND analysis_type = ?3),
               ?5, ?6, ?7, ?8, ?9, ?10
        WHERE ?11 IS NULL OR NOT EXISTS (
            SELECT 1 FROM analysis_results
            WHERE analysis_hash = ?4 AND status = 'completed' AND created_at >= ?11
        )
        RETURNING version
        "#,
    )
    .bind(result.id.to_string())
    .bind(&result.subject_id)
    .bind(&result.analysis_type)
    .bind(&result.analysis_hash)
    .bind(result.status.as_str())
    .bind(&payload)
    .bind(result.overall_quality as i64)
    .bind(result.is_partial_result)
    .bind(result.job_id.map(|id| id.to_string()))
    .bind(fmt_ts(result.created_at))
    .bind(dedup_since.map(fmt_ts))
    .fetch_optional(pool)
    .await?;

    Ok(version)
}

/// Most recent completed row with `hash` created at or after `since`
pub async fn find_recent_by_hash(
    pool: &SqlitePool,
    hash: &str,
    since: DateTime<Utc>,
) -> Result<Option<AnalysisResult>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM analysis_results
        WHERE analysis_hash = ? AND status = 'completed' AND created_at >= ?
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(hash)
    .bind(fmt_ts(since))
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(analysis_from_row).transpose()
}

/// Latest completed row for (subject, type), optionally bounded in time
pub async fn latest_completed(
    pool: &SqlitePool,
    subject_id: &str,
    analysis_type: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Option<AnalysisResult>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM analysis_results
        WHERE subject_id = ? AND analysis_type = ? AND status = 'completed'
          AND (? IS NULL OR created_at >= ?)
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(subject_id)
    .bind(analysis_type)
    .bind(since.map(fmt_ts))
    .bind(since.map(fmt_ts))
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(analysis_from_row).transpose()
}

/// Highest version for (subject, type) regardless of status
pub async fn latest(
    pool: &SqlitePool,
    subject_id: &str,
    analysis_type: &str,
) -> Result<Option<AnalysisResult>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM analysis_results
        WHERE subject_id = ? AND analysis_type = ?
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(subject_id)
    .bind(analysis_type)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(analysis_from_row).transpose()
}

/// All versions, oldest first
pub async fn list_versions(
    pool: &SqlitePool,
    subject_id: &str,
    analysis_type: &str,
) -> Result<Vec<AnalysisResult>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM analysis_results
        WHERE subject_id = ? AND analysis_type = ?
        ORDER BY version
        "#,
    )
    .bind(subject_id)
    .bind(analysis_type)
    .fetch_all(pool)
    .await?;
    rows.iter().map(analysis_from_row).collect()
}

pub async fn load_analysis(pool: &SqlitePool, id: Uuid) -> Result<Option<AnalysisResult>> {
    let row = sqlx::query("SELECT * FROM analysis_results WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(analysis_from_row).transpose()
}
