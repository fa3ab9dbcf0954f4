//! Group analysis session persistence

use super::{fmt_ts, from_json, parse_column, parse_opt_uuid, parse_ts, parse_uuid, to_json};
use crate::models::{GroupAnalysisResult, SessionStatus};
use critique_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn session_from_row(row: &SqliteRow) -> Result<GroupAnalysisResult> {
    Ok(GroupAnalysisResult {
        id: parse_uuid(row.get::<String, _>("id").as_str())?,
        session_id: parse_uuid(row.get::<String, _>("session_id").as_str())?,
        group_id: row.get("group_id"),
        group_job_id: parse_opt_uuid(row.get("group_job_id"))?,
        status: parse_column::<SessionStatus>("status", row.get::<String, _>("status").as_str())?,
        prompt: row.get("prompt"),
        group_context: row.get("group_context"),
        summary: from_json("summary", row.get::<String, _>("summary").as_str())?,
        insights: from_json("insights", row.get::<String, _>("insights").as_str())?,
        recommendations: from_json(
            "recommendations",
            row.get::<String, _>("recommendations").as_str(),
        )?,
        patterns: from_json("patterns", row.get::<String, _>("patterns").as_str())?,
        overall_quality: row.get::<i64, _>("overall_quality").clamp(0, 100) as u8,
        is_partial_result: row.get("is_partial_result"),
        parent_session_id: parse_opt_uuid(row.get("parent_session_id"))?,
        created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
        updated_at: parse_ts(row.get::<String, _>("updated_at").as_str())?,
    })
}

/// Insert a session row (pending fork or completed result)
pub async fn insert_session(pool: &SqlitePool, session: &GroupAnalysisResult) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO group_analysis_results (
            id, session_id, group_id, group_job_id, status, prompt, group_context,
            summary, insights, recommendations, patterns, overall_quality,
            is_partial_result, parent_session_id, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session.id.to_string())
    .bind(session.session_id.to_string())
    .bind(&session.group_id)
    .bind(session.group_job_id.map(|id| id.to_string()))
    .bind(session.status.as_str())
    .bind(&session.prompt)
    .bind(&session.group_context)
    .bind(to_json("summary", &session.summary)?)
    .bind(to_json("insights", &session.insights)?)
    .bind(to_json("recommendations", &session.recommendations)?)
    .bind(to_json("patterns", &session.patterns)?)
    .bind(session.overall_quality as i64)
    .bind(session.is_partial_result)
    .bind(session.parent_session_id.map(|id| id.to_string()))
    .bind(fmt_ts(session.created_at))
    .bind(fmt_ts(session.updated_at))
    .execute(pool)
    .await?;
    Ok(())
}

/// Fill a pending session with a completed aggregate
///
/// Only `pending` rows are updated, so a completed session (including a
/// fork's source) is never overwritten. Returns false when no pending row
/// matched.
pub async fn complete_session(pool: &SqlitePool, session: &GroupAnalysisResult) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE group_analysis_results
        SET status = 'completed', group_job_id = ?, summary = ?, insights = ?,
            recommendations = ?, patterns = ?, overall_quality = ?,
            is_partial_result = ?, updated_at = ?
        WHERE session_id = ? AND status = 'pending'
        "#,
    )
    .bind(session.group_job_id.map(|id| id.to_string()))
    .bind(to_json("summary", &session.summary)?)
    .bind(to_json("insights", &session.insights)?)
    .bind(to_json("recommendations", &session.recommendations)?)
    .bind(to_json("patterns", &session.patterns)?)
    .bind(session.overall_quality as i64)
    .bind(session.is_partial_result)
    .bind(fmt_ts(session.updated_at))
    .bind(session.session_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Remove a session that no group job ever filled
pub async fn delete_pending_session(pool: &SqlitePool, session_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM group_analysis_results WHERE session_id = ? AND status = 'pending'",
    )
    .bind(session_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn load_session(pool: &SqlitePool, session_id: Uuid) -> Result<Option<GroupAnalysisResult>> {
    let row = sqlx::query("SELECT * FROM group_analysis_results WHERE session_id = ?")
        .bind(session_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(session_from_row).transpose()
}

/// Session produced by a group job, if any
pub async fn load_by_group_job(
    pool: &SqlitePool,
    group_job_id: Uuid,
) -> Result<Option<GroupAnalysisResult>> {
    let row = sqlx::query(
        "SELECT * FROM group_analysis_results WHERE group_job_id = ? ORDER BY updated_at DESC LIMIT 1",
    )
    .bind(group_job_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(session_from_row).transpose()
}
