//! Job and group job persistence
//!
//! Every state change is a check-and-set `UPDATE` guarded on
//! `(status, current_stage, attempt)`; callers treat "0 rows affected" as a
//! lost race or a cancelled job and stand down.

use super::{fmt_ts, from_json, parse_column, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, to_json};
use crate::models::{GroupJob, Job, JobRef, JobState, Stage};
use chrono::{DateTime, Utc};
use critique_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

fn table(job_ref: JobRef) -> &'static str {
    match job_ref {
        JobRef::Single(_) => "jobs",
        JobRef::Group(_) => "group_jobs",
    }
}

fn result_column(job_ref: JobRef) -> &'static str {
    match job_ref {
        JobRef::Single(_) => "result_id",
        JobRef::Group(_) => "result_session_id",
    }
}

fn state_from_row(row: &SqliteRow) -> Result<JobState> {
    Ok(JobState {
        status: parse_column("status", row.get::<String, _>("status").as_str())?,
        current_stage: parse_column("current_stage", row.get::<String, _>("current_stage").as_str())?,
        progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        error: row.get("error"),
        attempt: row.get::<i64, _>("attempt").max(1) as u32,
    })
}

pub async fn insert_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, subject_id, subject_url, user_context, analysis_type,
            status, current_stage, progress, error, attempt,
            result_id, created_at, updated_at, completed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(&job.subject_id)
    .bind(&job.subject_url)
    .bind(&job.user_context)
    .bind(&job.analysis_type)
    .bind(job.state.status.as_str())
    .bind(job.state.current_stage.as_str())
    .bind(job.state.progress as i64)
    .bind(&job.state.error)
    .bind(job.state.attempt as i64)
    .bind(job.result_id.map(|id| id.to_string()))
    .bind(fmt_ts(job.created_at))
    .bind(fmt_ts(job.updated_at))
    .bind(job.completed_at.map(fmt_ts))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_group_job(pool: &SqlitePool, job: &GroupJob) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO group_jobs (
            id, group_id, subject_ids, subject_urls, group_context, prompt, session_id,
            status, current_stage, progress, error, attempt,
            result_session_id, created_at, updated_at, completed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(&job.group_id)
    .bind(to_json("subject_ids", &job.subject_ids)?)
    .bind(to_json("subject_urls", &job.subject_urls)?)
    .bind(&job.group_context)
    .bind(&job.prompt)
    .bind(job.session_id.map(|id| id.to_string()))
    .bind(job.state.status.as_str())
    .bind(job.state.current_stage.as_str())
    .bind(job.state.progress as i64)
    .bind(&job.state.error)
    .bind(job.state.attempt as i64)
    .bind(job.result_session_id.map(|id| id.to_string()))
    .bind(fmt_ts(job.created_at))
    .bind(fmt_ts(job.updated_at))
    .bind(job.completed_at.map(fmt_ts))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_job(pool: &SqlitePool, id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|row| -> Result<Job> {
        Ok(Job {
            id: parse_uuid(row.get::<String, _>("id").as_str())?,
            subject_id: row.get("subject_id"),
            subject_url: row.get("subject_url"),
            user_context: row.get("user_context"),
            analysis_type: row.get("analysis_type"),
            state: state_from_row(&row)?,
            result_id: parse_opt_uuid(row.get("result_id"))?,
            created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_ts(row.get::<String, _>("updated_at").as_str())?,
            completed_at: parse_opt_ts(row.get("completed_at"))?,
        })
    })
    .transpose()
}

pub async fn load_group_job(pool: &SqlitePool, id: Uuid) -> Result<Option<GroupJob>> {
    let row = sqlx::query("SELECT * FROM group_jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|row| -> Result<GroupJob> {
        Ok(GroupJob {
            id: parse_uuid(row.get::<String, _>("id").as_str())?,
            group_id: row.get("group_id"),
            subject_ids: from_json("subject_ids", row.get::<String, _>("subject_ids").as_str())?,
            subject_urls: from_json("subject_urls", row.get::<String, _>("subject_urls").as_str())?,
            group_context: row.get("group_context"),
            prompt: row.get("prompt"),
            session_id: parse_opt_uuid(row.get("session_id"))?,
            state: state_from_row(&row)?,
            result_session_id: parse_opt_uuid(row.get("result_session_id"))?,
            created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_ts(row.get::<String, _>("updated_at").as_str())?,
            completed_at: parse_opt_ts(row.get("completed_at"))?,
        })
    })
    .transpose()
}

/// State columns of either kind of job
pub async fn load_state(pool: &SqlitePool, job_ref: JobRef) -> Result<Option<JobState>> {
    let sql = format!(
        "SELECT status, current_stage, progress, error, attempt FROM {} WHERE id = ?",
        table(job_ref)
    );
    let row = sqlx::query(&sql)
        .bind(job_ref.id().to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(state_from_row).transpose()
}

/// Claim `stage` for `attempt`: status → processing, progress raised to `floor`
pub async fn mark_stage_entered(
    conn: &mut SqliteConnection,
    job_ref: JobRef,
    attempt: u32,
    stage: Stage,
    floor: u8,
    now: DateTime<Utc>,
) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE {}
        SET status = 'processing', progress = MAX(progress, ?), updated_at = ?
        WHERE id = ? AND attempt = ? AND current_stage = ?
          AND status IN ('pending', 'processing')
        "#,
        table(job_ref)
    );
    let result = sqlx::query(&sql)
        .bind(floor as i64)
        .bind(fmt_ts(now))
        .bind(job_ref.id().to_string())
        .bind(attempt as i64)
        .bind(stage.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Move from `from` to its successor, raising progress to `progress`
pub async fn advance_stage(
    conn: &mut SqliteConnection,
    job_ref: JobRef,
    attempt: u32,
    from: Stage,
    progress: u8,
    now: DateTime<Utc>,
) -> Result<bool> {
    let to = from
        .next()
        .ok_or_else(|| Error::InvalidInput(format!("stage {} has no successor", from)))?;
    let sql = format!(
        r#"
        UPDATE {}
        SET current_stage = ?, progress = MAX(progress, ?), updated_at = ?
        WHERE id = ? AND attempt = ? AND current_stage = ? AND status = 'processing'
        "#,
        table(job_ref)
    );
    let result = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(progress as i64)
        .bind(fmt_ts(now))
        .bind(job_ref.id().to_string())
        .bind(attempt as i64)
        .bind(from.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Synthesis → completed, recording the result (analysis id or session id)
pub async fn mark_completed(
    conn: &mut SqliteConnection,
    job_ref: JobRef,
    attempt: u32,
    result_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE {}
        SET status = 'completed', current_stage = 'completed', progress = 100,
            {} = ?, updated_at = ?, completed_at = ?
        WHERE id = ? AND attempt = ? AND current_stage = 'synthesis' AND status = 'processing'
        "#,
        table(job_ref),
        result_column(job_ref)
    );
    let result = sqlx::query(&sql)
        .bind(result_id.to_string())
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .bind(job_ref.id().to_string())
        .bind(attempt as i64)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Record a failure of `stage`; no-op when the job is terminal or has moved on
pub async fn mark_failed(
    conn: &mut SqliteConnection,
    job_ref: JobRef,
    attempt: u32,
    stage: Stage,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE {}
        SET status = 'failed', error = ?, updated_at = ?
        WHERE id = ? AND attempt = ? AND current_stage = ?
          AND status IN ('pending', 'processing')
        "#,
        table(job_ref)
    );
    let result = sqlx::query(&sql)
        .bind(message)
        .bind(fmt_ts(now))
        .bind(job_ref.id().to_string())
        .bind(attempt as i64)
        .bind(stage.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_cancelled(
    conn: &mut SqliteConnection,
    job_ref: JobRef,
    now: DateTime<Utc>,
) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE {}
        SET status = 'cancelled', updated_at = ?
        WHERE id = ? AND status IN ('pending', 'processing')
        "#,
        table(job_ref)
    );
    let result = sqlx::query(&sql)
        .bind(fmt_ts(now))
        .bind(job_ref.id().to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Start a new attempt for a failed or cancelled job
pub async fn reset_for_retry(
    conn: &mut SqliteConnection,
    job_ref: JobRef,
    now: DateTime<Utc>,
) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE {}
        SET status = 'pending', current_stage = 'context', progress = 0, error = NULL,
            attempt = attempt + 1, updated_at = ?, completed_at = NULL
        WHERE id = ? AND status IN ('failed', 'cancelled')
        "#,
        table(job_ref)
    );
    let result = sqlx::query(&sql)
        .bind(fmt_ts(now))
        .bind(job_ref.id().to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Non-terminal jobs of both kinds, oldest first
pub async fn list_unfinished(pool: &SqlitePool) -> Result<Vec<(JobRef, JobState)>> {
    let rows = sqlx::query(
        r#"
        SELECT 'single' AS kind, id, status, current_stage, progress, error, attempt, updated_at
        FROM jobs WHERE status IN ('pending', 'processing')
        UNION ALL
        SELECT 'group' AS kind, id, status, current_stage, progress, error, attempt, updated_at
        FROM group_jobs WHERE status IN ('pending', 'processing')
        ORDER BY updated_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<(JobRef, JobState)> {
            let id = parse_uuid(row.get::<String, _>("id").as_str())?;
            let job_ref = match row.get::<String, _>("kind").as_str() {
                "group" => JobRef::Group(id),
                _ => JobRef::Single(id),
            };
            Ok((job_ref, state_from_row(row)?))
        })
        .collect()
}
