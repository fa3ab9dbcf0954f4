//! Event log persistence
//!
//! Rows are append-only. `duration_ms` of a terminal event is fixed at insert
//! time from the most recent `started` event of the same subject and stage
//! that no earlier terminal event has closed.

use super::{fmt_ts, from_json, parse_column, parse_opt_ts, parse_ts, parse_uuid, to_json};
use crate::models::{Event, EventPhase, JobRef, NewEvent, Stage};
use chrono::{DateTime, Utc};
use critique_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

fn subject_column(subject: JobRef) -> &'static str {
    match subject {
        JobRef::Single(_) => "job_id",
        JobRef::Group(_) => "group_job_id",
    }
}

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    let job_id: Option<String> = row.get("job_id");
    let group_job_id: Option<String> = row.get("group_job_id");
    let subject = match (job_id, group_job_id) {
        (Some(id), None) => JobRef::Single(parse_uuid(&id)?),
        (None, Some(id)) => JobRef::Group(parse_uuid(&id)?),
        _ => {
            return Err(critique_common::Error::Internal(
                "event row must reference exactly one of job_id / group_job_id".to_string(),
            ))
        }
    };

    Ok(Event {
        id: parse_uuid(row.get::<String, _>("id").as_str())?,
        seq: row.get("seq"),
        subject,
        attempt: row.get::<i64, _>("attempt") as u32,
        event_name: row.get("event_name"),
        stage: parse_column("stage", row.get::<String, _>("stage").as_str())?,
        phase: parse_column("phase", row.get::<String, _>("phase").as_str())?,
        status: parse_column("status", row.get::<String, _>("status").as_str())?,
        progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        message: row.get("message"),
        metadata: from_json("metadata", row.get::<String, _>("metadata").as_str())?,
        started_at: parse_ts(row.get::<String, _>("started_at").as_str())?,
        ended_at: parse_opt_ts(row.get("ended_at"))?,
        duration_ms: row.get("duration_ms"),
        recorded_at: parse_ts(row.get::<String, _>("recorded_at").as_str())?,
    })
}

/// Append one event, deriving `started_at`/`duration_ms` for terminal phases
///
/// Run inside the caller's transaction so the event commits together with
/// the state change it records.
pub async fn append_event(
    conn: &mut SqliteConnection,
    event: &NewEvent,
    now: DateTime<Utc>,
) -> Result<Event> {
    let column = subject_column(event.subject);
    let subject_id = event.subject.id().to_string();

    let (started_at, ended_at, duration_ms) = if event.phase.is_terminal() {
        let sql = format!(
            r#"
            SELECT started_at FROM events
            WHERE {col} = ?1 AND stage = ?2 AND phase = 'started'
              AND seq > COALESCE(
                  (SELECT MAX(seq) FROM events
                   WHERE {col} = ?1 AND stage = ?2 AND phase IN ('completed', 'failed')),
                  0)
            ORDER BY seq DESC
            LIMIT 1
            "#,
            col = column
        );
        let open_start: Option<String> = sqlx::query_scalar(&sql)
            .bind(&subject_id)
            .bind(event.stage.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        match open_start {
            Some(start) => {
                let start = parse_ts(&start)?;
                let duration = (now - start).num_milliseconds().max(0);
                (start, Some(now), Some(duration))
            }
            None => (now, Some(now), None),
        }
    } else {
        (now, None, None)
    };

    let id = Uuid::new_v4();
    let event_name = event.event_name();
    let metadata = to_json("metadata", &event.metadata)?;
    let (job_id, group_job_id) = match event.subject {
        JobRef::Single(_) => (Some(subject_id.clone()), None),
        JobRef::Group(_) => (None, Some(subject_id.clone())),
    };

    let seq: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO events (
            id, job_id, group_job_id, attempt, event_name, stage, phase, status,
            progress, message, metadata, started_at, ended_at, duration_ms, recorded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING seq
        "#,
    )
    .bind(id.to_string())
    .bind(job_id)
    .bind(group_job_id)
    .bind(event.attempt as i64)
    .bind(&event_name)
    .bind(event.stage.as_str())
    .bind(event.phase.as_str())
    .bind(event.status.as_str())
    .bind(event.progress as i64)
    .bind(&event.message)
    .bind(&metadata)
    .bind(fmt_ts(started_at))
    .bind(ended_at.map(fmt_ts))
    .bind(duration_ms)
    .bind(fmt_ts(now))
    .fetch_one(&mut *conn)
    .await?;

    Ok(Event {
        id,
        seq,
        subject: event.subject,
        attempt: event.attempt,
        event_name,
        stage: event.stage,
        phase: event.phase,
        status: event.status,
        progress: event.progress,
        message: event.message.clone(),
        metadata: event.metadata.clone(),
        started_at,
        ended_at,
        duration_ms,
        recorded_at: now,
    })
}

/// All events of a subject in `seq` order
pub async fn list_events(pool: &SqlitePool, subject: JobRef) -> Result<Vec<Event>> {
    let sql = format!(
        "SELECT * FROM events WHERE {} = ? ORDER BY seq",
        subject_column(subject)
    );
    let rows = sqlx::query(&sql)
        .bind(subject.id().to_string())
        .fetch_all(pool)
        .await?;
    rows.iter().map(event_from_row).collect()
}

/// Events of one attempt in `seq` order
pub async fn list_attempt_events(
    pool: &SqlitePool,
    subject: JobRef,
    attempt: u32,
) -> Result<Vec<Event>> {
    let sql = format!(
        "SELECT * FROM events WHERE {} = ? AND attempt = ? ORDER BY seq",
        subject_column(subject)
    );
    let rows = sqlx::query(&sql)
        .bind(subject.id().to_string())
        .bind(attempt as i64)
        .fetch_all(pool)
        .await?;
    rows.iter().map(event_from_row).collect()
}

/// Metadata of the `completed` event of `stage` in `attempt`
pub async fn stage_output(
    pool: &SqlitePool,
    subject: JobRef,
    attempt: u32,
    stage: Stage,
) -> Result<Option<serde_json::Value>> {
    let sql = format!(
        r#"
        SELECT metadata FROM events
        WHERE {} = ? AND attempt = ? AND stage = ? AND phase = ?
        ORDER BY seq DESC
        LIMIT 1
        "#,
        subject_column(subject)
    );
    let metadata: Option<String> = sqlx::query_scalar(&sql)
        .bind(subject.id().to_string())
        .bind(attempt as i64)
        .bind(stage.as_str())
        .bind(EventPhase::Completed.as_str())
        .fetch_optional(pool)
        .await?;
    metadata.map(|m| from_json("metadata", &m)).transpose()
}

/// Delete events recorded before `cutoff`; job rows are untouched
pub async fn purge_events_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM events WHERE recorded_at < ?")
        .bind(fmt_ts(cutoff))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
