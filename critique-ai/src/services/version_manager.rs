//! Version Manager
//!
//! Content-hash dedup and monotonic per-(subject, analysis type) versioning.
//!
//! The dedup check and the version number are evaluated inside the insert
//! statement itself, so two concurrent identical stores cannot both create a
//! row. A unique-constraint violation (another writer claimed the version
//! first) is recovered by returning the latest row instead.

use crate::db;
use crate::models::{AnalysisResult, ExistingInfo, ResultStatus, StoreOutcome, StoreRequest};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use chrono::{DateTime, Duration, Utc};
use critique_common::{Error, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

/// Dedup key for an analysis request
///
/// User context is normalized (trimmed, lowercased, whitespace collapsed) so
/// cosmetic differences do not defeat dedup.
pub fn analysis_hash(subject_id: &str, analysis_type: &str, user_context: Option<&str>) -> String {
    let context = user_context
        .map(|c| c.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(subject_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(analysis_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(context.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Start of the `hours`-long window ending at `now`
///
/// Windows reaching past the Unix epoch start at the epoch; no result is
/// older than that.
fn window_start(now: DateTime<Utc>, hours: u32) -> DateTime<Utc> {
    now.checked_sub_signed(Duration::hours(i64::from(hours)))
        .filter(|since| since.timestamp() >= 0)
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct VersionManager {
    db: SqlitePool,
    dedup_window_hours: u32,
}

impl VersionManager {
    pub fn new(db: SqlitePool, dedup_window_hours: u32) -> Self {
        Self {
            db,
            dedup_window_hours,
        }
    }

    /// Latest completed result for (subject, type) within the window
    pub async fn check_existing(
        &self,
        subject_id: &str,
        analysis_type: &str,
        within_hours: Option<u32>,
    ) -> Result<Option<ExistingInfo>> {
        let hours = within_hours.unwrap_or(self.dedup_window_hours);
        let since = window_start(Utc::now(), hours);
        let existing = db::analyses::latest_completed(&self.db, subject_id, analysis_type, Some(since))
            .await?;
        Ok(existing.as_ref().map(ExistingInfo::from))
    }

    /// Persist a completed analysis, deduplicating unless `force_new`
    pub async fn store(&self, request: StoreRequest) -> Result<StoreOutcome> {
        if request.subject_id.trim().is_empty() || request.analysis_type.trim().is_empty() {
            return Err(Error::InvalidInput(
                "subject_id and analysis_type are required".to_string(),
            ));
        }

        let hash = analysis_hash(
            &request.subject_id,
            &request.analysis_type,
            request.user_context.as_deref(),
        );
        let now = Utc::now();
        let hours = request.within_hours.unwrap_or(self.dedup_window_hours);
        let dedup_since = (!request.force_new).then(|| window_start(now, hours));

        let result = AnalysisResult {
            id: Uuid::new_v4(),
            subject_id: request.subject_id,
            analysis_type: request.analysis_type,
            analysis_hash: hash,
            version: 0,
            status: ResultStatus::Completed,
            payload: request.payload,
            overall_quality: request.overall_quality.min(100),
            is_partial_result: request.is_partial_result,
            job_id: request.job_id,
            created_at: now,
        };

        let inserted = retry_on_lock("store analysis", DEFAULT_MAX_LOCK_WAIT_MS, || {
            db::analyses::insert_next_version(&self.db, &result, dedup_since)
        })
        .await;

        match inserted {
            Ok(Some(version)) => {
                info!(
                    subject_id = %result.subject_id,
                    analysis_type = %result.analysis_type,
                    version,
                    "Stored new analysis version"
                );
                Ok(StoreOutcome {
                    id: result.id,
                    version,
                    is_new: true,
                    overall_quality: result.overall_quality,
                    is_partial_result: result.is_partial_result,
                })
            }
            Ok(None) => {
                // Dedup guard held; return the row it matched
                let since = dedup_since.unwrap_or(now);
                let existing = db::analyses::find_recent_by_hash(&self.db, &result.analysis_hash, since)
                    .await?
                    .ok_or_else(|| {
                        Error::Internal("dedup matched a row that no longer exists".to_string())
                    })?;
                debug!(
                    subject_id = %existing.subject_id,
                    version = existing.version,
                    "Identical analysis within dedup window, reusing"
                );
                Ok(StoreOutcome::existing(&existing))
            }
            Err(err) if err.is_unique_violation() => self.recover_lost_race(&result, err).await,
            Err(err) => Err(err),
        }
    }

    /// Another writer claimed the version first; its row is the outcome
    async fn recover_lost_race(&self, result: &AnalysisResult, err: Error) -> Result<StoreOutcome> {
        let existing = db::analyses::latest(&self.db, &result.subject_id, &result.analysis_type)
            .await?
            .ok_or(err)?;
        debug!(
            subject_id = %existing.subject_id,
            version = existing.version,
            "Lost version race, returning latest row"
        );
        Ok(StoreOutcome::existing(&existing))
    }

    pub async fn latest(&self, subject_id: &str, analysis_type: &str) -> Result<Option<AnalysisResult>> {
        db::analyses::latest(&self.db, subject_id, analysis_type).await
    }

    pub async fn list_versions(
        &self,
        subject_id: &str,
        analysis_type: &str,
    ) -> Result<Vec<AnalysisResult>> {
        db::analyses::list_versions(&self.db, subject_id, analysis_type).await
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<AnalysisResult>> {
        db::analyses::load_analysis(&self.db, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalysisPayload;

    async fn setup() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::init_database_pool(&dir.path().join("test.db"))
            .await
            .unwrap();
        (dir, pool)
    }

    fn request(subject_id: &str) -> StoreRequest {
        StoreRequest {
            subject_id: subject_id.to_string(),
            analysis_type: "design_review".to_string(),
            user_context: None,
            payload: AnalysisPayload::default(),
            overall_quality: 70,
            is_partial_result: false,
            job_id: None,
            force_new: true,
            within_hours: None,
        }
    }

    #[tokio::test]
    async fn test_version_conflict_returns_winning_row() {
        let (_dir, pool) = setup().await;
        let versions = VersionManager::new(pool.clone(), 24);
        let winner = versions.store(request("img-9")).await.unwrap();
        assert_eq!(winner.version, 1);

        // A second writer that computed the same version number
        let loser = AnalysisResult {
            id: Uuid::new_v4(),
            subject_id: "img-9".to_string(),
            analysis_type: "design_review".to_string(),
            analysis_hash: analysis_hash("img-9", "design_review", None),
            version: winner.version,
            status: ResultStatus::Completed,
            payload: AnalysisPayload::default(),
            overall_quality: 40,
            is_partial_result: true,
            job_id: None,
            created_at: Utc::now(),
        };
        let err: Error = sqlx::query(
            r#"
            INSERT INTO analysis_results (
                id, subject_id, analysis_type, analysis_hash, version, status,
                payload, overall_quality, is_partial_result, job_id, created_at
            ) VALUES (?, ?, ?, ?, ?, 'completed', '{}', ?, ?, NULL, ?)
            "#,
        )
        .bind(loser.id.to_string())
        .bind(&loser.subject_id)
        .bind(&loser.analysis_type)
        .bind(&loser.analysis_hash)
        .bind(loser.version)
        .bind(loser.overall_quality as i64)
        .bind(loser.is_partial_result)
        .bind(db::fmt_ts(loser.created_at))
        .execute(&pool)
        .await
        .unwrap_err()
        .into();
        assert!(err.is_unique_violation());

        let outcome = versions.recover_lost_race(&loser, err).await.unwrap();
        assert!(!outcome.is_new);
        assert_eq!(outcome.id, winner.id);
        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.overall_quality, 70);
        assert!(!outcome.is_partial_result);
        assert_eq!(versions.list_versions("img-9", "design_review").await.unwrap().len(), 1);
    }

    #[test]
    fn test_hash_normalizes_context() {
        let a = analysis_hash("img-1", "design_review", Some("  Admin   Dashboard "));
        let b = analysis_hash("img-1", "design_review", Some("admin dashboard"));
        let c = analysis_hash("img-1", "design_review", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_window_start_saturates_at_epoch() {
        let now = Utc::now();
        assert_eq!(window_start(now, 24), now - Duration::hours(24));
        assert_eq!(window_start(now, u32::MAX), DateTime::<Utc>::default());
        assert_eq!(window_start(now, 0), now);
    }

    #[test]
    fn test_hash_fields_do_not_run_together() {
        assert_ne!(
            analysis_hash("ab", "c", None),
            analysis_hash("a", "bc", None)
        );
    }
}
