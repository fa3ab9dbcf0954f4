//! Result storage, event retention and session fork tests

mod helpers;

use chrono::{Duration as ChronoDuration, Utc};
use critique_ai::config::{PipelineConfig, ProviderRole};
use critique_ai::models::{AnalysisPayload, NewGroupJob, NewJob, SessionStatus, StoreRequest};
use critique_ai::services::VersionManager;
use critique_ai::PipelineError;
use helpers::db_utils::{backdate_events, count_rows};
use helpers::{
    bind, create_test_db, fast_gateway, group_ai_reply, test_orchestrator, vision_reply,
    ScriptedProvider,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn store_request(subject_id: &str, context: Option<&str>, force_new: bool) -> StoreRequest {
    StoreRequest {
        subject_id: subject_id.to_string(),
        analysis_type: "ux_review".to_string(),
        user_context: context.map(str::to_string),
        payload: AnalysisPayload {
            summary: "Readable, slightly dense".to_string(),
            metadata: json!({"source": "test"}),
            ..Default::default()
        },
        overall_quality: 80,
        is_partial_result: false,
        job_id: None,
        force_new,
        within_hours: None,
    }
}

#[tokio::test]
async fn test_identical_store_within_window_reuses_version() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let versions = VersionManager::new(pool.clone(), 24);

    let first = versions
        .store(store_request("img-1", Some("checkout"), false))
        .await
        .unwrap();
    assert!(first.is_new);
    assert_eq!(first.version, 1);

    let second = versions
        .store(store_request("img-1", Some("checkout"), false))
        .await
        .unwrap();
    assert!(!second.is_new);
    assert_eq!(second.id, first.id);
    assert_eq!(second.version, 1);

    assert_eq!(count_rows(&pool, "analysis_results").await.unwrap(), 1);
}

#[tokio::test]
async fn test_force_new_and_changed_context_add_versions() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let versions = VersionManager::new(pool, 24);

    versions
        .store(store_request("img-2", Some("checkout"), false))
        .await
        .unwrap();
    let forced = versions
        .store(store_request("img-2", Some("checkout"), true))
        .await
        .unwrap();
    assert!(forced.is_new);
    assert_eq!(forced.version, 2);

    let other_context = versions
        .store(store_request("img-2", Some("returning customer"), false))
        .await
        .unwrap();
    assert!(other_context.is_new);
    assert_eq!(other_context.version, 3);

    let all = versions.list_versions("img-2", "ux_review").await.unwrap();
    let numbers: Vec<i64> = all.iter().map(|r| r.version).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    let latest = versions.latest("img-2", "ux_review").await.unwrap().unwrap();
    assert_eq!(latest.id, other_context.id);

    let existing = versions
        .check_existing("img-2", "ux_review", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(existing.version, 3);
    assert!(versions
        .check_existing("img-unknown", "ux_review", None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_store_rejects_blank_subject() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let versions = VersionManager::new(pool, 24);
    let err = versions
        .store(store_request("  ", None, false))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("required"));
}

#[tokio::test]
async fn test_concurrent_identical_stores_insert_once() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let versions = VersionManager::new(pool.clone(), 24);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let versions = versions.clone();
            tokio::spawn(async move { versions.store(store_request("img-3", None, false)).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_new).count(), 1);
    assert!(outcomes.iter().all(|o| o.version == 1));
    assert_eq!(count_rows(&pool, "analysis_results").await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_forced_stores_get_distinct_versions() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let versions = VersionManager::new(pool.clone(), 24);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let versions = versions.clone();
            tokio::spawn(async move { versions.store(store_request("img-4", None, true)).await })
        })
        .collect();

    let mut inserted = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.is_new {
            inserted.push(outcome.version);
        }
    }

    let unique: HashSet<i64> = inserted.iter().copied().collect();
    assert_eq!(unique.len(), inserted.len());
    assert!(!inserted.is_empty());

    let stored = versions.list_versions("img-4", "ux_review").await.unwrap();
    assert_eq!(stored.len(), inserted.len());
    let numbers: Vec<i64> = stored.iter().map(|r| r.version).collect();
    let expected: Vec<i64> = (1..=stored.len() as i64).collect();
    assert_eq!(numbers, expected);
}

#[tokio::test]
async fn test_purge_deletes_only_expired_events() {
    let pipeline = test_orchestrator(fast_gateway(), PipelineConfig::default())
        .await
        .unwrap();
    let old = pipeline
        .orchestrator
        .create_job(NewJob {
            subject_id: "old".to_string(),
            subject_url: "https://cdn.example.com/old.png".to_string(),
            user_context: None,
            analysis_type: None,
        })
        .await
        .unwrap();
    let recent = pipeline
        .orchestrator
        .create_job(NewJob {
            subject_id: "recent".to_string(),
            subject_url: "https://cdn.example.com/recent.png".to_string(),
            user_context: None,
            analysis_type: None,
        })
        .await
        .unwrap();
    // No ai provider: both fail at ai after three stages of events
    pipeline.drive().await;

    let backdated = backdate_events(&pipeline.db, old.id, Utc::now() - ChronoDuration::days(61))
        .await
        .unwrap();
    assert_eq!(backdated, 6);

    let mut rx = pipeline.event_bus.subscribe();
    let deleted = pipeline.orchestrator.purge_events(Some(60)).await.unwrap();
    assert_eq!(deleted, 6);

    assert!(pipeline
        .orchestrator
        .events(old.job_ref())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        pipeline
            .orchestrator
            .events(recent.job_ref())
            .await
            .unwrap()
            .len(),
        6
    );
    // Job rows survive their events
    assert_eq!(count_rows(&pipeline.db, "jobs").await.unwrap(), 2);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.event_type(), "EventsPurged");

    let nothing_left = pipeline.orchestrator.purge_events(None).await.unwrap();
    assert_eq!(nothing_left, 0);
}

#[tokio::test]
async fn test_unbounded_windows_cover_all_history() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let versions = VersionManager::new(pool.clone(), 24);

    let first = versions
        .store(store_request("img-5", None, false))
        .await
        .unwrap();
    let existing = versions
        .check_existing("img-5", "ux_review", Some(u32::MAX))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(existing.version, first.version);

    let mut request = store_request("img-5", None, false);
    request.within_hours = Some(u32::MAX);
    let again = versions.store(request).await.unwrap();
    assert!(!again.is_new);
    assert_eq!(again.id, first.id);
}

#[tokio::test]
async fn test_purge_with_huge_retention_keeps_everything() {
    let pipeline = test_orchestrator(fast_gateway(), PipelineConfig::default())
        .await
        .unwrap();
    let job = pipeline
        .orchestrator
        .create_job(NewJob {
            subject_id: "kept".to_string(),
            subject_url: "https://cdn.example.com/kept.png".to_string(),
            user_context: None,
            analysis_type: None,
        })
        .await
        .unwrap();
    pipeline.drive().await;
    backdate_events(&pipeline.db, job.id, Utc::now() - ChronoDuration::days(3650))
        .await
        .unwrap();

    let deleted = pipeline
        .orchestrator
        .purge_events(Some(u32::MAX))
        .await
        .unwrap();
    assert_eq!(deleted, 0);
    assert_eq!(
        pipeline
            .orchestrator
            .events(job.job_ref())
            .await
            .unwrap()
            .len(),
        6
    );
}

#[tokio::test]
async fn test_fork_creates_child_session_and_keeps_source() {
    let ids = ["home", "cart"];
    let gateway = fast_gateway()
        .with_binding(bind(
            ProviderRole::Vision,
            Arc::new(ScriptedProvider::replying("vision-a", vision_reply())),
        ))
        .with_binding(bind(
            ProviderRole::Ai,
            Arc::new(ScriptedProvider::replying("ai", group_ai_reply(&ids))),
        ));
    let pipeline = test_orchestrator(gateway, PipelineConfig::default())
        .await
        .unwrap();

    let job = pipeline
        .orchestrator
        .create_group_job(NewGroupJob {
            group_id: Some("shop".to_string()),
            subject_ids: ids.iter().map(|s| s.to_string()).collect(),
            subject_urls: vec![
                "https://cdn.example.com/home.png".to_string(),
                "https://cdn.example.com/cart.png".to_string(),
            ],
            group_context: Some("online store".to_string()),
            prompt: Some("focus on navigation".to_string()),
            session_id: None,
        })
        .await
        .unwrap();
    pipeline.drive().await;

    let source_id = pipeline
        .orchestrator
        .get_group_job(job.id)
        .await
        .unwrap()
        .result_session_id
        .unwrap();
    let source_before = pipeline
        .orchestrator
        .aggregator()
        .load(source_id)
        .await
        .unwrap()
        .unwrap();

    let fork = pipeline
        .orchestrator
        .fork_group_session(source_id, Some("focus on checkout".to_string()))
        .await
        .unwrap();
    assert_eq!(fork.parent_session_id, source_id);
    assert_ne!(fork.session_id, source_id);

    let pending = pipeline
        .orchestrator
        .aggregator()
        .load(fork.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.status, SessionStatus::Pending);

    pipeline.drive().await;

    let fork_job = pipeline
        .orchestrator
        .get_group_job(fork.group_job_id)
        .await
        .unwrap();
    assert_eq!(fork_job.result_session_id, Some(fork.session_id));
    assert_eq!(fork_job.prompt.as_deref(), Some("focus on checkout"));

    let child = pipeline
        .orchestrator
        .aggregator()
        .load(fork.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.status, SessionStatus::Completed);
    assert_eq!(child.parent_session_id, Some(source_id));
    assert_eq!(child.group_id, "shop");
    assert_eq!(child.group_job_id, Some(fork.group_job_id));

    let source_after = pipeline
        .orchestrator
        .aggregator()
        .load(source_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(source_after.updated_at, source_before.updated_at);
    assert_eq!(source_after.prompt.as_deref(), Some("focus on navigation"));

    let lineage = pipeline
        .orchestrator
        .aggregator()
        .lineage(fork.session_id)
        .await
        .unwrap();
    assert_eq!(lineage.len(), 1);
    assert_eq!(lineage[0].session_id, source_id);
}

#[tokio::test]
async fn test_fork_requires_completed_source() {
    let ids = ["home", "cart"];
    let gateway = fast_gateway().with_binding(bind(
        ProviderRole::Ai,
        Arc::new(ScriptedProvider::replying("ai", group_ai_reply(&ids))),
    ));
    let pipeline = test_orchestrator(gateway, PipelineConfig::default())
        .await
        .unwrap();
    let job = pipeline
        .orchestrator
        .create_group_job(NewGroupJob {
            group_id: Some("shop".to_string()),
            subject_ids: ids.iter().map(|s| s.to_string()).collect(),
            subject_urls: vec![
                "https://cdn.example.com/home.png".to_string(),
                "https://cdn.example.com/cart.png".to_string(),
            ],
            group_context: None,
            prompt: None,
            session_id: None,
        })
        .await
        .unwrap();
    pipeline.drive().await;

    let completed_id = pipeline
        .orchestrator
        .get_group_job(job.id)
        .await
        .unwrap()
        .result_session_id
        .unwrap();
    let mut unfinished = pipeline
        .orchestrator
        .aggregator()
        .load(completed_id)
        .await
        .unwrap()
        .unwrap();
    unfinished.id = uuid::Uuid::new_v4();
    unfinished.session_id = uuid::Uuid::new_v4();
    unfinished.status = SessionStatus::Pending;
    critique_ai::db::group_results::insert_session(&pipeline.db, &unfinished)
        .await
        .unwrap();

    let err = pipeline
        .orchestrator
        .fork_group_session(unfinished.session_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState(_)));
    // No pending fork row left behind
    assert_eq!(count_rows(&pipeline.db, "group_analysis_results").await.unwrap(), 2);
    assert!(pipeline.dispatcher.pending().is_empty());
}

#[tokio::test]
async fn test_fork_of_unknown_session_is_not_found() {
    let pipeline = test_orchestrator(fast_gateway(), PipelineConfig::default())
        .await
        .unwrap();
    let err = pipeline
        .orchestrator
        .fork_group_session(uuid::Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
}
