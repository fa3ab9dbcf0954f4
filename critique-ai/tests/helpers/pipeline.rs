//! Orchestrator wiring for tests
//!
//! Stages are collected instead of queued to workers, so a test decides when
//! and in which order they run.

use anyhow::Result;
use async_trait::async_trait;
use critique_ai::config::{GatewayConfig, PipelineConfig, ProviderRole, ScoringConfig};
use critique_ai::providers::{Provider, ProviderBinding, ProviderGateway};
use critique_ai::services::{PipelineContext, StageDispatcher, StageOrchestrator, StageRun, StageTask};
use critique_ai::PipelineResult;
use critique_common::events::EventBus;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use super::create_test_db;

/// Dispatcher that records tasks for the test to run
#[derive(Default)]
pub struct CollectingDispatcher {
    queue: Mutex<VecDeque<StageTask>>,
}

impl CollectingDispatcher {
    pub fn pop(&self) -> Option<StageTask> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn pending(&self) -> Vec<StageTask> {
        self.queue.lock().unwrap().iter().copied().collect()
    }

    /// Forget queued work, as a crashed process would
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }
}

#[async_trait]
impl StageDispatcher for CollectingDispatcher {
    async fn dispatch(&self, task: StageTask) -> PipelineResult<()> {
        self.queue.lock().unwrap().push_back(task);
        Ok(())
    }
}

/// Run queued stages until nothing is left
pub async fn drive(
    orchestrator: &StageOrchestrator,
    dispatcher: &CollectingDispatcher,
) -> Vec<StageRun> {
    let mut runs = Vec::new();
    while let Some(task) = dispatcher.pop() {
        let run = orchestrator
            .run_stage(task.job_ref, task.stage)
            .await
            .expect("stage run should not error");
        runs.push(run);
    }
    runs
}

pub struct TestPipeline {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub orchestrator: Arc<StageOrchestrator>,
    pub dispatcher: Arc<CollectingDispatcher>,
    _temp_dir: TempDir,
}

impl TestPipeline {
    pub async fn drive(&self) -> Vec<StageRun> {
        drive(&self.orchestrator, &self.dispatcher).await
    }
}

/// Gateway with millisecond backoff so retries don't slow tests down
pub fn fast_gateway() -> ProviderGateway {
    ProviderGateway::new(&GatewayConfig {
        base_delay_ms: 1,
        max_delay_ms: 2,
        ..GatewayConfig::default()
    })
}

pub fn bind(role: ProviderRole, provider: Arc<dyn Provider>) -> ProviderBinding {
    ProviderBinding::new(role, "test-model", provider)
}

/// Orchestrator over a fresh database, wired to a collecting dispatcher
pub async fn test_orchestrator(
    gateway: ProviderGateway,
    pipeline: PipelineConfig,
) -> Result<TestPipeline> {
    let (temp_dir, db) = create_test_db().await?;
    let event_bus = EventBus::new(256);
    let dispatcher = Arc::new(CollectingDispatcher::default());

    let orchestrator = Arc::new(StageOrchestrator::new(
        PipelineContext {
            db: db.clone(),
            event_bus: event_bus.clone(),
            gateway: Arc::new(gateway),
            pipeline,
            scoring: ScoringConfig::default(),
        },
        dispatcher.clone(),
    ));

    Ok(TestPipeline {
        db,
        event_bus,
        orchestrator,
        dispatcher,
        _temp_dir: temp_dir,
    })
}
