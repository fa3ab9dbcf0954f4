//! Stage dispatch
//!
//! Stage handlers never call each other directly. A finished stage hands the
//! next `(job, stage)` pair to a [`StageDispatcher`]; in-process that is an
//! mpsc queue drained by [`StageWorkerPool`].

use crate::error::{PipelineError, PipelineResult};
use crate::models::{JobRef, Stage};
use crate::services::orchestrator::StageOrchestrator;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One unit of work for a stage handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageTask {
    pub job_ref: JobRef,
    pub stage: Stage,
}

impl StageTask {
    pub fn new(job_ref: JobRef, stage: Stage) -> Self {
        Self { job_ref, stage }
    }
}

/// Hands a stage to whatever executes it
#[async_trait]
pub trait StageDispatcher: Send + Sync {
    async fn dispatch(&self, task: StageTask) -> PipelineResult<()>;
}

/// In-process queue dispatcher
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: mpsc::UnboundedSender<StageTask>,
}

/// Create a dispatcher and the receiver a worker pool consumes
pub fn stage_queue() -> (QueueDispatcher, mpsc::UnboundedReceiver<StageTask>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueDispatcher { tx }, rx)
}

#[async_trait]
impl StageDispatcher for QueueDispatcher {
    async fn dispatch(&self, task: StageTask) -> PipelineResult<()> {
        debug!(job = %task.job_ref, stage = %task.stage, "Dispatching stage");
        self.tx
            .send(task)
            .map_err(|_| PipelineError::Dispatch("stage queue is closed".to_string()))
    }
}

/// Tokio tasks draining the stage queue
pub struct StageWorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl StageWorkerPool {
    pub fn spawn(
        orchestrator: Arc<StageOrchestrator>,
        rx: mpsc::UnboundedReceiver<StageTask>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let orchestrator = Arc::clone(&orchestrator);
                let rx = Arc::clone(&rx);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, orchestrator, rx, shutdown).await;
                })
            })
            .collect();

        info!(workers = workers.max(1), "Stage worker pool started");
        Self { handles, shutdown }
    }

    /// Signal shutdown and wait for in-flight stages to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Stage worker panicked: {}", e);
            }
        }
        info!("Stage worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    orchestrator: Arc<StageOrchestrator>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<StageTask>>>,
    shutdown: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            _ = shutdown.cancelled() => break,
            task = async { rx.lock().await.recv().await } => task,
        };

        let Some(task) = task else {
            debug!(worker_id, "Stage queue closed");
            break;
        };

        if let Err(e) = orchestrator.run_stage(task.job_ref, task.stage).await {
            error!(
                worker_id,
                job = %task.job_ref,
                stage = %task.stage,
                "Stage handler error: {}",
                e
            );
        }
    }
}
