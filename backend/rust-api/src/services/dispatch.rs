use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Semaphore;

use crate::services::scoring_orchestrator::ScoringOrchestrator;

/// Hands a job to whatever runs `process_job`. Must return without waiting for scoring.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job_id: &str) -> Result<()>;
}

/// Pushes job ids onto a Redis list drained by the scoring-worker binary.
pub struct RedisJobDispatcher {
    redis: ConnectionManager,
    queue: String,
}

impl RedisJobDispatcher {
    pub fn new(redis: ConnectionManager, queue: impl Into<String>) -> Self {
        Self {
            redis,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl JobDispatcher for RedisJobDispatcher {
    async fn dispatch(&self, job_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("LPUSH")
            .arg(&self.queue)
            .arg(job_id)
            .query_async::<i64>(&mut conn)
            .await
            .with_context(|| format!("Failed to push job {} onto {}", job_id, self.queue))?;

        tracing::debug!(job = %job_id, queue = %self.queue, "Job dispatched to Redis");
        Ok(())
    }
}

/// Runs jobs on the local runtime, at most `concurrency` at a time.
pub struct InProcessDispatcher {
    orchestrator: Arc<ScoringOrchestrator>,
    permits: Arc<Semaphore>,
}

impl InProcessDispatcher {
    pub fn new(orchestrator: Arc<ScoringOrchestrator>, concurrency: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

#[async_trait]
impl JobDispatcher for InProcessDispatcher {
    async fn dispatch(&self, job_id: &str) -> Result<()> {
        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        let job_id = job_id.to_string();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::error!(job = %job_id, "Dispatcher closed before job could run");
                return;
            };
            if let Err(err) = orchestrator.process_job(&job_id).await {
                tracing::error!(job = %job_id, error = %err, "Scoring job failed to process");
            }
        });

        Ok(())
    }
}
