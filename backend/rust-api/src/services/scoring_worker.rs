use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::PipelineSettings, metrics::SCORING_WORKER_TICKS_TOTAL,
    services::{scoring_orchestrator::ScoringOrchestrator, scoring_queue::MAX_LIST_LIMIT},
};

/// Consumes dispatched job ids from Redis and sweeps QUEUED jobs whenever the list is
/// idle. Claim is the only mutual exclusion, so a job both pushed and swept still runs
/// once.
pub struct ScoringWorker {
    orchestrator: Arc<ScoringOrchestrator>,
    redis: Option<ConnectionManager>,
    settings: PipelineSettings,
    permits: Arc<Semaphore>,
}

impl ScoringWorker {
    pub fn new(
        orchestrator: Arc<ScoringOrchestrator>,
        redis: Option<ConnectionManager>,
        settings: PipelineSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.worker_concurrency.max(1)));
        Self {
            orchestrator,
            redis,
            settings,
            permits,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let interval = self.settings.sweep_interval();
        info!(
            "Starting scoring worker (queue={}, interval={}s, concurrency={})",
            self.settings.dispatch_queue,
            interval.as_secs(),
            self.settings.worker_concurrency
        );

        loop {
            let popped = match self.redis.clone() {
                Some(conn) => self.next_dispatched(conn).await,
                None => {
                    sleep(interval).await;
                    Ok(None)
                }
            };

            match popped {
                Ok(Some(job_id)) => self.spawn_job(job_id).await,
                Ok(None) => self.tick().await,
                Err(err) => {
                    warn!(error = %err, "failed to read dispatch queue");
                    self.tick().await;
                    sleep(interval).await;
                }
            }
        }
    }

    /// Blocks up to one sweep interval for the next dispatched job id.
    async fn next_dispatched(&self, mut conn: ConnectionManager) -> Result<Option<String>> {
        let popped = redis::cmd("BRPOP")
            .arg(&self.settings.dispatch_queue)
            .arg(self.settings.sweep_interval_secs)
            .query_async::<Option<(String, String)>>(&mut conn)
            .await
            .context("BRPOP on dispatch queue failed")?;

        Ok(popped.map(|(_, job_id)| job_id))
    }

    async fn spawn_job(&self, job_id: String) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match orchestrator.process_job(&job_id).await {
                Ok(outcome) => debug!(job = %job_id, ?outcome, "dispatched job processed"),
                Err(err) => warn!(job = %job_id, error = %err, "failed to process dispatched job"),
            }
        });
    }

    async fn tick(&self) {
        match self.sweep().await {
            Ok(count) => {
                SCORING_WORKER_TICKS_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                if count > 0 {
                    info!("Scoring worker sweep processed {} job(s)", count);
                }
            }
            Err(err) => {
                SCORING_WORKER_TICKS_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                warn!(error = %err, "scoring worker sweep failed");
            }
        }
    }

    /// Processes one batch of QUEUED jobs with bounded concurrency.
    pub async fn sweep(&self) -> Result<usize> {
        let pending = self
            .orchestrator
            .queue()
            .list_pending(self.settings.sweep_batch_size.clamp(1, MAX_LIST_LIMIT))
            .await?;
        let count = pending.len();

        futures::stream::iter(pending)
            .for_each_concurrent(self.settings.worker_concurrency.max(1), |job| {
                let orchestrator = self.orchestrator.clone();
                async move {
                    if let Err(err) = orchestrator.process_job(&job.id).await {
                        warn!(job = %job.id, error = %err, "failed to process swept job");
                    }
                }
            })
            .await;

        Ok(count)
    }
}
