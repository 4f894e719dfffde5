use std::sync::Arc;

use crate::error::{PipelineError, ValidationCode};
use crate::metrics::SCORING_JOBS_TOTAL;
use crate::models::{JobStatus, Score, ScoringJob};
use crate::store::{Abandonment, JobResolution, PipelineStore, ResolutionOutcome, ResolvedJob};
use crate::utils::time;

pub const MAX_LIST_LIMIT: usize = 100;

/// Durable job queue; every state change is a conditional write in the store.
pub struct ScoringQueue {
    store: Arc<dyn PipelineStore>,
    max_retries: u32,
}

impl ScoringQueue {
    pub fn new(store: Arc<dyn PipelineStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Creates, reuses (QUEUED/PROCESSING) or resets (FAILED/COMPLETED) the attempt's job.
    pub async fn enqueue(&self, attempt_id: &str) -> Result<ScoringJob, PipelineError> {
        let job = self.store.enqueue_job(attempt_id, time::now()).await?;
        tracing::info!(
            job = %job.id,
            attempt = %attempt_id,
            status = job.status.as_str(),
            retry_count = job.retry_count,
            "Scoring job enqueued"
        );
        Ok(job)
    }

    /// QUEUED -> PROCESSING. `None` means another worker owns the job.
    pub async fn claim(&self, job_id: &str) -> Result<Option<ScoringJob>, PipelineError> {
        let claimed = self.store.claim_job(job_id, time::now()).await?;
        if claimed.is_none() {
            SCORING_JOBS_TOTAL.with_label_values(&["already_claimed"]).inc();
        }
        Ok(claimed)
    }

    pub async fn complete(
        &self,
        job: &ScoringJob,
        score: Score,
        note: Option<String>,
    ) -> Result<ResolvedJob, PipelineError> {
        let label = if note.is_some() {
            "completed_with_issues"
        } else {
            "completed"
        };
        let resolved = self
            .store
            .resolve_job(&JobResolution {
                job_id: job.id.clone(),
                attempt_id: job.attempt_id.clone(),
                outcome: ResolutionOutcome::Completed {
                    score: Box::new(score),
                    note,
                },
                at: time::now(),
            })
            .await?;

        SCORING_JOBS_TOTAL.with_label_values(&[label]).inc();
        Ok(resolved)
    }

    /// Records a failed pass: back to QUEUED while retries remain, FAILED otherwise.
    pub async fn fail(
        &self,
        job: &ScoringJob,
        error: &str,
    ) -> Result<ResolvedJob, PipelineError> {
        let resolved = self
            .store
            .resolve_job(&JobResolution {
                job_id: job.id.clone(),
                attempt_id: job.attempt_id.clone(),
                outcome: ResolutionOutcome::Failed {
                    error: error.to_string(),
                    max_retries: self.max_retries,
                },
                at: time::now(),
            })
            .await?;

        let label = match resolved.job.status {
            JobStatus::Failed => "failed",
            _ => "requeued",
        };
        SCORING_JOBS_TOTAL.with_label_values(&[label]).inc();
        Ok(resolved)
    }

    /// Fails a claimed job whose attempt is no longer PROCESSING, or requeues it if the
    /// attempt was resubmitted in the meantime.
    pub async fn abandon(
        &self,
        job: &ScoringJob,
        reason: &str,
    ) -> Result<Abandonment, PipelineError> {
        let outcome = self
            .store
            .abandon_job(&job.id, &job.attempt_id, reason, time::now())
            .await?;
        match outcome {
            Abandonment::Abandoned => SCORING_JOBS_TOTAL.with_label_values(&["abandoned"]).inc(),
            Abandonment::Requeued => SCORING_JOBS_TOTAL.with_label_values(&["released"]).inc(),
            Abandonment::Skipped => {}
        }
        Ok(outcome)
    }

    /// QUEUED jobs, oldest first.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<ScoringJob>, PipelineError> {
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(PipelineError::validation(
                ValidationCode::InvalidLimit,
                format!("limit must be between 1 and {}", MAX_LIST_LIMIT),
            ));
        }
        Ok(self.store.list_queued_jobs(limit).await?)
    }

    pub async fn find(&self, job_id: &str) -> Result<Option<ScoringJob>, PipelineError> {
        Ok(self.store.find_job(job_id).await?)
    }

    pub async fn find_for_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<ScoringJob>, PipelineError> {
        Ok(self.store.find_job_for_attempt(attempt_id).await?)
    }
}
