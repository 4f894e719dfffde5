//! Durable state behind the scoring pipeline.
//!
//! Every conditional write here is a compare-and-swap on a status field, executed by the
//! backend itself. Workers may live in separate processes, so no in-process lock is ever
//! relied on for mutual exclusion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{
    Attempt, AttemptMedia, AttemptStatus, AttemptTransition, Prompt, Score, ScoringJob,
};

pub mod memory;
pub mod mongo;

pub use memory::MemoryPipelineStore;
pub use mongo::MongoPipelineStore;

/// Terminal outcome of one processing pass, applied as a single unit.
#[derive(Debug, Clone)]
pub struct JobResolution {
    pub job_id: String,
    pub attempt_id: String,
    pub outcome: ResolutionOutcome,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ResolutionOutcome {
    /// Score persisted, attempt -> SCORED, job -> COMPLETED. `note` is kept on the job
    /// for audit (completed-with-issues).
    Completed { score: Box<Score>, note: Option<String> },
    /// retry_count += 1; job -> QUEUED while retries remain, otherwise job and attempt
    /// -> FAILED.
    Failed { error: String, max_retries: u32 },
}

#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub job: ScoringJob,
    pub attempt_status: AttemptStatus,
}

/// What `abandon_job` did with a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abandonment {
    /// Job -> FAILED; the attempt is not PROCESSING.
    Abandoned,
    /// The attempt is PROCESSING again (resubmitted); job -> QUEUED, retry count kept.
    Requeued,
    /// The job was no longer PROCESSING; nothing written.
    Skipped,
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn upsert_prompt(&self, prompt: &Prompt) -> Result<(), StoreError>;
    async fn find_prompt(&self, prompt_id: &str) -> Result<Option<Prompt>, StoreError>;

    /// Fails with `Conflict` if the learner already has an IN_PROGRESS writing attempt.
    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), StoreError>;
    async fn find_attempt(&self, attempt_id: &str) -> Result<Option<Attempt>, StoreError>;

    /// Stores content only while the attempt is IN_PROGRESS; `false` otherwise.
    async fn save_writing_content(
        &self,
        attempt_id: &str,
        content: &str,
        word_count: u32,
        saved_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Applies `change` only if the current status is one of `from`.
    /// Returns `None` when the guard did not match.
    async fn transition_attempt(
        &self,
        attempt_id: &str,
        from: &[AttemptStatus],
        change: &AttemptTransition,
    ) -> Result<Option<Attempt>, StoreError>;

    async fn insert_media(&self, media: &AttemptMedia) -> Result<(), StoreError>;
    async fn find_media(&self, media_id: &str) -> Result<Option<AttemptMedia>, StoreError>;
    /// Most recent upload first.
    async fn list_media(&self, attempt_id: &str) -> Result<Vec<AttemptMedia>, StoreError>;
    /// Deletes only while the owning attempt is IN_PROGRESS; `false` otherwise.
    async fn delete_media(&self, media_id: &str) -> Result<bool, StoreError>;

    /// Creates a QUEUED job, returns a live one unchanged, or resets a finished one
    /// to QUEUED (retry count preserved, error cleared).
    async fn enqueue_job(
        &self,
        attempt_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScoringJob, StoreError>;
    async fn find_job(&self, job_id: &str) -> Result<Option<ScoringJob>, StoreError>;
    async fn find_job_for_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<ScoringJob>, StoreError>;
    /// QUEUED -> PROCESSING. `None` if the job was not QUEUED.
    async fn claim_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScoringJob>, StoreError>;
    /// QUEUED jobs, oldest first.
    async fn list_queued_jobs(&self, limit: usize) -> Result<Vec<ScoringJob>, StoreError>;
    /// Releases a PROCESSING job after its attempt was found outside PROCESSING. The
    /// attempt status is re-checked in the same unit as the job write, so a resubmit
    /// that lands in between requeues the job instead of failing it.
    async fn abandon_job(
        &self,
        job_id: &str,
        attempt_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Abandonment, StoreError>;
    /// Applies score, attempt and job writes atomically. The job must be PROCESSING and
    /// the attempt PROCESSING, otherwise `Conflict` and nothing is written.
    async fn resolve_job(&self, resolution: &JobResolution) -> Result<ResolvedJob, StoreError>;

    async fn find_score(&self, attempt_id: &str) -> Result<Option<Score>, StoreError>;
    async fn delete_score(&self, attempt_id: &str) -> Result<bool, StoreError>;
}

/// Status a job lands in after a failed pass.
pub(crate) fn failed_pass_status(retry_count: u32, max_retries: u32) -> crate::models::JobStatus {
    if retry_count < max_retries {
        crate::models::JobStatus::Queued
    } else {
        crate::models::JobStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;

    #[test]
    fn third_failure_exhausts_default_budget() {
        assert_eq!(failed_pass_status(1, 3), JobStatus::Queued);
        assert_eq!(failed_pass_status(2, 3), JobStatus::Queued);
        assert_eq!(failed_pass_status(3, 3), JobStatus::Failed);
        assert_eq!(failed_pass_status(4, 3), JobStatus::Failed);
    }
}
