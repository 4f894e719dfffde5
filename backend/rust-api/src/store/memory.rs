use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    failed_pass_status, Abandonment, JobResolution, PipelineStore, ResolutionOutcome, ResolvedJob,
};
use crate::error::StoreError;
use crate::models::{
    Attempt, AttemptMedia, AttemptStatus, AttemptTransition, JobStatus, Prompt, Score,
    ScoringJob, SkillType,
};

#[derive(Default)]
struct MemoryState {
    prompts: HashMap<String, Prompt>,
    attempts: HashMap<String, Attempt>,
    media: HashMap<String, AttemptMedia>,
    jobs: HashMap<String, ScoringJob>,
    scores: HashMap<String, Score>,
}

/// Single-process store. Every operation runs under one mutex, which gives the same
/// all-or-nothing guarantees the MongoDB store gets from conditional updates and
/// transactions.
#[derive(Default)]
pub struct MemoryPipelineStore {
    state: Mutex<MemoryState>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".into()))
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn upsert_prompt(&self, prompt: &Prompt) -> Result<(), StoreError> {
        self.lock()?.prompts.insert(prompt.id.clone(), prompt.clone());
        Ok(())
    }

    async fn find_prompt(&self, prompt_id: &str) -> Result<Option<Prompt>, StoreError> {
        Ok(self.lock()?.prompts.get(prompt_id).cloned())
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if attempt.skill_type == SkillType::Writing && attempt.status == AttemptStatus::InProgress
        {
            let open_writing = state.attempts.values().any(|existing| {
                existing.learner_id == attempt.learner_id
                    && existing.skill_type == SkillType::Writing
                    && existing.status == AttemptStatus::InProgress
            });
            if open_writing {
                return Err(StoreError::Conflict(
                    "learner already has a writing attempt in progress".into(),
                ));
            }
        }
        if state.attempts.contains_key(&attempt.id) {
            return Err(StoreError::Conflict(format!(
                "attempt {} already exists",
                attempt.id
            )));
        }
        state.attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn find_attempt(&self, attempt_id: &str) -> Result<Option<Attempt>, StoreError> {
        Ok(self.lock()?.attempts.get(attempt_id).cloned())
    }

    async fn save_writing_content(
        &self,
        attempt_id: &str,
        content: &str,
        word_count: u32,
        saved_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.attempts.get_mut(attempt_id) {
            Some(attempt) if attempt.status == AttemptStatus::InProgress => {
                attempt.writing_content = Some(content.to_string());
                attempt.word_count = word_count;
                attempt.last_saved_at = Some(saved_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_attempt(
        &self,
        attempt_id: &str,
        from: &[AttemptStatus],
        change: &AttemptTransition,
    ) -> Result<Option<Attempt>, StoreError> {
        let mut state = self.lock()?;
        match state.attempts.get_mut(attempt_id) {
            Some(attempt) if from.contains(&attempt.status) => {
                change.apply(attempt);
                Ok(Some(attempt.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn insert_media(&self, media: &AttemptMedia) -> Result<(), StoreError> {
        self.lock()?.media.insert(media.id.clone(), media.clone());
        Ok(())
    }

    async fn find_media(&self, media_id: &str) -> Result<Option<AttemptMedia>, StoreError> {
        Ok(self.lock()?.media.get(media_id).cloned())
    }

    async fn list_media(&self, attempt_id: &str) -> Result<Vec<AttemptMedia>, StoreError> {
        let state = self.lock()?;
        let mut items: Vec<AttemptMedia> = state
            .media
            .values()
            .filter(|media| media.attempt_id == attempt_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then(b.id.cmp(&a.id)));
        Ok(items)
    }

    async fn delete_media(&self, media_id: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(attempt_id) = state.media.get(media_id).map(|m| m.attempt_id.clone()) else {
            return Ok(false);
        };
        let open = state
            .attempts
            .get(&attempt_id)
            .map(|attempt| attempt.status == AttemptStatus::InProgress)
            .unwrap_or(false);
        if !open {
            return Ok(false);
        }
        Ok(state.media.remove(media_id).is_some())
    }

    async fn enqueue_job(
        &self,
        attempt_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScoringJob, StoreError> {
        let mut state = self.lock()?;
        if let Some(job) = state
            .jobs
            .values_mut()
            .find(|job| job.attempt_id == attempt_id)
        {
            if !job.status.is_live() {
                job.status = JobStatus::Queued;
                job.error_message = None;
                job.started_at = None;
                job.completed_at = None;
            }
            return Ok(job.clone());
        }

        let job = ScoringJob::queued(attempt_id, now);
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<ScoringJob>, StoreError> {
        Ok(self.lock()?.jobs.get(job_id).cloned())
    }

    async fn find_job_for_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<ScoringJob>, StoreError> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .find(|job| job.attempt_id == attempt_id)
            .cloned())
    }

    async fn claim_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScoringJob>, StoreError> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_queued_jobs(&self, limit: usize) -> Result<Vec<ScoringJob>, StoreError> {
        let state = self.lock()?;
        let mut queued: Vec<ScoringJob> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        queued.truncate(limit);
        Ok(queued)
    }

    async fn abandon_job(
        &self,
        job_id: &str,
        attempt_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Abandonment, StoreError> {
        let mut state = self.lock()?;
        let resubmitted = state
            .attempts
            .get(attempt_id)
            .is_some_and(|attempt| attempt.status == AttemptStatus::Processing);

        match state.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                if resubmitted {
                    job.status = JobStatus::Queued;
                    job.started_at = None;
                    Ok(Abandonment::Requeued)
                } else {
                    job.status = JobStatus::Failed;
                    job.error_message = Some(reason.to_string());
                    job.completed_at = Some(now);
                    Ok(Abandonment::Abandoned)
                }
            }
            _ => Ok(Abandonment::Skipped),
        }
    }

    async fn resolve_job(&self, resolution: &JobResolution) -> Result<ResolvedJob, StoreError> {
        let mut state = self.lock()?;

        // Validate everything before the first write so a conflict leaves no trace.
        let job = state
            .jobs
            .get(&resolution.job_id)
            .cloned()
            .ok_or_else(|| StoreError::Missing(format!("scoring job {}", resolution.job_id)))?;
        if job.status != JobStatus::Processing {
            return Err(StoreError::Conflict(format!(
                "scoring job {} is {}, expected PROCESSING",
                job.id,
                job.status.as_str()
            )));
        }
        let attempt_status = state
            .attempts
            .get(&resolution.attempt_id)
            .map(|attempt| attempt.status)
            .ok_or_else(|| StoreError::Missing(format!("attempt {}", resolution.attempt_id)))?;
        if attempt_status != AttemptStatus::Processing {
            return Err(StoreError::Conflict(format!(
                "attempt {} is {}, expected PROCESSING",
                resolution.attempt_id,
                attempt_status.as_str()
            )));
        }

        let mut updated_job = job;
        let next_attempt_status = match &resolution.outcome {
            ResolutionOutcome::Completed { score, note } => {
                state
                    .scores
                    .insert(resolution.attempt_id.clone(), score.as_ref().clone());
                updated_job.status = JobStatus::Completed;
                updated_job.error_message = note.clone();
                updated_job.completed_at = Some(resolution.at);
                AttemptStatus::Scored
            }
            ResolutionOutcome::Failed { error, max_retries } => {
                updated_job.retry_count += 1;
                updated_job.error_message = Some(error.clone());
                updated_job.status = failed_pass_status(updated_job.retry_count, *max_retries);
                if updated_job.status == JobStatus::Failed {
                    updated_job.completed_at = Some(resolution.at);
                    AttemptStatus::Failed
                } else {
                    updated_job.started_at = None;
                    AttemptStatus::Processing
                }
            }
        };

        if let Some(attempt) = state.attempts.get_mut(&resolution.attempt_id) {
            attempt.status = next_attempt_status;
            if next_attempt_status == AttemptStatus::Scored {
                attempt.scored_at = Some(resolution.at);
            }
        }
        state
            .jobs
            .insert(updated_job.id.clone(), updated_job.clone());

        Ok(ResolvedJob {
            job: updated_job,
            attempt_status: next_attempt_status,
        })
    }

    async fn find_score(&self, attempt_id: &str) -> Result<Option<Score>, StoreError> {
        Ok(self.lock()?.scores.get(attempt_id).cloned())
    }

    async fn delete_score(&self, attempt_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.scores.remove(attempt_id).is_some())
    }
}
