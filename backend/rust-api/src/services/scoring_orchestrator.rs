//! Runs scoring jobs: claim, score, and apply the result to the attempt, job and score
//! as one unit. Scoring errors never escape to the submitter; they end up on the job
//! (retry policy) or as a completed-with-issues score. Store errors after the claim take
//! the retry path too.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::error::PipelineError;
use crate::models::{
    Attempt, AttemptMedia, AttemptStatus, AttemptTransition, JobStatus, Score, ScoringJob,
    SkillType, SubScores,
};
use crate::services::notifier::{Notifier, ScoringNotification};
use crate::services::scorer_client::{AudioInput, Scorer, ScorerError, ScoringOutcome};
use crate::services::scoring_feedback::{normalize_band, unintelligible_feedback};
use crate::services::scoring_queue::ScoringQueue;
use crate::services::storage::StorageProvider;
use crate::store::{Abandonment, PipelineStore};
use crate::utils::retry::{retry_with_policy, RetryPolicy};
use crate::utils::time;

pub const FALLBACK_CONFIDENCE: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Scored { overall_band: f64 },
    CompletedWithIssues { reason: String },
    Requeued { retry_count: u32, error: String },
    Failed { retry_count: u32, error: String },
    AlreadyClaimed,
    Abandoned { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedJob {
    pub job_id: String,
    #[serde(flatten)]
    pub outcome: Option<ProcessOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Polling view of an attempt's scoring state.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringResult {
    pub attempt_id: String,
    pub status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub can_rescore: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_comment: Option<String>,
}

/// Result of one scoring pass before it is written back.
enum Pass {
    Scored(ScoringOutcome),
    Unintelligible(String),
    Failed(String),
}

pub struct ScoringOrchestrator {
    store: Arc<dyn PipelineStore>,
    queue: Arc<ScoringQueue>,
    scorer: Arc<dyn Scorer>,
    storage: Arc<dyn StorageProvider>,
    notifier: Arc<dyn Notifier>,
    speaking_fallback_enabled: bool,
    storage_retry: RetryPolicy,
}

impl ScoringOrchestrator {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<ScoringQueue>,
        scorer: Arc<dyn Scorer>,
        storage: Arc<dyn StorageProvider>,
        notifier: Arc<dyn Notifier>,
        speaking_fallback_enabled: bool,
    ) -> Self {
        Self {
            store,
            queue,
            scorer,
            storage,
            notifier,
            speaking_fallback_enabled,
            storage_retry: RetryPolicy::default(),
        }
    }

    pub fn with_storage_retry(mut self, policy: RetryPolicy) -> Self {
        self.storage_retry = policy;
        self
    }

    pub fn queue(&self) -> &Arc<ScoringQueue> {
        &self.queue
    }

    pub async fn process_job(&self, job_id: &str) -> Result<ProcessOutcome, PipelineError> {
        if self.queue.find(job_id).await?.is_none() {
            tracing::error!(job = %job_id, "Scoring job not found");
            return Err(PipelineError::not_found(format!(
                "scoring job {} not found",
                job_id
            )));
        }

        let Some(job) = self.queue.claim(job_id).await? else {
            tracing::info!(job = %job_id, "Scoring job already claimed, skipping");
            return Ok(ProcessOutcome::AlreadyClaimed);
        };

        let attempt = match self.store.find_attempt(&job.attempt_id).await {
            Ok(Some(attempt)) => attempt,
            Ok(None) => {
                // Left PROCESSING for manual inspection.
                tracing::error!(
                    job = %job.id,
                    attempt = %job.attempt_id,
                    "Attempt for claimed scoring job not found"
                );
                return Err(PipelineError::not_found(format!(
                    "attempt {} not found",
                    job.attempt_id
                )));
            }
            Err(err) => {
                return self
                    .fail_claimed(&job, format!("failed to load attempt: {}", err))
                    .await
            }
        };

        if attempt.status != AttemptStatus::Processing {
            let reason = format!(
                "attempt {} is {}, expected PROCESSING",
                attempt.id,
                attempt.status.as_str()
            );
            return self.abandon(&job, reason).await;
        }

        tracing::info!(
            job = %job.id,
            attempt = %attempt.id,
            skill = attempt.skill_type.as_str(),
            retry_count = job.retry_count,
            "Scoring job claimed"
        );

        let pass = match attempt.skill_type {
            SkillType::Writing => self.score_writing(&attempt).await,
            SkillType::Speaking => self.score_speaking(&attempt).await,
        };

        self.apply(&job, &attempt, pass).await
    }

    async fn apply(
        &self,
        job: &ScoringJob,
        attempt: &Attempt,
        pass: Pass,
    ) -> Result<ProcessOutcome, PipelineError> {
        let recorded = match pass {
            Pass::Scored(outcome) => {
                let band = outcome.overall_band;
                let score = build_score(attempt, outcome);
                self.queue
                    .complete(job, score, None)
                    .await
                    .map(|_| ProcessOutcome::Scored { overall_band: band })
            }
            Pass::Unintelligible(reason) => {
                let score = zero_score(attempt, &reason);
                self.queue
                    .complete(job, score, Some(reason.clone()))
                    .await
                    .map(|_| ProcessOutcome::CompletedWithIssues { reason })
            }
            Pass::Failed(error) => return self.fail_claimed(job, error).await,
        };

        match recorded {
            Ok(outcome) => {
                match &outcome {
                    ProcessOutcome::Scored { overall_band } => {
                        tracing::info!(job = %job.id, attempt = %attempt.id, band = overall_band, "Attempt scored");
                        self.notify(attempt, *overall_band, false);
                    }
                    ProcessOutcome::CompletedWithIssues { reason } => {
                        tracing::warn!(job = %job.id, attempt = %attempt.id, reason = %reason, "Attempt completed with issues");
                        self.notify(attempt, 0.0, true);
                    }
                    _ => {}
                }
                Ok(outcome)
            }
            // The attempt moved while the scorer was running; nothing was written.
            Err(PipelineError::Conflict(reason)) => self.abandon(job, reason).await,
            Err(err) => {
                tracing::error!(job = %job.id, error = %err, "Failed to record scoring result");
                self.fail_claimed(job, format!("failed to record scoring result: {}", err))
                    .await
            }
        }
    }

    /// Puts a claimed job through the retry policy. Only a failure of that write itself
    /// escapes.
    async fn fail_claimed(
        &self,
        job: &ScoringJob,
        error: String,
    ) -> Result<ProcessOutcome, PipelineError> {
        let resolved = match self.queue.fail(job, &error).await {
            Ok(resolved) => resolved,
            Err(PipelineError::Conflict(reason)) => return self.abandon(job, reason).await,
            Err(err) => {
                tracing::error!(job = %job.id, error = %err, "Failed to record failed scoring pass");
                return Err(err);
            }
        };

        let retry_count = resolved.job.retry_count;
        if resolved.job.status == JobStatus::Failed {
            tracing::error!(job = %job.id, attempt = %job.attempt_id, retry_count, error = %error, "Scoring retries exhausted");
            Ok(ProcessOutcome::Failed { retry_count, error })
        } else {
            tracing::warn!(job = %job.id, retry_count, error = %error, "Scoring pass failed, job requeued");
            Ok(ProcessOutcome::Requeued { retry_count, error })
        }
    }

    async fn abandon(
        &self,
        job: &ScoringJob,
        reason: String,
    ) -> Result<ProcessOutcome, PipelineError> {
        match self.queue.abandon(job, &reason).await? {
            Abandonment::Requeued => {
                tracing::info!(
                    job = %job.id,
                    attempt = %job.attempt_id,
                    "Attempt was resubmitted, scoring job returned to the queue"
                );
                Ok(ProcessOutcome::Requeued {
                    retry_count: job.retry_count,
                    error: reason,
                })
            }
            Abandonment::Abandoned | Abandonment::Skipped => {
                tracing::warn!(job = %job.id, reason = %reason, "Abandoning scoring job");
                Ok(ProcessOutcome::Abandoned { reason })
            }
        }
    }

    /// Detached; a failed notification never touches the job.
    fn notify(&self, attempt: &Attempt, overall_band: f64, completed_with_issues: bool) {
        let notifier = self.notifier.clone();
        let notification = ScoringNotification {
            learner_id: attempt.learner_id.clone(),
            attempt_id: attempt.id.clone(),
            skill_type: attempt.skill_type,
            overall_band,
            completed_with_issues,
        };
        tokio::spawn(async move {
            if let Err(err) = notifier.notify_scored(&notification).await {
                tracing::warn!(
                    attempt = %notification.attempt_id,
                    error = %err,
                    "Failed to notify learner"
                );
            }
        });
    }

    async fn score_writing(&self, attempt: &Attempt) -> Pass {
        let prompt = match self.store.find_prompt(&attempt.prompt_id).await {
            Ok(prompt) => prompt,
            Err(err) => return Pass::Failed(format!("failed to load prompt: {}", err)),
        };
        if prompt.is_none() {
            tracing::warn!(
                attempt = %attempt.id,
                prompt = %attempt.prompt_id,
                "Prompt missing, scoring essay without it"
            );
        }

        let essay = attempt.writing_content.as_deref().unwrap_or_default();
        match self
            .scorer
            .score_writing(prompt.as_ref().map(|p| p.text.as_str()), essay)
            .await
        {
            Ok(outcome) => Pass::Scored(outcome),
            Err(ScorerError::Unintelligible(reason)) => Pass::Unintelligible(reason),
            Err(err @ ScorerError::Unavailable(_)) => Pass::Failed(err.to_string()),
        }
    }

    async fn score_speaking(&self, attempt: &Attempt) -> Pass {
        let media = match self.selected_media(attempt).await {
            Ok(media) => media,
            Err(err) => return Pass::Failed(format!("failed to load recording: {}", err)),
        };
        let Some(media) = media else {
            return self.speaking_fallback(attempt, None, "no recording selected".to_string());
        };

        let download = retry_with_policy(&self.storage_retry, "download_recording", || {
            self.storage.download(&media.storage_key)
        })
        .await;

        let bytes = match download {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                return self.speaking_fallback(
                    attempt,
                    Some(&media),
                    format!("recording {} missing from storage", media.storage_key),
                )
            }
            Err(err) => {
                return self.speaking_fallback(
                    attempt,
                    Some(&media),
                    format!("failed to download recording: {}", err),
                )
            }
        };

        let audio = AudioInput {
            bytes,
            file_name: media.file_name.clone(),
            mime_type: media.mime_type.clone(),
        };
        match self.scorer.score_speaking_audio(audio).await {
            Ok(outcome) => Pass::Scored(outcome),
            Err(ScorerError::Unintelligible(reason)) => Pass::Unintelligible(reason),
            Err(err @ ScorerError::Unavailable(_)) => {
                self.speaking_fallback(attempt, Some(&media), err.to_string())
            }
        }
    }

    async fn selected_media(
        &self,
        attempt: &Attempt,
    ) -> Result<Option<AttemptMedia>, PipelineError> {
        let Some(media_id) = attempt.selected_media_id.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_media(media_id)
            .await?
            .filter(|media| media.attempt_id == attempt.id))
    }

    fn speaking_fallback(
        &self,
        attempt: &Attempt,
        media: Option<&AttemptMedia>,
        error: String,
    ) -> Pass {
        if !self.speaking_fallback_enabled {
            return Pass::Failed(error);
        }

        tracing::warn!(
            attempt = %attempt.id,
            error = %error,
            "Speaking scoring unavailable, using local fallback score"
        );
        Pass::Scored(fallback_outcome(
            media.map(|m| m.duration_seconds).unwrap_or_default(),
        ))
    }

    /// FAILED -> PROCESSING with the job reset to QUEUED. The previous score, if any,
    /// is removed.
    pub async fn request_rescore(&self, attempt_id: &str) -> Result<ScoringJob, PipelineError> {
        let attempt = self
            .store
            .transition_attempt(
                attempt_id,
                &[AttemptStatus::Failed],
                &AttemptTransition::to(AttemptStatus::Processing),
            )
            .await?;

        if attempt.is_none() {
            let current = self.store.find_attempt(attempt_id).await?.ok_or_else(|| {
                PipelineError::not_found(format!("attempt {} not found", attempt_id))
            })?;
            return Err(PipelineError::conflict(format!(
                "rescore is only available for FAILED attempts, attempt {} is {}",
                attempt_id,
                current.status.as_str()
            )));
        }

        let requeue = async {
            self.store.delete_score(attempt_id).await?;
            let job = self.queue.enqueue(attempt_id).await?;
            Ok::<_, PipelineError>(job)
        };

        match requeue.await {
            Ok(job) => {
                tracing::info!(attempt = %attempt_id, job = %job.id, "Rescore requested");
                Ok(job)
            }
            Err(err) => {
                self.rollback(attempt_id, AttemptStatus::Failed).await;
                Err(err)
            }
        }
    }

    /// Best-effort compensation; a failure here is logged, the original error wins.
    /// Rolling back to IN_PROGRESS also clears the submission stamp and recording.
    pub(crate) async fn rollback(&self, attempt_id: &str, to: AttemptStatus) {
        let change = match to {
            AttemptStatus::InProgress => AttemptTransition::to(to).reopened(),
            _ => AttemptTransition::to(to),
        };
        if let Err(err) = self
            .store
            .transition_attempt(attempt_id, &[AttemptStatus::Processing], &change)
            .await
        {
            tracing::error!(
                attempt = %attempt_id,
                error = %err,
                "Failed to roll attempt back to {}",
                to.as_str()
            );
        }
    }

    pub async fn get_scoring_result(
        &self,
        attempt: &Attempt,
    ) -> Result<ScoringResult, PipelineError> {
        let job = self.queue.find_for_attempt(&attempt.id).await?;
        let mut result = ScoringResult {
            attempt_id: attempt.id.clone(),
            status: attempt.status,
            score: None,
            message: None,
            can_rescore: false,
            job_status: job.as_ref().map(|j| j.status),
            retry_count: job.as_ref().map(|j| j.retry_count),
            teacher_score: attempt.teacher_score,
            teacher_comment: attempt.teacher_comment.clone(),
        };

        match attempt.status {
            AttemptStatus::InProgress => {
                result.message = Some("Attempt has not been submitted yet".to_string());
            }
            AttemptStatus::Processing => {
                result.message = Some("Scoring in progress".to_string());
            }
            AttemptStatus::Scored | AttemptStatus::EvaluatedByTeacher => {
                result.score = self.store.find_score(&attempt.id).await?;
                result.message = job.and_then(|j| j.error_message);
            }
            AttemptStatus::Failed => {
                result.can_rescore = true;
                result.message = Some(
                    job.and_then(|j| j.error_message)
                        .map(|err| format!("Scoring failed: {}", err))
                        .unwrap_or_else(|| "Scoring failed".to_string()),
                );
            }
        }

        Ok(result)
    }

    /// Processes up to `limit` QUEUED jobs, oldest first.
    pub async fn drain_pending(&self, limit: usize) -> Result<Vec<ProcessedJob>, PipelineError> {
        let pending = self.queue.list_pending(limit).await?;
        let mut processed = Vec::with_capacity(pending.len());

        for job in pending {
            let entry = match self.process_job(&job.id).await {
                Ok(outcome) => ProcessedJob {
                    job_id: job.id,
                    outcome: Some(outcome),
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(job = %job.id, error = %err, "Failed to process pending job");
                    ProcessedJob {
                        job_id: job.id,
                        outcome: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            processed.push(entry);
        }

        Ok(processed)
    }
}

/// Provisional band from the recording length: 5.0, +0.5 from 60 s, +0.5 more from 90 s.
pub fn fallback_band(duration_seconds: f64) -> f64 {
    let mut band = 5.0;
    if duration_seconds >= 60.0 {
        band += 0.5;
    }
    if duration_seconds >= 90.0 {
        band += 0.5;
    }
    normalize_band(band)
}

fn fallback_outcome(duration_seconds: f64) -> ScoringOutcome {
    let band = fallback_band(duration_seconds);
    ScoringOutcome {
        overall_band: band,
        confidence: Some(FALLBACK_CONFIDENCE),
        sub_scores: SubScores {
            fluency_coherence: Some(band),
            pronunciation: Some(band),
            lexical_resource: band,
            grammatical_range: band,
            ..SubScores::default()
        },
        feedback: "Automatic scoring was unavailable, so this provisional band is estimated \
                   from the length of your recording."
            .to_string(),
        detailed_feedback: crate::models::DetailedFeedback {
            strengths: Vec::new(),
            areas_for_improvement: Vec::new(),
            suggestions: vec![
                "Ask your teacher to review this attempt for a full assessment.".to_string(),
            ],
        },
        transcript: None,
        raw_response: json!({
            "source": "local_fallback",
            "duration_seconds": duration_seconds,
        }),
    }
}

fn build_score(attempt: &Attempt, outcome: ScoringOutcome) -> Score {
    Score {
        id: uuid::Uuid::new_v4().to_string(),
        attempt_id: attempt.id.clone(),
        skill_type: attempt.skill_type,
        overall_band: outcome.overall_band,
        confidence: outcome.confidence,
        sub_scores: outcome.sub_scores,
        feedback: outcome.feedback,
        detailed_feedback: outcome.detailed_feedback,
        transcript: outcome.transcript,
        raw_scorer_response: outcome.raw_response,
        created_at: time::now(),
    }
}

fn zero_score(attempt: &Attempt, reason: &str) -> Score {
    let (feedback, detailed_feedback) = unintelligible_feedback(attempt.skill_type, reason);
    let sub_scores = match attempt.skill_type {
        SkillType::Speaking => SubScores {
            fluency_coherence: Some(0.0),
            pronunciation: Some(0.0),
            ..SubScores::default()
        },
        SkillType::Writing => SubScores {
            task_achievement: Some(0.0),
            coherence_cohesion: Some(0.0),
            ..SubScores::default()
        },
    };

    Score {
        id: uuid::Uuid::new_v4().to_string(),
        attempt_id: attempt.id.clone(),
        skill_type: attempt.skill_type,
        overall_band: 0.0,
        confidence: Some(0.0),
        sub_scores,
        feedback,
        detailed_feedback,
        transcript: None,
        raw_scorer_response: json!({ "source": "scorer", "error": reason }),
        created_at: time::now(),
    }
}
