use std::sync::Arc;

use serde::Serialize;

use crate::error::{PipelineError, ValidationCode};
use crate::metrics::SUBMISSIONS_TOTAL;
use crate::models::{Attempt, AttemptStatus, AttemptTransition, ScoringJob, SkillType};
use crate::services::attempt_service::{count_words, AttemptService};
use crate::services::dispatch::JobDispatcher;
use crate::services::scoring_orchestrator::ScoringOrchestrator;
use crate::store::PipelineStore;
use crate::utils::time;

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionAccepted {
    pub attempt_id: String,
    pub status: AttemptStatus,
    pub job_id: String,
}

/// Entry point for learner submissions. Validates, moves the attempt to PROCESSING and
/// hands the job off without waiting for scoring.
pub struct SubmissionGateway {
    store: Arc<dyn PipelineStore>,
    attempts: Arc<AttemptService>,
    orchestrator: Arc<ScoringOrchestrator>,
    dispatcher: Arc<dyn JobDispatcher>,
}

impl SubmissionGateway {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        attempts: Arc<AttemptService>,
        orchestrator: Arc<ScoringOrchestrator>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            store,
            attempts,
            orchestrator,
            dispatcher,
        }
    }

    pub async fn submit_speaking(
        &self,
        learner_id: &str,
        attempt_id: &str,
        selected_media_id: Option<&str>,
    ) -> Result<SubmissionAccepted, PipelineError> {
        let result = self
            .try_submit_speaking(learner_id, attempt_id, selected_media_id)
            .await;
        record(SkillType::Speaking, &result);
        result
    }

    async fn try_submit_speaking(
        &self,
        learner_id: &str,
        attempt_id: &str,
        selected_media_id: Option<&str>,
    ) -> Result<SubmissionAccepted, PipelineError> {
        let attempt = self
            .open_attempt(learner_id, attempt_id, SkillType::Speaking)
            .await?;

        let media_id = selected_media_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                PipelineError::validation(
                    ValidationCode::RecordingNotSelected,
                    "select a recording before submitting",
                )
            })?;

        let owned = self
            .store
            .find_media(media_id)
            .await?
            .is_some_and(|media| media.attempt_id == attempt.id);
        if !owned {
            return Err(PipelineError::validation(
                ValidationCode::RecordingNotSelected,
                format!("recording {} does not belong to this attempt", media_id),
            ));
        }

        self.attempts
            .transition(
                attempt_id,
                &[AttemptStatus::InProgress],
                AttemptTransition::to(AttemptStatus::Processing)
                    .submitted(time::now())
                    .with_selected_media(media_id),
            )
            .await?;

        self.hand_off(attempt_id).await
    }

    pub async fn submit_writing(
        &self,
        learner_id: &str,
        attempt_id: &str,
    ) -> Result<SubmissionAccepted, PipelineError> {
        let result = self.try_submit_writing(learner_id, attempt_id).await;
        record(SkillType::Writing, &result);
        result
    }

    async fn try_submit_writing(
        &self,
        learner_id: &str,
        attempt_id: &str,
    ) -> Result<SubmissionAccepted, PipelineError> {
        let attempt = self
            .open_attempt(learner_id, attempt_id, SkillType::Writing)
            .await?;
        let prompt = self.attempts.prompt(&attempt.prompt_id).await?;

        let word_count = count_words(attempt.writing_content.as_deref().unwrap_or_default());
        let minimum = prompt.task_type.min_word_count();
        if word_count < minimum {
            return Err(PipelineError::validation(
                ValidationCode::WordCountTooLow,
                format!(
                    "essay has {} words, at least {} are required",
                    word_count, minimum
                ),
            ));
        }

        self.attempts
            .transition(
                attempt_id,
                &[AttemptStatus::InProgress],
                AttemptTransition::to(AttemptStatus::Processing).submitted(time::now()),
            )
            .await?;

        self.hand_off(attempt_id).await
    }

    /// Rescore for an attempt owned by `learner_id`; dispatched like a fresh submission.
    pub async fn request_rescore(
        &self,
        learner_id: &str,
        attempt_id: &str,
    ) -> Result<ScoringJob, PipelineError> {
        self.attempts.get_attempt(learner_id, attempt_id).await?;
        let job = self.orchestrator.request_rescore(attempt_id).await?;

        // The job is durable and QUEUED; the worker sweep picks it up if this push is lost.
        if let Err(err) = self.dispatcher.dispatch(&job.id).await {
            tracing::warn!(job = %job.id, error = %err, "Failed to dispatch rescore job");
        }
        Ok(job)
    }

    async fn open_attempt(
        &self,
        learner_id: &str,
        attempt_id: &str,
        skill: SkillType,
    ) -> Result<Attempt, PipelineError> {
        let attempt = self.attempts.get_attempt(learner_id, attempt_id).await?;
        if attempt.skill_type != skill {
            return Err(PipelineError::validation(
                ValidationCode::SkillMismatch,
                format!("attempt {} is not a {} attempt", attempt_id, skill.as_str()),
            ));
        }
        if attempt.status != AttemptStatus::InProgress {
            return Err(PipelineError::conflict(format!(
                "attempt {} was already submitted ({})",
                attempt_id,
                attempt.status.as_str()
            )));
        }
        Ok(attempt)
    }

    /// Enqueue and dispatch. Any failure rolls the attempt back to IN_PROGRESS so the
    /// learner is never left PROCESSING without a job.
    async fn hand_off(&self, attempt_id: &str) -> Result<SubmissionAccepted, PipelineError> {
        let handed_off = async {
            let job = self.orchestrator.queue().enqueue(attempt_id).await?;
            self.dispatcher
                .dispatch(&job.id)
                .await
                .map_err(|e| PipelineError::internal(format!("failed to dispatch job: {}", e)))?;
            Ok::<_, PipelineError>(job)
        };

        match handed_off.await {
            Ok(job) => {
                tracing::info!(attempt = %attempt_id, job = %job.id, "Attempt submitted");
                Ok(SubmissionAccepted {
                    attempt_id: attempt_id.to_string(),
                    status: AttemptStatus::Processing,
                    job_id: job.id,
                })
            }
            Err(err) => {
                tracing::error!(
                    attempt = %attempt_id,
                    error = %err,
                    "Submission hand-off failed, rolling attempt back"
                );
                self.orchestrator
                    .rollback(attempt_id, AttemptStatus::InProgress)
                    .await;
                Err(err)
            }
        }
    }
}

fn record(skill: SkillType, result: &Result<SubmissionAccepted, PipelineError>) {
    let outcome = match result {
        Ok(_) => "accepted",
        Err(PipelineError::Validation { .. }) => "invalid",
        Err(PipelineError::Conflict(_)) => "conflict",
        Err(_) => "error",
    };
    SUBMISSIONS_TOTAL
        .with_label_values(&[skill.as_str(), outcome])
        .inc();
}
