use std::sync::Arc;

use crate::error::{PipelineError, ValidationCode};
use crate::models::{
    Attempt, AttemptStatus, AttemptTransition, Prompt, SkillType, TeacherEvaluation,
};
use crate::store::PipelineStore;
use crate::utils::time;

pub const MAX_TEACHER_COMMENT_CHARS: usize = 2000;

/// Whitespace-delimited token count.
pub fn count_words(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

pub fn is_valid_band(score: f64) -> bool {
    score.is_finite() && (0.0..=9.0).contains(&score) && (score * 2.0).fract() == 0.0
}

pub struct AttemptService {
    store: Arc<dyn PipelineStore>,
}

impl AttemptService {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    pub async fn upsert_prompt(&self, prompt: Prompt) -> Result<Prompt, PipelineError> {
        if prompt.task_type.skill() != prompt.skill_type {
            return Err(PipelineError::validation(
                ValidationCode::SkillMismatch,
                format!(
                    "task type {:?} does not belong to skill {}",
                    prompt.task_type,
                    prompt.skill_type.as_str()
                ),
            ));
        }

        self.store.upsert_prompt(&prompt).await?;
        tracing::info!(prompt = %prompt.id, "Prompt upserted");
        Ok(prompt)
    }

    pub async fn prompt(&self, prompt_id: &str) -> Result<Prompt, PipelineError> {
        self.store
            .find_prompt(prompt_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("prompt {} not found", prompt_id)))
    }

    /// Starts an IN_PROGRESS attempt. A learner may hold only one open writing attempt.
    pub async fn create_attempt(
        &self,
        learner_id: &str,
        prompt_id: &str,
        skill_type: SkillType,
    ) -> Result<Attempt, PipelineError> {
        let prompt = self.prompt(prompt_id).await?;
        if prompt.skill_type != skill_type {
            return Err(PipelineError::validation(
                ValidationCode::SkillMismatch,
                format!(
                    "prompt {} is a {} prompt",
                    prompt_id,
                    prompt.skill_type.as_str()
                ),
            ));
        }

        let attempt = Attempt::new(learner_id, prompt_id, skill_type, time::now());
        self.store.insert_attempt(&attempt).await?;

        tracing::info!(
            attempt = %attempt.id,
            learner = %learner_id,
            skill = skill_type.as_str(),
            "Attempt created"
        );
        Ok(attempt)
    }

    /// Loads an attempt without an ownership check; pipeline-internal.
    pub async fn load(&self, attempt_id: &str) -> Result<Attempt, PipelineError> {
        self.store
            .find_attempt(attempt_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("attempt {} not found", attempt_id)))
    }

    /// Foreign attempts are reported as missing so their existence is not leaked.
    pub async fn get_attempt(
        &self,
        learner_id: &str,
        attempt_id: &str,
    ) -> Result<Attempt, PipelineError> {
        let attempt = self.load(attempt_id).await?;
        if attempt.learner_id != learner_id {
            return Err(PipelineError::not_found(format!(
                "attempt {} not found",
                attempt_id
            )));
        }
        Ok(attempt)
    }

    pub async fn update_writing_content(
        &self,
        learner_id: &str,
        attempt_id: &str,
        content: &str,
        is_auto_save: bool,
    ) -> Result<u32, PipelineError> {
        let attempt = self.get_attempt(learner_id, attempt_id).await?;
        if attempt.skill_type != SkillType::Writing {
            return Err(PipelineError::validation(
                ValidationCode::SkillMismatch,
                "only writing attempts carry text content",
            ));
        }
        if attempt.status != AttemptStatus::InProgress {
            return Err(PipelineError::conflict(format!(
                "attempt {} is {}",
                attempt_id,
                attempt.status.as_str()
            )));
        }

        let word_count = count_words(content);
        let saved = self
            .store
            .save_writing_content(attempt_id, content, word_count, time::now())
            .await?;
        if !saved {
            return Err(PipelineError::conflict(format!(
                "attempt {} is no longer in progress",
                attempt_id
            )));
        }

        tracing::debug!(
            attempt = %attempt_id,
            word_count,
            is_auto_save,
            "Writing content saved"
        );
        Ok(word_count)
    }

    /// Conditional status change; `Conflict` when the current status is not in `from`.
    pub async fn transition(
        &self,
        attempt_id: &str,
        from: &[AttemptStatus],
        change: AttemptTransition,
    ) -> Result<Attempt, PipelineError> {
        match self
            .store
            .transition_attempt(attempt_id, from, &change)
            .await?
        {
            Some(attempt) => Ok(attempt),
            None => {
                let current = self.load(attempt_id).await?;
                Err(PipelineError::conflict(format!(
                    "attempt {} is {}, expected one of [{}]",
                    attempt_id,
                    current.status.as_str(),
                    from.iter()
                        .map(AttemptStatus::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                )))
            }
        }
    }

    /// Teacher override of a machine score. Re-evaluation replaces the previous one.
    pub async fn evaluate_by_teacher(
        &self,
        teacher_id: &str,
        attempt_id: &str,
        teacher_score: f64,
        teacher_comment: Option<String>,
    ) -> Result<Attempt, PipelineError> {
        if !is_valid_band(teacher_score) {
            return Err(PipelineError::validation(
                ValidationCode::InvalidTeacherScore,
                "teacher score must be between 0.0 and 9.0 in steps of 0.5",
            ));
        }
        let comment = teacher_comment
            .map(|comment| comment.trim().to_string())
            .filter(|comment| !comment.is_empty());
        if comment
            .as_ref()
            .is_some_and(|comment| comment.chars().count() > MAX_TEACHER_COMMENT_CHARS)
        {
            return Err(PipelineError::validation(
                ValidationCode::CommentTooLong,
                format!(
                    "teacher comment exceeds {} characters",
                    MAX_TEACHER_COMMENT_CHARS
                ),
            ));
        }

        let evaluation = TeacherEvaluation {
            teacher_id: teacher_id.to_string(),
            score: teacher_score,
            comment,
            evaluated_at: time::now(),
        };

        let attempt = self
            .transition(
                attempt_id,
                &[AttemptStatus::Scored, AttemptStatus::EvaluatedByTeacher],
                AttemptTransition::to(AttemptStatus::EvaluatedByTeacher).with_evaluation(evaluation),
            )
            .await?;

        tracing::info!(
            attempt = %attempt_id,
            teacher = %teacher_id,
            score = teacher_score,
            "Attempt evaluated by teacher"
        );
        Ok(attempt)
    }
}
