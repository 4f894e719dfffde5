use serde::Deserialize;
use validator::Validate;

use super::{SkillType, TaskType};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAttemptRequest {
    #[validate(length(min = 1, max = 128, message = "prompt_id must be 1-128 characters"))]
    pub prompt_id: String,
    pub skill_type: SkillType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateContentRequest {
    pub content: String,
    #[serde(default)]
    pub is_auto_save: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitSpeakingRequest {
    #[serde(default)]
    pub selected_media_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeacherEvaluationRequest {
    pub teacher_score: f64,
    #[serde(default)]
    pub teacher_comment: Option<String>,
}

/// Query of `POST /attempts/{id}/media`; the body is the raw recording.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaUploadQuery {
    pub file_name: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpsertPromptRequest {
    pub skill_type: SkillType,
    pub task_type: TaskType,
    #[validate(length(min = 1, max = 200, message = "title must be 1-200 characters"))]
    pub title: String,
    #[validate(length(min = 1, message = "text must not be empty"))]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobListQuery {
    #[serde(default = "default_job_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DrainRequest {
    #[serde(default = "default_job_limit")]
    pub limit: usize,
}

fn default_job_limit() -> usize {
    20
}
