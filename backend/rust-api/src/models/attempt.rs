use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::time::{bson_datetime_as_chrono, bson_datetime_as_chrono_option};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillType {
    Speaking,
    Writing,
}

impl SkillType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillType::Speaking => "speaking",
            SkillType::Writing => "writing",
        }
    }
}

/// Attempt lifecycle. IN_PROGRESS and PROCESSING are the only non-terminal states;
/// FAILED re-enters PROCESSING through a rescore request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    InProgress,
    Processing,
    Scored,
    EvaluatedByTeacher,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "IN_PROGRESS",
            AttemptStatus::Processing => "PROCESSING",
            AttemptStatus::Scored => "SCORED",
            AttemptStatus::EvaluatedByTeacher => "EVALUATED_BY_TEACHER",
            AttemptStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::InProgress | AttemptStatus::Processing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(rename = "_id")]
    pub id: String,
    pub learner_id: String,
    pub prompt_id: String,
    pub skill_type: SkillType,
    pub status: AttemptStatus,
    #[serde(default)]
    pub writing_content: Option<String>,
    #[serde(default)]
    pub word_count: u32,
    #[serde(default)]
    pub selected_media_id: Option<String>,
    #[serde(with = "bson_datetime_as_chrono")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_datetime_as_chrono")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "bson_datetime_as_chrono_option")]
    pub last_saved_at: Option<DateTime<Utc>>,
    #[serde(default, with = "bson_datetime_as_chrono_option")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, with = "bson_datetime_as_chrono_option")]
    pub scored_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub teacher_score: Option<f64>,
    #[serde(default)]
    pub teacher_comment: Option<String>,
    #[serde(default)]
    pub evaluated_by: Option<String>,
    #[serde(default, with = "bson_datetime_as_chrono_option")]
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn new(learner_id: &str, prompt_id: &str, skill_type: SkillType, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            learner_id: learner_id.to_string(),
            prompt_id: prompt_id.to_string(),
            skill_type,
            status: AttemptStatus::InProgress,
            writing_content: None,
            word_count: 0,
            selected_media_id: None,
            created_at: now,
            started_at: now,
            last_saved_at: None,
            submitted_at: None,
            scored_at: None,
            teacher_score: None,
            teacher_comment: None,
            evaluated_by: None,
            evaluated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherEvaluation {
    pub teacher_id: String,
    pub score: f64,
    pub comment: Option<String>,
    #[serde(with = "bson_datetime_as_chrono")]
    pub evaluated_at: DateTime<Utc>,
}

/// Field changes applied together with a conditional status transition.
#[derive(Debug, Clone)]
pub struct AttemptTransition {
    pub to: AttemptStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub selected_media_id: Option<String>,
    pub evaluation: Option<TeacherEvaluation>,
    /// Clears `submitted_at` and `selected_media_id` (submission rolled back).
    pub reopen: bool,
}

impl AttemptTransition {
    pub fn to(status: AttemptStatus) -> Self {
        Self {
            to: status,
            submitted_at: None,
            selected_media_id: None,
            evaluation: None,
            reopen: false,
        }
    }

    pub fn reopened(mut self) -> Self {
        self.reopen = true;
        self
    }

    pub fn submitted(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = Some(at);
        self
    }

    pub fn with_selected_media(mut self, media_id: &str) -> Self {
        self.selected_media_id = Some(media_id.to_string());
        self
    }

    pub fn with_evaluation(mut self, evaluation: TeacherEvaluation) -> Self {
        self.evaluation = Some(evaluation);
        self
    }

    pub fn apply(&self, attempt: &mut Attempt) {
        attempt.status = self.to;
        if self.reopen {
            attempt.submitted_at = None;
            attempt.selected_media_id = None;
        }
        if let Some(at) = self.submitted_at {
            attempt.submitted_at = Some(at);
        }
        if let Some(ref media_id) = self.selected_media_id {
            attempt.selected_media_id = Some(media_id.clone());
        }
        if let Some(ref evaluation) = self.evaluation {
            attempt.teacher_score = Some(evaluation.score);
            attempt.teacher_comment = evaluation.comment.clone();
            attempt.evaluated_by = Some(evaluation.teacher_id.clone());
            attempt.evaluated_at = Some(evaluation.evaluated_at);
        }
    }
}
