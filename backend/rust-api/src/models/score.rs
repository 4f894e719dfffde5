use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SkillType;
use crate::utils::time::bson_datetime_as_chrono;

/// Criterion bands. Speaking fills fluency/pronunciation, writing fills
/// task achievement/coherence; lexical and grammar are shared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluency_coherence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pronunciation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_achievement: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coherence_cohesion: Option<f64>,
    pub lexical_resource: f64,
    pub grammatical_range: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailedFeedback {
    pub strengths: Vec<String>,
    pub areas_for_improvement: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    #[serde(rename = "_id")]
    pub id: String,
    pub attempt_id: String,
    pub skill_type: SkillType,
    pub overall_band: f64,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub sub_scores: SubScores,
    pub feedback: String,
    pub detailed_feedback: DetailedFeedback,
    #[serde(default)]
    pub transcript: Option<String>,
    pub raw_scorer_response: serde_json::Value,
    #[serde(with = "bson_datetime_as_chrono")]
    pub created_at: DateTime<Utc>,
}
