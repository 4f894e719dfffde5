use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::time::{bson_datetime_as_chrono, bson_datetime_as_chrono_option};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// A live job is one that a worker will (or already does) own.
    pub fn is_live(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }
}

/// One scoring request per attempt; `attempt_id` is unique across the collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringJob {
    #[serde(rename = "_id")]
    pub id: String,
    pub attempt_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(with = "bson_datetime_as_chrono")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "bson_datetime_as_chrono_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "bson_datetime_as_chrono_option")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScoringJob {
    pub fn queued(attempt_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            status: JobStatus::Queued,
            retry_count: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}
