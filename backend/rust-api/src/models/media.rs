use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::time::bson_datetime_as_chrono;

/// Uploaded recording attached to a speaking attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptMedia {
    #[serde(rename = "_id")]
    pub id: String,
    pub attempt_id: String,
    pub storage_key: String,
    pub file_name: String,
    pub duration_seconds: f64,
    pub file_size: u64,
    pub mime_type: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(with = "bson_datetime_as_chrono")]
    pub uploaded_at: DateTime<Utc>,
}
