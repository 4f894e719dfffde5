use std::sync::Arc;

use crate::error::{PipelineError, ValidationCode};
use crate::models::{AttemptMedia, AttemptStatus, SkillType};
use crate::services::attempt_service::AttemptService;
use crate::services::storage::{media_key, StorageProvider};
use crate::store::PipelineStore;
use crate::utils::time;

pub const MIN_DURATION_SECONDS: f64 = 30.0;
pub const MAX_DURATION_SECONDS: f64 = 120.0;
pub const MAX_FILE_SIZE_BYTES: usize = 25 * 1024 * 1024;
pub const MAX_FILE_NAME_CHARS: usize = 255;

pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "audio/webm",
    "audio/ogg",
    "audio/mpeg",
    "audio/mp3",
    "audio/wav",
    "audio/x-wav",
    "audio/wave",
    "audio/mp4",
    "audio/x-m4a",
    "audio/m4a",
    "audio/flac",
    "video/webm",
    "video/mp4",
];

#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub duration_seconds: f64,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl MediaUpload {
    /// Checks the upload before any state is touched.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.duration_seconds.is_finite()
            || !(MIN_DURATION_SECONDS..=MAX_DURATION_SECONDS).contains(&self.duration_seconds)
        {
            return Err(PipelineError::validation(
                ValidationCode::InvalidDuration,
                format!(
                    "recording must last between {} and {} seconds",
                    MIN_DURATION_SECONDS, MAX_DURATION_SECONDS
                ),
            ));
        }

        if !ALLOWED_MIME_TYPES.contains(&base_mime_type(&self.mime_type).as_str()) {
            return Err(PipelineError::validation(
                ValidationCode::InvalidMimeType,
                format!("unsupported media type {}", self.mime_type),
            ));
        }

        let name_len = self.file_name.chars().count();
        if name_len == 0
            || name_len > MAX_FILE_NAME_CHARS
            || self
                .file_name
                .chars()
                .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(PipelineError::validation(
                ValidationCode::InvalidFileName,
                "file name must be 1-255 characters without path separators",
            ));
        }

        if self.bytes.is_empty() {
            return Err(PipelineError::validation(
                ValidationCode::EmptyFile,
                "recording is empty",
            ));
        }
        if self.bytes.len() > MAX_FILE_SIZE_BYTES {
            return Err(PipelineError::validation(
                ValidationCode::FileTooLarge,
                "recording exceeds 25 MiB",
            ));
        }

        Ok(())
    }
}

/// `audio/webm; codecs=opus` -> `audio/webm`
fn base_mime_type(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub struct MediaService {
    store: Arc<dyn PipelineStore>,
    storage: Arc<dyn StorageProvider>,
    attempts: Arc<AttemptService>,
}

impl MediaService {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        storage: Arc<dyn StorageProvider>,
        attempts: Arc<AttemptService>,
    ) -> Self {
        Self {
            store,
            storage,
            attempts,
        }
    }

    pub async fn attach(
        &self,
        learner_id: &str,
        attempt_id: &str,
        upload: MediaUpload,
    ) -> Result<AttemptMedia, PipelineError> {
        upload.validate()?;

        let attempt = self.attempts.get_attempt(learner_id, attempt_id).await?;
        if attempt.skill_type != SkillType::Speaking {
            return Err(PipelineError::validation(
                ValidationCode::SkillMismatch,
                "recordings can only be attached to speaking attempts",
            ));
        }
        if attempt.status != AttemptStatus::InProgress {
            return Err(PipelineError::conflict(format!(
                "attempt {} is {}",
                attempt_id,
                attempt.status.as_str()
            )));
        }

        let media_id = uuid::Uuid::new_v4().to_string();
        let key = media_key(attempt_id, &media_id, &upload.file_name);
        let file_size = upload.bytes.len() as u64;
        let mime_type = base_mime_type(&upload.mime_type);

        let stored = self
            .storage
            .upload(upload.bytes, &key, &mime_type)
            .await
            .map_err(|e| PipelineError::internal(format!("failed to store recording: {}", e)))?;

        let media = AttemptMedia {
            id: media_id,
            attempt_id: attempt_id.to_string(),
            storage_key: stored.key,
            file_name: upload.file_name,
            duration_seconds: upload.duration_seconds,
            file_size,
            mime_type,
            url: Some(stored.url),
            uploaded_at: time::now(),
        };
        self.store.insert_media(&media).await?;

        tracing::info!(
            attempt = %attempt_id,
            media = %media.id,
            size = file_size,
            "Recording attached"
        );
        Ok(media)
    }

    /// Most recent first.
    pub async fn list_for(
        &self,
        learner_id: &str,
        attempt_id: &str,
    ) -> Result<Vec<AttemptMedia>, PipelineError> {
        self.attempts.get_attempt(learner_id, attempt_id).await?;
        Ok(self.store.list_media(attempt_id).await?)
    }

    pub async fn detach(
        &self,
        learner_id: &str,
        attempt_id: &str,
        media_id: &str,
    ) -> Result<(), PipelineError> {
        self.attempts.get_attempt(learner_id, attempt_id).await?;
        let media = self
            .store
            .find_media(media_id)
            .await?
            .filter(|media| media.attempt_id == attempt_id)
            .ok_or_else(|| PipelineError::not_found(format!("media {} not found", media_id)))?;

        if !self.store.delete_media(&media.id).await? {
            return Err(PipelineError::conflict(format!(
                "attempt {} is no longer in progress",
                attempt_id
            )));
        }

        tracing::info!(attempt = %attempt_id, media = %media_id, "Recording detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Prompt, TaskType};
    use crate::services::storage::MemoryStorage;
    use crate::store::MemoryPipelineStore;

    fn upload() -> MediaUpload {
        MediaUpload {
            file_name: "answer.webm".into(),
            duration_seconds: 45.0,
            mime_type: "audio/webm;codecs=opus".into(),
            bytes: vec![1, 2, 3, 4],
        }
    }

    async fn setup() -> (MediaService, Arc<AttemptService>, Arc<MemoryStorage>) {
        let store: Arc<dyn PipelineStore> = Arc::new(MemoryPipelineStore::new());
        let storage = Arc::new(MemoryStorage::new());
        let attempts = Arc::new(AttemptService::new(store.clone()));
        attempts
            .upsert_prompt(Prompt {
                id: "talk".into(),
                skill_type: SkillType::Speaking,
                task_type: TaskType::SpeakingPart2,
                title: "A journey".into(),
                text: "Describe a memorable journey.".into(),
            })
            .await
            .unwrap();
        let media = MediaService::new(store, storage.clone(), attempts.clone());
        (media, attempts, storage)
    }

    #[test]
    fn duration_bounds_are_inclusive() {
        for (duration, ok) in [(29.9, false), (30.0, true), (120.0, true), (120.5, false)] {
            let mut candidate = upload();
            candidate.duration_seconds = duration;
            assert_eq!(candidate.validate().is_ok(), ok, "duration {}", duration);
        }
    }

    #[test]
    fn rejects_bad_metadata_with_reason_codes() {
        let mut candidate = upload();
        candidate.mime_type = "application/pdf".into();
        assert_eq!(candidate.validate().unwrap_err().code(), "INVALID_MIME_TYPE");

        let mut candidate = upload();
        candidate.file_name = "../etc/passwd".into();
        assert_eq!(candidate.validate().unwrap_err().code(), "INVALID_FILE_NAME");

        let mut candidate = upload();
        candidate.file_name = String::new();
        assert_eq!(candidate.validate().unwrap_err().code(), "INVALID_FILE_NAME");

        let mut candidate = upload();
        candidate.bytes.clear();
        assert_eq!(candidate.validate().unwrap_err().code(), "EMPTY_FILE");

        let mut candidate = upload();
        candidate.bytes = vec![0; MAX_FILE_SIZE_BYTES + 1];
        assert_eq!(candidate.validate().unwrap_err().code(), "FILE_TOO_LARGE");
    }

    #[tokio::test]
    async fn attach_stores_bytes_and_lists_newest_first() {
        let (media, attempts, storage) = setup().await;
        let attempt = attempts
            .create_attempt("learner", "talk", SkillType::Speaking)
            .await
            .unwrap();

        let first = media.attach("learner", &attempt.id, upload()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = media.attach("learner", &attempt.id, upload()).await.unwrap();

        assert_eq!(first.mime_type, "audio/webm");
        assert!(storage.contains(&first.storage_key));
        assert!(first
            .storage_key
            .starts_with(&format!("attempts/{}/{}-", attempt.id, first.id)));

        let listed = media.list_for("learner", &attempt.id).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    }

    #[tokio::test]
    async fn detach_only_while_in_progress() {
        let (media, attempts, _) = setup().await;
        let attempt = attempts
            .create_attempt("learner", "talk", SkillType::Speaking)
            .await
            .unwrap();
        let first = media.attach("learner", &attempt.id, upload()).await.unwrap();
        let second = media.attach("learner", &attempt.id, upload()).await.unwrap();

        media.detach("learner", &attempt.id, &first.id).await.unwrap();

        attempts
            .transition(
                &attempt.id,
                &[AttemptStatus::InProgress],
                crate::models::AttemptTransition::to(AttemptStatus::Processing),
            )
            .await
            .unwrap();
        let err = media
            .detach("learner", &attempt.id, &second.id)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));

        let err = media
            .attach("learner", &attempt.id, upload())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }
}
