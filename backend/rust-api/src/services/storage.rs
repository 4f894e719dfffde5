use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, key: &str, content_type: &str) -> Result<StoredObject>;

    /// `None` when no object exists under `key`.
    async fn download(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Object key for an uploaded recording.
pub fn media_key(attempt_id: &str, media_id: &str, file_name: &str) -> String {
    format!(
        "attempts/{}/{}-{}",
        attempt_id,
        media_id,
        sanitize_file_name(file_name)
    )
}

fn sanitize_file_name(file_name: &str) -> String {
    let cleaned: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches('.').is_empty() {
        "recording".to_string()
    } else {
        cleaned
    }
}

/// Process-local storage used by tests and `APP_ENV=memory` runs.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|mut objects| objects.remove(key).is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn upload(&self, bytes: Vec<u8>, key: &str, _content_type: &str) -> Result<StoredObject> {
        self.objects
            .lock()
            .map_err(|_| anyhow!("memory storage lock poisoned"))?
            .insert(key.to_string(), bytes);

        Ok(StoredObject {
            key: key.to_string(),
            url: format!("memory://{}", key),
        })
    }

    async fn download(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory storage lock poisoned"))?;
        Ok(objects.get(key).cloned())
    }
}
