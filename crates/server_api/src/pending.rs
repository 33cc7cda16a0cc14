use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::domain::{FolderId, UserId};
use tokio::time::Instant;

/// An upload whose destination was issued but whose arrival is unconfirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub file_key: String,
    pub owner_id: UserId,
    pub folder_id: Option<FolderId>,
    pub file_name: String,
    pub size_hint: u64,
    pub mime_hint: String,
    pub created_at: Instant,
}

#[derive(Clone, Default)]
pub struct PendingUploadStore {
    uploads: Arc<Mutex<HashMap<String, PendingUpload>>>,
}

impl PendingUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, upload: PendingUpload) {
        self.lock().insert(upload.file_key.clone(), upload);
    }

    pub fn get(&self, file_key: &str) -> Option<PendingUpload> {
        self.lock().get(file_key).cloned()
    }

    /// Removes and returns the entry. Only one caller ever receives a given upload.
    pub fn take(&self, file_key: &str) -> Option<PendingUpload> {
        self.lock().remove(file_key)
    }

    /// Entries created at least `min_age` ago, oldest first.
    pub fn older_than(&self, min_age: Duration) -> Vec<PendingUpload> {
        let now = Instant::now();
        let mut due: Vec<_> = self
            .lock()
            .values()
            .filter(|upload| now.saturating_duration_since(upload.created_at) >= min_age)
            .cloned()
            .collect();
        due.sort_by_key(|upload| upload.created_at);
        due
    }

    /// Drops entries older than `max_age` and returns their keys.
    pub fn evict_older_than(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut uploads = self.lock();
        let expired: Vec<String> = uploads
            .values()
            .filter(|upload| now.saturating_duration_since(upload.created_at) > max_age)
            .map(|upload| upload.file_key.clone())
            .collect();
        for key in &expired {
            uploads.remove(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingUpload>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/pending_tests.rs"]
mod tests;
