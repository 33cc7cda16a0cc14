use std::{collections::HashMap, sync::Arc};

use shared::protocol::UploadedFile;
use tokio::sync::RwLock;

/// The client's local view of the user's files, keyed by storage key.
#[derive(Clone, Default)]
pub struct FileCatalog {
    files: Arc<RwLock<HashMap<String, UploadedFile>>>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record. Returns `true` when the key was not known yet.
    pub async fn upsert(&self, file: UploadedFile) -> bool {
        let mut files = self.files.write().await;
        files.insert(file.file_key.clone(), file).is_none()
    }

    pub async fn extend(&self, batch: impl IntoIterator<Item = UploadedFile>) {
        let mut files = self.files.write().await;
        for file in batch {
            files.insert(file.file_key.clone(), file);
        }
    }

    pub async fn get(&self, file_key: &str) -> Option<UploadedFile> {
        self.files.read().await.get(file_key).cloned()
    }

    /// Newest first.
    pub async fn list(&self) -> Vec<UploadedFile> {
        let mut files: Vec<_> = self.files.read().await.values().cloned().collect();
        files.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.file_id.0.cmp(&a.file_id.0))
        });
        files
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}
