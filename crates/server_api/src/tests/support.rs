use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use event_hub::{EventHub, Mailbox};
use shared::{domain::UserId, protocol::StreamEvent};
use storage::Storage;
use tokio::time::Instant;

use crate::{
    ApiContext, PendingUpload, PendingUploadStore, PrepareUploadRequest, PreparedUpload,
    ProviderError, ProviderFile, UploadProvider,
};

pub const SECRET: &str = "sk_test_secret";

#[derive(Default)]
pub struct FakeProvider {
    pub prepared: Mutex<Vec<PrepareUploadRequest>>,
    pub uploaded: Mutex<HashMap<String, ProviderFile>>,
    pub lookups: Mutex<Vec<Vec<String>>>,
    pub deleted: Mutex<Vec<Vec<String>>>,
    /// Lookups that fail before the provider starts answering.
    pub failing_lookups: AtomicUsize,
    next_key: AtomicUsize,
}

impl FakeProvider {
    pub fn mark_uploaded(&self, key: &str) {
        self.uploaded.lock().expect("lock").insert(
            key.to_string(),
            ProviderFile {
                key: key.to_string(),
                name: format!("{key}.png"),
                url: format!("https://files.example/f/{key}"),
            },
        );
    }
}

#[async_trait]
impl UploadProvider for FakeProvider {
    async fn prepare_upload(
        &self,
        request: &PrepareUploadRequest,
    ) -> Result<PreparedUpload, ProviderError> {
        self.prepared.lock().expect("lock").push(request.clone());
        let key = format!("key-{}", self.next_key.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(PreparedUpload {
            url: format!("https://uploads.example/{key}"),
            key,
            fields: Default::default(),
        })
    }

    async fn find_uploaded(
        &self,
        file_keys: &[String],
    ) -> Result<Vec<Option<ProviderFile>>, ProviderError> {
        self.lookups.lock().expect("lock").push(file_keys.to_vec());
        if self
            .failing_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::Status(reqwest::StatusCode::BAD_GATEWAY));
        }
        let uploaded = self.uploaded.lock().expect("lock");
        Ok(file_keys.iter().map(|key| uploaded.get(key).cloned()).collect())
    }

    async fn delete_files(&self, file_keys: &[String]) -> Result<(), ProviderError> {
        self.deleted.lock().expect("lock").push(file_keys.to_vec());
        Ok(())
    }
}

pub async fn setup() -> (ApiContext, Arc<FakeProvider>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let provider = Arc::new(FakeProvider::default());
    let ctx = ApiContext {
        storage,
        hub: EventHub::new(),
        pending: PendingUploadStore::new(),
        provider: provider.clone(),
        callback_secret: SECRET.to_string(),
        api_url: "http://localhost:3001".to_string(),
    };
    (ctx, provider)
}

pub async fn connect(ctx: &ApiContext, user_id: UserId, name: &str) -> Mailbox<StreamEvent> {
    let mailbox = Mailbox::unbounded();
    ctx.hub
        .register_connection(user_id, name.into(), mailbox.clone())
        .await;
    mailbox
}

pub fn pending_since(key: &str, owner: UserId, age: Duration) -> PendingUpload {
    PendingUpload {
        file_key: key.to_string(),
        owner_id: owner,
        folder_id: None,
        file_name: format!("{key}.png"),
        size_hint: 4096,
        mime_hint: "image/png".to_string(),
        created_at: Instant::now().checked_sub(age).expect("instant in range"),
    }
}
