use std::sync::Arc;

use event_hub::{current_user, EventHub};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{
        InitiateUploadRequest, InitiateUploadResponse, ListFilesResponse, StreamEvent,
        UploadMetadata, UploadedFile, MAX_FILE_SIZE_BYTES, MAX_KEYS_PER_LOOKUP,
    },
};
use storage::{NewFile, Storage};
use tokio::time::Instant;
use tracing::{debug, info};

mod callback;
mod folders;
mod pending;
mod provider;
mod reconcile;

pub use callback::{handle_upload_callback, sign_callback, verify_callback_signature, CallbackError};
pub use folders::{create_folder, delete_files, delete_folders, list_folders, move_files};
pub use pending::{PendingUpload, PendingUploadStore};
pub use provider::{
    HttpUploadProvider, PrepareUploadRequest, PreparedUpload, ProviderError, ProviderFile,
    UploadProvider,
};
pub use reconcile::{reconcile_pending_uploads, spawn_reconciler, ReconcileConfig};

const MAX_FILENAME_BYTES: usize = 180;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const CALLBACK_SLUG: &str = "upload";

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub hub: EventHub,
    pub pending: PendingUploadStore,
    pub provider: Arc<dyn UploadProvider>,
    /// Shared secret the vendor signs callbacks with.
    pub callback_secret: String,
    /// Public base URL of this server, used to build the callback URL.
    pub api_url: String,
}

impl ApiContext {
    pub fn callback_url(&self) -> String {
        format!("{}/upload_callback", self.api_url.trim_end_matches('/'))
    }
}

/// The user the current request acts for.
pub fn acting_user() -> Result<UserId, ApiError> {
    current_user().ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "no authenticated user"))
}

/// Issues a presigned destination for a new upload and starts tracking it as pending.
pub async fn initiate_upload(
    ctx: &ApiContext,
    req: InitiateUploadRequest,
) -> Result<InitiateUploadResponse, ApiError> {
    let user_id = acting_user()?;
    let file_name = validate_file_name(&req.file_name)?;
    if req.file_size == 0 {
        return Err(ApiError::validation("file cannot be empty"));
    }
    if req.file_size > MAX_FILE_SIZE_BYTES {
        return Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            format!("file exceeds {MAX_FILE_SIZE_BYTES} bytes"),
        ));
    }
    if let Some(folder_id) = req.folder_id {
        folders::ensure_folder_owned(ctx, user_id, folder_id).await?;
    }
    let mime_type = match req.mime_type.trim() {
        "" => DEFAULT_MIME_TYPE.to_string(),
        mime => mime.to_string(),
    };

    let prepared = ctx
        .provider
        .prepare_upload(&PrepareUploadRequest {
            file_name: file_name.to_string(),
            file_size: req.file_size,
            mime_type: mime_type.clone(),
            callback_url: ctx.callback_url(),
            callback_slug: CALLBACK_SLUG.to_string(),
            metadata: UploadMetadata {
                user_id,
                folder_id: req.folder_id,
            },
        })
        .await
        .map_err(|e| ApiError::new(ErrorCode::Upstream, e.to_string()))?;

    ctx.pending.insert(PendingUpload {
        file_key: prepared.key.clone(),
        owner_id: user_id,
        folder_id: req.folder_id,
        file_name: file_name.to_string(),
        size_hint: req.file_size,
        mime_hint: mime_type,
        created_at: Instant::now(),
    });
    info!(%user_id, file_key = %prepared.key, "upload initiated");

    ctx.hub
        .notify_current_user(StreamEvent::UploadInitiated {
            file_key: prepared.key.clone(),
            file_name: file_name.to_string(),
        })
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(InitiateUploadResponse {
        presigned_url: prepared.url,
        file_key: prepared.key,
        fields: prepared.fields,
    })
}

/// Batched, order-preserving lookup of the acting user's files by storage key.
pub async fn files_by_keys(
    ctx: &ApiContext,
    file_keys: &[String],
) -> Result<Vec<Option<UploadedFile>>, ApiError> {
    let user_id = acting_user()?;
    if file_keys.len() > MAX_KEYS_PER_LOOKUP {
        return Err(ApiError::validation(format!(
            "at most {MAX_KEYS_PER_LOOKUP} keys per request"
        )));
    }
    ctx.storage
        .files_by_keys(user_id, file_keys)
        .await
        .map_err(internal)
}

pub async fn list_files(
    ctx: &ApiContext,
    limit: u32,
    offset: u32,
) -> Result<ListFilesResponse, ApiError> {
    let user_id = acting_user()?;
    let (files, has_next) = ctx
        .storage
        .list_files(user_id, limit.clamp(1, 100), offset)
        .await
        .map_err(internal)?;
    Ok(ListFilesResponse { files, has_next })
}

/// Records an arrived file and tells its owner, whichever path reported it.
///
/// Only the call that creates the row notifies, so a webhook and a poll reporting
/// the same key produce a single `FileUploaded` event.
pub async fn complete_upload(ctx: &ApiContext, file: NewFile) -> anyhow::Result<UploadedFile> {
    let (stored, created) = ctx.storage.insert_file(&file).await?;
    ctx.pending.take(&file.file_key);
    if created {
        ctx.hub
            .notify_user(
                stored.owner_id,
                StreamEvent::FileUploaded {
                    file: stored.clone(),
                },
            )
            .await;
    } else {
        debug!(file_key = %file.file_key, "upload already completed");
    }
    Ok(stored)
}

fn validate_file_name(raw: &str) -> Result<&str, ApiError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::validation("file name cannot be empty"));
    }
    if name.len() > MAX_FILENAME_BYTES {
        return Err(ApiError::validation("file name is too long"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ApiError::validation(
            "file name must not contain path separators",
        ));
    }
    Ok(name)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
