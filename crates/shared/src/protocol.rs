use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FileId, FolderId, UserId};

pub const MAX_FILE_SIZE_BYTES: u64 = 8 * 1024 * 1024;
/// Upper bound on keys accepted by one `files/by_keys` lookup.
pub const MAX_KEYS_PER_LOOKUP: usize = 100;

pub const CALLBACK_HOOK_HEADER: &str = "uploadthing-hook";
pub const CALLBACK_SIGNATURE_HEADER: &str = "x-uploadthing-signature";
pub const CALLBACK_SIGNATURE_PREFIX: &str = "hmac-sha256=";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub file_id: FileId,
    pub owner_id: UserId,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<FolderId>,
    pub file_key: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything that can travel over the per-user event stream.
///
/// `KeepAlive` is synthesised by the transport layer and never passes through
/// the hub's mailboxes in practice, but it shares the type so a single frame
/// format covers both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    KeepAlive,
    FileUploaded { file: UploadedFile },
    UploadInitiated { file_key: String, file_name: String },
}

impl StreamEvent {
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, Self::KeepAlive)
    }
}

/// One wire frame: a batch of events written as a single transport message.
pub type EventFrame = Vec<StreamEvent>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    #[serde(default)]
    pub folder_id: Option<FolderId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateUploadResponse {
    pub presigned_url: String,
    pub file_key: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesByKeysRequest {
    pub file_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub files: Vec<UploadedFile>,
    pub has_next: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub folder_id: FolderId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const MAX_FOLDER_NAME_LEN: usize = 255;
/// Upper bound on ids accepted by one delete or move request.
pub const MAX_IDS_PER_REQUEST: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFolderRequest {
    pub folder_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFilesRequest {
    pub file_ids: Vec<FileId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFoldersRequest {
    pub folder_ids: Vec<FolderId>,
}

/// `folder_id: None` moves the files back to the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveFilesRequest {
    pub file_ids: Vec<FileId>,
    #[serde(default)]
    pub folder_id: Option<FolderId>,
}

/// Opaque metadata handed to the storage vendor at initiation and echoed back in
/// the completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub user_id: UserId,
    #[serde(default)]
    pub folder_id: Option<FolderId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Uploaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackFile {
    pub url: String,
    pub key: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCallbackPayload {
    pub status: CallbackStatus,
    pub metadata: UploadMetadata,
    pub file: CallbackFile,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
