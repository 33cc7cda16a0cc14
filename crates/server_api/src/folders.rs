//! Folder management and bulk file operations for the acting user.

use shared::{
    domain::{FolderId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        CreateFolderRequest, DeleteFilesRequest, DeleteFoldersRequest, Folder, MoveFilesRequest,
        MAX_FOLDER_NAME_LEN, MAX_IDS_PER_REQUEST,
    },
};
use tracing::{info, warn};

use crate::{acting_user, internal, ApiContext};

pub async fn create_folder(ctx: &ApiContext, req: CreateFolderRequest) -> Result<Folder, ApiError> {
    let user_id = acting_user()?;
    let name = req.folder_name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("folder name cannot be empty"));
    }
    if name.len() > MAX_FOLDER_NAME_LEN {
        return Err(ApiError::validation("folder name is too long"));
    }
    let folder = ctx
        .storage
        .create_folder(user_id, name)
        .await
        .map_err(internal)?;
    info!(%user_id, folder_id = %folder.folder_id, "folder created");
    Ok(folder)
}

pub async fn list_folders(ctx: &ApiContext) -> Result<Vec<Folder>, ApiError> {
    let user_id = acting_user()?;
    ctx.storage.list_folders(user_id).await.map_err(internal)
}

/// Removes the records, then asks the vendor to drop the stored bytes.
pub async fn delete_files(ctx: &ApiContext, req: DeleteFilesRequest) -> Result<(), ApiError> {
    let user_id = acting_user()?;
    check_id_count(req.file_ids.len())?;
    let keys = ctx
        .storage
        .delete_files(user_id, &req.file_ids)
        .await
        .map_err(internal)?;
    info!(%user_id, deleted = keys.len(), "files deleted");
    purge_from_provider(ctx, &keys).await;
    Ok(())
}

pub async fn delete_folders(ctx: &ApiContext, req: DeleteFoldersRequest) -> Result<(), ApiError> {
    let user_id = acting_user()?;
    check_id_count(req.folder_ids.len())?;
    let keys = ctx
        .storage
        .delete_folders(user_id, &req.folder_ids)
        .await
        .map_err(internal)?;
    info!(%user_id, files = keys.len(), "folders deleted");
    purge_from_provider(ctx, &keys).await;
    Ok(())
}

pub async fn move_files(ctx: &ApiContext, req: MoveFilesRequest) -> Result<(), ApiError> {
    let user_id = acting_user()?;
    check_id_count(req.file_ids.len())?;
    if let Some(folder_id) = req.folder_id {
        ensure_folder_owned(ctx, user_id, folder_id).await?;
    }
    let moved = ctx
        .storage
        .move_files(user_id, &req.file_ids, req.folder_id)
        .await
        .map_err(internal)?;
    info!(%user_id, moved, folder_id = ?req.folder_id, "files moved");
    Ok(())
}

pub(crate) async fn ensure_folder_owned(
    ctx: &ApiContext,
    user_id: UserId,
    folder_id: FolderId,
) -> Result<(), ApiError> {
    let owned = ctx
        .storage
        .folder_exists(user_id, folder_id)
        .await
        .map_err(internal)?;
    if owned {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::NotFound,
            format!("folder {folder_id} not found"),
        ))
    }
}

fn check_id_count(count: usize) -> Result<(), ApiError> {
    if count > MAX_IDS_PER_REQUEST {
        return Err(ApiError::validation(format!(
            "at most {MAX_IDS_PER_REQUEST} ids per request"
        )));
    }
    Ok(())
}

// The records are already gone, so a vendor failure only leaves orphaned bytes.
async fn purge_from_provider(ctx: &ApiContext, keys: &[String]) {
    if keys.is_empty() {
        return;
    }
    if let Err(err) = ctx.provider.delete_files(keys).await {
        warn!(%err, keys = keys.len(), "failed to delete files at the upload provider");
    }
}

#[cfg(test)]
#[path = "tests/folders_tests.rs"]
mod tests;
