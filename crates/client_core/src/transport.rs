use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use shared::{
    domain::{FileId, FolderId, UserId},
    protocol::{
        CreateFolderRequest, DeleteFilesRequest, DeleteFoldersRequest, FilesByKeysRequest, Folder,
        InitiateUploadRequest, InitiateUploadResponse, ListFilesResponse, MoveFilesRequest,
        UploadedFile,
    },
};

use crate::{
    error::TransferError,
    file_sync::FileLookup,
    upload::{UploadBackend, UploadInput},
};

/// HTTP client for the file routes, acting as one user.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    server_url: String,
    user_id: UserId,
}

impl ApiClient {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            user_id,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub async fn initiate_upload(
        &self,
        req: &InitiateUploadRequest,
    ) -> anyhow::Result<InitiateUploadResponse> {
        let response = self
            .http
            .post(format!("{}/files/initiate", self.server_url))
            .query(&[("user_id", self.user_id.0)])
            .json(req)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    pub async fn files_by_keys(
        &self,
        file_keys: &[String],
    ) -> anyhow::Result<Vec<Option<UploadedFile>>> {
        let files = self
            .http
            .post(format!("{}/files/by_keys", self.server_url))
            .query(&[("user_id", self.user_id.0)])
            .json(&FilesByKeysRequest {
                file_keys: file_keys.to_vec(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(files)
    }

    pub async fn list_files(&self, limit: u32, offset: u32) -> anyhow::Result<ListFilesResponse> {
        let page = self
            .http
            .get(format!("{}/files", self.server_url))
            .query(&[
                ("user_id", self.user_id.0),
                ("limit", i64::from(limit)),
                ("offset", i64::from(offset)),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page)
    }

    pub async fn list_folders(&self) -> anyhow::Result<Vec<Folder>> {
        let folders = self
            .http
            .get(format!("{}/folders", self.server_url))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(folders)
    }

    pub async fn create_folder(&self, folder_name: &str) -> anyhow::Result<Folder> {
        let folder = self
            .post("folders")
            .json(&CreateFolderRequest {
                folder_name: folder_name.to_string(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(folder)
    }

    pub async fn delete_files(&self, file_ids: &[FileId]) -> anyhow::Result<()> {
        let request = DeleteFilesRequest {
            file_ids: file_ids.to_vec(),
        };
        send_command(self.post("files/delete").json(&request)).await
    }

    /// Also deletes every file inside the folders.
    pub async fn delete_folders(&self, folder_ids: &[FolderId]) -> anyhow::Result<()> {
        let request = DeleteFoldersRequest {
            folder_ids: folder_ids.to_vec(),
        };
        send_command(self.post("folders/delete").json(&request)).await
    }

    /// `None` moves the files back to the root.
    pub async fn move_files(
        &self,
        file_ids: &[FileId],
        folder_id: Option<FolderId>,
    ) -> anyhow::Result<()> {
        let request = MoveFilesRequest {
            file_ids: file_ids.to_vec(),
            folder_id,
        };
        send_command(self.post("files/move").json(&request)).await
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}/{path}", self.server_url))
            .query(&[("user_id", self.user_id.0)])
    }

    /// PUTs the payload to the presigned destination.
    pub async fn transfer(
        &self,
        destination: &InitiateUploadResponse,
        input: &UploadInput,
    ) -> Result<(), TransferError> {
        let response = self
            .http
            .put(&destination.presigned_url)
            .header(reqwest::header::CONTENT_TYPE, &input.mime_type)
            .body(input.bytes.clone())
            .send()
            .await
            .map_err(classify_request_error)?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(classify_status(status)),
        }
    }
}

async fn send_command(request: RequestBuilder) -> anyhow::Result<()> {
    request.send().await?.error_for_status()?;
    Ok(())
}

fn classify_request_error(err: reqwest::Error) -> TransferError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        TransferError::Transient(err.to_string())
    } else {
        TransferError::Permanent(err.to_string())
    }
}

fn classify_status(status: StatusCode) -> TransferError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        TransferError::Transient(format!("destination answered {status}"))
    } else {
        TransferError::Permanent(format!("destination answered {status}"))
    }
}

#[async_trait]
impl UploadBackend for ApiClient {
    async fn initiate(&self, input: &UploadInput) -> anyhow::Result<InitiateUploadResponse> {
        let size = u64::try_from(input.bytes.len())?;
        self.initiate_upload(&InitiateUploadRequest {
            file_name: input.file_name.clone(),
            file_size: size,
            mime_type: input.mime_type.clone(),
            folder_id: input.folder_id,
        })
        .await
    }

    async fn transfer(
        &self,
        destination: &InitiateUploadResponse,
        input: &UploadInput,
    ) -> Result<(), TransferError> {
        ApiClient::transfer(self, destination, input).await
    }
}

#[async_trait]
impl FileLookup for ApiClient {
    async fn find_by_keys(
        &self,
        file_keys: &[String],
    ) -> anyhow::Result<Vec<Option<UploadedFile>>> {
        self.files_by_keys(file_keys).await
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
