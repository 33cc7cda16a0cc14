use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{protocol::UploadMetadata, retry::RetryPolicy};
use thiserror::Error;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "x-uploadthing-api-key";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("upload provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upload provider returned status {0}")]
    Status(StatusCode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    #[serde(rename = "fileType")]
    pub mime_type: String,
    pub callback_url: String,
    pub callback_slug: String,
    pub metadata: UploadMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PreparedUpload {
    pub key: String,
    pub url: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// A file the provider reports as fully uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFile {
    pub key: String,
    pub name: String,
    pub url: String,
}

/// The external storage vendor: issues presigned destinations and answers
/// whether a key has arrived.
#[async_trait]
pub trait UploadProvider: Send + Sync {
    async fn prepare_upload(
        &self,
        request: &PrepareUploadRequest,
    ) -> Result<PreparedUpload, ProviderError>;

    /// Answers position for position with `file_keys`.
    async fn find_uploaded(
        &self,
        file_keys: &[String],
    ) -> Result<Vec<Option<ProviderFile>>, ProviderError>;

    async fn delete_files(&self, file_keys: &[String]) -> Result<(), ProviderError>;
}

#[derive(Debug, Deserialize)]
struct ListFilesResponse {
    files: Vec<ListedFile>,
}

#[derive(Debug, Deserialize)]
struct ListedFile {
    key: String,
    name: String,
    status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteFilesBody<'a> {
    file_keys: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteFilesResponse {
    #[serde(default)]
    deleted_count: u64,
}

#[derive(Clone)]
pub struct HttpUploadProvider {
    http: Client,
    api_url: String,
    file_url_base: String,
    api_key: String,
    retry: RetryPolicy,
}

impl HttpUploadProvider {
    pub fn new(
        api_url: impl Into<String>,
        file_url_base: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            file_url_base: file_url_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &(impl Serialize + Sync),
    ) -> Result<T, ProviderError> {
        let url = format!("{}{path}", self.api_url);
        let build = || {
            self.http
                .post(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .json(body)
        };
        let response = send_with_retry(build, self.retry).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl UploadProvider for HttpUploadProvider {
    async fn prepare_upload(
        &self,
        request: &PrepareUploadRequest,
    ) -> Result<PreparedUpload, ProviderError> {
        self.post_json("/v7/prepareUpload", request).await
    }

    async fn find_uploaded(
        &self,
        file_keys: &[String],
    ) -> Result<Vec<Option<ProviderFile>>, ProviderError> {
        let listed: ListFilesResponse = self
            .post_json("/v6/listFiles", &serde_json::json!({}))
            .await?;
        let uploaded: HashMap<String, String> = listed
            .files
            .into_iter()
            .filter(|file| file.status == "Uploaded")
            .map(|file| (file.key, file.name))
            .collect();

        Ok(file_keys
            .iter()
            .map(|key| {
                uploaded.get(key).map(|name| ProviderFile {
                    key: key.clone(),
                    name: name.clone(),
                    url: format!("{}/f/{key}", self.file_url_base),
                })
            })
            .collect())
    }

    async fn delete_files(&self, file_keys: &[String]) -> Result<(), ProviderError> {
        let response: DeleteFilesResponse = self
            .post_json("/v6/deleteFiles", &DeleteFilesBody { file_keys })
            .await?;
        debug!(
            requested = file_keys.len(),
            deleted = response.deleted_count,
            "provider deleted files"
        );
        Ok(())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

async fn send_with_retry(
    build: impl Fn() -> RequestBuilder,
    policy: RetryPolicy,
) -> Result<Response, ProviderError> {
    let mut retry = 0;
    loop {
        let outcome = build().send().await;
        let transient = match &outcome {
            Ok(response) => is_transient_status(response.status()),
            Err(err) => err.is_connect() || err.is_timeout(),
        };
        if !transient || retry >= policy.max_retries {
            let response = outcome?;
            if !response.status().is_success() {
                return Err(ProviderError::Status(response.status()));
            }
            return Ok(response);
        }
        let delay = policy.delay_for(retry);
        warn!(retry, ?delay, "upload provider request failed transiently, retrying");
        tokio::time::sleep(delay).await;
        retry += 1;
    }
}

#[cfg(test)]
#[path = "tests/provider_tests.rs"]
mod tests;
