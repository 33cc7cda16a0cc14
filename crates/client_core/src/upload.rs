use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use shared::{
    domain::{FolderId, UploadId},
    protocol::InitiateUploadResponse,
    retry::RetryPolicy,
};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    error::{TransferError, UploadError},
    file_sync::{CompletionSynchronizer, FileLookup},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadInput {
    pub file_name: String,
    pub mime_type: String,
    pub folder_id: Option<FolderId>,
    pub bytes: Vec<u8>,
}

/// Where payloads go: asks for a presigned destination, then sends the bytes there.
#[async_trait]
pub trait UploadBackend: Send + Sync + 'static {
    async fn initiate(&self, input: &UploadInput) -> anyhow::Result<InitiateUploadResponse>;
    async fn transfer(
        &self,
        destination: &InitiateUploadResponse,
        input: &UploadInput,
    ) -> Result<(), TransferError>;
}

/// Steps of a single upload. Each step consumes the previous one.
#[derive(Debug)]
pub enum UploadState {
    Idle(UploadInput),
    Uploading(UploadInput),
    /// Carries the payload forward next to the server-issued key.
    Syncing { input: UploadInput, file_key: String },
    Done { file_key: String },
}

/// What observers of an upload see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPhase {
    Idle,
    Uploading,
    Syncing { file_key: String },
    Done { file_key: String },
    Failed { message: String },
    Cancelled,
}

impl UploadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. } | Self::Cancelled)
    }
}

impl From<&UploadState> for UploadPhase {
    fn from(state: &UploadState) -> Self {
        match state {
            UploadState::Idle(_) => Self::Idle,
            UploadState::Uploading(_) => Self::Uploading,
            UploadState::Syncing { file_key, .. } => Self::Syncing {
                file_key: file_key.clone(),
            },
            UploadState::Done { file_key } => Self::Done {
                file_key: file_key.clone(),
            },
        }
    }
}

/// Shared collaborators of every upload run by one client.
pub struct UploadContext<B, L> {
    pub backend: Arc<B>,
    pub sync: CompletionSynchronizer<L>,
    pub retry: RetryPolicy,
}

impl<B, L> Clone for UploadContext<B, L> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            sync: self.sync.clone(),
            retry: self.retry,
        }
    }
}

/// Advances one state. `Done` has no successor.
pub async fn step<B: UploadBackend, L: FileLookup>(
    id: UploadId,
    state: UploadState,
    ctx: &UploadContext<B, L>,
) -> Result<Option<UploadState>, UploadError> {
    match state {
        UploadState::Idle(input) => Ok(Some(UploadState::Uploading(input))),
        UploadState::Uploading(input) => {
            let destination = ctx
                .backend
                .initiate(&input)
                .await
                .map_err(UploadError::Initiate)?;
            transfer_with_retry(ctx.backend.as_ref(), &destination, &input, ctx.retry).await?;
            info!(upload_id = %id, file_key = %destination.file_key, "payload transferred");
            Ok(Some(UploadState::Syncing {
                input,
                file_key: destination.file_key,
            }))
        }
        UploadState::Syncing { file_key, .. } => {
            ctx.sync.wait_for_file(&file_key, id).await?;
            Ok(Some(UploadState::Done { file_key }))
        }
        UploadState::Done { .. } => Ok(None),
    }
}

/// Runs the machine from `Idle` until it has no successor, publishing every
/// non-terminal state on `status`. Returns the server-issued key.
pub async fn run_upload<B: UploadBackend, L: FileLookup>(
    id: UploadId,
    input: UploadInput,
    ctx: &UploadContext<B, L>,
    status: &watch::Sender<UploadPhase>,
) -> Result<String, UploadError> {
    let mut state = Some(UploadState::Idle(input));
    let mut completed_key = String::new();
    while let Some(current) = state {
        match &current {
            UploadState::Done { file_key } => completed_key.clone_from(file_key),
            other => {
                status.send_replace(UploadPhase::from(other));
            }
        }
        state = step(id, current, ctx).await?;
    }
    Ok(completed_key)
}

pub async fn transfer_with_retry<B: UploadBackend + ?Sized>(
    backend: &B,
    destination: &InitiateUploadResponse,
    input: &UploadInput,
    policy: RetryPolicy,
) -> Result<(), TransferError> {
    let mut retry = 0;
    loop {
        match backend.transfer(destination, input).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                warn!(file_key = %destination.file_key, %err, ?delay, retry, "retrying transfer");
                sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUploadSummary {
    pub id: UploadId,
    pub file_name: String,
    pub phase: UploadPhase,
}

struct ActiveUpload {
    file_name: String,
    status: Arc<watch::Sender<UploadPhase>>,
    task: JoinHandle<()>,
}

pub struct UploadHandle {
    pub id: UploadId,
    pub status: watch::Receiver<UploadPhase>,
}

impl UploadHandle {
    /// Resolves once the upload reaches a terminal phase.
    pub async fn finished(mut self) -> UploadPhase {
        if let Ok(phase) = self.status.wait_for(UploadPhase::is_terminal).await {
            return phase.clone();
        }
        self.status.borrow().clone()
    }
}

type ActiveMap = HashMap<UploadId, ActiveUpload>;

/// Owns the running uploads. Finished uploads leave the active set on their own,
/// failed ones stay until cancelled so the error can be shown.
pub struct UploadManager<B, L> {
    ctx: UploadContext<B, L>,
    active: Arc<Mutex<ActiveMap>>,
}

impl<B: UploadBackend, L: FileLookup> UploadManager<B, L> {
    pub fn new(ctx: UploadContext<B, L>) -> Self {
        Self {
            ctx,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start(&self, input: UploadInput) -> UploadHandle {
        let id = UploadId::new();
        let (status, receiver) = watch::channel(UploadPhase::Idle);
        let status = Arc::new(status);
        let file_name = input.file_name.clone();

        let mut active = lock(&self.active);
        let task = tokio::spawn({
            let ctx = self.ctx.clone();
            let status = Arc::clone(&status);
            let registry = Arc::clone(&self.active);
            async move {
                let outcome = run_upload(id, input, &ctx, &status).await;
                settle(&registry, id, &status, outcome);
            }
        });
        active.insert(
            id,
            ActiveUpload {
                file_name,
                status,
                task,
            },
        );

        UploadHandle {
            id,
            status: receiver,
        }
    }

    /// Drops the upload from the active set and aborts whatever it was doing.
    /// Returns `false` for unknown ids.
    pub fn cancel(&self, id: UploadId) -> bool {
        let Some(upload) = lock(&self.active).remove(&id) else {
            return false;
        };
        upload.task.abort();
        if !upload.status.borrow().is_terminal() {
            upload.status.send_replace(UploadPhase::Cancelled);
        }
        info!(upload_id = %id, file_name = %upload.file_name, "upload cancelled");
        true
    }

    pub fn active_uploads(&self) -> Vec<ActiveUploadSummary> {
        lock(&self.active)
            .iter()
            .map(|(id, upload)| ActiveUploadSummary {
                id: *id,
                file_name: upload.file_name.clone(),
                phase: upload.status.borrow().clone(),
            })
            .collect()
    }

    pub fn is_active(&self, id: UploadId) -> bool {
        lock(&self.active).contains_key(&id)
    }
}

/// Publishes the terminal phase unless [`UploadManager::cancel`] got there first.
fn settle(
    registry: &Mutex<ActiveMap>,
    id: UploadId,
    status: &watch::Sender<UploadPhase>,
    outcome: Result<String, UploadError>,
) {
    let mut active = lock(registry);
    match outcome {
        Ok(file_key) => {
            if active.remove(&id).is_none() {
                debug!(upload_id = %id, "upload finished after cancel");
                return;
            }
            info!(upload_id = %id, %file_key, "upload done");
            status.send_replace(UploadPhase::Done { file_key });
        }
        Err(err) => {
            if !active.contains_key(&id) {
                debug!(upload_id = %id, error = %err, "upload failed after cancel");
                return;
            }
            warn!(upload_id = %id, error = %err, "upload failed");
            status.send_replace(UploadPhase::Failed {
                message: err.to_string(),
            });
        }
    }
}

fn lock(active: &Mutex<ActiveMap>) -> MutexGuard<'_, ActiveMap> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
