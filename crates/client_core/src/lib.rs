//! Client half of the upload pipeline: keeps the per-user event stream alive,
//! turns arrival events (or the fallback sweep) into completed uploads, and runs
//! each upload as its own cancellable task.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

pub mod catalog;
pub mod config;
pub mod error;
pub mod event_stream;
pub mod file_sync;
pub mod transport;
pub mod upload;

pub use catalog::FileCatalog;
pub use config::ClientConfig;
pub use error::{EventStreamError, SyncError, TransferError, UploadError};
pub use event_stream::{events_url, EventBus};
pub use file_sync::{CompletionSynchronizer, FileLookup, SweepConfig};
pub use transport::ApiClient;
pub use upload::{
    ActiveUploadSummary, UploadBackend, UploadContext, UploadHandle, UploadInput, UploadManager,
    UploadPhase, UploadState,
};

/// Everything a running client needs, wired to one server and one user.
pub struct SyncClient {
    pub api: ApiClient,
    pub bus: EventBus,
    pub sync: CompletionSynchronizer<ApiClient>,
    pub uploads: UploadManager<ApiClient, ApiClient>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Connects the event stream and starts the background sweep.
    pub fn start(config: ClientConfig) -> anyhow::Result<Self> {
        let api = ApiClient::new(config.server_url.clone(), config.user_id);
        let bus = EventBus::new();
        let sync = CompletionSynchronizer::new(
            api.clone(),
            FileCatalog::new(),
            SweepConfig {
                period: config.sweep_period,
                threshold: config.sweep_threshold,
                batch_size: config.lookup_batch,
            },
        );

        let url = events_url(
            &config.server_url,
            config.user_id,
            Some(&config.connection_id),
        )?;
        let tasks = vec![
            sync.spawn_event_listener(bus.subscribe()),
            sync.spawn_sweeper(),
            event_stream::spawn_event_stream(
                url,
                config.heartbeat_timeout,
                config.reconnect_delay,
                bus.clone(),
            ),
        ];
        info!(user_id = %config.user_id, server = %config.server_url, "sync client started");

        let uploads = UploadManager::new(UploadContext {
            backend: Arc::new(api.clone()),
            sync: sync.clone(),
            retry: config.transfer_retry,
        });
        Ok(Self {
            api,
            bus,
            sync,
            uploads,
            tasks,
        })
    }

    /// Seeds the local catalog with the first page of the user's files.
    pub async fn refresh_catalog(&self, limit: u32) -> anyhow::Result<usize> {
        let page = self.api.list_files(limit, 0).await?;
        let count = page.files.len();
        self.sync.catalog().extend(page.files).await;
        Ok(count)
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
