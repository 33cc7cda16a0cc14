use std::time::Duration;

use shared::protocol::MAX_KEYS_PER_LOOKUP;
use storage::NewFile;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{complete_upload, ApiContext};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Pending uploads younger than this are left to the webhook.
    pub min_age: Duration,
    /// Pending uploads older than this are dropped without a lookup.
    pub max_age: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_age: Duration::from_secs(5),
            max_age: Duration::from_secs(60 * 60),
        }
    }
}

/// Asks the provider about pending uploads older than `min_age` and completes the
/// ones it reports as arrived. Returns how many were completed.
///
/// A batch the provider fails to answer is logged and skipped; the rest of the
/// pass still runs.
pub async fn reconcile_pending_uploads(ctx: &ApiContext, min_age: Duration) -> usize {
    let due = ctx.pending.older_than(min_age);
    let mut completed = 0;
    for batch in due.chunks(MAX_KEYS_PER_LOOKUP) {
        let keys: Vec<String> = batch.iter().map(|upload| upload.file_key.clone()).collect();
        let found = match ctx.provider.find_uploaded(&keys).await {
            Ok(found) if found.len() == keys.len() => found,
            Ok(found) => {
                warn!(
                    answered = found.len(),
                    asked = keys.len(),
                    "provider answer does not line up with the batch, skipping it"
                );
                continue;
            }
            Err(err) => {
                warn!(%err, keys = keys.len(), "provider lookup failed, skipping batch");
                continue;
            }
        };

        for (pending, found) in batch.iter().zip(found) {
            let Some(found) = found else {
                continue;
            };
            // The webhook may have won the race while the lookup was in flight.
            if ctx.pending.get(&pending.file_key).is_none() {
                continue;
            }
            let file_key = found.key.clone();
            let stored = complete_upload(
                ctx,
                NewFile {
                    owner_id: pending.owner_id,
                    folder_id: pending.folder_id,
                    file_key: found.key,
                    url: found.url,
                    name: found.name,
                    mime_type: pending.mime_hint.clone(),
                    size_bytes: pending.size_hint,
                },
            )
            .await;
            match stored {
                Ok(_) => completed += 1,
                Err(err) => warn!(%file_key, %err, "failed to complete reconciled upload"),
            }
        }
    }
    completed
}

pub fn spawn_reconciler(ctx: ApiContext, config: ReconcileConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(config.interval);
        loop {
            ticks.tick().await;
            for file_key in ctx.pending.evict_older_than(config.max_age) {
                warn!(%file_key, "evicted pending upload that never arrived");
            }
            if ctx.pending.is_empty() {
                continue;
            }
            match reconcile_pending_uploads(&ctx, config.min_age).await {
                0 => debug!("no pending uploads resolved"),
                completed => info!(completed, "reconciled pending uploads"),
            }
        }
    })
}
