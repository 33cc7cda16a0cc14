use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::UploadId,
    protocol::{StreamEvent, UploadedFile},
};
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{catalog::FileCatalog, error::SyncError};

/// Batched, order-preserving "find by keys": entry `i` of the answer belongs to
/// key `i` of the request, `None` when the file has not arrived.
#[async_trait]
pub trait FileLookup: Send + Sync + 'static {
    async fn find_by_keys(&self, file_keys: &[String]) -> anyhow::Result<Vec<Option<UploadedFile>>>;
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub period: Duration,
    pub threshold: Duration,
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            threshold: Duration::from_secs(5),
            batch_size: shared::protocol::MAX_KEYS_PER_LOOKUP,
        }
    }
}

struct Waiter {
    token: u64,
    requester: UploadId,
    added_at: Instant,
    resolve: oneshot::Sender<()>,
}

type WaiterMap = HashMap<String, Waiter>;

struct Inner<L> {
    waiters: Mutex<WaiterMap>,
    next_token: AtomicU64,
    lookup: L,
    catalog: FileCatalog,
    sweep: SweepConfig,
}

/// Lets an upload suspend until its file is known to have arrived, whether that
/// news comes from the event stream or from the periodic lookup sweep.
pub struct CompletionSynchronizer<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for CompletionSynchronizer<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: FileLookup> CompletionSynchronizer<L> {
    pub fn new(lookup: L, catalog: FileCatalog, sweep: SweepConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                waiters: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                lookup,
                catalog,
                sweep,
            }),
        }
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.inner.catalog
    }

    /// Suspends until `file_key` is signalled. Dropping the future withdraws the waiter.
    pub async fn wait_for_file(
        &self,
        file_key: &str,
        requester: UploadId,
    ) -> Result<(), SyncError> {
        let (resolve, resolved) = oneshot::channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut waiters = self.lock_waiters();
            if let Some(existing) = waiters.get(file_key) {
                debug!(file_key, holder = %existing.requester, %requester, "duplicate wait rejected");
                return Err(SyncError::AlreadyWaiting(file_key.to_string()));
            }
            waiters.insert(
                file_key.to_string(),
                Waiter {
                    token,
                    requester,
                    added_at: Instant::now(),
                    resolve,
                },
            );
        }
        let _guard = WaiterGuard {
            waiters: &self.inner.waiters,
            file_key,
            token,
        };

        resolved
            .await
            .map_err(|_| SyncError::Abandoned(file_key.to_string()))
    }

    /// Resolves the waiter for `file_key`, if any. Signals for keys nobody waits on
    /// are dropped. Returns whether a waiter was resolved.
    pub fn signal_file_arrived(&self, file_key: &str) -> bool {
        let Some(waiter) = self.lock_waiters().remove(file_key) else {
            return false;
        };
        debug!(file_key, requester = %waiter.requester, "file arrived");
        waiter.resolve.send(()).is_ok()
    }

    pub fn waiter_count(&self) -> usize {
        self.lock_waiters().len()
    }

    pub fn is_waiting(&self, file_key: &str) -> bool {
        self.lock_waiters().contains_key(file_key)
    }

    /// Records an arrived file locally, then releases whoever waits for it.
    pub async fn file_arrived(&self, file: UploadedFile) -> bool {
        let file_key = file.file_key.clone();
        self.inner.catalog.upsert(file).await;
        self.signal_file_arrived(&file_key)
    }

    pub async fn apply_event(&self, event: &StreamEvent) {
        if let StreamEvent::FileUploaded { file } = event {
            self.file_arrived(file.clone()).await;
        }
    }

    /// One pass of the fallback sweep: looks up every waiter older than the
    /// threshold and resolves those whose file the server already has. A failed
    /// lookup only costs its own batch.
    pub async fn reconcile_once(&self) -> usize {
        let due = self.due_keys();
        if due.is_empty() {
            return 0;
        }

        let mut resolved = 0;
        for batch in due.chunks(self.inner.sweep.batch_size.max(1)) {
            let found = match self.inner.lookup.find_by_keys(batch).await {
                Ok(found) if found.len() == batch.len() => found,
                Ok(found) => {
                    warn!(
                        answered = found.len(),
                        asked = batch.len(),
                        "lookup answer does not line up with the batch, skipping it"
                    );
                    continue;
                }
                Err(error) => {
                    warn!(%error, keys = batch.len(), "file lookup failed, skipping batch");
                    continue;
                }
            };
            for file in found.into_iter().flatten() {
                if self.file_arrived(file).await {
                    resolved += 1;
                }
            }
        }
        if resolved > 0 {
            info!(resolved, "sweep resolved waiting uploads");
        }
        resolved
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sync = self.clone();
        let period = self.inner.sweep.period;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sync.reconcile_once().await;
            }
        })
    }

    /// Applies `FileUploaded` events from the bus until it closes.
    pub fn spawn_event_listener(
        &self,
        mut events: broadcast::Receiver<StreamEvent>,
    ) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => sync.apply_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event listener lagged; sweep will catch up");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn due_keys(&self) -> Vec<String> {
        let threshold = self.inner.sweep.threshold;
        let now = Instant::now();
        let waiters = self.lock_waiters();
        let mut due: Vec<(&String, Instant)> = waiters
            .iter()
            .filter(|(_, waiter)| now.saturating_duration_since(waiter.added_at) >= threshold)
            .map(|(key, waiter)| (key, waiter.added_at))
            .collect();
        due.sort_by_key(|(_, added_at)| *added_at);
        due.into_iter().map(|(key, _)| key.clone()).collect()
    }

    fn lock_waiters(&self) -> MutexGuard<'_, WaiterMap> {
        lock(&self.inner.waiters)
    }
}

fn lock(waiters: &Mutex<WaiterMap>) -> MutexGuard<'_, WaiterMap> {
    waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the waiter it was created for when the waiting future goes away,
/// unless the entry already belongs to a newer waiter.
struct WaiterGuard<'a> {
    waiters: &'a Mutex<WaiterMap>,
    file_key: &'a str,
    token: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut waiters = lock(self.waiters);
        if waiters
            .get(self.file_key)
            .is_some_and(|waiter| waiter.token == self.token)
        {
            waiters.remove(self.file_key);
        }
    }
}

#[cfg(test)]
#[path = "tests/file_sync_tests.rs"]
mod tests;
