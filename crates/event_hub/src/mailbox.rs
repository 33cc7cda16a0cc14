use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{stream, Stream};
use tokio::sync::Notify;

/// Multi-producer, single-consumer queue with an explicit terminal shutdown.
///
/// Clones share the same queue. After [`Mailbox::shutdown`] every offer is
/// refused, queued items are discarded, and [`Mailbox::take`] yields `None`.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

struct State<T> {
    queue: VecDeque<T>,
    capacity: Option<usize>,
    shut_down: bool,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Mailbox<T> {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    capacity,
                    shut_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueues without waiting. Returns `false` when the mailbox is shut down or full.
    pub fn offer(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.shut_down {
            return false;
        }
        if let Some(capacity) = state.capacity {
            if state.queue.len() >= capacity {
                return false;
            }
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    /// Waits for the next item; `None` once the mailbox has been shut down.
    pub async fn take(&self) -> Option<T> {
        loop {
            {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    return Some(item);
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Returns `true` if this call performed the shutdown.
    pub fn shutdown(&self) -> bool {
        let mut state = self.lock();
        if state.shut_down {
            return false;
        }
        state.shut_down = true;
        state.queue.clear();
        drop(state);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
        true
    }

    /// Number of queued items, or `None` once shut down.
    pub fn size(&self) -> Option<usize> {
        let state = self.lock();
        (!state.shut_down).then_some(state.queue.len())
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// `true` when both handles share one queue.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> Mailbox<T> {
    /// Drains the mailbox as a stream that ends on shutdown.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        stream::unfold(self, |mailbox| async move {
            let item = mailbox.take().await?;
            Some((item, mailbox))
        })
    }
}

#[cfg(test)]
#[path = "tests/mailbox_tests.rs"]
mod tests;
