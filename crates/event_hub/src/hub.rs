use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ConnectionId, UserId},
    protocol::StreamEvent,
};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

use crate::{current_user::current_user, mailbox::Mailbox};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("no acting user in scope")]
    NoCurrentUser,
}

struct ActiveConnection {
    user_id: UserId,
    connection_id: ConnectionId,
    mailbox: Mailbox<StreamEvent>,
    last_activity: Instant,
}

type ConnectionMap = HashMap<UserId, Vec<ActiveConnection>>;

/// Registry of live connections keyed by user, plus fan-out over them.
///
/// Every state transition runs inside [`EventHub::update`], so register,
/// unregister and notify are serialized against each other and callers never
/// handle the lock themselves.
#[derive(Clone, Default)]
pub struct EventHub {
    connections: Arc<Mutex<ConnectionMap>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<R>(&self, f: impl FnOnce(&mut ConnectionMap) -> R) -> R {
        let mut connections = self.connections.lock().await;
        f(&mut connections)
    }

    pub async fn register_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        mailbox: Mailbox<StreamEvent>,
    ) {
        let now = Instant::now();
        self.update(|connections| {
            let user_connections = connections.entry(user_id).or_default();
            if let Some(position) = user_connections
                .iter()
                .position(|conn| conn.connection_id == connection_id)
            {
                // A reused id replaces the stale entry; the old transport sees its stream end.
                let previous = user_connections.remove(position);
                previous.mailbox.shutdown();
                debug!(%user_id, %connection_id, "replaced existing connection");
            }
            user_connections.push(ActiveConnection {
                user_id,
                connection_id: connection_id.clone(),
                mailbox,
                last_activity: now,
            });
            debug!(
                %user_id,
                %connection_id,
                connections = user_connections.len(),
                "registered connection"
            );
        })
        .await;
    }

    pub async fn unregister_connection(&self, user_id: UserId, connection_id: &ConnectionId) {
        self.remove_where(user_id, connection_id, |_| true).await;
    }

    /// Removes the entry for `connection_id` only while it still holds `mailbox`.
    ///
    /// A transport whose id was taken over by a newer registration calls this on
    /// exit and leaves the replacement in place.
    pub async fn unregister_mailbox(
        &self,
        user_id: UserId,
        connection_id: &ConnectionId,
        mailbox: &Mailbox<StreamEvent>,
    ) {
        let removed = self
            .remove_where(user_id, connection_id, |conn| conn.mailbox.same_as(mailbox))
            .await;
        if !removed {
            mailbox.shutdown();
        }
    }

    async fn remove_where(
        &self,
        user_id: UserId,
        connection_id: &ConnectionId,
        owns: impl FnOnce(&ActiveConnection) -> bool,
    ) -> bool {
        self.update(|connections| {
            let Some(user_connections) = connections.get_mut(&user_id) else {
                return false;
            };
            let Some(position) = user_connections
                .iter()
                .position(|conn| &conn.connection_id == connection_id)
            else {
                return false;
            };
            if !owns(&user_connections[position]) {
                debug!(%user_id, %connection_id, "connection id owned by a newer registration");
                return false;
            }
            let removed = user_connections.remove(position);
            removed.mailbox.shutdown();
            if user_connections.is_empty() {
                connections.remove(&user_id);
            }
            debug!(%user_id, %connection_id, "unregistered connection");
            true
        })
        .await
    }

    /// Offers `event` to every connection of `user_id` without waiting on any of them.
    ///
    /// A user with no connections is not an error. A refused offer (mailbox shut
    /// down or full) is logged and the remaining connections still receive it.
    pub async fn notify_user(&self, user_id: UserId, event: StreamEvent) {
        let now = Instant::now();
        self.update(|connections| {
            let Some(user_connections) = connections.get_mut(&user_id) else {
                return;
            };
            for conn in user_connections.iter_mut() {
                if conn.mailbox.offer(event.clone()) {
                    conn.last_activity = now;
                } else {
                    warn!(
                        user_id = %conn.user_id,
                        connection_id = %conn.connection_id,
                        "mailbox refused event, skipping send"
                    );
                }
            }
        })
        .await;
    }

    /// Like [`EventHub::notify_user`] for the identity set by
    /// [`scope_current_user`](crate::scope_current_user).
    pub async fn notify_current_user(&self, event: StreamEvent) -> Result<(), HubError> {
        let user_id = current_user().ok_or(HubError::NoCurrentUser)?;
        self.notify_user(user_id, event).await;
        Ok(())
    }

    pub async fn connection_count(&self, user_id: UserId) -> usize {
        self.update(|connections| connections.get(&user_id).map_or(0, Vec::len))
            .await
    }

    pub async fn user_count(&self) -> usize {
        self.update(|connections| connections.len()).await
    }

    pub async fn last_activity(
        &self,
        user_id: UserId,
        connection_id: &ConnectionId,
    ) -> Option<Instant> {
        self.update(|connections| {
            connections
                .get(&user_id)?
                .iter()
                .find(|conn| &conn.connection_id == connection_id)
                .map(|conn| conn.last_activity)
        })
        .await
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
