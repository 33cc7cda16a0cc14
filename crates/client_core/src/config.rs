use std::time::Duration;

use shared::{
    domain::{ConnectionId, UserId},
    retry::RetryPolicy,
};

/// Client-side tuning for the event stream, the completion sweep and uploads.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub user_id: UserId,
    /// Sent on every (re)connect of the event stream.
    pub connection_id: ConnectionId,
    /// No keep-alive within this window means the stream is dead.
    pub heartbeat_timeout: Duration,
    pub reconnect_delay: Duration,
    pub sweep_period: Duration,
    /// Waiters younger than this are left to the push path.
    pub sweep_threshold: Duration,
    pub lookup_batch: usize,
    pub transfer_retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            user_id,
            connection_id: ConnectionId::random(),
            heartbeat_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            sweep_period: Duration::from_secs(5),
            sweep_threshold: Duration::from_secs(5),
            lookup_batch: shared::protocol::MAX_KEYS_PER_LOOKUP,
            transfer_retry: RetryPolicy::default(),
        }
    }
}
