use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub heartbeat_interval: Duration,
    pub batch_max_events: usize,
    pub batch_max_wait: Duration,
    /// `None` leaves connection mailboxes unbounded.
    pub mailbox_capacity: Option<usize>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            batch_max_events: 25,
            batch_max_wait: Duration::from_millis(50),
            mailbox_capacity: None,
        }
    }
}
