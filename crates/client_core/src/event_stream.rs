use std::{future::Future, time::Duration};

use futures::{Stream, StreamExt};
use shared::{
    domain::{ConnectionId, UserId},
    protocol::{EventFrame, StreamEvent},
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{sleep, timeout_at, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::EventStreamError;

const BUS_CAPACITY: usize = 256;

/// Process-wide fan-out of real (non keep-alive) events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StreamEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }

    /// Returns how many subscribers saw the event.
    pub fn publish(&self, event: StreamEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

/// `ws(s)://…/events?user_id=…` for an `http(s)://` server URL.
///
/// A `connection_id` kept across reconnects lets the server replace the stale
/// registration instead of accumulating one per attempt.
pub fn events_url(
    server_url: &str,
    user_id: UserId,
    connection_id: Option<&ConnectionId>,
) -> anyhow::Result<Url> {
    let mut url = Url::parse(server_url)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => anyhow::bail!("server_url must start with http:// or https://, got {other}://"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot switch {server_url} to {scheme}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("{server_url} cannot be a base URL"))?
        .pop_if_empty()
        .push("events");
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("user_id", &user_id.to_string());
        if let Some(connection_id) = connection_id {
            query.append_pair("connection_id", &connection_id.0);
        }
    }
    Ok(url)
}

/// Opens the socket and yields decoded frames until the server closes it.
pub async fn connect_frames(
    url: Url,
) -> Result<impl Stream<Item = Result<EventFrame, EventStreamError>> + Send + Unpin, EventStreamError>
{
    let (socket, _) = connect_async(url.as_str())
        .await
        .map_err(|e| EventStreamError::Connect(e.into()))?;
    info!(%url, "event stream connected");

    let (_, reader) = socket.split();
    let frames = reader
        .take_while(|msg| futures::future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str::<EventFrame>(&text).map_err(EventStreamError::from))
                }
                Ok(Message::Binary(bytes)) => {
                    Some(serde_json::from_slice::<EventFrame>(&bytes).map_err(EventStreamError::from))
                }
                Ok(_) => None,
                Err(err) => Some(Err(err.into())),
            }
        });
    Ok(Box::pin(frames))
}

/// Drains one connection. Real events go to the bus; keep-alives only push the
/// deadline back. Returns when the connection has to be replaced.
pub async fn pump_frames<S>(
    mut frames: S,
    heartbeat_timeout: Duration,
    bus: &EventBus,
) -> EventStreamError
where
    S: Stream<Item = Result<EventFrame, EventStreamError>> + Unpin,
{
    let mut deadline = Instant::now() + heartbeat_timeout;
    loop {
        let frame = match timeout_at(deadline, frames.next()).await {
            Err(_) => return EventStreamError::HeartbeatTimeout(heartbeat_timeout),
            Ok(None) => return EventStreamError::Closed,
            Ok(Some(Err(err))) => return err,
            Ok(Some(Ok(frame))) => frame,
        };
        for event in frame {
            if event.is_keep_alive() {
                deadline = Instant::now() + heartbeat_timeout;
            } else {
                bus.publish(event);
            }
        }
    }
}

/// Keeps a stream open forever: connect, pump, wait `reconnect_delay`, repeat.
pub async fn run_with_reconnect<C, Fut, S>(
    mut connect: C,
    heartbeat_timeout: Duration,
    reconnect_delay: Duration,
    bus: EventBus,
) where
    C: FnMut() -> Fut,
    Fut: Future<Output = Result<S, EventStreamError>>,
    S: Stream<Item = Result<EventFrame, EventStreamError>> + Unpin,
{
    loop {
        let reason = match connect().await {
            Ok(frames) => pump_frames(frames, heartbeat_timeout, &bus).await,
            Err(err) => err,
        };
        match &reason {
            EventStreamError::HeartbeatTimeout(_) | EventStreamError::Closed => {
                debug!(%reason, "event stream ended; reconnecting")
            }
            _ => warn!(error = %reason, "event stream failed; reconnecting"),
        }
        sleep(reconnect_delay).await;
    }
}

pub fn spawn_event_stream(
    url: Url,
    heartbeat_timeout: Duration,
    reconnect_delay: Duration,
    bus: EventBus,
) -> JoinHandle<()> {
    tokio::spawn(run_with_reconnect(
        move || connect_frames(url.clone()),
        heartbeat_timeout,
        reconnect_delay,
        bus,
    ))
}

#[cfg(test)]
#[path = "tests/event_stream_tests.rs"]
mod tests;
