use futures::{
    future,
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use shared::protocol::{EventFrame, StreamEvent};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

use crate::{config::HubConfig, mailbox::Mailbox};

/// Builds the transport-facing stream for one registered connection.
///
/// Real events are grouped into frames of at most `batch_max_events`, flushed
/// after `batch_max_wait`. A keep-alive frame is interleaved every
/// `heartbeat_interval`. The stream ends as soon as the mailbox is shut down.
pub fn connection_stream(
    mailbox: Mailbox<StreamEvent>,
    config: &HubConfig,
) -> BoxStream<'static, EventFrame> {
    let events = tokio_stream::StreamExt::chunks_timeout(
        mailbox.into_stream(),
        config.batch_max_events.max(1),
        config.batch_max_wait,
    );

    let period = config.heartbeat_interval;
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let heartbeat = IntervalStream::new(ticks).map(|_| vec![StreamEvent::KeepAlive]);

    merge_halt_either(events, heartbeat).boxed()
}

/// Interleaves two streams and stops as soon as either one ends.
pub fn merge_halt_either<A, B, T>(left: A, right: B) -> impl Stream<Item = T>
where
    A: Stream<Item = T>,
    B: Stream<Item = T>,
{
    let left = left.map(Some).chain(stream::once(future::ready(None)));
    let right = right.map(Some).chain(stream::once(future::ready(None)));
    stream::select(left, right)
        .take_while(|item| future::ready(item.is_some()))
        .filter_map(future::ready)
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
