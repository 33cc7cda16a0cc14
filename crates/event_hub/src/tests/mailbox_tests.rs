use std::time::Duration;

use futures::StreamExt;

use super::*;

#[tokio::test]
async fn take_returns_items_in_offer_order() {
    let mailbox = Mailbox::unbounded();
    assert!(mailbox.offer(1));
    assert!(mailbox.offer(2));
    assert_eq!(mailbox.size(), Some(2));
    assert_eq!(mailbox.take().await, Some(1));
    assert_eq!(mailbox.take().await, Some(2));
}

#[tokio::test]
async fn take_waits_for_a_later_offer() {
    let mailbox = Mailbox::unbounded();
    let producer = mailbox.clone();
    let consumer = tokio::spawn(async move { mailbox.take().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(producer.offer("late"));
    assert_eq!(consumer.await.expect("join"), Some("late"));
}

#[tokio::test]
async fn shutdown_refuses_offers_and_wakes_pending_take() {
    let mailbox: Mailbox<u8> = Mailbox::unbounded();
    let waiter = mailbox.clone();
    let pending = tokio::spawn(async move { waiter.take().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(mailbox.shutdown());
    assert_eq!(pending.await.expect("join"), None);
    assert!(!mailbox.offer(1));
    assert_eq!(mailbox.size(), None);
    assert!(mailbox.is_shut_down());
    assert!(!mailbox.shutdown(), "second shutdown is a no-op");
}

#[tokio::test]
async fn shutdown_discards_queued_items() {
    let mailbox = Mailbox::unbounded();
    mailbox.offer(1);
    mailbox.shutdown();
    assert_eq!(mailbox.take().await, None);
}

#[test]
fn bounded_mailbox_refuses_when_full() {
    let mailbox = Mailbox::bounded(1);
    assert!(mailbox.offer('a'));
    assert!(!mailbox.offer('b'));
    assert_eq!(mailbox.size(), Some(1));
}

#[tokio::test]
async fn stream_ends_after_shutdown() {
    let mailbox = Mailbox::unbounded();
    mailbox.offer(5);
    let handle = mailbox.clone();
    let mut items = Box::pin(mailbox.into_stream());
    assert_eq!(items.next().await, Some(5));
    handle.shutdown();
    assert_eq!(items.next().await, None);
}

#[test]
fn clones_share_identity_and_separate_mailboxes_do_not() {
    let first: Mailbox<u32> = Mailbox::unbounded();
    let second: Mailbox<u32> = Mailbox::unbounded();
    assert!(first.same_as(&first.clone()));
    assert!(!first.same_as(&second));
}
