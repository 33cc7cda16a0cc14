use std::time::Duration;

use chrono::Utc;
use shared::{
    domain::{FileId, UserId},
    protocol::UploadedFile,
};

use super::*;
use crate::scope_current_user;

fn sample_event() -> StreamEvent {
    StreamEvent::KeepAlive
}

fn uploaded_event(key: &str) -> StreamEvent {
    let now = Utc::now();
    StreamEvent::FileUploaded {
        file: UploadedFile {
            file_id: FileId(1),
            owner_id: UserId(1),
            name: "cat.png".into(),
            mime_type: "image/png".into(),
            size_bytes: 10,
            folder_id: None,
            file_key: key.into(),
            url: format!("https://files.example/f/{key}"),
            created_at: now,
            updated_at: now,
        },
    }
}

#[tokio::test]
async fn notify_delivers_to_registered_connection_and_unregister_shuts_it_down() {
    let hub = EventHub::new();
    let mailbox = Mailbox::unbounded();
    let user = UserId(1);
    let conn = ConnectionId::from("conn-1");

    hub.register_connection(user, conn.clone(), mailbox.clone())
        .await;
    hub.notify_user(user, sample_event()).await;
    assert_eq!(mailbox.take().await, Some(sample_event()));

    assert!(mailbox.offer(sample_event()));
    mailbox.take().await;

    hub.unregister_connection(user, &conn).await;
    assert!(!mailbox.offer(sample_event()));
    assert_eq!(mailbox.size(), None);
    assert_eq!(mailbox.take().await, None);
}

#[tokio::test]
async fn notify_fans_out_to_all_connections_of_one_user_only() {
    let hub = EventHub::new();
    let user = UserId(3);
    let other = UserId(4);
    let first = Mailbox::unbounded();
    let second = Mailbox::unbounded();
    let unrelated = Mailbox::unbounded();

    hub.register_connection(user, "conn-3-1".into(), first.clone())
        .await;
    hub.register_connection(user, "conn-3-2".into(), second.clone())
        .await;
    hub.register_connection(other, "conn-3-other".into(), unrelated.clone())
        .await;

    let event = uploaded_event("k1");
    hub.notify_user(user, event.clone()).await;

    assert_eq!(first.take().await, Some(event.clone()));
    assert_eq!(second.take().await, Some(event));
    assert_eq!(unrelated.size(), Some(0));
}

#[tokio::test]
async fn notify_without_connections_is_a_no_op() {
    let hub = EventHub::new();
    hub.notify_user(UserId(5), sample_event()).await;
    assert_eq!(hub.user_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn notify_refreshes_activity_after_long_idle() {
    let hub = EventHub::new();
    let mailbox = Mailbox::unbounded();
    let user = UserId(6);
    let conn = ConnectionId::from("conn-6");

    hub.register_connection(user, conn.clone(), mailbox.clone())
        .await;
    let registered_at = hub.last_activity(user, &conn).await.expect("registered");

    tokio::time::advance(Duration::from_secs(119 * 60)).await;
    hub.notify_user(user, sample_event()).await;
    assert_eq!(mailbox.take().await, Some(sample_event()));

    let refreshed = hub.last_activity(user, &conn).await.expect("still registered");
    assert_eq!(refreshed - registered_at, Duration::from_secs(119 * 60));

    tokio::time::advance(Duration::from_secs(2 * 60 * 60)).await;
    assert!(mailbox.offer(sample_event()));
    assert_eq!(hub.connection_count(user).await, 1);
}

#[tokio::test]
async fn unregistering_unknown_connection_or_user_is_a_no_op() {
    let hub = EventHub::new();
    let mailbox = Mailbox::unbounded();
    hub.register_connection(UserId(7), "conn-7".into(), mailbox.clone())
        .await;

    hub.unregister_connection(UserId(7), &"conn-missing".into())
        .await;
    hub.unregister_connection(UserId(9), &"conn-7".into()).await;

    assert_eq!(hub.connection_count(UserId(7)).await, 1);
    assert_eq!(mailbox.size(), Some(0));
}

#[tokio::test]
async fn removing_last_connection_drops_the_user_entry() {
    let hub = EventHub::new();
    let user = UserId(8);
    let first = Mailbox::unbounded();
    let second = Mailbox::unbounded();
    hub.register_connection(user, "conn-8-1".into(), first.clone())
        .await;
    hub.register_connection(user, "conn-8-2".into(), second.clone())
        .await;

    hub.unregister_connection(user, &"conn-8-1".into()).await;
    hub.notify_user(user, sample_event()).await;
    assert_eq!(second.take().await, Some(sample_event()));
    assert_eq!(first.size(), None);

    hub.unregister_connection(user, &"conn-8-2".into()).await;
    assert_eq!(hub.user_count().await, 0);
    hub.notify_user(user, sample_event()).await;
    assert_eq!(second.size(), None);
    assert!(!second.offer(sample_event()));
}

#[tokio::test]
async fn shut_down_mailbox_does_not_block_siblings() {
    let hub = EventHub::new();
    let user = UserId(10);
    let dead = Mailbox::unbounded();
    let alive = Mailbox::unbounded();
    hub.register_connection(user, "dead".into(), dead.clone())
        .await;
    hub.register_connection(user, "alive".into(), alive.clone())
        .await;

    dead.shutdown();
    hub.notify_user(user, sample_event()).await;

    assert_eq!(alive.take().await, Some(sample_event()));
    assert_eq!(hub.connection_count(user).await, 2);
}

#[tokio::test]
async fn reusing_a_connection_id_replaces_the_previous_mailbox() {
    let hub = EventHub::new();
    let user = UserId(11);
    let old = Mailbox::unbounded();
    let new = Mailbox::unbounded();
    hub.register_connection(user, "tab".into(), old.clone()).await;
    hub.register_connection(user, "tab".into(), new.clone()).await;

    assert_eq!(hub.connection_count(user).await, 1);
    assert!(old.is_shut_down());
    hub.notify_user(user, sample_event()).await;
    assert_eq!(new.size(), Some(1));
}

#[tokio::test]
async fn stale_transport_unregistering_a_reused_id_keeps_the_replacement() {
    let hub = EventHub::new();
    let user = UserId(11);
    let old = Mailbox::unbounded();
    let new = Mailbox::unbounded();
    hub.register_connection(user, "tab".into(), old.clone()).await;
    hub.register_connection(user, "tab".into(), new.clone()).await;

    // The replaced transport notices its stream ended and cleans up after itself.
    hub.unregister_mailbox(user, &"tab".into(), &old).await;

    assert_eq!(hub.connection_count(user).await, 1);
    assert!(!new.is_shut_down());
    hub.notify_user(user, sample_event()).await;
    assert_eq!(new.take().await, Some(sample_event()));

    hub.unregister_mailbox(user, &"tab".into(), &new).await;
    assert_eq!(hub.connection_count(user).await, 0);
    assert_eq!(hub.user_count().await, 0);
    assert!(new.is_shut_down());
}

#[tokio::test]
async fn concurrent_registrations_for_one_user_keep_every_entry() {
    let hub = EventHub::new();
    let user = UserId(12);
    let mut tasks = Vec::new();
    for index in 0..32 {
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            hub.register_connection(
                user,
                ConnectionId(format!("conn-{index}")),
                Mailbox::unbounded(),
            )
            .await;
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }
    assert_eq!(hub.connection_count(user).await, 32);
}

#[tokio::test]
async fn notify_current_user_uses_the_scoped_identity() {
    let hub = EventHub::new();
    let mailbox = Mailbox::unbounded();
    hub.register_connection(UserId(13), "conn-13".into(), mailbox.clone())
        .await;

    scope_current_user(UserId(13), async {
        hub.notify_current_user(sample_event())
            .await
            .expect("user in scope");
    })
    .await;
    assert_eq!(mailbox.size(), Some(1));

    let err = hub
        .notify_current_user(sample_event())
        .await
        .expect_err("no user in scope");
    assert_eq!(err, HubError::NoCurrentUser);
}
