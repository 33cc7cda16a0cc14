use super::*;

fn pending(key: &str) -> PendingUpload {
    PendingUpload {
        file_key: key.to_string(),
        owner_id: UserId(1),
        folder_id: None,
        file_name: format!("{key}.png"),
        size_hint: 10,
        mime_hint: "image/png".to_string(),
        created_at: Instant::now(),
    }
}

#[test]
fn take_hands_out_an_entry_once() {
    let store = PendingUploadStore::new();
    store.insert(pending("a"));
    assert!(store.get("a").is_some());
    assert!(store.take("a").is_some());
    assert!(store.take("a").is_none());
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn older_than_selects_only_aged_entries() {
    let store = PendingUploadStore::new();
    store.insert(pending("old"));
    tokio::time::advance(Duration::from_secs(6)).await;
    store.insert(pending("fresh"));

    let due = store.older_than(Duration::from_secs(5));
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].file_key, "old");
}

#[tokio::test(start_paused = true)]
async fn eviction_removes_expired_entries() {
    let store = PendingUploadStore::new();
    store.insert(pending("stale"));
    tokio::time::advance(Duration::from_secs(3601)).await;
    store.insert(pending("live"));

    let evicted = store.evict_older_than(Duration::from_secs(3600));
    assert_eq!(evicted, vec!["stale".to_string()]);
    assert_eq!(store.len(), 1);
    assert!(store.get("live").is_some());
}
