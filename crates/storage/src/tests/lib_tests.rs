use super::*;

fn new_file(owner: i64, key: &str) -> NewFile {
    NewFile {
        owner_id: UserId(owner),
        folder_id: None,
        file_key: key.to_string(),
        url: format!("https://files.example/f/{key}"),
        name: format!("{key}.png"),
        mime_type: "image/png".to_string(),
        size_bytes: 2048,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("filesync_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn insert_file_is_idempotent_per_key() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (first, created) = storage.insert_file(&new_file(1, "abc")).await.expect("insert");
    let mut replay = new_file(1, "abc");
    replay.name = "renamed.png".to_string();
    let (second, created_again) = storage.insert_file(&replay).await.expect("replay");

    assert!(created);
    assert!(!created_again);
    assert_eq!(first.file_id, second.file_id);
    assert_eq!(second.name, "abc.png");
    assert_eq!(first.size_bytes, 2048);
}

#[tokio::test]
async fn files_by_keys_preserves_request_order_and_owner_scope() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.insert_file(&new_file(1, "a")).await.expect("a");
    storage.insert_file(&new_file(1, "b")).await.expect("b");
    storage.insert_file(&new_file(2, "c")).await.expect("c");

    let keys = vec![
        "b".to_string(),
        "missing".to_string(),
        "c".to_string(),
        "a".to_string(),
    ];
    let found = storage
        .files_by_keys(UserId(1), &keys)
        .await
        .expect("lookup");

    assert_eq!(found.len(), 4);
    assert_eq!(found[0].as_ref().map(|f| f.file_key.as_str()), Some("b"));
    assert!(found[1].is_none());
    assert!(found[2].is_none(), "other owner's file is hidden");
    assert_eq!(found[3].as_ref().map(|f| f.file_key.as_str()), Some("a"));
}

#[tokio::test]
async fn files_by_keys_with_no_keys_skips_the_query() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let found = storage.files_by_keys(UserId(1), &[]).await.expect("lookup");
    assert!(found.is_empty());
}

#[tokio::test]
async fn list_files_pages_newest_first() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for key in ["one", "two", "three"] {
        storage.insert_file(&new_file(5, key)).await.expect("insert");
    }

    let (page, has_next) = storage.list_files(UserId(5), 2, 0).await.expect("page");
    assert_eq!(page.len(), 2);
    assert!(has_next);
    assert_eq!(page[0].file_key, "three");

    let (rest, has_next) = storage.list_files(UserId(5), 2, 2).await.expect("rest");
    assert_eq!(rest.len(), 1);
    assert!(!has_next);
    assert_eq!(rest[0].file_key, "one");
}

fn in_folder(owner: i64, key: &str, folder: &Folder) -> NewFile {
    NewFile {
        folder_id: Some(folder.folder_id),
        ..new_file(owner, key)
    }
}

#[tokio::test]
async fn folders_are_listed_per_owner_by_name() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let zebra = storage.create_folder(UserId(1), "zebra").await.expect("create");
    let apple = storage.create_folder(UserId(1), "apple").await.expect("create");
    storage.create_folder(UserId(2), "other").await.expect("create");

    let listed = storage.list_folders(UserId(1)).await.expect("list");
    assert_eq!(listed, vec![apple.clone(), zebra]);
    assert!(storage
        .folder_exists(UserId(1), apple.folder_id)
        .await
        .expect("exists"));
    assert!(!storage
        .folder_exists(UserId(2), apple.folder_id)
        .await
        .expect("exists"));
}

#[tokio::test]
async fn delete_files_returns_keys_of_own_files_only() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (mine, _) = storage.insert_file(&new_file(1, "mine")).await.expect("insert");
    let (kept, _) = storage.insert_file(&new_file(1, "kept")).await.expect("insert");
    let (theirs, _) = storage.insert_file(&new_file(2, "theirs")).await.expect("insert");

    let keys = storage
        .delete_files(UserId(1), &[mine.file_id, theirs.file_id])
        .await
        .expect("delete");

    assert_eq!(keys, vec!["mine".to_string()]);
    assert!(storage.file_by_key("mine").await.expect("query").is_none());
    assert!(storage.file_by_key("theirs").await.expect("query").is_some());
    assert!(storage.file_by_key(&kept.file_key).await.expect("query").is_some());
    assert!(storage.delete_files(UserId(1), &[]).await.expect("noop").is_empty());
}

#[tokio::test]
async fn delete_folders_takes_their_files_along() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let docs = storage.create_folder(UserId(1), "docs").await.expect("create");
    let foreign = storage.create_folder(UserId(2), "foreign").await.expect("create");
    storage.insert_file(&in_folder(1, "inside", &docs)).await.expect("insert");
    storage.insert_file(&new_file(1, "root")).await.expect("insert");
    storage.insert_file(&in_folder(2, "foreign-file", &foreign)).await.expect("insert");

    let keys = storage
        .delete_folders(UserId(1), &[docs.folder_id, foreign.folder_id])
        .await
        .expect("delete");

    assert_eq!(keys, vec!["inside".to_string()]);
    assert!(storage.list_folders(UserId(1)).await.expect("list").is_empty());
    assert_eq!(storage.list_folders(UserId(2)).await.expect("list"), vec![foreign]);
    assert!(storage.file_by_key("root").await.expect("query").is_some());
    assert!(storage.file_by_key("foreign-file").await.expect("query").is_some());
}

#[tokio::test]
async fn move_files_updates_only_the_owners_files() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let docs = storage.create_folder(UserId(1), "docs").await.expect("create");
    let (mine, _) = storage.insert_file(&new_file(1, "mine")).await.expect("insert");
    let (theirs, _) = storage.insert_file(&new_file(2, "theirs")).await.expect("insert");

    let moved = storage
        .move_files(UserId(1), &[mine.file_id, theirs.file_id], Some(docs.folder_id))
        .await
        .expect("move");
    assert_eq!(moved, 1);
    let stored = storage.file_by_key("mine").await.expect("query").expect("row");
    assert_eq!(stored.folder_id, Some(docs.folder_id));
    assert!(stored.updated_at >= mine.updated_at);
    let untouched = storage.file_by_key("theirs").await.expect("query").expect("row");
    assert_eq!(untouched.folder_id, None);

    storage
        .move_files(UserId(1), &[mine.file_id], None)
        .await
        .expect("back to root");
    let stored = storage.file_by_key("mine").await.expect("query").expect("row");
    assert_eq!(stored.folder_id, None);
}
