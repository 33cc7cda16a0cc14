use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn defaults_match_stream_tuning() {
    let settings = Settings::default();
    let hub = settings.hub_config();
    assert_eq!(hub.heartbeat_interval, Duration::from_secs(3));
    assert_eq!(hub.batch_max_events, 25);
    assert_eq!(hub.batch_max_wait, Duration::from_millis(50));
    assert_eq!(hub.mailbox_capacity, None);

    let reconcile = settings.reconcile_config();
    assert_eq!(reconcile.interval, Duration::from_secs(5));
    assert_eq!(reconcile.min_age, Duration::from_secs(5));
    assert_eq!(reconcile.max_age, Duration::from_secs(3600));
}

#[test]
fn partial_settings_file_keeps_remaining_defaults() {
    let settings = parse_settings_file(
        r#"
        bind_addr = "0.0.0.0:8080"
        mailbox_capacity = 64
        "#,
    )
    .expect("parse");

    assert_eq!(settings.bind_addr, "0.0.0.0:8080");
    assert_eq!(settings.hub_config().mailbox_capacity, Some(64));
    assert_eq!(settings.database_url, Settings::default().database_url);
}

#[test]
fn app_prefixed_variables_win_over_legacy_names() {
    let mut settings = Settings::default();
    apply_env_overrides(
        &mut settings,
        env_from(&[
            ("SERVER_BIND", "127.0.0.1:1"),
            ("APP__BIND_ADDR", "127.0.0.1:2"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("APP__HEARTBEAT_INTERVAL_MS", "1500"),
        ]),
    )
    .expect("overrides");

    assert_eq!(settings.bind_addr, "127.0.0.1:2");
    assert_eq!(settings.database_url, "sqlite::memory:");
    assert_eq!(
        settings.hub_config().heartbeat_interval,
        Duration::from_millis(1500)
    );
}

#[test]
fn unparsable_numeric_override_is_an_error() {
    let mut settings = Settings::default();
    let err = apply_env_overrides(&mut settings, env_from(&[("APP__BATCH_MAX_EVENTS", "lots")]))
        .expect_err("invalid number");
    assert!(err.to_string().contains("APP__BATCH_MAX_EVENTS"));
}

#[test]
fn zero_batch_size_is_raised_to_one() {
    let settings = Settings {
        batch_max_events: 0,
        ..Settings::default()
    };
    assert_eq!(settings.hub_config().batch_max_events, 1);
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn creates_parent_dir_for_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("upload_sync_server_test_{suffix}"));
    let db_path = temp_root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.join("data").exists());

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("upload_sync_server_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(db_path.exists(), "database file should be created: {}", db_path.display());

    fs::remove_dir_all(temp_root).expect("cleanup");
}
