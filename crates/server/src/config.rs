use std::{
    fmt::Display,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use event_hub::HubConfig;
use serde::Deserialize;
use server_api::ReconcileConfig;

const SETTINGS_FILE: &str = "server.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    /// Public base URL of this server; the upload callback is registered under it.
    pub api_url: String,
    pub upload_api_url: String,
    pub upload_file_url_base: String,
    /// Authenticates calls to the upload vendor and signs its callbacks.
    pub upload_api_key: String,
    pub heartbeat_interval_ms: u64,
    pub batch_max_events: usize,
    pub batch_max_wait_ms: u64,
    /// 0 leaves connection mailboxes unbounded.
    pub mailbox_capacity: usize,
    pub reconcile_interval_ms: u64,
    pub reconcile_min_age_ms: u64,
    pub pending_max_age_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".into(),
            database_url: "sqlite://./data/server.db".into(),
            api_url: "http://127.0.0.1:3001".into(),
            upload_api_url: "https://api.uploadthing.com".into(),
            upload_file_url_base: "https://utfs.io".into(),
            upload_api_key: "sk_dev_secret".into(),
            heartbeat_interval_ms: 3_000,
            batch_max_events: 25,
            batch_max_wait_ms: 50,
            mailbox_capacity: 0,
            reconcile_interval_ms: 5_000,
            reconcile_min_age_ms: 5_000,
            pending_max_age_secs: 3_600,
        }
    }
}

impl Settings {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            batch_max_events: self.batch_max_events.max(1),
            batch_max_wait: Duration::from_millis(self.batch_max_wait_ms),
            mailbox_capacity: (self.mailbox_capacity > 0).then_some(self.mailbox_capacity),
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: Duration::from_millis(self.reconcile_interval_ms),
            min_age: Duration::from_millis(self.reconcile_min_age_ms),
            max_age: Duration::from_secs(self.pending_max_age_secs),
        }
    }
}

/// Defaults, then `server.toml` if present, then the environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    let mut settings = match fs::read_to_string(SETTINGS_FILE) {
        Ok(raw) => parse_settings_file(&raw)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Settings::default(),
        Err(err) => return Err(err).with_context(|| format!("failed to read {SETTINGS_FILE}")),
    };
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok())?;
    Ok(settings)
}

fn parse_settings_file(raw: &str) -> anyhow::Result<Settings> {
    toml::from_str(raw).with_context(|| format!("invalid {SETTINGS_FILE}"))
}

/// `APP__*` names win over the legacy plain names.
fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    let var = |app: &str, legacy: Option<&str>| lookup(app).or_else(|| legacy.and_then(&lookup));

    if let Some(v) = var("APP__BIND_ADDR", Some("SERVER_BIND")) {
        settings.bind_addr = v;
    }
    if let Some(v) = var("APP__DATABASE_URL", Some("DATABASE_URL")) {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__API_URL", Some("API_URL")) {
        settings.api_url = v;
    }
    if let Some(v) = var("APP__UPLOAD_API_URL", None) {
        settings.upload_api_url = v;
    }
    if let Some(v) = var("APP__UPLOAD_FILE_URL_BASE", None) {
        settings.upload_file_url_base = v;
    }
    if let Some(v) = var("APP__UPLOAD_API_KEY", Some("UPLOADTHING_SECRET")) {
        settings.upload_api_key = v;
    }

    if let Some(v) = var("APP__HEARTBEAT_INTERVAL_MS", None) {
        settings.heartbeat_interval_ms = parse_var("APP__HEARTBEAT_INTERVAL_MS", &v)?;
    }
    if let Some(v) = var("APP__BATCH_MAX_EVENTS", None) {
        settings.batch_max_events = parse_var("APP__BATCH_MAX_EVENTS", &v)?;
    }
    if let Some(v) = var("APP__BATCH_MAX_WAIT_MS", None) {
        settings.batch_max_wait_ms = parse_var("APP__BATCH_MAX_WAIT_MS", &v)?;
    }
    if let Some(v) = var("APP__MAILBOX_CAPACITY", None) {
        settings.mailbox_capacity = parse_var("APP__MAILBOX_CAPACITY", &v)?;
    }
    if let Some(v) = var("APP__RECONCILE_INTERVAL_MS", None) {
        settings.reconcile_interval_ms = parse_var("APP__RECONCILE_INTERVAL_MS", &v)?;
    }
    if let Some(v) = var("APP__RECONCILE_MIN_AGE_MS", None) {
        settings.reconcile_min_age_ms = parse_var("APP__RECONCILE_MIN_AGE_MS", &v)?;
    }
    if let Some(v) = var("APP__PENDING_MAX_AGE_SECS", None) {
        settings.pending_max_age_secs = parse_var("APP__PENDING_MAX_AGE_SECS", &v)?;
    }

    Ok(())
}

fn parse_var<T>(name: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid value {raw:?} for {name}: {err}"))
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        return sqlite_url_for_path(path);
    }
    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return sqlite_url_for_path(path);
    }
    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    sqlite_url_for_path(raw_database_url)
}

// Drive-letter paths keep a single colon so sqlx does not read `C:` as a host.
fn sqlite_url_for_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    if has_drive_letter(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
