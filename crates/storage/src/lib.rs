use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{FileId, FolderId, UserId},
    protocol::{Folder, UploadedFile},
};

const FOLDER_COLUMNS: &str = "id, name, created_at, updated_at";
const FILE_COLUMNS: &str =
    "id, owner_user_id, folder_id, file_key, url, name, mime_type, size_bytes, created_at, updated_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// A file the storage vendor has confirmed, not yet assigned a local id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub owner_id: UserId,
    pub folder_id: Option<FolderId>,
    pub file_key: String,
    pub url: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            // a single connection keeps `sqlite::memory:` one shared database
            .max_connections(if database_url.contains(":memory:") { 1 } else { 5 })
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Persists `file`, or returns the already stored record when the key is known.
    ///
    /// Both the webhook and the reconciliation poller may report the same key, so a
    /// second insert is a no-op rather than an error. The flag is `true` only for
    /// the call that actually created the row.
    pub async fn insert_file(&self, file: &NewFile) -> Result<(UploadedFile, bool)> {
        let now = Utc::now();
        let size_bytes = i64::try_from(file.size_bytes).unwrap_or(i64::MAX);
        let inserted = sqlx::query(
            "INSERT INTO files (owner_user_id, folder_id, file_key, url, name, mime_type, size_bytes, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(file_key) DO NOTHING",
        )
        .bind(file.owner_id.0)
        .bind(file.folder_id.map(|folder| folder.0))
        .bind(&file.file_key)
        .bind(&file.url)
        .bind(&file.name)
        .bind(&file.mime_type)
        .bind(size_bytes)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert file {}", file.file_key))?
        .rows_affected()
            == 1;

        let stored = self
            .file_by_key(&file.file_key)
            .await?
            .with_context(|| format!("file {} missing after insert", file.file_key))?;
        Ok((stored, inserted))
    }

    pub async fn file_by_key(&self, file_key: &str) -> Result<Option<UploadedFile>> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE file_key = ?"))
            .bind(file_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    /// Looks up `file_keys` owned by `owner_id`, answering position for position:
    /// `result[i]` is the record for `file_keys[i]`, or `None` if unknown.
    pub async fn files_by_keys(
        &self,
        owner_id: UserId,
        file_keys: &[String],
    ) -> Result<Vec<Option<UploadedFile>>> {
        if file_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE owner_user_id = "
        ));
        query.push_bind(owner_id.0);
        query.push(" AND file_key IN (");
        let mut keys = query.separated(", ");
        for key in file_keys {
            keys.push_bind(key.as_str());
        }
        keys.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut by_key = HashMap::with_capacity(rows.len());
        for row in &rows {
            let file = file_from_row(row)?;
            by_key.insert(file.file_key.clone(), file);
        }

        Ok(file_keys.iter().map(|key| by_key.get(key).cloned()).collect())
    }

    /// Newest first. The flag reports whether another page follows.
    pub async fn list_files(
        &self,
        owner_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<UploadedFile>, bool)> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE owner_user_id = ? ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(owner_id.0)
        .bind(i64::from(limit) + 1)
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        let mut files = rows.iter().map(file_from_row).collect::<Result<Vec<_>>>()?;
        let has_next = files.len() > limit as usize;
        files.truncate(limit as usize);
        Ok((files, has_next))
    }

    pub async fn create_folder(&self, owner_id: UserId, name: &str) -> Result<Folder> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO folders (owner_user_id, name, created_at, updated_at) VALUES (?, ?, ?, ?) \
             RETURNING {FOLDER_COLUMNS}"
        ))
        .bind(owner_id.0)
        .bind(name)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create folder {name:?}"))?;
        folder_from_row(&row)
    }

    /// Alphabetical by name.
    pub async fn list_folders(&self, owner_id: UserId) -> Result<Vec<Folder>> {
        let rows = sqlx::query(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE owner_user_id = ? ORDER BY name, id"
        ))
        .bind(owner_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(folder_from_row).collect()
    }

    pub async fn folder_exists(&self, owner_id: UserId, folder_id: FolderId) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM folders WHERE id = ? AND owner_user_id = ?")
                .bind(folder_id.0)
                .bind(owner_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Deletes the listed files owned by `owner_id` and returns their vendor keys.
    /// Ids belonging to someone else are ignored.
    pub async fn delete_files(&self, owner_id: UserId, file_ids: &[FileId]) -> Result<Vec<String>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM files WHERE owner_user_id = ");
        query.push_bind(owner_id.0);
        push_id_list(&mut query, " AND id IN (", file_ids.iter().map(|id| id.0));
        query.push(" RETURNING file_key");

        let keys: Vec<String> = query
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await
            .context("failed to delete files")?;
        Ok(keys)
    }

    /// Deletes the listed folders owned by `owner_id` together with the files in
    /// them, returning the vendor keys of those files.
    pub async fn delete_folders(
        &self,
        owner_id: UserId,
        folder_ids: &[FolderId],
    ) -> Result<Vec<String>> {
        if folder_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT id FROM folders WHERE owner_user_id = ");
        select.push_bind(owner_id.0);
        push_id_list(&mut select, " AND id IN (", folder_ids.iter().map(|id| id.0));
        let owned: Vec<i64> = select.build_query_scalar().fetch_all(&mut *tx).await?;
        if owned.is_empty() {
            return Ok(Vec::new());
        }

        let mut files = QueryBuilder::<Sqlite>::new("DELETE FROM files WHERE owner_user_id = ");
        files.push_bind(owner_id.0);
        push_id_list(&mut files, " AND folder_id IN (", owned.iter().copied());
        files.push(" RETURNING file_key");
        let keys: Vec<String> = files
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await
            .context("failed to delete files of folders")?;

        let mut folders = QueryBuilder::<Sqlite>::new("DELETE FROM folders WHERE owner_user_id = ");
        folders.push_bind(owner_id.0);
        push_id_list(&mut folders, " AND id IN (", owned.iter().copied());
        folders
            .build()
            .execute(&mut *tx)
            .await
            .context("failed to delete folders")?;

        tx.commit().await?;
        Ok(keys)
    }

    /// Moves the listed files owned by `owner_id` into `folder_id`, or back to the
    /// root for `None`. The caller checks the folder belongs to the same owner.
    /// Returns how many files moved.
    pub async fn move_files(
        &self,
        owner_id: UserId,
        file_ids: &[FileId],
        folder_id: Option<FolderId>,
    ) -> Result<u64> {
        if file_ids.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE files SET folder_id = ");
        query.push_bind(folder_id.map(|folder| folder.0));
        query.push(", updated_at = ");
        query.push_bind(Utc::now());
        query.push(" WHERE owner_user_id = ");
        query.push_bind(owner_id.0);
        push_id_list(&mut query, " AND id IN (", file_ids.iter().map(|id| id.0));

        let moved = query
            .build()
            .execute(&self.pool)
            .await
            .context("failed to move files")?
            .rows_affected();
        Ok(moved)
    }
}

fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, prefix: &str, ids: impl Iterator<Item = i64>) {
    query.push(prefix);
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");
}

fn folder_from_row(row: &SqliteRow) -> Result<Folder> {
    Ok(Folder {
        folder_id: FolderId(row.try_get::<i64, _>("id")?),
        name: row.try_get("name")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn file_from_row(row: &SqliteRow) -> Result<UploadedFile> {
    Ok(UploadedFile {
        file_id: FileId(row.try_get::<i64, _>("id")?),
        owner_id: UserId(row.try_get::<i64, _>("owner_user_id")?),
        folder_id: row.try_get::<Option<i64>, _>("folder_id")?.map(FolderId),
        file_key: row.try_get("file_key")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        mime_type: row.try_get("mime_type")?,
        size_bytes: row.try_get::<i64, _>("size_bytes")?.max(0) as u64,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
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
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
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
#[path = "tests/lib_tests.rs"]
mod tests;
