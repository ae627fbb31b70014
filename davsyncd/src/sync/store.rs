use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::node::FileNode;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const COLUMNS: &str = "id, account, remote_path, parent_id, remote_id, content_type, length, \
    created_at, modified_at, etag, local_etag, permissions, storage_path, keep_in_sync, \
    last_sync_properties, last_sync_data, modified_at_last_sync_data";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("{0} has not been saved yet")]
    Unsaved(String),
    #[error("folder {0} still has children")]
    NotEmpty(String),
}

/// Local tree of every account, one row per known file or folder.
#[derive(Debug, Clone)]
pub struct TreeStore {
    pool: SqlitePool,
}

impl TreeStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Returns the root folder of `account`, creating it on first use.
    pub async fn ensure_root(&self, account: &str) -> Result<FileNode, StoreError> {
        if let Some(root) = self.get_by_path(account, "/").await? {
            return Ok(root);
        }
        self.save_file(&FileNode::root(account)).await
    }

    /// Returns the folder at `remote_path`, creating it and any missing ancestor as
    /// never-synced placeholders.
    pub async fn ensure_folder(
        &self,
        account: &str,
        remote_path: &str,
    ) -> Result<FileNode, StoreError> {
        let mut folder = self.ensure_root(account).await?;
        for prefix in folder_prefixes(remote_path) {
            folder = match self.get_by_path(account, &prefix).await? {
                Some(existing) => existing,
                None => {
                    let placeholder = FileNode {
                        remote_path: prefix,
                        parent_id: folder.id,
                        ..FileNode::root(account)
                    };
                    self.save_file(&placeholder).await?
                }
            };
        }
        Ok(folder)
    }

    pub async fn get_by_path(
        &self,
        account: &str,
        remote_path: &str,
    ) -> Result<Option<FileNode>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM files WHERE account = ?1 AND remote_path = ?2"
        ))
        .bind(account)
        .bind(remote_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    pub async fn get_by_id(&self, account: &str, id: i64) -> Result<Option<FileNode>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM files WHERE account = ?1 AND id = ?2"
        ))
        .bind(account)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    /// Direct children of `folder`, ordered by path.
    pub async fn folder_content(&self, folder: &FileNode) -> Result<Vec<FileNode>, StoreError> {
        let Some(folder_id) = folder.id else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM files WHERE account = ?1 AND parent_id = ?2 ORDER BY remote_path ASC"
        ))
        .bind(&folder.account)
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    /// Replaces the children of `folder` in one transaction: `children` are upserted under
    /// the folder, `obsolete` rows are deleted (folders with everything below them). Cached
    /// copies of deleted files are removed from disk after the commit.
    pub async fn save_folder(
        &self,
        folder: &FileNode,
        children: &[FileNode],
        obsolete: &[FileNode],
    ) -> Result<Vec<FileNode>, StoreError> {
        let folder_id = folder
            .id
            .ok_or_else(|| StoreError::Unsaved(folder.remote_path.clone()))?;

        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(children.len());
        for child in children {
            let mut child = child.clone();
            child.parent_id = Some(folder_id);
            child.id = Some(upsert_node(&mut tx, &child).await?);
            saved.push(child);
        }
        let mut local_copies = Vec::new();
        for gone in obsolete {
            local_copies.extend(delete_subtree(&mut tx, gone).await?);
        }
        tx.commit().await?;

        remove_local_copies(&local_copies).await;
        Ok(saved)
    }

    /// Upserts one node and returns it with its row id.
    pub async fn save_file(&self, file: &FileNode) -> Result<FileNode, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let id = upsert_node(&mut conn, file).await?;
        Ok(FileNode {
            id: Some(id),
            ..file.clone()
        })
    }

    /// Deletes `folder` and, when `recursive`, everything below it. A non-recursive removal
    /// of a folder that still has children is refused.
    pub async fn remove_folder(
        &self,
        folder: &FileNode,
        recursive: bool,
        delete_local_copies: bool,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if !recursive && let Some(folder_id) = folder.id {
            let children: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE parent_id = ?1")
                    .bind(folder_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if children > 0 {
                return Err(StoreError::NotEmpty(folder.remote_path.clone()));
            }
        }
        let local_copies = delete_subtree(&mut tx, folder).await?;
        tx.commit().await?;

        if delete_local_copies {
            remove_local_copies(&local_copies).await;
        }
        Ok(())
    }

    pub async fn remove_file(
        &self,
        file: &FileNode,
        delete_local_copy: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM files WHERE account = ?1 AND remote_path = ?2")
            .bind(&file.account)
            .bind(&file.remote_path)
            .execute(&self.pool)
            .await?;
        if delete_local_copy && let Some(path) = &file.storage_path {
            remove_local_copies(std::slice::from_ref(path)).await;
        }
        Ok(())
    }

    /// Records a finished transfer: the cached copy now matches `local_etag`.
    pub async fn mark_content_synced(
        &self,
        account: &str,
        remote_path: &str,
        storage_path: &Path,
        local_etag: &str,
        synced_at: i64,
        local_modified_at: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE files
             SET storage_path = ?3,
                 local_etag = ?4,
                 last_sync_data = ?5,
                 modified_at_last_sync_data = ?6
             WHERE account = ?1 AND remote_path = ?2",
        )
        .bind(account)
        .bind(remote_path)
        .bind(storage_path.to_string_lossy().into_owned())
        .bind(local_etag)
        .bind(synced_at)
        .bind(local_modified_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_files(&self, account: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE account = ?1")
            .bind(account)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn remove_account(&self, account: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM files WHERE account = ?1")
            .bind(account)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn upsert_node(conn: &mut SqliteConnection, node: &FileNode) -> Result<i64, StoreError> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO files (
            account, remote_path, parent_id, remote_id, content_type, length,
            created_at, modified_at, etag, local_etag, permissions, storage_path,
            keep_in_sync, last_sync_properties, last_sync_data, modified_at_last_sync_data
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ON CONFLICT(account, remote_path) DO UPDATE SET
            parent_id = excluded.parent_id,
            remote_id = excluded.remote_id,
            content_type = excluded.content_type,
            length = excluded.length,
            created_at = excluded.created_at,
            modified_at = excluded.modified_at,
            etag = excluded.etag,
            local_etag = excluded.local_etag,
            permissions = excluded.permissions,
            storage_path = excluded.storage_path,
            keep_in_sync = excluded.keep_in_sync,
            last_sync_properties = excluded.last_sync_properties,
            last_sync_data = excluded.last_sync_data,
            modified_at_last_sync_data = excluded.modified_at_last_sync_data
        RETURNING id",
    )
    .bind(&node.account)
    .bind(&node.remote_path)
    .bind(node.parent_id)
    .bind(&node.remote_id)
    .bind(&node.content_type)
    .bind(i64::try_from(node.length).unwrap_or(i64::MAX))
    .bind(node.created_at)
    .bind(node.modified_at)
    .bind(&node.etag)
    .bind(&node.local_etag)
    .bind(&node.permissions)
    .bind(
        node.storage_path
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned()),
    )
    .bind(node.keep_in_sync)
    .bind(node.last_sync_properties)
    .bind(node.last_sync_data)
    .bind(node.modified_at_last_sync_data)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Deletes `node` (and, for a folder, every row below it); returns their cached copies.
async fn delete_subtree(
    conn: &mut SqliteConnection,
    node: &FileNode,
) -> Result<Vec<PathBuf>, StoreError> {
    let filter = if node.is_folder() {
        "account = ?1 AND (remote_path = ?2 OR substr(remote_path, 1, length(?2)) = ?2)"
    } else {
        "account = ?1 AND remote_path = ?2"
    };
    let copies: Vec<Option<String>> = sqlx::query_scalar(&format!(
        "SELECT storage_path FROM files WHERE {filter} AND storage_path IS NOT NULL"
    ))
    .bind(&node.account)
    .bind(&node.remote_path)
    .fetch_all(&mut *conn)
    .await?;
    sqlx::query(&format!("DELETE FROM files WHERE {filter}"))
        .bind(&node.account)
        .bind(&node.remote_path)
        .execute(&mut *conn)
        .await?;
    Ok(copies.into_iter().flatten().map(PathBuf::from).collect())
}

/// `/a/b/` yields `/a/` and `/a/b/`; the root is not included.
fn folder_prefixes(remote_path: &str) -> Vec<String> {
    let mut prefix = String::from("/");
    remote_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            prefix.push_str(segment);
            prefix.push('/');
            prefix.clone()
        })
        .collect()
}

async fn remove_local_copies(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "removed cached copy"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove cached copy")
            }
        }
    }
}

fn node_from_row(row: &SqliteRow) -> Result<FileNode, StoreError> {
    let length: i64 = row.try_get("length")?;
    let storage_path: Option<String> = row.try_get("storage_path")?;
    Ok(FileNode {
        id: Some(row.try_get("id")?),
        account: row.try_get("account")?,
        remote_path: row.try_get("remote_path")?,
        parent_id: row.try_get("parent_id")?,
        remote_id: row.try_get("remote_id")?,
        content_type: row.try_get("content_type")?,
        length: u64::try_from(length).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
        etag: row.try_get("etag")?,
        local_etag: row.try_get("local_etag")?,
        permissions: row.try_get("permissions")?,
        storage_path: storage_path.map(PathBuf::from),
        keep_in_sync: row.try_get("keep_in_sync")?,
        last_sync_properties: row.try_get("last_sync_properties")?,
        last_sync_data: row.try_get("last_sync_data")?,
        modified_at_last_sync_data: row.try_get("modified_at_last_sync_data")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("davsync");
    path.push("tree.db");
    Ok(path)
}
