use std::path::PathBuf;

use davsync_core::{FOLDER_CONTENT_TYPE, RemoteFile};

/// One remote file or folder as known locally.
///
/// `etag` is the token the server reported at the last metadata pass; `local_etag` is the
/// token of the state that was actually synchronized (content for files, children for
/// folders). Only the latter decides whether work is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub id: Option<i64>,
    pub account: String,
    pub remote_path: String,
    pub parent_id: Option<i64>,
    pub remote_id: Option<String>,
    pub content_type: String,
    pub length: u64,
    pub created_at: i64,
    pub modified_at: i64,
    pub etag: String,
    pub local_etag: String,
    pub permissions: Option<String>,
    pub storage_path: Option<PathBuf>,
    pub keep_in_sync: bool,
    pub last_sync_properties: i64,
    pub last_sync_data: i64,
    pub modified_at_last_sync_data: i64,
}

impl FileNode {
    pub fn from_remote(account: &str, remote: &RemoteFile) -> Self {
        Self {
            id: None,
            account: account.to_string(),
            remote_path: remote.path.clone(),
            parent_id: None,
            remote_id: remote.remote_id.clone(),
            content_type: remote.content_type.clone(),
            length: remote.length,
            created_at: remote.created_at,
            modified_at: remote.modified_at,
            etag: remote.etag.clone(),
            local_etag: String::new(),
            permissions: remote.permissions.clone(),
            storage_path: None,
            keep_in_sync: false,
            last_sync_properties: 0,
            last_sync_data: 0,
            modified_at_last_sync_data: 0,
        }
    }

    /// Root folder placeholder created the first time an account is seen.
    pub fn root(account: &str) -> Self {
        Self {
            id: None,
            account: account.to_string(),
            remote_path: "/".to_string(),
            parent_id: None,
            remote_id: None,
            content_type: FOLDER_CONTENT_TYPE.to_string(),
            length: 0,
            created_at: 0,
            modified_at: 0,
            etag: String::new(),
            local_etag: String::new(),
            permissions: None,
            storage_path: None,
            keep_in_sync: false,
            last_sync_properties: 0,
            last_sync_data: 0,
            modified_at_last_sync_data: 0,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.content_type == FOLDER_CONTENT_TYPE
    }

    /// True when the server reports a different version than the one last synchronized.
    pub fn remote_changed(&self) -> bool {
        !etag_eq(&self.etag, &self.local_etag)
    }
}

pub fn etag_eq(left: &str, right: &str) -> bool {
    left.eq_ignore_ascii_case(right)
}

/// Carries the local-only fields of `old` over onto a node freshly built from the server.
///
/// The remote fields of `fresh` are kept as reported, except the length of folders, which is
/// not computed by the server listing and keeps its previous value.
pub fn merge_local_state(old: Option<&FileNode>, mut fresh: FileNode) -> FileNode {
    match old {
        Some(old) => {
            fresh.id = old.id;
            fresh.keep_in_sync = old.keep_in_sync;
            fresh.local_etag = old.local_etag.clone();
            fresh.storage_path = old.storage_path.clone();
            fresh.last_sync_data = old.last_sync_data;
            fresh.modified_at_last_sync_data = old.modified_at_last_sync_data;
            if fresh.is_folder() {
                fresh.length = old.length;
            }
        }
        None => {
            fresh.local_etag.clear();
            fresh.storage_path = None;
        }
    }
    if fresh.is_folder() {
        fresh.storage_path = None;
    }
    fresh
}
