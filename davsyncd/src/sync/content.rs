use std::fs::Metadata;
use std::io;
use std::time::UNIX_EPOCH;

use super::node::FileNode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSyncOutcome {
    UpToDate,
    Download,
    Upload,
    /// Both the cached copy and the server version moved since the last transfer.
    Conflict,
    Failed(String),
}

/// Compares the cached copy of a keep-in-sync file with the version the server reports.
///
/// `local_modified` is the cached copy's mtime in milliseconds, `None` when there is no copy.
pub fn decide(node: &FileNode, local_modified: Option<i64>) -> ContentSyncOutcome {
    let Some(local_modified) = local_modified else {
        return ContentSyncOutcome::Download;
    };
    let local_changed = local_modified != node.modified_at_last_sync_data;
    let remote_changed = node.remote_changed();
    match (local_changed, remote_changed) {
        (false, false) => ContentSyncOutcome::UpToDate,
        (true, false) => ContentSyncOutcome::Upload,
        (false, true) => ContentSyncOutcome::Download,
        (true, true) => ContentSyncOutcome::Conflict,
    }
}

/// Reads the cached copy's metadata and decides what the file needs.
pub async fn check_content(node: &FileNode) -> ContentSyncOutcome {
    let Some(path) = &node.storage_path else {
        return ContentSyncOutcome::Download;
    };
    let local_modified = match tokio::fs::metadata(path).await {
        Ok(metadata) => match modified_millis(&metadata) {
            Ok(value) => Some(value),
            Err(err) => return ContentSyncOutcome::Failed(err.to_string()),
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return ContentSyncOutcome::Failed(err.to_string()),
    };
    decide(node, local_modified)
}

pub fn modified_millis(metadata: &Metadata) -> io::Result<i64> {
    let modified = metadata.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(i64::try_from(since_epoch.as_millis()).unwrap_or(i64::MAX))
}
