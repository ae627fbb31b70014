use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use davsync_core::{DavClient, DavError, RemoteFile};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::content::{ContentSyncOutcome, check_content};
use super::node::{FileNode, etag_eq, merge_local_state};
use super::paths::{PathError, account_save_dir, default_save_path_for};
use super::repair::{RepairOutcome, repair_storage_path};
use super::store::{StoreError, TreeStore};
use super::transfer::TransferService;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote error: {0}")]
    Remote(#[from] DavError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("folder is not known locally: {0}")]
    FolderNotTracked(String),
    #[error("sync cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Remote(err) if err.is_retryable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCode {
    Success,
    NoChange,
    /// Remote reads succeeded but at least one file is in conflict or failed to sync.
    Conflict,
    /// The folder is gone on the server; its local records were removed.
    NotFound,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Save fresh folder metadata even when nothing changed.
    pub update_folder_properties: bool,
    /// Part of an account-wide sync; the scheduler reports the aggregate instead.
    pub sync_full_account: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub account: String,
    pub remote_path: String,
    pub in_progress: bool,
    pub code: Option<SyncCode>,
}

#[derive(Debug, Clone)]
pub struct FolderSyncResult {
    pub code: SyncCode,
    pub conflicts_found: usize,
    pub failures_in_favourites: usize,
    /// Remote path to the foreign local copy that could not be brought into managed storage.
    pub forgotten_local_files: HashMap<String, PathBuf>,
    pub children: Vec<FileNode>,
    /// Changed folders whose own pass still has to run.
    pub subfolders: Vec<FileNode>,
    pub transfers_requested: usize,
}

impl FolderSyncResult {
    fn finished(code: SyncCode, children: Vec<FileNode>) -> Self {
        Self {
            code,
            conflicts_found: 0,
            failures_in_favourites: 0,
            forgotten_local_files: HashMap::new(),
            children,
            subfolders: Vec::new(),
            transfers_requested: 0,
        }
    }
}

/// State of one reconciliation pass over one folder.
struct SyncRun {
    timestamp: i64,
    conflicts_found: usize,
    failures_in_favourites: usize,
    transfers_requested: usize,
    forgotten_local_files: HashMap<String, PathBuf>,
}

/// Reconciles one folder of an account with the server.
#[derive(Clone)]
pub struct FolderSync {
    account: String,
    client: DavClient,
    store: TreeStore,
    transfers: TransferService,
    events: broadcast::Sender<SyncEvent>,
}

impl FolderSync {
    pub fn new(
        account: impl Into<String>,
        client: DavClient,
        store: TreeStore,
        transfers: TransferService,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            account: account.into(),
            client,
            store,
            transfers,
            events,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    pub fn transfers(&self) -> &TransferService {
        &self.transfers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Runs one pass over `remote_path`. Sub-folders are not entered; the changed ones are
    /// returned in [`FolderSyncResult::subfolders`] for the caller to dispatch.
    pub async fn execute(
        &self,
        remote_path: &str,
        run_timestamp: i64,
        options: SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<FolderSyncResult, EngineError> {
        let result = self
            .synchronize(remote_path, run_timestamp, options, cancel)
            .await;
        match &result {
            Ok(outcome) => tracing::info!(
                account = %self.account,
                path = remote_path,
                code = ?outcome.code,
                conflicts = outcome.conflicts_found,
                failures = outcome.failures_in_favourites,
                transfers = outcome.transfers_requested,
                "synchronized folder"
            ),
            Err(EngineError::Cancelled) => tracing::debug!(
                account = %self.account,
                path = remote_path,
                "folder sync cancelled"
            ),
            Err(err) => tracing::warn!(
                account = %self.account,
                path = remote_path,
                error = %err,
                "folder sync failed"
            ),
        }
        if !options.sync_full_account {
            self.notify(SyncEvent {
                account: self.account.clone(),
                remote_path: remote_path.to_string(),
                in_progress: false,
                code: result.as_ref().ok().map(|outcome| outcome.code),
            });
        }
        result
    }

    async fn synchronize(
        &self,
        remote_path: &str,
        run_timestamp: i64,
        options: SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<FolderSyncResult, EngineError> {
        let tracked = self.local_folder(remote_path).await?;

        let remote = match cancellable(cancel, self.client.read_metadata(remote_path)).await? {
            Ok(remote) => remote,
            Err(err) if err.is_not_found() => {
                return match tracked {
                    Some(folder) => self.remove_local_folder(folder).await,
                    None => Ok(FolderSyncResult::finished(SyncCode::NotFound, Vec::new())),
                };
            }
            Err(err) => return Err(err.into()),
        };
        let folder = match tracked {
            Some(folder) => folder,
            None => self.store.ensure_root(&self.account).await?,
        };

        if etag_eq(&remote.etag, &folder.local_etag) {
            let children = self.store.folder_content(&folder).await?;
            if options.update_folder_properties {
                self.save_folder_properties(&folder, &remote, run_timestamp)
                    .await?;
            }
            return Ok(FolderSyncResult::finished(SyncCode::NoChange, children));
        }

        let listing = match cancellable(cancel, self.client.read_folder(remote_path)).await? {
            Ok(listing) => listing,
            Err(err) if err.is_not_found() => return self.remove_local_folder(folder).await,
            Err(err) => return Err(err.into()),
        };

        let mut run = SyncRun {
            timestamp: run_timestamp,
            conflicts_found: 0,
            failures_in_favourites: 0,
            transfers_requested: 0,
            forgotten_local_files: HashMap::new(),
        };
        let (children, obsolete) = self.reconcile(&folder, &listing.children, &mut run).await?;

        let saved = self.store.save_folder(&folder, &children, &obsolete).await?;
        let subfolders = self.dispatch_content(&saved, &mut run).await;
        self.save_folder_properties(&folder, &listing.folder, run.timestamp)
            .await?;

        let code = if run.conflicts_found > 0 || run.failures_in_favourites > 0 {
            SyncCode::Conflict
        } else {
            SyncCode::Success
        };
        Ok(FolderSyncResult {
            code,
            conflicts_found: run.conflicts_found,
            failures_in_favourites: run.failures_in_favourites,
            forgotten_local_files: run.forgotten_local_files,
            children: saved,
            subfolders,
            transfers_requested: run.transfers_requested,
        })
    }

    /// The local record of `remote_path`. Only the root may be missing; it is created once the
    /// server has answered.
    async fn local_folder(&self, remote_path: &str) -> Result<Option<FileNode>, EngineError> {
        let folder = self
            .store
            .get_by_path(&self.account, remote_path)
            .await?
            .filter(FileNode::is_folder);
        if folder.is_none() && remote_path != "/" {
            return Err(EngineError::FolderNotTracked(remote_path.to_string()));
        }
        Ok(folder)
    }

    /// Merges the server listing with the local children. Returns the merged children and the
    /// local children that no longer exist on the server.
    async fn reconcile(
        &self,
        folder: &FileNode,
        remote_children: &[RemoteFile],
        run: &mut SyncRun,
    ) -> Result<(Vec<FileNode>, Vec<FileNode>), EngineError> {
        let mut local: HashMap<String, FileNode> = self
            .store
            .folder_content(folder)
            .await?
            .into_iter()
            .map(|child| (child.remote_path.clone(), child))
            .collect();

        let mut children = Vec::with_capacity(remote_children.len());
        for remote in remote_children {
            let mut fresh = FileNode::from_remote(&self.account, remote);
            fresh.parent_id = folder.id;
            fresh.last_sync_properties = run.timestamp;
            let previous = local.remove(&fresh.remote_path);
            let mut merged = merge_local_state(previous.as_ref(), fresh);

            if let RepairOutcome::Forgotten { from, .. } =
                repair_storage_path(&mut merged, self.transfers.storage_root()).await
            {
                run.forgotten_local_files
                    .insert(merged.remote_path.clone(), from);
            }
            children.push(merged);
        }

        let obsolete: Vec<FileNode> = local.into_values().collect();
        if !obsolete.is_empty() {
            tracing::debug!(
                account = %self.account,
                path = %folder.remote_path,
                count = obsolete.len(),
                "removing children gone from the server"
            );
        }
        Ok((children, obsolete))
    }

    /// Hands content work for the saved children to the transfer service and returns the
    /// sub-folders to visit next.
    async fn dispatch_content(&self, saved: &[FileNode], run: &mut SyncRun) -> Vec<FileNode> {
        let mut subfolders = Vec::new();
        for child in saved {
            if child.is_folder() {
                if child.remote_changed() {
                    subfolders.push(child.clone());
                }
                continue;
            }

            if child.keep_in_sync {
                self.sync_content(child, run).await;
            } else if child.remote_changed() {
                match self.transfers.request_download(&self.client, child) {
                    Ok(started) => run.transfers_requested += usize::from(started),
                    Err(err) => tracing::warn!(
                        account = %self.account,
                        path = %child.remote_path,
                        error = %err,
                        "could not request download"
                    ),
                }
            }
        }
        subfolders
    }

    async fn sync_content(&self, file: &FileNode, run: &mut SyncRun) {
        let requested = match check_content(file).await {
            ContentSyncOutcome::UpToDate => return,
            ContentSyncOutcome::Conflict => {
                tracing::warn!(
                    account = %self.account,
                    path = %file.remote_path,
                    "content conflict"
                );
                run.conflicts_found += 1;
                return;
            }
            ContentSyncOutcome::Failed(reason) => {
                tracing::warn!(
                    account = %self.account,
                    path = %file.remote_path,
                    reason = %reason,
                    "content sync failed"
                );
                run.failures_in_favourites += 1;
                return;
            }
            ContentSyncOutcome::Download => self.transfers.request_download(&self.client, file),
            ContentSyncOutcome::Upload => self.transfers.request_upload(&self.client, file),
        };
        match requested {
            Ok(started) => run.transfers_requested += usize::from(started),
            Err(err) => {
                tracing::warn!(
                    account = %self.account,
                    path = %file.remote_path,
                    error = %err,
                    "content transfer could not start"
                );
                run.failures_in_favourites += 1;
            }
        }
    }

    async fn save_folder_properties(
        &self,
        folder: &FileNode,
        remote: &RemoteFile,
        run_timestamp: i64,
    ) -> Result<FileNode, EngineError> {
        let mut updated =
            merge_local_state(Some(folder), FileNode::from_remote(&self.account, remote));
        updated.remote_path = folder.remote_path.clone();
        updated.parent_id = folder.parent_id;
        updated.local_etag = remote.etag.clone();
        updated.last_sync_properties = run_timestamp;
        Ok(self.store.save_file(&updated).await?)
    }

    async fn remove_local_folder(&self, folder: FileNode) -> Result<FolderSyncResult, EngineError> {
        let storage_root = self.transfers.storage_root();
        let local_dir = default_save_path_for(storage_root, &self.account, &folder.remote_path)?;
        let delete_local = local_dir.starts_with(account_save_dir(storage_root, &self.account));

        self.store.remove_folder(&folder, true, delete_local).await?;
        if delete_local {
            remove_dir_if_present(&local_dir).await?;
        }
        tracing::info!(
            account = %self.account,
            path = %folder.remote_path,
            "folder removed on the server, dropped local records"
        );
        Ok(FolderSyncResult::finished(SyncCode::NotFound, Vec::new()))
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = T>,
) -> Result<T, EngineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        value = operation => Ok(value),
    }
}

async fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
