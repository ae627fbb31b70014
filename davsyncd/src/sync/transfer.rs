use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use davsync_core::{DavClient, DavError};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, broadcast};

use super::content::modified_millis;
use super::forest::{IndexedForest, ROOT_PATH};
use super::node::FileNode;
use super::now_millis;
use super::paths::{PathError, default_save_path_for, partial_path_for};
use super::store::{StoreError, TreeStore};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Remote(#[from] DavError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("{0} is a folder")]
    NotAFile(String),
    #[error("{0} has no local copy to upload")]
    NoLocalCopy(String),
    #[error("transfer of {0} was cancelled")]
    Cancelled(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Download,
    Upload,
}

/// Payload registered in the in-flight forest while a transfer runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTicket {
    pub kind: TransferKind,
    pub etag: String,
    pub requested_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub account: String,
    pub remote_path: String,
    pub kind: TransferKind,
    pub success: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            upload_concurrency: 2,
        }
    }
}

/// Fire-and-forget content transfers, at most one per path at a time.
#[derive(Clone)]
pub struct TransferService {
    store: TreeStore,
    storage_root: PathBuf,
    in_flight: Arc<IndexedForest<TransferTicket>>,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
    events: broadcast::Sender<TransferEvent>,
    idle: Arc<Notify>,
}

impl TransferService {
    pub fn new(store: TreeStore, storage_root: PathBuf, config: TransferConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            storage_root,
            in_flight: Arc::new(IndexedForest::new()),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
            events,
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Starts downloading `file` into its managed location. Returns `false` when a transfer
    /// for the same path is already running.
    pub fn request_download(
        &self,
        client: &DavClient,
        file: &FileNode,
    ) -> Result<bool, TransferError> {
        if file.is_folder() {
            return Err(TransferError::NotAFile(file.remote_path.clone()));
        }
        let target = default_save_path_for(&self.storage_root, &file.account, &file.remote_path)?;
        if !self.register(file, TransferKind::Download) {
            return Ok(false);
        }

        let service = self.clone();
        let client = client.clone();
        let file = file.clone();
        tokio::spawn(async move {
            let result = service.download(&client, &file, &target).await;
            service.finish(&file, TransferKind::Download, result);
        });
        Ok(true)
    }

    /// Starts uploading the cached copy of `file`. Returns `false` when a transfer for the same
    /// path is already running.
    pub fn request_upload(
        &self,
        client: &DavClient,
        file: &FileNode,
    ) -> Result<bool, TransferError> {
        let Some(source) = file.storage_path.clone() else {
            return Err(TransferError::NoLocalCopy(file.remote_path.clone()));
        };
        if !self.register(file, TransferKind::Upload) {
            return Ok(false);
        }

        let service = self.clone();
        let client = client.clone();
        let file = file.clone();
        tokio::spawn(async move {
            let result = service.upload(&client, &file, &source).await;
            service.finish(&file, TransferKind::Upload, result);
        });
        Ok(true)
    }

    /// True when `remote_path` or anything below it is being transferred.
    pub fn is_transferring(&self, account: &str, remote_path: &str) -> bool {
        self.in_flight.contains(account, remote_path)
    }

    pub fn is_downloading(&self, account: &str, remote_path: &str) -> bool {
        self.is_transferring(account, remote_path)
            && self
                .in_flight
                .get(account, remote_path)
                .is_none_or(|ticket| ticket.kind == TransferKind::Download)
    }

    /// Forgets every transfer of `account`; running ones finish without touching the store.
    pub fn cancel_account(&self, account: &str) -> usize {
        let cancelled = self.in_flight.remove_account(account);
        self.idle.notify_waiters();
        cancelled
    }

    /// Resolves once nothing of `account` is being transferred.
    pub async fn wait_idle(&self, account: &str) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.in_flight.contains(account, ROOT_PATH) {
                return;
            }
            notified.await;
        }
    }

    fn register(&self, file: &FileNode, kind: TransferKind) -> bool {
        let ticket = TransferTicket {
            kind,
            etag: file.etag.clone(),
            requested_at: now_millis(),
        };
        let outcome = self
            .in_flight
            .put_if_absent(&file.account, &file.remote_path, ticket);
        if !outcome.inserted {
            tracing::debug!(
                account = %file.account,
                path = %file.remote_path,
                ?kind,
                "transfer already in flight"
            );
        }
        outcome.inserted
    }

    async fn download(
        &self,
        client: &DavClient,
        file: &FileNode,
        target: &Path,
    ) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path_for(target);
        let downloaded = match client.download_to(&file.remote_path, &partial).await {
            Ok(downloaded) => downloaded,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err.into());
            }
        };
        if let Err(err) = self.ensure_tracked(file) {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
        tokio::fs::rename(&partial, target).await?;

        let local_modified = modified_millis(&tokio::fs::metadata(target).await?)?;
        let etag = downloaded.etag.unwrap_or_else(|| file.etag.clone());
        self.store
            .mark_content_synced(
                &file.account,
                &file.remote_path,
                target,
                &etag,
                now_millis(),
                local_modified,
            )
            .await?;
        Ok(())
    }

    async fn upload(
        &self,
        client: &DavClient,
        file: &FileNode,
        source: &Path,
    ) -> Result<(), TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;

        let local_modified = modified_millis(&tokio::fs::metadata(source).await?)?;
        let etag = match client.upload_from(&file.remote_path, source).await? {
            Some(etag) => etag,
            None => client.read_metadata(&file.remote_path).await?.etag,
        };
        self.ensure_tracked(file)?;
        self.store
            .mark_content_synced(
                &file.account,
                &file.remote_path,
                source,
                &etag,
                now_millis(),
                local_modified,
            )
            .await?;
        Ok(())
    }

    fn ensure_tracked(&self, file: &FileNode) -> Result<(), TransferError> {
        if self.in_flight.contains(&file.account, &file.remote_path) {
            Ok(())
        } else {
            Err(TransferError::Cancelled(file.remote_path.clone()))
        }
    }

    fn finish(&self, file: &FileNode, kind: TransferKind, result: Result<(), TransferError>) {
        self.in_flight
            .remove_payload(&file.account, &file.remote_path);
        let success = match result {
            Ok(()) => {
                tracing::info!(
                    account = %file.account,
                    path = %file.remote_path,
                    ?kind,
                    "transfer finished"
                );
                true
            }
            Err(err) => {
                tracing::warn!(
                    account = %file.account,
                    path = %file.remote_path,
                    ?kind,
                    error = %err,
                    "transfer failed"
                );
                false
            }
        };
        let _ = self.events.send(TransferEvent {
            account: file.account.clone(),
            remote_path: file.remote_path.clone(),
            kind,
            success,
        });
        self.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::paths::account_save_dir;
    use sqlx::SqlitePool;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{body_bytes, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn make_store() -> TreeStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = TreeStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    async fn saved_file(store: &TreeStore, path: &str) -> FileNode {
        let root = store.ensure_root("alice").await.unwrap();
        let file = FileNode {
            remote_path: path.into(),
            content_type: "text/plain".into(),
            etag: "5".into(),
            ..FileNode::root("alice")
        };
        store.save_folder(&root, &[file], &[]).await.unwrap().remove(0)
    }

    fn client_for(server: &MockServer) -> DavClient {
        DavClient::new(&server.uri(), "alice", None).unwrap()
    }

    async fn next_event(events: &mut broadcast::Receiver<TransferEvent>) -> TransferEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn download_lands_in_managed_storage_and_updates_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs/a.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"5\"")
                    .set_body_bytes(b"hello"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = make_store().await;
        let file = saved_file(&store, "/docs/a.txt").await;
        let service =
            TransferService::new(store.clone(), dir.path().into(), TransferConfig::default());
        let mut events = service.subscribe();

        assert!(service.request_download(&client_for(&server), &file).unwrap());
        let event = next_event(&mut events).await;

        assert!(event.success);
        assert_eq!(event.kind, TransferKind::Download);
        let target = account_save_dir(dir.path(), "alice").join("docs/a.txt");
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert!(!partial_path_for(&target).exists());
        let stored = store.get_by_path("alice", "/docs/a.txt").await.unwrap().unwrap();
        assert_eq!(stored.local_etag, "5");
        assert_eq!(stored.storage_path, Some(target));
        assert!(!service.is_transferring("alice", "/docs/a.txt"));
        assert!(!service.is_transferring("alice", "/docs"));
    }

    #[tokio::test]
    async fn duplicate_request_is_ignored_while_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow")
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = make_store().await;
        let file = saved_file(&store, "/a.txt").await;
        let service = TransferService::new(store, dir.path().into(), TransferConfig::default());
        let mut events = service.subscribe();
        let client = client_for(&server);

        assert!(service.request_download(&client, &file).unwrap());
        assert!(service.is_downloading("alice", "/a.txt"));
        assert!(!service.request_download(&client, &file).unwrap());

        assert!(next_event(&mut events).await.success);
    }

    #[tokio::test]
    async fn wait_idle_returns_after_running_transfers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow")
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = make_store().await;
        let file = saved_file(&store, "/a.txt").await;
        let service = TransferService::new(store, dir.path().into(), TransferConfig::default());

        assert!(service.request_download(&client_for(&server), &file).unwrap());
        tokio::time::timeout(Duration::from_secs(5), service.wait_idle("alice"))
            .await
            .unwrap();

        assert!(!service.is_transferring("alice", "/"));
        let target = account_save_dir(dir.path(), "alice").join("a.txt");
        assert_eq!(std::fs::read(target).unwrap(), b"slow");
    }

    #[tokio::test]
    async fn failed_download_reports_failure_and_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = make_store().await;
        let file = saved_file(&store, "/a.txt").await;
        let service = TransferService::new(store, dir.path().into(), TransferConfig::default());
        let mut events = service.subscribe();

        service.request_download(&client_for(&server), &file).unwrap();
        let event = next_event(&mut events).await;

        assert!(!event.success);
        let target = account_save_dir(dir.path(), "alice").join("a.txt");
        assert!(!target.exists());
        assert!(!partial_path_for(&target).exists());
        assert!(!service.is_transferring("alice", "/a.txt"));
    }

    #[tokio::test]
    async fn upload_records_new_version() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/a.txt"))
            .and(body_bytes(b"edited"))
            .respond_with(ResponseTemplate::new(204).insert_header("etag", "\"6\""))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"edited").unwrap();
        let store = make_store().await;
        let mut file = saved_file(&store, "/a.txt").await;
        file.storage_path = Some(local.clone());
        let service =
            TransferService::new(store.clone(), dir.path().into(), TransferConfig::default());
        let mut events = service.subscribe();

        assert!(service.request_upload(&client_for(&server), &file).unwrap());
        let event = next_event(&mut events).await;

        assert!(event.success);
        assert_eq!(event.kind, TransferKind::Upload);
        let stored = store.get_by_path("alice", "/a.txt").await.unwrap().unwrap();
        assert_eq!(stored.local_etag, "6");
        assert_eq!(stored.storage_path, Some(local));
    }

    #[tokio::test]
    async fn folders_and_missing_copies_are_rejected() {
        let dir = tempdir().unwrap();
        let store = make_store().await;
        let service =
            TransferService::new(store.clone(), dir.path().into(), TransferConfig::default());
        let client = DavClient::new("http://127.0.0.1:9", "alice", None).unwrap();
        let root = store.ensure_root("alice").await.unwrap();

        assert!(matches!(
            service.request_download(&client, &root),
            Err(TransferError::NotAFile(_))
        ));
        let file = saved_file(&store, "/a.txt").await;
        assert!(matches!(
            service.request_upload(&client, &file),
            Err(TransferError::NoLocalCopy(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_account_does_not_touch_the_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = make_store().await;
        let file = saved_file(&store, "/a.txt").await;
        let service =
            TransferService::new(store.clone(), dir.path().into(), TransferConfig::default());
        let mut events = service.subscribe();

        service.request_download(&client_for(&server), &file).unwrap();
        assert!(service.cancel_account("alice") > 0);
        let event = next_event(&mut events).await;

        assert!(!event.success);
        let stored = store.get_by_path("alice", "/a.txt").await.unwrap().unwrap();
        assert_eq!(stored.local_etag, "");
        assert_eq!(stored.storage_path, None);
    }
}
