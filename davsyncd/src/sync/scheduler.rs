//! Fans folder passes out to a pool of workers.
//!
//! Every pass is registered in an in-flight forest before it is queued, so a second trigger
//! for a folder that is already queued or running is dropped. A pass that finds changed
//! sub-folders queues one job per sub-folder instead of recursing. The root node of an
//! account only exists while some pass of that account is in flight, which is how the
//! scheduler knows an account-wide sync has drained.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::folder::{EngineError, FolderSync, SyncCode, SyncEvent, SyncOptions};
use super::forest::{IndexedForest, ROOT_PATH};
use super::now_millis;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub backoff: Backoff,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff: Backoff::default(),
        }
    }
}

/// Payload of a queued or running folder pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTicket {
    pub run_timestamp: i64,
    pub attempt: u32,
}

/// Aggregate of an account-wide sync, reported when its last pass finishes.
#[derive(Debug)]
struct AccountTally {
    root: String,
    outstanding: AtomicUsize,
    conflicts: AtomicUsize,
    failures: AtomicUsize,
    errors: AtomicUsize,
    /// The account's "sync running" flag, cleared on report.
    running: Arc<AtomicBool>,
}

impl AccountTally {
    fn new(root: &str, running: Arc<AtomicBool>) -> Self {
        Self {
            root: root.to_string(),
            outstanding: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            running,
        }
    }

    fn code(&self) -> Option<SyncCode> {
        if self.errors.load(Ordering::SeqCst) > 0 {
            None
        } else if self.conflicts.load(Ordering::SeqCst) > 0
            || self.failures.load(Ordering::SeqCst) > 0
        {
            Some(SyncCode::Conflict)
        } else {
            Some(SyncCode::Success)
        }
    }
}

#[derive(Debug, Clone)]
struct SyncJob {
    account: String,
    remote_path: String,
    run_timestamp: i64,
    options: SyncOptions,
    attempt: u32,
    cancel: CancellationToken,
    tally: Option<Arc<AccountTally>>,
}

impl SyncJob {
    fn child(&self, remote_path: &str) -> Self {
        Self {
            remote_path: remote_path.to_string(),
            attempt: 0,
            ..self.clone()
        }
    }
}

struct AccountHandle {
    sync: FolderSync,
    cancel: CancellationToken,
    account_sync_running: Arc<AtomicBool>,
}

struct Inner {
    accounts: DashMap<String, AccountHandle>,
    in_flight: IndexedForest<SyncTicket>,
    queue: mpsc::UnboundedSender<SyncJob>,
    receiver: Mutex<mpsc::UnboundedReceiver<SyncJob>>,
    idle: Notify,
    backoff: Backoff,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
    workers: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl SyncScheduler {
    /// Spawns the worker pool on the current runtime.
    pub fn start(config: SchedulerConfig) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            accounts: DashMap::new(),
            in_flight: IndexedForest::new(),
            queue,
            receiver: Mutex::new(receiver),
            idle: Notify::new(),
            backoff: config.backoff,
            shutdown: CancellationToken::new(),
        });
        let workers = (0..config.workers.max(1))
            .map(|_| tokio::spawn(worker_loop(Arc::clone(&inner))))
            .collect();
        Self {
            inner,
            workers: Arc::new(std::sync::Mutex::new(workers)),
        }
    }

    pub fn add_account(&self, sync: FolderSync) {
        let account = sync.account().to_string();
        tracing::info!(account = %account, "account registered");
        self.inner.accounts.insert(
            account,
            AccountHandle {
                sync,
                cancel: CancellationToken::new(),
                account_sync_running: Arc::new(AtomicBool::new(false)),
            },
        );
    }

    /// Queues a pass over one folder. Returns `false` when the folder already has a pass
    /// queued or running, or the account is unknown.
    pub fn request_sync(&self, account: &str, remote_path: &str, options: SyncOptions) -> bool {
        let Some(cancel) = self.account_token(account) else {
            tracing::warn!(account, "sync requested for unknown account");
            return false;
        };
        self.inner.enqueue(SyncJob {
            account: account.to_string(),
            remote_path: remote_path.to_string(),
            run_timestamp: now_millis(),
            options,
            attempt: 0,
            cancel,
            tally: None,
        })
    }

    /// Syncs the whole tree of `account` from its root; one aggregate event is emitted when
    /// every pass has finished. Refused while a previous account sync is still running.
    pub fn sync_account(&self, account: &str, root: &str) -> bool {
        let Some((cancel, running)) = self.inner.accounts.get(account).map(|handle| {
            (
                handle.cancel.clone(),
                Arc::clone(&handle.account_sync_running),
            )
        }) else {
            tracing::warn!(account, "sync requested for unknown account");
            return false;
        };
        if running.swap(true, Ordering::SeqCst) {
            tracing::debug!(account, "account sync already running");
            return false;
        }
        let job = SyncJob {
            account: account.to_string(),
            remote_path: root.to_string(),
            run_timestamp: now_millis(),
            options: SyncOptions {
                update_folder_properties: false,
                sync_full_account: true,
            },
            attempt: 0,
            cancel,
            tally: Some(Arc::new(AccountTally::new(root, Arc::clone(&running)))),
        };
        if !self.inner.register(&job) {
            running.store(false, Ordering::SeqCst);
            return false;
        }
        self.inner.track(&job);
        self.inner.notify(SyncEvent {
            account: account.to_string(),
            remote_path: root.to_string(),
            in_progress: true,
            code: None,
        });
        self.inner.send(job)
    }

    pub fn is_syncing(&self, account: &str, remote_path: &str) -> bool {
        self.inner.in_flight.contains(account, remote_path)
    }

    /// Stops every pass of `account` and forgets its in-flight work. Queued passes are
    /// dropped when dequeued; running ones stop at their next remote read.
    pub fn remove_account(&self, account: &str) -> bool {
        let Some((_, handle)) = self.inner.accounts.remove(account) else {
            return false;
        };
        handle.cancel.cancel();
        let passes = self.inner.in_flight.remove_account(account);
        let transfers = handle.sync.transfers().cancel_account(account);
        tracing::info!(account, passes, transfers, "account removed");
        self.inner.idle.notify_waiters();
        true
    }

    /// Resolves once `account` has nothing queued or running.
    pub async fn wait_idle(&self, account: &str) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.in_flight.contains(account, ROOT_PATH) {
                return;
            }
            notified.await;
        }
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    fn account_token(&self, account: &str) -> Option<CancellationToken> {
        self.inner
            .accounts
            .get(account)
            .map(|handle| handle.cancel.clone())
    }
}

impl Inner {
    fn enqueue(&self, job: SyncJob) -> bool {
        if !self.register(&job) {
            return false;
        }
        self.track(&job);
        self.send(job)
    }

    fn track(&self, job: &SyncJob) {
        if let Some(tally) = &job.tally {
            tally.outstanding.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn register(&self, job: &SyncJob) -> bool {
        let ticket = SyncTicket {
            run_timestamp: job.run_timestamp,
            attempt: job.attempt,
        };
        let outcome = self
            .in_flight
            .put_if_absent(&job.account, &job.remote_path, ticket);
        if !outcome.inserted {
            tracing::debug!(
                account = %job.account,
                path = %job.remote_path,
                "folder pass already in flight"
            );
        }
        outcome.inserted
    }

    fn send(&self, job: SyncJob) -> bool {
        if let Err(err) = self.queue.send(job) {
            let job = err.0;
            tracing::error!(account = %job.account, path = %job.remote_path, "sync queue closed");
            self.finish(&job);
            return false;
        }
        true
    }

    fn notify(&self, event: SyncEvent) {
        if let Some(handle) = self.accounts.get(&event.account) {
            handle.sync.notify(event);
        }
    }

    async fn run(self: &Arc<Self>, job: SyncJob) {
        let sync = self
            .accounts
            .get(&job.account)
            .map(|handle| handle.sync.clone());
        let Some(sync) = sync.filter(|_| !job.cancel.is_cancelled()) else {
            tracing::debug!(
                account = %job.account,
                path = %job.remote_path,
                "dropping cancelled pass"
            );
            self.finish(&job);
            return;
        };

        match sync
            .execute(&job.remote_path, job.run_timestamp, job.options, &job.cancel)
            .await
        {
            Ok(result) => {
                for folder in &result.subfolders {
                    self.enqueue(job.child(&folder.remote_path));
                }
                if let Some(tally) = &job.tally {
                    tally
                        .conflicts
                        .fetch_add(result.conflicts_found, Ordering::SeqCst);
                    tally
                        .failures
                        .fetch_add(result.failures_in_favourites, Ordering::SeqCst);
                }
            }
            Err(EngineError::Cancelled) => {}
            Err(err) if err.is_retryable() && job.attempt < MAX_RETRY_ATTEMPTS => {
                self.retry(job);
                return;
            }
            Err(_) => {
                if let Some(tally) = &job.tally {
                    tally.errors.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.finish(&job);
    }

    /// Re-queues a failed pass after a backoff delay; the forest entry stays in place.
    fn retry(self: &Arc<Self>, mut job: SyncJob) {
        let delay = self.backoff.delay(job.attempt);
        job.attempt += 1;
        tracing::info!(
            account = %job.account,
            path = %job.remote_path,
            attempt = job.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retrying folder pass"
        );
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = job.cancel.cancelled() => inner.finish(&job),
                _ = inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    inner.send(job);
                }
            }
        });
    }

    fn finish(&self, job: &SyncJob) {
        self.in_flight
            .remove_payload(&job.account, &job.remote_path);
        if let Some(tally) = &job.tally
            && tally.outstanding.fetch_sub(1, Ordering::SeqCst) == 1
        {
            tally.running.store(false, Ordering::SeqCst);
            if !job.cancel.is_cancelled() {
                let code = tally.code();
                tracing::info!(
                    account = %job.account,
                    root = %tally.root,
                    ?code,
                    "account sync finished"
                );
                self.notify(SyncEvent {
                    account: job.account.clone(),
                    remote_path: tally.root.clone(),
                    in_progress: false,
                    code,
                });
            }
        }
        self.idle.notify_waiters();
    }
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        let job = {
            let mut receiver = inner.receiver.lock().await;
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            return;
        };
        inner.run(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::store::TreeStore;
    use crate::sync::transfer::{TransferConfig, TransferService};
    use davsync_core::DavClient;
    use sqlx::SqlitePool;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const COLLECTION: &str = "<d:resourcetype><d:collection/></d:resourcetype>";

    fn multistatus(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(207).set_body_string(format!(
            r#"<?xml version="1.0"?><d:multistatus xmlns:d="DAV:">{body}</d:multistatus>"#
        ))
    }

    fn entry(href: &str, etag: &str, props: &str) -> String {
        format!(
            r#"<d:response><d:href>{href}</d:href><d:propstat><d:prop><d:getetag>"{etag}"</d:getetag>{props}</d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>"#
        )
    }

    async fn propfind(server: &MockServer, remote_path: &str, depth: &str, body: String) {
        Mock::given(method("PROPFIND"))
            .and(path(remote_path))
            .and(header("depth", depth))
            .respond_with(multistatus(&body))
            .mount(server)
            .await;
    }

    async fn account(server: &MockServer) -> (FolderSync, TreeStore, TempDir) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = TreeStore::from_pool(pool);
        store.init().await.unwrap();
        let dir = tempdir().unwrap();
        let transfers =
            TransferService::new(store.clone(), dir.path().into(), TransferConfig::default());
        let client = DavClient::new(&server.uri(), "alice", None).unwrap();
        (
            FolderSync::new("alice", client, store.clone(), transfers),
            store,
            dir,
        )
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            workers: 2,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5), false),
        }
    }

    async fn wait(scheduler: &SyncScheduler) {
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle("alice"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn account_sync_descends_into_changed_folders() {
        let server = MockServer::start().await;
        propfind(&server, "/", "0", entry("/", "1", COLLECTION)).await;
        propfind(
            &server,
            "/",
            "1",
            [entry("/", "1", COLLECTION), entry("/docs/", "2", COLLECTION)].concat(),
        )
        .await;
        propfind(&server, "/docs/", "0", entry("/docs/", "2", COLLECTION)).await;
        propfind(
            &server,
            "/docs/",
            "1",
            [entry("/docs/", "2", COLLECTION), entry("/docs/deep/", "3", COLLECTION)].concat(),
        )
        .await;
        propfind(&server, "/docs/deep/", "0", entry("/docs/deep/", "3", COLLECTION)).await;
        propfind(&server, "/docs/deep/", "1", entry("/docs/deep/", "3", COLLECTION)).await;

        let (sync, store, _dir) = account(&server).await;
        let mut events = sync.subscribe();
        let scheduler = SyncScheduler::start(fast_config());
        scheduler.add_account(sync);

        assert!(scheduler.sync_account("alice", "/"));
        wait(&scheduler).await;

        let deep = store.get_by_path("alice", "/docs/deep/").await.unwrap().unwrap();
        assert_eq!(deep.local_etag, "3");
        let docs = store.get_by_path("alice", "/docs/").await.unwrap().unwrap();
        assert_eq!(docs.local_etag, "2");

        let started = events.recv().await.unwrap();
        assert!(started.in_progress);
        let finished = events.recv().await.unwrap();
        assert!(!finished.in_progress);
        assert_eq!(finished.remote_path, "/");
        assert_eq!(finished.code, Some(SyncCode::Success));
        assert!(events.try_recv().is_err());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn account_sync_reports_while_a_folder_pass_outlives_it() {
        let server = MockServer::start().await;
        propfind(&server, "/", "0", entry("/", "1", COLLECTION)).await;
        propfind(
            &server,
            "/",
            "1",
            [entry("/", "1", COLLECTION), entry("/slow/", "2", COLLECTION)].concat(),
        )
        .await;
        Mock::given(method("PROPFIND"))
            .and(path("/slow/"))
            .respond_with(
                multistatus(&entry("/slow/", "2", COLLECTION))
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&server)
            .await;

        let (sync, store, _dir) = account(&server).await;
        store.ensure_folder("alice", "/slow/").await.unwrap();
        let mut events = sync.subscribe();
        let scheduler = SyncScheduler::start(fast_config());
        scheduler.add_account(sync);

        assert!(scheduler.request_sync("alice", "/slow/", SyncOptions::default()));
        assert!(scheduler.sync_account("alice", "/"));
        assert!(!scheduler.sync_account("alice", "/"));
        wait(&scheduler).await;

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.remote_path == "/" && !event.in_progress {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(finished.code, Some(SyncCode::Success));

        assert!(scheduler.sync_account("alice", "/"));
        wait(&scheduler).await;
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_request_for_running_folder_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(
                multistatus(&entry("/", "", COLLECTION)).set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let (sync, _store, _dir) = account(&server).await;
        let scheduler = SyncScheduler::start(fast_config());
        scheduler.add_account(sync);

        assert!(scheduler.request_sync("alice", "/", SyncOptions::default()));
        assert!(scheduler.is_syncing("alice", "/"));
        assert!(!scheduler.request_sync("alice", "/", SyncOptions::default()));
        wait(&scheduler).await;

        assert!(!scheduler.is_syncing("alice", "/"));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        propfind(&server, "/", "0", entry("/", "4", COLLECTION)).await;
        propfind(&server, "/", "1", entry("/", "4", COLLECTION)).await;

        let (sync, store, _dir) = account(&server).await;
        let scheduler = SyncScheduler::start(fast_config());
        scheduler.add_account(sync);

        scheduler.request_sync("alice", "/", SyncOptions::default());
        wait(&scheduler).await;

        let root = store.get_by_path("alice", "/").await.unwrap().unwrap();
        assert_eq!(root.local_etag, "4");
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn retries_give_up_after_the_limit() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (sync, _store, _dir) = account(&server).await;
        let scheduler = SyncScheduler::start(fast_config());
        scheduler.add_account(sync);

        scheduler.request_sync("alice", "/", SyncOptions::default());
        wait(&scheduler).await;

        let attempts = server.received_requests().await.unwrap().len();
        assert_eq!(attempts, 1 + MAX_RETRY_ATTEMPTS as usize);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn removing_an_account_stops_its_passes() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(
                multistatus(&entry("/", "5", COLLECTION)).set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let (sync, store, _dir) = account(&server).await;
        let scheduler = SyncScheduler::start(fast_config());
        scheduler.add_account(sync);

        scheduler.sync_account("alice", "/");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.remove_account("alice"));
        wait(&scheduler).await;

        assert!(!scheduler.is_syncing("alice", "/"));
        assert!(!scheduler.request_sync("alice", "/", SyncOptions::default()));
        tokio::time::sleep(Duration::from_millis(600)).await;
        let root = store.get_by_path("alice", "/").await.unwrap();
        assert!(root.is_none_or(|root| root.local_etag.is_empty()));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_account_is_refused() {
        let scheduler = SyncScheduler::start(fast_config());
        assert!(!scheduler.request_sync("nobody", "/", SyncOptions::default()));
        assert!(!scheduler.sync_account("nobody", "/"));
        assert!(!scheduler.remove_account("nobody"));
        scheduler.shutdown().await;
    }
}
