use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use davsync_core::DavClient;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::sync::folder::{FolderSync, SyncEvent};
use crate::sync::scheduler::{SchedulerConfig, SyncScheduler};
use crate::sync::store::{TreeStore, default_db_path};
use crate::sync::transfer::{TransferConfig, TransferEvent, TransferService};

const DEFAULT_REMOTE_ROOT: &str = "/";
const DEFAULT_POLL_SECS: u64 = 300;
const DEFAULT_SYNC_WORKERS: u64 = 4;
const DEFAULT_DOWNLOAD_CONCURRENCY: u64 = 4;
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 2;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server_url: String,
    pub username: String,
    pub password: Option<String>,
    pub account: String,
    pub storage_root: PathBuf,
    pub db_path: PathBuf,
    pub remote_root: String,
    pub poll_interval: Duration,
    pub sync_workers: usize,
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from `vars`, which resolves a variable name to its value.
    pub fn from_vars<F>(vars: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let server_url = vars("DAVSYNC_SERVER_URL").context("DAVSYNC_SERVER_URL is not set")?;
        let username = vars("DAVSYNC_USERNAME").context("DAVSYNC_USERNAME is not set")?;
        let password = vars("DAVSYNC_PASSWORD").filter(|value| !value.is_empty());
        let account = match vars("DAVSYNC_ACCOUNT").filter(|value| !value.trim().is_empty()) {
            Some(account) => account,
            None => default_account_name(&server_url, &username)?,
        };
        let storage_root = match vars("DAVSYNC_STORAGE_DIR") {
            Some(value) => expand_with_home(&value, &home),
            None => default_storage_root()?,
        };
        let db_path = match vars("DAVSYNC_DB_PATH") {
            Some(value) => expand_with_home(&value, &home),
            None => default_db_path().context("failed to resolve tree store location")?,
        };
        let remote_root = normalize_folder_path(
            &vars("DAVSYNC_REMOTE_ROOT").unwrap_or_else(|| DEFAULT_REMOTE_ROOT.to_string()),
        );
        let poll_interval = Duration::from_secs(read_u64_var(
            &vars,
            "DAVSYNC_POLL_SECS",
            DEFAULT_POLL_SECS,
        ));
        let sync_workers = read_usize_var(&vars, "DAVSYNC_SYNC_WORKERS", DEFAULT_SYNC_WORKERS);
        let download_concurrency = read_usize_var(
            &vars,
            "DAVSYNC_DOWNLOAD_CONCURRENCY",
            DEFAULT_DOWNLOAD_CONCURRENCY,
        );
        let upload_concurrency = read_usize_var(
            &vars,
            "DAVSYNC_UPLOAD_CONCURRENCY",
            DEFAULT_UPLOAD_CONCURRENCY,
        );

        Ok(Self {
            server_url,
            username,
            password,
            account,
            storage_root,
            db_path,
            remote_root,
            poll_interval,
            sync_workers,
            download_concurrency,
            upload_concurrency,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    sync: FolderSync,
    scheduler: SyncScheduler,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.storage_root)
            .await
            .with_context(|| {
                format!("failed to create storage root at {:?}", config.storage_root)
            })?;

        let store = TreeStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open tree store at {:?}", config.db_path))?;
        store
            .ensure_folder(&config.account, &config.remote_root)
            .await
            .context("failed to register the remote root")?;
        let client = DavClient::new(
            &config.server_url,
            config.username.clone(),
            config.password.clone(),
        )
        .context("invalid WebDAV server configuration")?;
        let transfers = TransferService::new(
            store.clone(),
            config.storage_root.clone(),
            TransferConfig {
                download_concurrency: config.download_concurrency,
                upload_concurrency: config.upload_concurrency,
            },
        );
        let sync = FolderSync::new(config.account.clone(), client, store, transfers);
        let scheduler = SyncScheduler::start(SchedulerConfig {
            workers: config.sync_workers,
            ..SchedulerConfig::default()
        });
        scheduler.add_account(sync.clone());

        Ok(Self {
            config,
            sync,
            scheduler,
        })
    }

    /// Syncs the account periodically until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            account = %self.config.account,
            server = %self.config.server_url,
            remote_root = %self.config.remote_root,
            storage_root = %self.config.storage_root.display(),
            "daemon started"
        );

        let events_handle = tokio::spawn(log_events(
            self.sync.subscribe(),
            self.sync.transfers().subscribe(),
        ));

        let scheduler = self.scheduler.clone();
        let account = self.config.account.clone();
        let remote_root = self.config.remote_root.clone();
        let poll_interval = self.config.poll_interval;
        let poll_handle = tokio::spawn(async move {
            loop {
                if !scheduler.sync_account(&account, &remote_root) {
                    tracing::debug!(account = %account, "previous account sync still running");
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutdown requested");

        poll_handle.abort();
        self.scheduler.remove_account(&self.config.account);
        self.scheduler.shutdown().await;
        events_handle.abort();
        Ok(())
    }

    /// Runs one account-wide sync and waits for its passes and transfers to finish.
    pub async fn run_once(self) -> anyhow::Result<()> {
        let account = self.config.account.as_str();
        let events_handle = tokio::spawn(log_events(
            self.sync.subscribe(),
            self.sync.transfers().subscribe(),
        ));

        if !self.scheduler.sync_account(account, &self.config.remote_root) {
            anyhow::bail!("could not start sync of account {account}");
        }
        self.scheduler.wait_idle(account).await;
        self.sync.transfers().wait_idle(account).await;
        self.scheduler.shutdown().await;

        let files = self
            .sync
            .store()
            .count_files(account)
            .await
            .context("failed to count tracked files")?;
        tracing::info!(account, files, "one-shot sync finished");
        events_handle.abort();
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
