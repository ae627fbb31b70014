async fn log_events(
    mut syncs: broadcast::Receiver<SyncEvent>,
    mut transfers: broadcast::Receiver<TransferEvent>,
) {
    loop {
        tokio::select! {
            event = syncs.recv() => match event {
                Ok(event) => log_sync_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "sync event log fell behind");
                }
                Err(RecvError::Closed) => return,
            },
            event = transfers.recv() => match event {
                Ok(event) if event.success => tracing::debug!(
                    account = %event.account,
                    path = %event.remote_path,
                    kind = ?event.kind,
                    "transfer done"
                ),
                Ok(event) => tracing::warn!(
                    account = %event.account,
                    path = %event.remote_path,
                    kind = ?event.kind,
                    "transfer failed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "transfer event log fell behind");
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

fn log_sync_event(event: &SyncEvent) {
    if event.in_progress {
        tracing::debug!(account = %event.account, path = %event.remote_path, "sync started");
        return;
    }
    match event.code {
        Some(code) => tracing::info!(
            account = %event.account,
            path = %event.remote_path,
            ?code,
            "sync finished"
        ),
        None => tracing::warn!(
            account = %event.account,
            path = %event.remote_path,
            "sync finished with errors"
        ),
    }
}

fn default_account_name(server_url: &str, username: &str) -> anyhow::Result<String> {
    let url = url::Url::parse(server_url)
        .with_context(|| format!("DAVSYNC_SERVER_URL is not a valid url: {server_url}"))?;
    let host = url
        .host_str()
        .with_context(|| format!("DAVSYNC_SERVER_URL has no host: {server_url}"))?;
    Ok(format!("{username}@{host}"))
}

fn default_storage_root() -> anyhow::Result<PathBuf> {
    let data_dir = dirs::data_dir().context("data directory is unavailable")?;
    Ok(data_dir.join("davsync").join("files"))
}

fn normalize_folder_path(value: &str) -> String {
    let trimmed = value.trim().trim_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    format!("/{trimmed}/")
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_var<F>(vars: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    vars(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_usize_var<F>(vars: &F, name: &str, default: u64) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    usize::try_from(read_u64_var(vars, name, default)).unwrap_or(usize::MAX)
}
