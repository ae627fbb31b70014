use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::content::modified_millis;
use super::node::FileNode;
use super::paths::{PathError, default_save_path_for, partial_path_for};

const COPY_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("not enough free space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    Untouched,
    /// A cached copy outside managed storage was copied in.
    Relocated { from: PathBuf },
    /// A copy already sitting at the managed location was taken over.
    Adopted,
    /// The foreign copy could not be brought in; the node no longer points at it.
    Forgotten { from: PathBuf, reason: String },
}

/// Makes sure the cached copy of `node` lives at its managed location. Never fails: problems
/// degrade to [`RepairOutcome::Forgotten`] or leave the node untouched.
pub async fn repair_storage_path(node: &mut FileNode, storage_root: &Path) -> RepairOutcome {
    if node.is_folder() {
        node.storage_path = None;
        return RepairOutcome::Untouched;
    }
    let expected = match default_save_path_for(storage_root, &node.account, &node.remote_path) {
        Ok(path) => path,
        Err(err) => {
            tracing::warn!(path = %node.remote_path, error = %err, "no managed location for file");
            return RepairOutcome::Untouched;
        }
    };

    match node.storage_path.clone() {
        Some(current) if current == expected => RepairOutcome::Untouched,
        Some(current) => match copy_into_managed(&current, &expected).await {
            Ok(bytes) => {
                tracing::info!(
                    from = %current.display(),
                    to = %expected.display(),
                    bytes,
                    "copied foreign file into managed storage"
                );
                node.storage_path = Some(expected);
                RepairOutcome::Relocated { from: current }
            }
            Err(err) => {
                tracing::warn!(
                    path = %node.remote_path,
                    from = %current.display(),
                    error = %err,
                    "forgetting foreign local copy"
                );
                node.storage_path = None;
                RepairOutcome::Forgotten {
                    from: current,
                    reason: err.to_string(),
                }
            }
        },
        None => match tokio::fs::metadata(&expected).await {
            Ok(metadata) if metadata.is_file() => {
                let modified = modified_millis(&metadata).unwrap_or_default();
                node.storage_path = Some(expected);
                node.last_sync_data = modified;
                node.modified_at_last_sync_data = modified;
                tracing::debug!(path = %node.remote_path, "adopted copy found at managed location");
                RepairOutcome::Adopted
            }
            _ => RepairOutcome::Untouched,
        },
    }
}

async fn copy_into_managed(source: &Path, target: &Path) -> Result<u64, RepairError> {
    let needed = tokio::fs::metadata(source).await?.len();
    if let Some(available) = available_space(target)
        && available < needed
    {
        return Err(RepairError::InsufficientSpace { needed, available });
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let partial = partial_path_for(target);
    let copied = copy_chunked(source, &partial).await;
    match copied {
        Ok(bytes) => {
            tokio::fs::rename(&partial, target).await?;
            Ok(bytes)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(err.into())
        }
    }
}

async fn copy_chunked(source: &Path, target: &Path) -> io::Result<u64> {
    let mut reader = tokio::fs::File::open(source).await?;
    let mut writer = tokio::fs::File::create(target).await?;
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        total += read as u64;
    }
    writer.flush().await?;
    writer.sync_all().await?;
    Ok(total)
}

/// Bytes available to unprivileged users on the filesystem that would hold `path`.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn available_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let existing = path.ancestors().find(|candidate| candidate.exists())?;
    let c_path = CString::new(existing.as_os_str().as_bytes()).ok()?;
    let mut stats = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stats.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let stats = unsafe { stats.assume_init() };
    Some((stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64))
}

#[cfg(not(unix))]
fn available_space(_path: &Path) -> Option<u64> {
    None
}
