use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use url::form_urlencoded::byte_serialize;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
}

/// Managed directory holding the cached content of one account.
pub fn account_save_dir(storage_root: &Path, account: &str) -> PathBuf {
    let encoded: String = byte_serialize(account.as_bytes()).collect();
    storage_root.join(encoded)
}

/// Where the cached copy of `remote_path` is expected to live.
pub fn default_save_path_for(
    storage_root: &Path,
    account: &str,
    remote_path: &str,
) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }

    // Remote paths are POSIX-like ("/Docs/A.txt"); map them under the account directory.
    let mut out = account_save_dir(storage_root, account);
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Sibling path used while content is still being written.
pub fn partial_path_for(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_remote_path_under_account_dir() {
        let root = PathBuf::from("/cache");
        let mapped = default_save_path_for(&root, "alice@cloud.example", "/Docs/A.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/cache/alice%40cloud.example/Docs/A.txt"));
    }

    #[test]
    fn account_names_cannot_escape_the_root() {
        let root = PathBuf::from("/cache");
        assert_eq!(
            account_save_dir(&root, "../bob"),
            PathBuf::from("/cache/..%2Fbob")
        );
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/cache");
        assert!(matches!(
            default_save_path_for(&root, "alice", "../secret"),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(matches!(
            default_save_path_for(&root, "alice", ""),
            Err(PathError::Empty)
        ));
    }

    #[test]
    fn partial_path_is_a_sibling() {
        let partial = partial_path_for(Path::new("/cache/alice/a.txt"));
        assert_eq!(partial, PathBuf::from("/cache/alice/a.txt.partial"));
    }
}
