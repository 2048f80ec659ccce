use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::pathcheck::is_valid_path;

/// Sandboxed view of the device filesystem.
///
/// Device paths are absolute (`/web/app.js`) and are mapped below a single
/// host root directory. Callers are expected to run paths through
/// [`is_valid_path`] first; `resolve` re-checks anyway so a missed gate
/// cannot escape the root.
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Maps a validated device path onto the host filesystem, refusing
    /// symlinks anywhere along the way.
    pub async fn resolve(
        &self,
        device_path: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        if !is_valid_path(device_path) {
            return Err(StorageError::InvalidPath);
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(device_path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }
        let target = self.root.join(normalized);
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    pub async fn exists(&self, device_path: &str) -> bool {
        match self.resolve(device_path, true).await {
            Ok(target) => fs::metadata(target).await.is_ok(),
            Err(_) => false,
        }
    }

    pub async fn read_file(&self, device_path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(device_path, false).await?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            return Err(StorageError::InvalidPath);
        }
        Ok(fs::read(target).await?)
    }

    pub async fn list_dir(&self, device_path: &str) -> Result<Vec<FileEntry>, StorageError> {
        let target = self.resolve(device_path, false).await?;
        let mut dir = fs::read_dir(&target).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(FileEntry {
                name,
                size: metadata.len(),
                is_dir: metadata.is_dir(),
            });
        }

        entries.sort_by(|a, b| {
            b.is_dir
                .cmp(&a.is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(entries)
    }

    pub async fn delete(&self, device_path: &str) -> Result<(), StorageError> {
        let target = self.resolve(device_path, false).await?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(target).await?;
        } else {
            fs::remove_file(target).await?;
        }
        Ok(())
    }

    pub async fn create_dir(&self, device_path: &str) -> Result<(), StorageError> {
        let target = self.resolve(device_path, true).await?;
        fs::create_dir_all(target).await?;
        Ok(())
    }

    /// Walks the root and sums file sizes. Mirrors the flash usage counters
    /// the management UI charts.
    pub async fn used_bytes(&self) -> Result<u64, StorageError> {
        let mut pending = vec![self.root.clone()];
        let mut used = 0u64;

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else {
                    used += metadata.len();
                }
            }
        }

        Ok(used)
    }
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidPath => write!(f, "invalid path"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
}

#[cfg(test)]
mod tests {
    use super::{Storage, StorageError};
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");
        (temp, Storage::new(root))
    }

    #[tokio::test]
    async fn resolve_rejects_invalid_device_path() {
        let (_temp, storage) = make_storage();
        assert!(matches!(
            storage.resolve("relative.txt", true).await,
            Err(StorageError::InvalidPath)
        ));
        assert!(matches!(
            storage.resolve("/a/../b", true).await,
            Err(StorageError::InvalidPath)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage();
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, storage.root_path().join("link")).expect("symlink");

        let result = storage.resolve("/link", false).await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[tokio::test]
    async fn list_dir_reports_entries() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("b.txt"), b"abc").expect("write");
        std::fs::create_dir(storage.root_path().join("a")).expect("mkdir");

        let entries = storage.list_dir("/").await.expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].name, "b.txt");
        assert_eq!(entries[1].size, 3);
    }

    #[tokio::test]
    async fn used_bytes_sums_nested_files() {
        let (_temp, storage) = make_storage();
        std::fs::create_dir(storage.root_path().join("web")).expect("mkdir");
        std::fs::write(storage.root_path().join("web/app.js"), b"12345").expect("write");
        std::fs::write(storage.root_path().join("config.json"), b"{}").expect("write");

        assert_eq!(storage.used_bytes().await.expect("usage"), 7);
    }
}
