//! File stores for uploaded vendor files

use crate::core::error::StoreError;
use crate::persistence::{FileStore, StoreResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// File store over the local filesystem, rooted at a base directory
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn map_io(path: &str, err: std::io::Error) -> StoreError {
        StoreError::Backend(format!("{}: {}", path, err))
    }
}

#[async_trait::async_trait]
impl FileStore for LocalFileStore {
    async fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        tokio::fs::read(self.resolve(path))
            .await
            .map_err(|e| Self::map_io(path, e))
    }

    async fn write(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_io(path, e))?;
        }
        tokio::fs::write(target, data)
            .await
            .map_err(|e| Self::map_io(path, e))
    }

    async fn move_file(&self, src: &str, dst: &str) -> StoreResult<()> {
        let target = self.resolve(dst);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_io(dst, e))?;
        }
        tokio::fs::rename(self.resolve(src), target)
            .await
            .map_err(|e| Self::map_io(src, e))
    }

    async fn list_files(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::map_io(prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::map_io(prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Self::map_io(prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let relative = relative.to_string_lossy().replace('\\', "/");
                    if relative.starts_with(prefix) {
                        found.push(relative);
                    }
                }
            }
        }

        found.sort();
        Ok(found)
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| Self::map_io(path, e))
    }
}

/// In-memory file store (for testing)
#[derive(Default)]
pub struct InMemoryFileStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl FileStore for InMemoryFileStore {
    async fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::Backend(format!("{}: no such file", path)))
    }

    async fn write(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        self.files
            .write()
            .await
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn move_file(&self, src: &str, dst: &str) -> StoreResult<()> {
        let mut files = self.files.write().await;
        let data = files
            .remove(src)
            .ok_or_else(|| StoreError::Backend(format!("{}: no such file", src)))?;
        files.insert(dst.to_string(), data);
        Ok(())
    }

    async fn list_files(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .files
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        Ok(self.files.read().await.contains_key(path))
    }
}
