//! Filesystem object store for on-prem deployments.
//!
//! Keys map to paths under a root directory. Key segments may not be
//! absolute or contain `..`.

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tracing::debug;

use crate::{ObjectError, ObjectMeta, ObjectResult, ObjectStore};

/// Object store rooted at a local directory.
#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> ObjectResult<PathBuf> {
        let rel = Path::new(key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(ObjectError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn upload(&self, key: &str, body: &[u8]) -> ObjectResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ObjectError::Io(e.to_string()))?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ObjectError::Io(e.to_string()))?;
        debug!(key, size = body.len(), "object written");
        Ok(())
    }

    async fn download(&self, key: &str) -> ObjectResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectError::NotFound(key.to_string()))
            }
            Err(e) => Err(ObjectError::Io(e.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> ObjectResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ObjectError::Io(e.to_string()))?)
    }

    async fn delete(&self, key: &str) -> ObjectResult<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ObjectError::Io(e.to_string())),
        }
    }

    async fn list_by_prefix(&self, prefix: &str) -> ObjectResult<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ObjectError::Io(e.to_string())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ObjectError::Io(e.to_string()))?
            {
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| ObjectError::Io(e.to_string()))?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }
                let last_modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                out.push(ObjectMeta {
                    key,
                    size: meta.len(),
                    last_modified,
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}
