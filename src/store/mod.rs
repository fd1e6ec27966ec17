use base64::Engine;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Other(String),
}

/// Metadata returned by a head request; enough for the integrity
/// verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    /// Base64 of the MD5 digest, matching the GCS object hash format.
    pub md5_base64: Option<String>,
}

/// The opaque object store the pipeline writes to. Production plugs a
/// cloud client in behind this seam; tests and local runs use the
/// filesystem implementation below.
pub trait ObjectStore: Send + Sync + 'static {
    fn put(
        &self,
        local: &Path,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn head(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<ObjectMeta, StoreError>> + Send;

    fn rename(
        &self,
        from: &str,
        to: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn list(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn delete(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

/// Base64 MD5 of a local file, the same encoding object-store heads
/// report.
pub async fn local_md5_base64(path: &Path) -> Result<String, StoreError> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(base64::engine::general_purpose::STANDARD.encode(hasher.finalize()))
}

/// Filesystem-backed object store rooted at a directory. Keys map to
/// relative paths; heads hash the stored bytes so the integrity
/// verifier exercises the same code path as a cloud deployment.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for FsObjectStore {
    async fn put(&self, local: &Path, key: &str) -> Result<(), StoreError> {
        let dest = self.resolve(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &dest).await?;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let path = self.resolve(key);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| StoreError::NotFound(key.to_string()))?;
        let md5 = local_md5_base64(&path).await?;
        Ok(ObjectMeta {
            size: meta.len(),
            md5_base64: Some(md5),
        })
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let dest = self.resolve(to);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.resolve(from), dest)
            .await
            .map_err(StoreError::from)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let base = self.root.clone();
        let start = self.resolve(prefix);
        let mut pending = vec![if start.is_dir() { start } else { base.clone() }];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&base) {
                    let key = crate::partition::to_store_path(rel);
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.resolve(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
