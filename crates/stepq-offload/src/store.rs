use crate::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::debug;

/// Key/value object storage. Adapters are shared by every execution unit and
/// must be safe for concurrent use.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError>;

    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<(), StoreError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// In-process object store.
///
/// Supports a total byte quota and injected transport faults so failure paths
/// can be exercised without a real service.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Bytes>,
    quota_bytes: Option<usize>,
    used_bytes: AtomicUsize,
    pending_faults: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        MemoryObjectStore {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Make the next `count` calls fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    fn inject_fault(&self) -> Result<(), StoreError> {
        let taken = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Unavailable("injected fault".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.inject_fault()?;

        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes.load(Ordering::SeqCst);
            if used + body.len() > quota {
                return Err(StoreError::QuotaExceeded(format!(
                    "{} bytes requested, {} of {} in use",
                    body.len(),
                    used,
                    quota
                )));
            }
        }

        self.used_bytes.fetch_add(body.len(), Ordering::SeqCst);
        if let Some(previous) = self.objects.insert(key.to_string(), body) {
            self.used_bytes.fetch_sub(previous.len(), Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError> {
        self.inject_fault()?;
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.inject_fault()?;
        if let Some((_, previous)) = self.objects.remove(key) {
            self.used_bytes.fetch_sub(previous.len(), Ordering::SeqCst);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Directory-backed object store for local runs and offline testing.
/// Keys map to relative paths under the root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsObjectStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(err: std::io::Error, key: &str) -> StoreError {
    match err.kind() {
        ErrorKind::NotFound => StoreError::NotFound {
            key: key.to_string(),
        },
        _ => StoreError::Unavailable(format!("{key}: {err}")),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, key))?;
        }

        // Write then rename so readers never observe a partial object.
        let staging = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, &body)
            .await
            .map_err(|e| io_error(e, key))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| io_error(e, key))?;

        debug!(key, bytes = body.len(), "stored object");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path).await.map_err(|e| io_error(e, key))?;
        Ok(Bytes::from(data))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e, key)),
        }
    }

    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_quota() {
        let store = MemoryObjectStore::with_quota(10);
        store.put_object("a", Bytes::from_static(b"12345")).await.unwrap();

        let err = store
            .put_object("b", Bytes::from_static(b"1234567"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded(_)));

        store.delete_object("a").await.unwrap();
        store.put_object("b", Bytes::from_static(b"1234567")).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_injected_faults() {
        let store = MemoryObjectStore::new();
        store.fail_next(2);

        assert!(store.get_object("x").await.unwrap_err().is_retryable());
        assert!(store.put_object("x", Bytes::new()).await.is_err());
        store.put_object("x", Bytes::new()).await.unwrap();
        assert!(store.contains("x"));
    }

    #[tokio::test]
    async fn test_fs_store_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store
            .put_object("stepq/payloads/abc/1", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        let data = store.get_object("stepq/payloads/abc/1").await.unwrap();
        assert_eq!(&data[..], b"payload");

        store.delete_object("stepq/payloads/abc/1").await.unwrap();
        store.delete_object("stepq/payloads/abc/1").await.unwrap();
        assert!(matches!(
            store.get_object("stepq/payloads/abc/1").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        for key in ["../outside", "/etc/passwd", "", "a/../../b"] {
            assert!(matches!(
                store.put_object(key, Bytes::new()).await,
                Err(StoreError::InvalidKey(_))
            ));
        }
    }
}
