use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use stepq_core::TaskId;
use stepq_offload::{OffloadBackend, OffloadError};

/// Out-of-band cancellation markers keyed by task id.
#[async_trait]
pub trait CancellationRegistry: Send + Sync {
    async fn mark(&self, task_id: TaskId) -> Result<(), OffloadError>;

    async fn is_marked(&self, task_id: TaskId) -> Result<bool, OffloadError>;

    /// Removing a missing marker succeeds.
    async fn clear(&self, task_id: TaskId) -> Result<(), OffloadError>;
}

/// Markers visible only inside this process.
#[derive(Default)]
pub struct MemoryCancellations {
    markers: DashMap<TaskId, chrono::DateTime<Utc>>,
}

impl MemoryCancellations {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CancellationRegistry for MemoryCancellations {
    async fn mark(&self, task_id: TaskId) -> Result<(), OffloadError> {
        self.markers.insert(task_id, Utc::now());
        Ok(())
    }

    async fn is_marked(&self, task_id: TaskId) -> Result<bool, OffloadError> {
        Ok(self.markers.contains_key(&task_id))
    }

    async fn clear(&self, task_id: TaskId) -> Result<(), OffloadError> {
        self.markers.remove(&task_id);
        Ok(())
    }
}

/// Markers kept as records under a prefix of the offload store, so a cancel
/// issued from one process is seen by workers in another.
///
/// Marker objects are written and removed through the offload backend's
/// record operations, never through the raw store.
pub struct StoreCancellations {
    offload: OffloadBackend,
    prefix: String,
}

impl StoreCancellations {
    pub fn new(offload: OffloadBackend, prefix: impl Into<String>) -> Self {
        StoreCancellations {
            offload,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    fn key(&self, task_id: TaskId) -> String {
        format!("{}/{}", self.prefix, task_id)
    }
}

#[async_trait]
impl CancellationRegistry for StoreCancellations {
    async fn mark(&self, task_id: TaskId) -> Result<(), OffloadError> {
        let body = Bytes::from(Utc::now().to_rfc3339());
        self.offload.put_record(&self.key(task_id), body).await
    }

    async fn is_marked(&self, task_id: TaskId) -> Result<bool, OffloadError> {
        Ok(self.offload.get_record(&self.key(task_id)).await?.is_some())
    }

    async fn clear(&self, task_id: TaskId) -> Result<(), OffloadError> {
        self.offload.delete_record(&self.key(task_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stepq_core::RetryPolicy;
    use stepq_offload::{FsObjectStore, MemoryObjectStore, ObjectStore};
    use uuid::Uuid;

    fn offload(store: Arc<dyn ObjectStore>) -> OffloadBackend {
        OffloadBackend::new(store, "stepq/payloads", RetryPolicy::none())
    }

    async fn exercise(registry: &dyn CancellationRegistry) {
        let task_id = Uuid::new_v4();
        assert!(!registry.is_marked(task_id).await.unwrap());

        registry.mark(task_id).await.unwrap();
        registry.mark(task_id).await.unwrap();
        assert!(registry.is_marked(task_id).await.unwrap());
        assert!(!registry.is_marked(Uuid::new_v4()).await.unwrap());

        registry.clear(task_id).await.unwrap();
        registry.clear(task_id).await.unwrap();
        assert!(!registry.is_marked(task_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_markers() {
        exercise(&MemoryCancellations::new()).await;
    }

    #[tokio::test]
    async fn test_store_markers() {
        let store = Arc::new(MemoryObjectStore::new());
        exercise(&StoreCancellations::new(offload(store.clone()), "stepq/cancelled")).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_markers_shared_between_registries() {
        let dir = tempfile::tempdir().unwrap();
        let cancel_side = StoreCancellations::new(
            offload(Arc::new(FsObjectStore::new(dir.path()))),
            "stepq/cancelled",
        );
        let worker_side = StoreCancellations::new(
            offload(Arc::new(FsObjectStore::new(dir.path()))),
            "stepq/cancelled/",
        );

        let task_id = Uuid::new_v4();
        cancel_side.mark(task_id).await.unwrap();
        assert!(worker_side.is_marked(task_id).await.unwrap());
        worker_side.clear(task_id).await.unwrap();
        assert!(!cancel_side.is_marked(task_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_errors_surface() {
        let store = Arc::new(MemoryObjectStore::new());
        let registry = StoreCancellations::new(offload(store.clone()), "stepq/cancelled");
        store.fail_next(1);
        let err = registry.is_marked(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
