use crate::{ObjectStore, OffloadError, Result, StoreError};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use stepq_core::{PayloadPointer, RetryPolicy};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_PAYLOAD_PREFIX: &str = "stepq/payloads";

/// SHA-256 of `data` as lowercase hex.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stores oversized message and result bodies out of band.
///
/// Has no opinion on sizes and no knowledge of queues: callers decide when to
/// offload. This is the only component that deletes objects: payloads, and
/// the small keyed records other components keep in the same store.
#[derive(Clone)]
pub struct OffloadBackend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    retry: RetryPolicy,
}

impl OffloadBackend {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, retry: RetryPolicy) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        OffloadBackend {
            store,
            prefix,
            retry,
        }
    }

    /// Store a payload under a fresh, content-derived key.
    pub async fn put(&self, payload: &[u8]) -> Result<PayloadPointer> {
        let checksum = checksum(payload);
        // Unique suffix: identical payloads in flight must not share an object,
        // or deleting one would orphan the other's pointer.
        let object_key = format!("{}/{}/{}", self.prefix, checksum, Uuid::new_v4());
        let body = Bytes::copy_from_slice(payload);

        self.retry
            .run(
                "object_put",
                || self.store.put_object(&object_key, body.clone()),
                StoreError::is_retryable,
            )
            .await
            .map_err(OffloadError::from)?;

        debug!(key = %object_key, bytes = payload.len(), "offloaded payload");
        Ok(PayloadPointer {
            object_key,
            size: payload.len() as u64,
            checksum,
        })
    }

    /// Fetch and verify the payload a pointer refers to.
    pub async fn get(&self, pointer: &PayloadPointer) -> Result<Vec<u8>> {
        let data = self
            .retry
            .run(
                "object_get",
                || self.store.get_object(&pointer.object_key),
                StoreError::is_retryable,
            )
            .await
            .map_err(OffloadError::from)?;

        if data.len() as u64 != pointer.size || checksum(&data) != pointer.checksum {
            return Err(OffloadError::ChecksumMismatch {
                key: pointer.object_key.clone(),
            });
        }
        Ok(data.to_vec())
    }

    /// Write a small record under an exact key, replacing any previous one.
    pub async fn put_record(&self, key: &str, body: Bytes) -> Result<()> {
        self.retry
            .run(
                "record_put",
                || self.store.put_object(key, body.clone()),
                StoreError::is_retryable,
            )
            .await
            .map_err(OffloadError::from)
    }

    /// `None` when no record is stored under `key`.
    pub async fn get_record(&self, key: &str) -> Result<Option<Bytes>> {
        let result = self
            .retry
            .run(
                "record_get",
                || self.store.get_object(key),
                StoreError::is_retryable,
            )
            .await;
        match result {
            Ok(body) => Ok(Some(body)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removing a missing record succeeds. Unlike `delete`, failures surface.
    pub async fn delete_record(&self, key: &str) -> Result<()> {
        self.retry
            .run(
                "record_delete",
                || self.store.delete_object(key),
                StoreError::is_retryable,
            )
            .await
            .map_err(OffloadError::from)?;
        debug!(key, "deleted record");
        Ok(())
    }

    /// Best effort: a leaked object is preferable to blocking message deletion.
    pub async fn delete(&self, pointer: &PayloadPointer) {
        let result = self
            .retry
            .run(
                "object_delete",
                || self.store.delete_object(&pointer.object_key),
                StoreError::is_retryable,
            )
            .await;

        match result {
            Ok(()) => debug!(key = %pointer.object_key, "released offloaded payload"),
            Err(e) => warn!(key = %pointer.object_key, error = %e, "failed to delete offloaded payload"),
        }
    }
}
