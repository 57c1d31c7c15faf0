use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use stepq_core::TaskId;
use stepq_offload::{checksum, OffloadBackend, OffloadError};
use tokio::time::Instant;
use tracing::warn;

const PURGE_THRESHOLD: usize = 4096;

/// Outcome of reserving a dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The key is now held by the caller's task id
    Reserved,
    /// An unexpired send already holds the key
    Duplicate(TaskId),
}

/// Dedup records, keyed by dedup key, each held for the dedup window.
#[async_trait]
pub trait DedupRegistry: Send + Sync {
    async fn reserve(&self, key: &str, task_id: TaskId) -> Result<Reservation, OffloadError>;

    /// Drop a reservation whose send failed, unless another task id has
    /// since taken the key.
    async fn release(&self, key: &str, task_id: TaskId) -> Result<(), OffloadError>;
}

struct MemoryRecord {
    task_id: TaskId,
    expires_at: Instant,
}

/// Records visible only inside this process.
///
/// Reservation is atomic per key: of two concurrent sends with the same key
/// exactly one gets `Reserved`.
pub struct MemoryDedup {
    window: Duration,
    records: DashMap<String, MemoryRecord>,
}

impl MemoryDedup {
    pub fn new(window: Duration) -> Self {
        MemoryDedup {
            window,
            records: DashMap::new(),
        }
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.records.retain(|_, record| record.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DedupRegistry for MemoryDedup {
    async fn reserve(&self, key: &str, task_id: TaskId) -> Result<Reservation, OffloadError> {
        if self.records.len() > PURGE_THRESHOLD {
            self.purge_expired();
        }
        let now = Instant::now();
        let record = MemoryRecord {
            task_id,
            expires_at: now + self.window,
        };

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return Ok(Reservation::Duplicate(entry.get().task_id));
                }
                entry.insert(record);
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }
        Ok(Reservation::Reserved)
    }

    async fn release(&self, key: &str, task_id: TaskId) -> Result<(), OffloadError> {
        self.records
            .remove_if(key, |_, record| record.task_id == task_id);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    task_id: TaskId,
    expires_at: DateTime<Utc>,
}

/// Records kept in the offload store under a prefix, so every broker that
/// shares the store sees every other broker's sends.
///
/// Expiry uses wall-clock time. Reading and writing a record are separate
/// store calls, so two brokers reserving one key at the same instant may
/// both win; each then enqueues its own message under its own task id.
pub struct StoreDedup {
    offload: OffloadBackend,
    prefix: String,
    window: Duration,
}

impl StoreDedup {
    pub fn new(offload: OffloadBackend, prefix: impl Into<String>, window: Duration) -> Self {
        StoreDedup {
            offload,
            prefix: prefix.into().trim_matches('/').to_string(),
            window,
        }
    }

    /// Dedup keys are free text; the record key is their digest.
    fn record_key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, checksum(key.as_bytes()))
    }

    async fn load(&self, record_key: &str) -> Result<Option<StoredRecord>, OffloadError> {
        let Some(body) = self.offload.get_record(record_key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&body) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Overwritten by the next reservation.
                warn!(key = %record_key, error = %e, "ignoring unreadable dedup record");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl DedupRegistry for StoreDedup {
    async fn reserve(&self, key: &str, task_id: TaskId) -> Result<Reservation, OffloadError> {
        let record_key = self.record_key(key);
        let now = Utc::now();

        if let Some(existing) = self.load(&record_key).await? {
            if existing.expires_at > now {
                return Ok(Reservation::Duplicate(existing.task_id));
            }
        }

        let window = chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::zero());
        let record = StoredRecord {
            task_id,
            expires_at: now + window,
        };
        let body = serde_json::to_vec(&record)
            .map_err(|e| OffloadError::StorageUnavailable(e.to_string()))?;
        self.offload.put_record(&record_key, Bytes::from(body)).await?;
        Ok(Reservation::Reserved)
    }

    async fn release(&self, key: &str, task_id: TaskId) -> Result<(), OffloadError> {
        let record_key = self.record_key(key);
        match self.load(&record_key).await? {
            Some(existing) if existing.task_id == task_id => {
                self.offload.delete_record(&record_key).await
            }
            _ => Ok(()),
        }
    }
}
