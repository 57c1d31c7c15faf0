use crate::{QueueLabel, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reference to a payload that was too large to travel inline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadPointer {
    pub object_key: String,
    /// Size of the stored payload in bytes
    pub size: u64,
    /// SHA-256 of the payload, lowercase hex
    pub checksum: String,
}

/// Time-bounded right to process one received message.
///
/// A lease belongs to the execution unit that received it; nothing else may
/// renew or ack it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: TaskId,
    pub receipt_handle: String,
    pub queue_label: QueueLabel,
    pub visibility_deadline: DateTime<Utc>,
    /// How many times the provider has delivered this message (1 on first delivery)
    pub receive_count: u32,
    /// Offloaded payload to release once the message is deleted
    pub pointer: Option<PayloadPointer>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        self.visibility_deadline <= Utc::now()
    }

    /// Time left before the message becomes visible again; zero once expired.
    pub fn remaining(&self) -> Duration {
        (self.visibility_deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Same lease with a deadline `extension` from now.
    pub fn extended(&self, extension: Duration) -> Lease {
        let extension = chrono::Duration::from_std(extension).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Lease {
            visibility_deadline: Utc::now() + extension,
            ..self.clone()
        }
    }
}
