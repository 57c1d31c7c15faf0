use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Invalid priority value: {0:?}")]
    InvalidPriority(String),

    #[error("Invalid task name: {0:?}")]
    InvalidTaskName(String),

    #[error("Unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Failure taxonomy shared by every component.
///
/// The snake-case name is what shows up in logs (`kind = ...`) and in metric
/// labels, so the strings are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transport or configuration error talking to the queue service.
    BrokerUnavailable,
    /// A lease renewal lost the race against its visibility deadline.
    LeaseExpired,
    /// An offload pointer names an object that is gone.
    ObjectNotFound,
    /// Transport error talking to the object store.
    StorageUnavailable,
    /// The object store refused the write.
    StorageQuotaExceeded,
    /// Message body could not be decoded or its payload failed verification.
    MalformedMessage,
    /// No handler is registered for the task name.
    UnknownTask,
    /// The dispatched handler itself failed.
    HandlerExecutionError,
    /// Cooperative cancellation was observed.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::BrokerUnavailable => "broker_unavailable",
            FailureKind::LeaseExpired => "lease_expired",
            FailureKind::ObjectNotFound => "object_not_found",
            FailureKind::StorageUnavailable => "storage_unavailable",
            FailureKind::StorageQuotaExceeded => "storage_quota_exceeded",
            FailureKind::MalformedMessage => "malformed_message",
            FailureKind::UnknownTask => "unknown_task",
            FailureKind::HandlerExecutionError => "handler_execution_error",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Fatal kinds can never succeed on redelivery of the same message.
    pub fn is_fatal_for_message(&self) -> bool {
        matches!(
            self,
            FailureKind::ObjectNotFound | FailureKind::MalformedMessage | FailureKind::UnknownTask
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
