pub mod broker;
pub mod cancellation;
pub mod config;
pub mod connect;
pub mod dedup;
pub mod metrics;
pub mod queue;
pub mod selection;

#[cfg(feature = "aws")]
pub mod sqs;

pub use broker::{BrokerBuilder, Delivery, LabelDepth, LabeledQueue, PriorityBroker};
pub use cancellation::{CancellationRegistry, MemoryCancellations, StoreCancellations};
pub use config::{BrokerConfig, ConfigError, ObjectStoreKind, QueueSpec};
pub use connect::connect;
pub use dedup::{DedupRegistry, MemoryDedup, Reservation, StoreDedup};
pub use metrics::BrokerMetrics;
pub use queue::{MemoryQueue, QueueDepth, QueueError, QueueService, ReceivedMessage, SendRequest};

use stepq_core::{FailureKind, TaskId};
use stepq_offload::OffloadError;
use stepq_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Lease for task {task_id} expired")]
    LeaseExpired { task_id: TaskId },

    #[error("Unknown queue label: {0}")]
    UnknownQueue(String),

    #[error("Cancellation is not enabled")]
    CancellationDisabled,

    #[error("No result queue is configured")]
    ResultQueueNotConfigured,

    #[error("Message too large even after offload: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Offload(#[from] OffloadError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl BrokerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BrokerError::BrokerUnavailable(_)
            | BrokerError::UnknownQueue(_)
            | BrokerError::CancellationDisabled
            | BrokerError::ResultQueueNotConfigured => FailureKind::BrokerUnavailable,
            BrokerError::LeaseExpired { .. } => FailureKind::LeaseExpired,
            BrokerError::PayloadTooLarge { .. } | BrokerError::Protocol(_) => {
                FailureKind::MalformedMessage
            }
            BrokerError::Offload(e) => e.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::BrokerUnavailable(_) => true,
            BrokerError::Offload(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<QueueError> for BrokerError {
    fn from(err: QueueError) -> Self {
        BrokerError::BrokerUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
