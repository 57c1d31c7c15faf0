pub mod dispatch;
pub mod handler;
pub mod orchestrator;
pub mod payload;
pub mod tags;

pub use dispatch::{Disposition, DispatchBridge, JobRequest, StepRequest};
pub use handler::{
    EchoHandler, HandlerError, HandlerRegistry, ProcessHandler, TaskContext, TaskHandler,
};
pub use orchestrator::{DetachedRunStore, FailureReport, MemoryRunStore, RunStore, StepStatus};
pub use payload::TaskArgs;
pub use tags::TagMap;

use stepq_broker::BrokerError;
use stepq_core::{FailureKind, TaskError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Invalid tag {key}={value:?}: {reason}")]
    InvalidTag {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Failed to encode task arguments: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Run store error: {0}")]
    RunStore(String),
}

impl BridgeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BridgeError::Broker(e) => e.kind(),
            BridgeError::RunStore(_) => FailureKind::BrokerUnavailable,
            BridgeError::InvalidTag { .. } | BridgeError::Task(_) | BridgeError::Encode(_) => {
                FailureKind::MalformedMessage
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Broker(e) => e.is_retryable(),
            BridgeError::RunStore(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
