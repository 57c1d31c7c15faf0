mod error;
mod lease;
mod priority;
mod retry;
mod task;

pub use error::{FailureKind, Result, TaskError};
pub use lease::{Lease, PayloadPointer};
pub use priority::Priority;
pub use retry::RetryPolicy;
pub use task::{
    QueueLabel, ResultStatus, TaskId, TaskKind, TaskMessage, TaskPayload, TaskRequest,
    TaskRequestBuilder, TaskResult,
};

/// Queue label used when neither the request nor the configuration names one.
pub const DEFAULT_QUEUE_LABEL: &str = "dagster";
