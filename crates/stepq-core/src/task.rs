use crate::{Priority, Result, TaskError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Task payload (opaque bytes)
pub type TaskPayload = Vec<u8>;

/// Name of one queue in the priority queue set
pub type QueueLabel = String;

/// The task kinds the orchestrator dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Execute one step (or a subset of a plan) of a run.
    ExecutePlan,
    /// Execute a whole run.
    ExecuteJob,
    /// Re-dispatch the incomplete part of an interrupted run.
    ResumeJob,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::ExecutePlan, TaskKind::ExecuteJob, TaskKind::ResumeJob];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ExecutePlan => "execute_plan",
            TaskKind::ExecuteJob => "execute_job",
            TaskKind::ResumeJob => "resume_job",
        }
    }
}

impl FromStr for TaskKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "execute_plan" => Ok(TaskKind::ExecutePlan),
            "execute_job" => Ok(TaskKind::ExecuteJob),
            "resume_job" => Ok(TaskKind::ResumeJob),
            other => Err(TaskError::UnknownTaskKind(other.to_string())),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A send request before the broker assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub task_name: String,
    pub args: TaskPayload,
    /// Falls back to the broker's default priority when unset.
    pub priority: Option<Priority>,
    /// Falls back to the broker's default queue when unset.
    pub queue_label: Option<QueueLabel>,
    pub dedup_key: Option<String>,
    pub delay_seconds: u32,
}

impl TaskRequest {
    pub fn builder(task_name: impl Into<String>, args: TaskPayload) -> TaskRequestBuilder {
        TaskRequestBuilder::new(task_name.into(), args)
    }
}

/// Builder for send requests
pub struct TaskRequestBuilder {
    request: TaskRequest,
}

impl TaskRequestBuilder {
    pub fn new(task_name: String, args: TaskPayload) -> Self {
        TaskRequestBuilder {
            request: TaskRequest {
                task_name,
                args,
                priority: None,
                queue_label: None,
                dedup_key: None,
                delay_seconds: 0,
            },
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.request.priority = Some(priority);
        self
    }

    pub fn queue(mut self, label: impl Into<QueueLabel>) -> Self {
        self.request.queue_label = Some(label.into());
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.request.dedup_key = Some(key.into());
        self
    }

    pub fn delay_seconds(mut self, delay: u32) -> Self {
        self.request.delay_seconds = delay;
        self
    }

    pub fn build(self) -> Result<TaskRequest> {
        let name = &self.request.task_name;
        if name.trim().is_empty() || name.chars().any(char::is_control) {
            return Err(TaskError::InvalidTaskName(name.clone()));
        }
        Ok(self.request)
    }
}

/// Immutable task message as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Unique while the message is in flight
    pub task_id: TaskId,

    /// Handler name (e.g., "execute_plan")
    pub task_name: String,

    /// Opaque arguments; may have been offloaded in transit
    pub args: TaskPayload,

    pub priority: Priority,

    pub queue_label: QueueLabel,

    pub dedup_key: Option<String>,

    /// When the broker accepted the message
    pub enqueue_time: DateTime<Utc>,
}

impl TaskMessage {
    /// Resolve a request into a message with the id and defaults chosen by the broker.
    pub fn from_request(
        request: TaskRequest,
        task_id: TaskId,
        priority: Priority,
        queue_label: QueueLabel,
    ) -> Self {
        TaskMessage {
            task_id,
            task_name: request.task_name,
            args: request.args,
            priority,
            queue_label,
            dedup_key: request.dedup_key,
            enqueue_time: Utc::now(),
        }
    }

    pub fn kind(&self) -> Option<TaskKind> {
        self.task_name.parse().ok()
    }
}

/// Final status reported on the result path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Succeeded => "succeeded",
            ResultStatus::Failed => "failed",
            ResultStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one task execution, published on the result path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_name: String,
    pub status: ResultStatus,
    pub output: TaskPayload,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn succeeded(message: &TaskMessage, output: TaskPayload) -> Self {
        Self::new(message, ResultStatus::Succeeded, output, None)
    }

    pub fn failed(message: &TaskMessage, error: impl Into<String>) -> Self {
        Self::new(message, ResultStatus::Failed, Vec::new(), Some(error.into()))
    }

    pub fn cancelled(task_id: TaskId, task_name: impl Into<String>) -> Self {
        TaskResult {
            task_id,
            task_name: task_name.into(),
            status: ResultStatus::Cancelled,
            output: Vec::new(),
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// Failure of a delivery whose message could not be rebuilt.
    pub fn rejected(task_id: TaskId, task_name: impl Into<String>, error: impl Into<String>) -> Self {
        TaskResult {
            task_id,
            task_name: task_name.into(),
            status: ResultStatus::Failed,
            output: Vec::new(),
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }

    fn new(
        message: &TaskMessage,
        status: ResultStatus,
        output: TaskPayload,
        error: Option<String>,
    ) -> Self {
        TaskResult {
            task_id: message.task_id,
            task_name: message.task_name.clone(),
            status,
            output,
            error,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_round_trip_names() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!(matches!(
            "compile".parse::<TaskKind>(),
            Err(TaskError::UnknownTaskKind(_))
        ));
    }

    #[test]
    fn test_request_builder() {
        let request = TaskRequest::builder("execute_plan", b"{}".to_vec())
            .priority(Priority::new(9))
            .queue("gpu")
            .dedup_key("run-1:step-a")
            .delay_seconds(3)
            .build()
            .unwrap();

        assert_eq!(request.priority, Some(Priority::new(9)));
        assert_eq!(request.queue_label.as_deref(), Some("gpu"));
        assert_eq!(request.dedup_key.as_deref(), Some("run-1:step-a"));
        assert_eq!(request.delay_seconds, 3);
    }

    #[test]
    fn test_request_builder_defaults_are_unset() {
        let request = TaskRequest::builder("execute_job", vec![]).build().unwrap();
        assert_eq!(request.priority, None);
        assert_eq!(request.queue_label, None);
        assert_eq!(request.dedup_key, None);
        assert_eq!(request.delay_seconds, 0);
    }

    #[test]
    fn test_rejects_blank_task_name() {
        assert!(TaskRequest::builder("  ", vec![]).build().is_err());
        assert!(TaskRequest::builder("bad\nname", vec![]).build().is_err());
    }

    #[test]
    fn test_message_from_request() {
        let request = TaskRequest::builder("execute_plan", vec![1, 2]).build().unwrap();
        let id = Uuid::new_v4();
        let message = TaskMessage::from_request(request, id, Priority::DEFAULT, "dagster".into());

        assert_eq!(message.task_id, id);
        assert_eq!(message.kind(), Some(TaskKind::ExecutePlan));
        assert_eq!(message.args, vec![1, 2]);
        assert_eq!(message.queue_label, "dagster");
    }

    #[test]
    fn test_result_constructors() {
        let request = TaskRequest::builder("execute_job", vec![]).build().unwrap();
        let message =
            TaskMessage::from_request(request, Uuid::new_v4(), Priority::DEFAULT, "dagster".into());

        let ok = TaskResult::succeeded(&message, b"done".to_vec());
        assert_eq!(ok.status, ResultStatus::Succeeded);
        assert_eq!(ok.output, b"done");

        let failed = TaskResult::failed(&message, "boom");
        assert_eq!(failed.status, ResultStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
