use crate::ENVELOPE_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepq_core::{
    PayloadPointer, Priority, QueueLabel, ResultStatus, TaskId, TaskMessage, TaskPayload,
    TaskResult,
};

/// Where the payload of a message lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Inline(#[serde(with = "base64_bytes")] TaskPayload),
    Offloaded(PayloadPointer),
}

impl Body {
    pub fn pointer(&self) -> Option<&PayloadPointer> {
        match self {
            Body::Inline(_) => None,
            Body::Offloaded(pointer) => Some(pointer),
        }
    }
}

/// Task header plus body, exactly as carried by a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: TaskId,
    pub task_name: String,
    pub priority: Priority,
    pub queue_label: QueueLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub enqueue_time: DateTime<Utc>,
    pub body: Body,
}

impl TaskEnvelope {
    pub fn inline(message: &TaskMessage) -> Self {
        Self::with_body(message, Body::Inline(message.args.clone()))
    }

    pub fn offloaded(message: &TaskMessage, pointer: PayloadPointer) -> Self {
        Self::with_body(message, Body::Offloaded(pointer))
    }

    fn with_body(message: &TaskMessage, body: Body) -> Self {
        TaskEnvelope {
            task_id: message.task_id,
            task_name: message.task_name.clone(),
            priority: message.priority,
            queue_label: message.queue_label.clone(),
            dedup_key: message.dedup_key.clone(),
            enqueue_time: message.enqueue_time,
            body,
        }
    }

    /// Rebuild the message once the payload is at hand.
    pub fn into_message(self, args: TaskPayload) -> TaskMessage {
        TaskMessage {
            task_id: self.task_id,
            task_name: self.task_name,
            args,
            priority: self.priority,
            queue_label: self.queue_label,
            dedup_key: self.dedup_key,
            enqueue_time: self.enqueue_time,
        }
    }
}

/// Result header plus body for the result path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: TaskId,
    pub task_name: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub body: Body,
}

impl ResultEnvelope {
    pub fn inline(result: &TaskResult) -> Self {
        Self::with_body(result, Body::Inline(result.output.clone()))
    }

    pub fn offloaded(result: &TaskResult, pointer: PayloadPointer) -> Self {
        Self::with_body(result, Body::Offloaded(pointer))
    }

    fn with_body(result: &TaskResult, body: Body) -> Self {
        ResultEnvelope {
            task_id: result.task_id,
            task_name: result.task_name.clone(),
            status: result.status,
            error: result.error.clone(),
            completed_at: result.completed_at,
            body,
        }
    }

    pub fn into_result(self, output: TaskPayload) -> TaskResult {
        TaskResult {
            task_id: self.task_id,
            task_name: self.task_name,
            status: self.status,
            output,
            error: self.error,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Content {
    Task(TaskEnvelope),
    Result(ResultEnvelope),
}

/// Top-level JSON document stored in a queue message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(flatten)]
    pub content: Content,
}

impl Envelope {
    pub fn task(task: TaskEnvelope) -> Self {
        Envelope {
            v: ENVELOPE_VERSION,
            content: Content::Task(task),
        }
    }

    pub fn result(result: ResultEnvelope) -> Self {
        Envelope {
            v: ENVELOPE_VERSION,
            content: Content::Result(result),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
