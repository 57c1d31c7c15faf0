use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Arguments of every dispatched task kind, as JSON.
///
/// `context` is the orchestrator's own execution context and is passed
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub run_id: String,
    pub job_name: String,
    /// Steps to execute; empty means the whole job
    #[serde(default)]
    pub step_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_task_id: Option<String>,
    #[serde(default)]
    pub context: Value,
}

impl TaskArgs {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The part of the arguments needed to attribute a failure to a run.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RunScope {
    pub run_id: String,
    #[serde(default)]
    pub step_keys: Vec<String>,
}

impl RunScope {
    pub(crate) fn from_args(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}
