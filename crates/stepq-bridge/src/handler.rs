use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use stepq_core::{FailureKind, TaskId};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Error, Debug)]
pub enum HandlerError {
    /// The arguments can never be executed; redelivery will not help.
    #[error("Invalid task arguments: {0}")]
    InvalidArgs(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HandlerError::InvalidArgs(_) => FailureKind::MalformedMessage,
            HandlerError::Cancelled => FailureKind::Cancelled,
            HandlerError::Failed(_) => FailureKind::HandlerExecutionError,
        }
    }
}

/// Result type for task handlers
pub type HandlerOutput = Result<Vec<u8>, HandlerError>;

/// What a running handler can see about its own delivery.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_name: String,
    receive_count: u32,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        task_name: impl Into<String>,
        receive_count: u32,
        cancel: CancellationToken,
    ) -> Self {
        TaskContext {
            task_id,
            task_name: task_name.into(),
            receive_count,
            cancel,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn receive_count(&self) -> u32 {
        self.receive_count
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Call between units of work. Returns `Cancelled` once cancellation
    /// has been observed for this task.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.cancel.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is observed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Trait for task handlers
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task with its resolved arguments
    async fn execute(&self, args: Vec<u8>, ctx: &TaskContext) -> HandlerOutput;
}

/// Registry of task handlers by task name
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a task name, replacing any previous one
    pub fn register<H: TaskHandler + 'static>(&self, task_name: impl Into<String>, handler: H) {
        self.register_shared(task_name, Arc::new(handler));
    }

    pub fn register_shared(&self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().insert(task_name.into(), handler);
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(task_name).cloned()
    }

    pub fn has_handler(&self, task_name: &str) -> bool {
        self.handlers.read().contains_key(task_name)
    }

    /// Registered task names, sorted
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns its arguments unchanged.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, args: Vec<u8>, ctx: &TaskContext) -> HandlerOutput {
        ctx.checkpoint()?;
        Ok(args)
    }
}

/// Runs an external command per task: arguments on stdin, result on stdout.
///
/// The task id, name and receive count are exported as `STEPQ_TASK_ID`,
/// `STEPQ_TASK_NAME` and `STEPQ_RECEIVE_COUNT`. A non-zero exit is a
/// handler failure carrying the tail of stderr. Once started, the process
/// runs to completion; cancellation is only checked before it starts.
#[derive(Debug, Clone)]
pub struct ProcessHandler {
    program: String,
    args: Vec<String>,
}

const STDERR_TAIL: usize = 2048;

impl ProcessHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        ProcessHandler {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. `None` if it is blank.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(ProcessHandler::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let mut start = text.len().saturating_sub(STDERR_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[async_trait]
impl TaskHandler for ProcessHandler {
    async fn execute(&self, args: Vec<u8>, ctx: &TaskContext) -> HandlerOutput {
        ctx.checkpoint()?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("STEPQ_TASK_ID", ctx.task_id().to_string())
            .env("STEPQ_TASK_NAME", ctx.task_name())
            .env("STEPQ_RECEIVE_COUNT", ctx.receive_count().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HandlerError::Failed(format!("failed to spawn {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HandlerError::Failed("child stdin unavailable".to_string()))?;
        let write_args = async move {
            let written = stdin.write_all(&args).await;
            drop(stdin);
            written
        };
        let (written, output) = tokio::join!(write_args, child.wait_with_output());

        // The command may legitimately exit without reading its input.
        if let Err(e) = written {
            debug!(task_id = %ctx.task_id(), error = %e, "could not write task arguments");
        }
        let output = output
            .map_err(|e| HandlerError::Failed(format!("failed to wait for {}: {e}", self.program)))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(HandlerError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr_tail(&output.stderr)
            )))
        }
    }
}
