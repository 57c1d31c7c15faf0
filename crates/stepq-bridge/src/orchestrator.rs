//! The orchestrator as seen from the bridge: run state reads, tag writes
//! and terminal failure reports.

use crate::tags::TagMap;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stepq_core::{FailureKind, TaskId};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Complete steps are left out of a resume.
    pub fn is_complete(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }
}

/// A terminal failure of one dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub run_id: String,
    /// Empty for whole-job tasks
    pub step_keys: Vec<String>,
    pub task_id: TaskId,
    pub task_name: String,
    pub kind: FailureKind,
    pub error: String,
    pub receive_count: u32,
    pub reported_at: DateTime<Utc>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Status of every step of the run's plan, keyed by step key.
    async fn step_statuses(&self, run_id: &str) -> Result<BTreeMap<String, StepStatus>>;

    async fn set_run_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    async fn report_failure(&self, report: FailureReport) -> Result<()>;
}

#[derive(Debug, Default)]
struct RunRecord {
    tags: TagMap,
    steps: BTreeMap<String, StepStatus>,
    failures: Vec<FailureReport>,
}

/// In-process run store.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: DashMap<String, RunRecord>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_step_status(&self, run_id: &str, step_key: &str, status: StepStatus) {
        self.runs
            .entry(run_id.to_string())
            .or_default()
            .steps
            .insert(step_key.to_string(), status);
    }

    pub fn run_tags(&self, run_id: &str) -> TagMap {
        self.runs
            .get(run_id)
            .map(|run| run.tags.clone())
            .unwrap_or_default()
    }

    pub fn tag(&self, run_id: &str, key: &str) -> Option<String> {
        self.runs.get(run_id)?.tags.get(key).cloned()
    }

    pub fn failures(&self, run_id: &str) -> Vec<FailureReport> {
        self.runs
            .get(run_id)
            .map(|run| run.failures.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn step_statuses(&self, run_id: &str) -> Result<BTreeMap<String, StepStatus>> {
        Ok(self
            .runs
            .get(run_id)
            .map(|run| run.steps.clone())
            .unwrap_or_default())
    }

    async fn set_run_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.runs
            .entry(run_id.to_string())
            .or_default()
            .tags
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn report_failure(&self, report: FailureReport) -> Result<()> {
        self.runs
            .entry(report.run_id.clone())
            .or_default()
            .failures
            .push(report);
        Ok(())
    }
}

/// Run store for workers with no direct line to the orchestrator.
///
/// Reports are logged; the orchestrator learns outcomes from the result
/// queue instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedRunStore;

#[async_trait]
impl RunStore for DetachedRunStore {
    async fn step_statuses(&self, _run_id: &str) -> Result<BTreeMap<String, StepStatus>> {
        Ok(BTreeMap::new())
    }

    async fn set_run_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        debug!(run_id, key, value, "run tag not persisted");
        Ok(())
    }

    async fn report_failure(&self, report: FailureReport) -> Result<()> {
        warn!(
            task_id = %report.task_id,
            kind = %report.kind,
            run_id = %report.run_id,
            steps = ?report.step_keys,
            error = %report.error,
            "terminal task failure"
        );
        Ok(())
    }
}
