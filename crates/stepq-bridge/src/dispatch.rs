//! Orchestrator ⇄ queue bridge.
//!
//! The send side turns step, job and resume launches into prioritized,
//! deduplicated task messages and records the task ids on the run. The
//! receive side runs one delivery through its handler and settles the
//! message according to how the attempt ended.

use crate::handler::{HandlerError, HandlerRegistry, TaskContext};
use crate::orchestrator::{FailureReport, RunStore};
use crate::payload::{RunScope, TaskArgs};
use crate::tags::{self, TagMap, TASK_ID_TAG};
use crate::Result;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use stepq_broker::{BrokerError, Delivery, PriorityBroker};
use stepq_core::{FailureKind, TaskId, TaskKind, TaskMessage, TaskRequest, TaskResult};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Launch of a single step of a run.
#[derive(Debug, Clone, Default)]
pub struct StepRequest {
    pub run_id: String,
    pub job_name: String,
    pub step_key: String,
    pub run_tags: TagMap,
    pub step_tags: TagMap,
    pub context: Value,
}

/// Launch (or resume) of a whole run.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub run_id: String,
    pub job_name: String,
    pub run_tags: TagMap,
    pub context: Value,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded; message acked
    Completed,
    /// Cancellation honoured; message acked
    Cancelled,
    /// Fatal delivery error reported; message acked
    Rejected,
    /// Left for redelivery
    Requeued,
    /// Last delivery failed; reported, left for the provider's redrive
    DeadLettered,
    /// Failed again past the redrive limit; acked without a second report
    Discarded,
    /// The lease was lost; nothing acked or reported
    Abandoned,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Completed => "succeeded",
            Disposition::Cancelled => "cancelled",
            Disposition::Rejected => "rejected",
            Disposition::Requeued => "requeued",
            Disposition::DeadLettered => "dead_lettered",
            Disposition::Discarded => "discarded",
            Disposition::Abandoned => "abandoned",
        }
    }
}

pub struct DispatchBridge {
    broker: Arc<PriorityBroker>,
    runs: Arc<dyn RunStore>,
    handlers: Arc<HandlerRegistry>,
}

impl DispatchBridge {
    pub fn new(
        broker: Arc<PriorityBroker>,
        runs: Arc<dyn RunStore>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        DispatchBridge {
            broker,
            runs,
            handlers,
        }
    }

    pub fn broker(&self) -> &Arc<PriorityBroker> {
        &self.broker
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Dispatch one step. The task id is written to the run under
    /// `stepq/task_id/<step_key>`.
    pub async fn execute_plan(&self, request: &StepRequest) -> Result<TaskId> {
        let args = TaskArgs {
            run_id: request.run_id.clone(),
            job_name: request.job_name.clone(),
            step_keys: vec![request.step_key.clone()],
            previous_task_id: None,
            context: request.context.clone(),
        };
        let task_id = self
            .dispatch(
                TaskKind::ExecutePlan,
                &args,
                &request.step_tags,
                &request.run_tags,
                format!("{}:{}", request.run_id, request.step_key),
            )
            .await?;

        self.runs
            .set_run_tag(
                &request.run_id,
                &tags::step_task_id_tag(&request.step_key),
                &task_id.to_string(),
            )
            .await?;
        info!(%task_id, run_id = %request.run_id, step_key = %request.step_key, "dispatched step");
        Ok(task_id)
    }

    /// Dispatch a whole run; the task id is written under `stepq/task_id`.
    pub async fn execute_job(&self, request: &JobRequest) -> Result<TaskId> {
        let args = TaskArgs {
            run_id: request.run_id.clone(),
            job_name: request.job_name.clone(),
            step_keys: Vec::new(),
            previous_task_id: None,
            context: request.context.clone(),
        };
        let task_id = self
            .dispatch(
                TaskKind::ExecuteJob,
                &args,
                &TagMap::new(),
                &request.run_tags,
                request.run_id.clone(),
            )
            .await?;

        self.runs
            .set_run_tag(&request.run_id, TASK_ID_TAG, &task_id.to_string())
            .await?;
        info!(%task_id, run_id = %request.run_id, job_name = %request.job_name, "dispatched job");
        Ok(task_id)
    }

    /// Re-dispatch the steps of an interrupted run that have not completed.
    /// Returns `None` without sending anything when every step is complete.
    pub async fn resume_job(&self, request: &JobRequest) -> Result<Option<TaskId>> {
        let statuses = self.runs.step_statuses(&request.run_id).await?;
        let incomplete: Vec<String> = statuses
            .into_iter()
            .filter(|(_, status)| !status.is_complete())
            .map(|(step_key, _)| step_key)
            .collect();

        let previous_task_id = request.run_tags.get(TASK_ID_TAG).cloned();
        if incomplete.is_empty() {
            info!(run_id = %request.run_id, "nothing to resume");
            return Ok(None);
        }

        let dedup_key = format!("{}:resume:{}", request.run_id, incomplete.join(","));
        let args = TaskArgs {
            run_id: request.run_id.clone(),
            job_name: request.job_name.clone(),
            step_keys: incomplete,
            previous_task_id: previous_task_id.clone(),
            context: request.context.clone(),
        };
        let task_id = self
            .dispatch(
                TaskKind::ResumeJob,
                &args,
                &TagMap::new(),
                &request.run_tags,
                dedup_key,
            )
            .await?;

        self.runs
            .set_run_tag(&request.run_id, TASK_ID_TAG, &task_id.to_string())
            .await?;
        info!(
            %task_id,
            run_id = %request.run_id,
            previous_task_id = previous_task_id.as_deref().unwrap_or("none"),
            steps = args.step_keys.len(),
            "resumed job"
        );
        Ok(Some(task_id))
    }

    async fn dispatch(
        &self,
        kind: TaskKind,
        args: &TaskArgs,
        step_tags: &TagMap,
        run_tags: &TagMap,
        dedup_key: String,
    ) -> Result<TaskId> {
        let config = self.broker.config();
        let priority = tags::resolve_priority(step_tags, run_tags, config.default_priority())?;
        let queue = tags::resolve_queue(step_tags, run_tags, &config.task_default_queue);

        let request = TaskRequest::builder(kind.as_str(), args.encode()?)
            .priority(priority)
            .queue(queue)
            .dedup_key(dedup_key)
            .build()?;
        Ok(self.broker.send(request).await?)
    }

    /// Run one delivery through its handler and settle the message.
    ///
    /// `cancel` is the unit's cooperative cancellation flag; whoever keeps
    /// the lease may flip it while the handler runs.
    pub async fn process(&self, delivery: &Delivery, cancel: CancellationToken) -> Disposition {
        let started = Instant::now();
        let disposition = self.settle(delivery, cancel).await;
        self.broker.metrics().observe_task(
            delivery.task_name(),
            disposition.as_str(),
            started.elapsed().as_secs_f64(),
        );
        disposition
    }

    async fn settle(&self, delivery: &Delivery, cancel: CancellationToken) -> Disposition {
        let task_id = delivery.task_id();

        if cancel.is_cancelled() || self.cancellation_requested(task_id).await {
            return self.honour_cancellation(delivery).await;
        }

        let message = match self.broker.resolve(delivery).await {
            Ok(message) => message,
            Err(e) if e.kind().is_fatal_for_message() => {
                return self.reject(delivery, None, e.kind(), e.to_string()).await;
            }
            Err(e) => {
                warn!(%task_id, kind = %e.kind(), error = %e, "could not resolve task arguments");
                return Disposition::Requeued;
            }
        };

        let Some(handler) = self.handlers.get(&message.task_name) else {
            let error = format!("no handler registered for {:?}", message.task_name);
            let scope = RunScope::from_args(&message.args);
            return self.reject(delivery, scope, FailureKind::UnknownTask, error).await;
        };

        let ctx = TaskContext::new(
            task_id,
            message.task_name.clone(),
            delivery.receive_count(),
            cancel.clone(),
        );
        match handler.execute(message.args.clone(), &ctx).await {
            Ok(output) => self.complete(delivery, &message, output).await,
            Err(HandlerError::Cancelled) => self.honour_cancellation(delivery).await,
            Err(e @ HandlerError::InvalidArgs(_)) => {
                let scope = RunScope::from_args(&message.args);
                self.reject(delivery, scope, e.kind(), e.to_string()).await
            }
            Err(HandlerError::Failed(error)) => {
                if cancel.is_cancelled() || self.cancellation_requested(task_id).await {
                    return self.honour_cancellation(delivery).await;
                }
                self.fail(delivery, &message, error).await
            }
        }
    }

    async fn cancellation_requested(&self, task_id: TaskId) -> bool {
        match self.broker.is_cancelled(task_id).await {
            Ok(marked) => marked,
            Err(e) => {
                warn!(%task_id, kind = %e.kind(), error = %e, "could not check cancellation");
                false
            }
        }
    }

    async fn ack_or(&self, delivery: &Delivery, settled: Disposition) -> Disposition {
        match self.broker.ack(&delivery.lease).await {
            Ok(()) => settled,
            Err(BrokerError::LeaseExpired { .. }) => Disposition::Abandoned,
            Err(e) => {
                error!(
                    task_id = %delivery.task_id(),
                    kind = %e.kind(),
                    error = %e,
                    "ack failed; message will be redelivered"
                );
                Disposition::Requeued
            }
        }
    }

    async fn publish(&self, result: &TaskResult) {
        if let Err(e) = self.broker.publish_result(result).await {
            error!(task_id = %result.task_id, kind = %e.kind(), error = %e, "failed to publish result");
        }
    }

    async fn complete(&self, delivery: &Delivery, message: &TaskMessage, output: Vec<u8>) -> Disposition {
        self.publish(&TaskResult::succeeded(message, output)).await;
        let disposition = self.ack_or(delivery, Disposition::Completed).await;
        if disposition == Disposition::Completed {
            info!(task_id = %message.task_id, task_name = %message.task_name, "task succeeded");
        }
        disposition
    }

    async fn honour_cancellation(&self, delivery: &Delivery) -> Disposition {
        let task_id = delivery.task_id();
        let disposition = self.ack_or(delivery, Disposition::Cancelled).await;
        if disposition != Disposition::Cancelled {
            return disposition;
        }
        if let Err(e) = self.broker.clear_cancellation(task_id).await {
            warn!(%task_id, kind = %e.kind(), error = %e, "could not clear cancellation marker");
        }
        self.publish(&TaskResult::cancelled(task_id, delivery.task_name()))
            .await;
        info!(%task_id, kind = %FailureKind::Cancelled, "cancellation honoured");
        disposition
    }

    async fn reject(
        &self,
        delivery: &Delivery,
        scope: Option<RunScope>,
        kind: FailureKind,
        error: String,
    ) -> Disposition {
        let task_id = delivery.task_id();
        error!(%task_id, %kind, error = %error, "task cannot be executed; dropping message");
        self.report(delivery, scope, kind, &error).await;
        self.publish(&TaskResult::rejected(task_id, delivery.task_name(), &error))
            .await;
        self.ack_or(delivery, Disposition::Rejected).await
    }

    async fn fail(&self, delivery: &Delivery, message: &TaskMessage, error: String) -> Disposition {
        let task_id = delivery.task_id();
        let kind = FailureKind::HandlerExecutionError;
        let receive_count = delivery.receive_count();
        let max_receive_count = self.broker.config().max_receive_count;

        if receive_count < max_receive_count {
            warn!(
                %task_id,
                %kind,
                receive_count,
                max_receive_count,
                error = %error,
                "handler failed; leaving for redelivery"
            );
            return Disposition::Requeued;
        }

        if receive_count > max_receive_count {
            // Already reported on the final delivery; no redrive moved it.
            error!(
                %task_id,
                %kind,
                receive_count,
                max_receive_count,
                error = %error,
                "handler failed past the redrive limit; discarding message"
            );
            return self.ack_or(delivery, Disposition::Discarded).await;
        }

        error!(%task_id, %kind, receive_count, error = %error, "handler failed on final delivery");
        self.report(delivery, RunScope::from_args(&message.args), kind, &error)
            .await;
        self.publish(&TaskResult::failed(message, &error)).await;
        Disposition::DeadLettered
    }

    async fn report(
        &self,
        delivery: &Delivery,
        scope: Option<RunScope>,
        kind: FailureKind,
        error: &str,
    ) {
        let task_id = delivery.task_id();
        let Some(scope) = scope else {
            warn!(%task_id, %kind, "failure cannot be attributed to a run");
            return;
        };
        let report = FailureReport {
            run_id: scope.run_id,
            step_keys: scope.step_keys,
            task_id,
            task_name: delivery.task_name().to_string(),
            kind,
            error: error.to_string(),
            receive_count: delivery.receive_count(),
            reported_at: Utc::now(),
        };
        if let Err(e) = self.runs.report_failure(report).await {
            error!(%task_id, kind = %e.kind(), error = %e, "could not report failure to the orchestrator");
        }
    }
}
