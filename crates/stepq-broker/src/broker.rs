use crate::cancellation::{CancellationRegistry, MemoryCancellations};
use crate::config::{validate_queue_set, BrokerConfig, ConfigError, MAX_VISIBILITY_TIMEOUT_SECS};
use crate::dedup::{DedupRegistry, MemoryDedup, Reservation};
use crate::metrics::BrokerMetrics;
use crate::queue::{QueueDepth, QueueError, QueueService, SendRequest, MAX_RECEIVE_BATCH};
use crate::selection::PollPlanner;
use crate::{BrokerError, Result};

use chrono::Utc;
use futures::Stream;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use stepq_core::{
    FailureKind, Lease, PayloadPointer, QueueLabel, RetryPolicy, TaskId, TaskMessage, TaskRequest,
    TaskResult,
};
use stepq_offload::{MemoryObjectStore, ObjectStore, OffloadBackend};
use stepq_protocol::{Body, BodyCodec, Envelope, ProtocolError, ResultEnvelope, TaskEnvelope};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Provider ceiling for a per-message delay.
const MAX_DELAY_SECONDS: u32 = 900;

const ACKED_RECEIPTS: usize = 4096;
const RESULT_GROUP_ID: &str = "stepq-results";

/// A queue handle bound to its label.
pub struct LabeledQueue {
    pub label: QueueLabel,
    pub weight: u32,
    pub queue: Arc<dyn QueueService>,
}

/// A received task message together with the lease that covers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub envelope: TaskEnvelope,
    pub lease: Lease,
}

impl Delivery {
    pub fn task_id(&self) -> TaskId {
        self.envelope.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.envelope.task_name
    }

    pub fn receive_count(&self) -> u32 {
        self.lease.receive_count
    }
}

/// Approximate depth of one label, for `worker list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelDepth {
    pub label: QueueLabel,
    pub weight: u32,
    pub url: String,
    #[serde(flatten)]
    pub depth: QueueDepth,
}

/// Priority-aware broker over a set of labeled queues.
///
/// Owns the queue handles and all lease bookkeeping. Construct it once and
/// share it (`Arc`) with the bridge and the worker runtime.
pub struct PriorityBroker {
    config: BrokerConfig,
    queues: Vec<LabeledQueue>,
    planner: PollPlanner,
    results: Option<Arc<dyn QueueService>>,
    codec: BodyCodec,
    offload: OffloadBackend,
    dedup: Arc<dyn DedupRegistry>,
    cancellations: Arc<dyn CancellationRegistry>,
    acked: Mutex<LruCache<String, ()>>,
    retry: RetryPolicy,
    metrics: Arc<BrokerMetrics>,
}

/// Assembles a broker from explicit adapters.
pub struct BrokerBuilder {
    config: BrokerConfig,
    queues: Vec<LabeledQueue>,
    results: Option<Arc<dyn QueueService>>,
    store: Option<Arc<dyn ObjectStore>>,
    dedup: Option<Arc<dyn DedupRegistry>>,
    cancellations: Option<Arc<dyn CancellationRegistry>>,
    metrics: Option<Arc<BrokerMetrics>>,
}

impl BrokerBuilder {
    pub fn queue(
        mut self,
        label: impl Into<QueueLabel>,
        weight: u32,
        queue: Arc<dyn QueueService>,
    ) -> Self {
        self.queues.push(LabeledQueue {
            label: label.into(),
            weight,
            queue,
        });
        self
    }

    pub fn result_queue(mut self, queue: Arc<dyn QueueService>) -> Self {
        self.results = Some(queue);
        self
    }

    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to records kept inside this broker.
    pub fn dedup(mut self, registry: Arc<dyn DedupRegistry>) -> Self {
        self.dedup = Some(registry);
        self
    }

    pub fn cancellations(mut self, registry: Arc<dyn CancellationRegistry>) -> Self {
        self.cancellations = Some(registry);
        self
    }

    pub fn metrics(mut self, metrics: Arc<BrokerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(mut self) -> std::result::Result<PriorityBroker, ConfigError> {
        self.config.validate_settings()?;
        validate_queue_set(
            self.queues.iter().map(|q| (q.label.as_str(), q.weight)),
            &self.config.task_default_queue,
        )?;
        self.queues.sort_by(|a, b| b.weight.cmp(&a.weight));

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(BrokerMetrics::new()?),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryObjectStore::new()) as Arc<dyn ObjectStore>);
        let retry = self.config.retry_policy();
        let planner = PollPlanner::new(
            self.queues.iter().map(|q| q.weight).collect(),
            self.config.is_fair(),
        );
        let acked_capacity = NonZeroUsize::new(ACKED_RECEIPTS).unwrap_or(NonZeroUsize::MIN);

        Ok(PriorityBroker {
            codec: BodyCodec::new(self.config.max_message_size),
            offload: OffloadBackend::new(store, self.config.payload_prefix.clone(), retry.clone()),
            dedup: self.dedup.unwrap_or_else(|| {
                Arc::new(MemoryDedup::new(self.config.dedup_window())) as Arc<dyn DedupRegistry>
            }),
            cancellations: self
                .cancellations
                .unwrap_or_else(|| Arc::new(MemoryCancellations::new()) as Arc<dyn CancellationRegistry>),
            acked: Mutex::new(LruCache::new(acked_capacity)),
            results: self.results,
            queues: self.queues,
            planner,
            retry,
            metrics,
            config: self.config,
        })
    }
}

impl PriorityBroker {
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder {
            config,
            queues: Vec::new(),
            results: None,
            store: None,
            dedup: None,
            cancellations: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    pub fn offload(&self) -> &OffloadBackend {
        &self.offload
    }

    /// Labels in descending weight order
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|q| q.label.as_str())
    }

    fn queue(&self, label: &str) -> Result<&LabeledQueue> {
        self.queues
            .iter()
            .find(|q| q.label == label)
            .ok_or_else(|| BrokerError::UnknownQueue(label.to_string()))
    }

    /// Enqueue a task and return its id.
    ///
    /// With deduplication enabled, a dedup key still held by an earlier send
    /// returns that send's task id and enqueues nothing. On FIFO queues the
    /// provider deduplicates by task id, so it only ever suppresses a resend
    /// of a message that is already queued under the returned id.
    pub async fn send(&self, request: TaskRequest) -> Result<TaskId> {
        let label = request
            .queue_label
            .clone()
            .unwrap_or_else(|| self.config.task_default_queue.clone());
        let queue = self.queue(&label)?;
        let priority = request
            .priority
            .unwrap_or_else(|| self.config.default_priority());
        let delay_seconds = request.delay_seconds.min(MAX_DELAY_SECONDS);
        let task_id = Uuid::new_v4();

        let dedup_key = request
            .dedup_key
            .clone()
            .filter(|_| self.config.use_task_id_for_deduplication);
        if let Some(key) = &dedup_key {
            if let Reservation::Duplicate(existing) = self.dedup.reserve(key, task_id).await? {
                self.metrics.dedup_suppressed.inc();
                info!(task_id = %existing, dedup_key = %key, "suppressed duplicate send");
                return Ok(existing);
            }
        }

        let message = TaskMessage::from_request(request, task_id, priority, label);
        if let Err(e) = self.enqueue(queue, &message, delay_seconds).await {
            if let Some(key) = &dedup_key {
                if let Err(release) = self.dedup.release(key, task_id).await {
                    warn!(%task_id, dedup_key = %key, error = %release, "could not release dedup key");
                }
            }
            error!(%task_id, kind = %e.kind(), error = %e, "send failed");
            return Err(e);
        }
        Ok(task_id)
    }

    async fn enqueue(
        &self,
        queue: &LabeledQueue,
        message: &TaskMessage,
        delay_seconds: u32,
    ) -> Result<()> {
        let (body, pointer) = self
            .encode_with_offload(
                &message.args,
                || Envelope::task(TaskEnvelope::inline(message)),
                |pointer| Envelope::task(TaskEnvelope::offloaded(message, pointer)),
            )
            .await?;

        let fifo = queue.queue.is_fifo();
        let request = SendRequest {
            body,
            delay_seconds,
            dedup_id: fifo.then(|| message.task_id.to_string()),
            group_id: fifo.then(|| queue.label.clone()),
        };

        let sent = self
            .retry
            .run(
                "send_message",
                || queue.queue.send_message(request.clone()),
                QueueError::is_retryable,
            )
            .await;

        match sent {
            Ok(message_id) => {
                self.metrics
                    .messages_sent
                    .with_label_values(&[queue.label.as_str()])
                    .inc();
                debug!(
                    task_id = %message.task_id,
                    task_name = %message.task_name,
                    label = %queue.label,
                    priority = %message.priority,
                    %message_id,
                    offloaded = pointer.is_some(),
                    "sent task"
                );
                Ok(())
            }
            Err(e) => {
                // No message references the object.
                if let Some(pointer) = &pointer {
                    self.offload.delete(pointer).await;
                }
                Err(e.into())
            }
        }
    }

    /// Encode inline, or offload the payload and encode a pointer when the
    /// inline body is over the provider limit.
    async fn encode_with_offload<I, O>(
        &self,
        payload: &[u8],
        inline: I,
        offloaded: O,
    ) -> Result<(String, Option<PayloadPointer>)>
    where
        I: FnOnce() -> Envelope,
        O: FnOnce(PayloadPointer) -> Envelope,
    {
        let body = self.codec.encode(&inline())?;
        if self.codec.fits(&body) {
            return Ok((body, None));
        }

        let pointer = self.offload.put(payload).await?;
        self.metrics.payloads_offloaded.inc();

        match self.codec.encode_checked(&offloaded(pointer.clone())) {
            Ok(body) => Ok((body, Some(pointer))),
            Err(e) => {
                self.offload.delete(&pointer).await;
                Err(match e {
                    ProtocolError::MessageTooLarge { size, max } => {
                        BrokerError::PayloadTooLarge { size, max }
                    }
                    other => other.into(),
                })
            }
        }
    }

    /// Receive up to `max_messages` deliveries, waiting up to `wait`.
    ///
    /// An empty batch means the wait elapsed. With several labels, each cycle
    /// short-polls them in poll-planner order and stops at the first label
    /// that yields messages; empty cycles repeat every `poll_interval`.
    pub async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let max = max_messages.clamp(1, MAX_RECEIVE_BATCH);

        if let [only] = self.queues.as_slice() {
            return self.poll(only, max, wait).await;
        }

        let deadline = Instant::now() + wait;
        loop {
            for index in self.planner.next_cycle() {
                let deliveries = self.poll(&self.queues[index], max, Duration::ZERO).await?;
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    async fn poll(&self, queue: &LabeledQueue, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let visibility = self.config.visibility_timeout();
        // The provider starts the visibility clock no earlier than this.
        let requested_at = Utc::now();

        let received = self
            .retry
            .run(
                "receive_message",
                || queue.queue.receive_messages(max, wait, visibility),
                QueueError::is_retryable,
            )
            .await?;

        let deadline = requested_at
            + chrono::Duration::from_std(visibility).unwrap_or_else(|_| chrono::Duration::zero());
        let mut deliveries = Vec::with_capacity(received.len());

        for message in received {
            let envelope = match self.codec.decode_task(&message.body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(
                        label = %queue.label,
                        message_id = %message.message_id,
                        kind = %FailureKind::MalformedMessage,
                        error = %e,
                        "discarding undecodable message"
                    );
                    if let Err(e) = queue.queue.delete_message(&message.receipt_handle).await {
                        warn!(message_id = %message.message_id, error = %e, "failed to discard message");
                    }
                    continue;
                }
            };

            deliveries.push(Delivery {
                lease: Lease {
                    task_id: envelope.task_id,
                    receipt_handle: message.receipt_handle,
                    queue_label: queue.label.clone(),
                    visibility_deadline: deadline,
                    receive_count: message.receive_count,
                    pointer: envelope.body.pointer().cloned(),
                },
                envelope,
            });
        }

        if !deliveries.is_empty() {
            self.metrics
                .messages_received
                .with_label_values(&[queue.label.as_str()])
                .inc_by(deliveries.len() as u64);
            // Stable: equal priorities keep provider order.
            deliveries.sort_by(|a, b| b.envelope.priority.cmp(&a.envelope.priority));
        }
        Ok(deliveries)
    }

    /// Endless stream of deliveries; each batch comes from `receive`.
    pub fn stream(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> impl Stream<Item = Result<Delivery>> + '_ {
        futures::stream::unfold(VecDeque::new(), move |mut buffered| async move {
            loop {
                if let Some(delivery) = buffered.pop_front() {
                    return Some((Ok(delivery), buffered));
                }
                match self.receive(max_messages, wait).await {
                    Ok(batch) => buffered.extend(batch),
                    Err(e) => return Some((Err(e), buffered)),
                }
            }
        })
    }

    /// Rebuild the full message, fetching an offloaded payload if needed.
    pub async fn resolve(&self, delivery: &Delivery) -> Result<TaskMessage> {
        let args = match &delivery.envelope.body {
            Body::Inline(args) => args.clone(),
            Body::Offloaded(pointer) => self.offload.get(pointer).await?,
        };
        Ok(delivery.envelope.clone().into_message(args))
    }

    /// Push the lease deadline `extension` into the future.
    pub async fn renew_lease(&self, lease: &Lease, extension: Duration) -> Result<Lease> {
        if lease.is_expired() {
            return Err(self.lease_expired(lease));
        }
        let queue = self.queue(&lease.queue_label)?;
        let extension = extension.min(Duration::from_secs(MAX_VISIBILITY_TIMEOUT_SECS));
        let renewed = lease.extended(extension);

        let result = self
            .retry
            .run(
                "change_visibility",
                || queue.queue.change_visibility(&lease.receipt_handle, extension),
                QueueError::is_retryable,
            )
            .await;

        match result {
            Ok(()) => {
                self.metrics.lease_renewals.inc();
                debug!(task_id = %lease.task_id, extension_secs = extension.as_secs(), "renewed lease");
                Ok(renewed)
            }
            Err(QueueError::ReceiptInvalid(_)) => Err(self.lease_expired(lease)),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the message and then its offloaded payload. Acking the same
    /// lease again is a no-op.
    pub async fn ack(&self, lease: &Lease) -> Result<()> {
        if self.acked.lock().contains(&lease.receipt_handle) {
            debug!(task_id = %lease.task_id, "lease already acked");
            return Ok(());
        }
        let queue = self.queue(&lease.queue_label)?;

        let result = self
            .retry
            .run(
                "delete_message",
                || queue.queue.delete_message(&lease.receipt_handle),
                QueueError::is_retryable,
            )
            .await;
        match result {
            Ok(()) => {}
            Err(QueueError::ReceiptInvalid(_)) => return Err(self.lease_expired(lease)),
            Err(e) => return Err(e.into()),
        }

        self.acked.lock().put(lease.receipt_handle.clone(), ());
        self.metrics
            .messages_acked
            .with_label_values(&[queue.label.as_str()])
            .inc();
        if let Some(pointer) = &lease.pointer {
            self.offload.delete(pointer).await;
        }
        debug!(task_id = %lease.task_id, "acked");
        Ok(())
    }

    fn lease_expired(&self, lease: &Lease) -> BrokerError {
        self.metrics.lease_expirations.inc();
        warn!(
            task_id = %lease.task_id,
            kind = %FailureKind::LeaseExpired,
            "lease is no longer held"
        );
        BrokerError::LeaseExpired {
            task_id: lease.task_id,
        }
    }

    /// Set a cancellation marker. Advisory: a unit already running the task
    /// only notices at its next checkpoint.
    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        if !self.config.enable_cancellation {
            return Err(BrokerError::CancellationDisabled);
        }
        self.cancellations.mark(task_id).await?;
        info!(%task_id, "cancellation requested");
        Ok(())
    }

    pub async fn is_cancelled(&self, task_id: TaskId) -> Result<bool> {
        if !self.config.enable_cancellation {
            return Ok(false);
        }
        Ok(self.cancellations.is_marked(task_id).await?)
    }

    /// Consume a marker once the cancellation has been honoured.
    pub async fn clear_cancellation(&self, task_id: TaskId) -> Result<()> {
        if !self.config.enable_cancellation {
            return Ok(());
        }
        Ok(self.cancellations.clear(task_id).await?)
    }

    /// Publish a task outcome on the result queue, offloading large outputs.
    /// Without a result queue the outcome is only logged.
    pub async fn publish_result(&self, result: &TaskResult) -> Result<()> {
        let Some(queue) = &self.results else {
            debug!(
                task_id = %result.task_id,
                status = result.status.as_str(),
                "no result queue configured"
            );
            return Ok(());
        };

        let (body, pointer) = self
            .encode_with_offload(
                &result.output,
                || Envelope::result(ResultEnvelope::inline(result)),
                |pointer| Envelope::result(ResultEnvelope::offloaded(result, pointer)),
            )
            .await?;

        let fifo = queue.is_fifo();
        let request = SendRequest {
            body,
            delay_seconds: 0,
            dedup_id: fifo.then(|| format!("{}-{}", result.task_id, result.status.as_str())),
            group_id: fifo.then(|| RESULT_GROUP_ID.to_string()),
        };
        let sent = self
            .retry
            .run(
                "publish_result",
                || queue.send_message(request.clone()),
                QueueError::is_retryable,
            )
            .await;

        if let Err(e) = sent {
            if let Some(pointer) = &pointer {
                self.offload.delete(pointer).await;
            }
            return Err(e.into());
        }
        debug!(task_id = %result.task_id, status = result.status.as_str(), "published result");
        Ok(())
    }

    /// Consume published results. Each result is deleted from the result
    /// queue once read.
    pub async fn receive_results(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<TaskResult>> {
        let queue = self
            .results
            .as_ref()
            .ok_or(BrokerError::ResultQueueNotConfigured)?;
        let max = max_messages.clamp(1, MAX_RECEIVE_BATCH);
        let visibility = self.config.visibility_timeout();

        let received = self
            .retry
            .run(
                "receive_results",
                || queue.receive_messages(max, wait, visibility),
                QueueError::is_retryable,
            )
            .await?;

        let mut results = Vec::with_capacity(received.len());
        for message in received {
            let envelope = match self.codec.decode_result(&message.body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(
                        message_id = %message.message_id,
                        kind = %FailureKind::MalformedMessage,
                        error = %e,
                        "discarding undecodable result"
                    );
                    if let Err(e) = queue.delete_message(&message.receipt_handle).await {
                        warn!(message_id = %message.message_id, error = %e, "failed to discard result");
                    }
                    continue;
                }
            };

            let output = match &envelope.body {
                Body::Inline(output) => output.clone(),
                Body::Offloaded(pointer) => match self.offload.get(pointer).await {
                    Ok(output) => output,
                    Err(e) if e.is_retryable() => {
                        // Left invisible; it comes back after the timeout.
                        warn!(task_id = %envelope.task_id, kind = %e.kind(), error = %e, "result payload unavailable");
                        continue;
                    }
                    Err(e) => {
                        error!(task_id = %envelope.task_id, kind = %e.kind(), error = %e, "result payload lost");
                        if let Err(e) = queue.delete_message(&message.receipt_handle).await {
                            warn!(task_id = %envelope.task_id, error = %e, "failed to discard result");
                        }
                        continue;
                    }
                },
            };
            let pointer = envelope.body.pointer().cloned();

            self.retry
                .run(
                    "delete_result",
                    || queue.delete_message(&message.receipt_handle),
                    QueueError::is_retryable,
                )
                .await?;
            if let Some(pointer) = &pointer {
                self.offload.delete(pointer).await;
            }
            results.push(envelope.into_result(output));
        }
        Ok(results)
    }

    /// Approximate depth of every label; also refreshes the depth gauges.
    pub async fn queue_depths(&self) -> Result<Vec<LabelDepth>> {
        let mut depths = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            let depth = self
                .retry
                .run(
                    "queue_depth",
                    || queue.queue.approximate_depth(),
                    QueueError::is_retryable,
                )
                .await?;
            self.metrics.set_queue_depth(
                &queue.label,
                depth.visible,
                depth.in_flight,
                depth.delayed,
            );
            depths.push(LabelDepth {
                label: queue.label.clone(),
                weight: queue.weight,
                url: queue.queue.url().to_string(),
                depth,
            });
        }
        Ok(depths)
    }
}
