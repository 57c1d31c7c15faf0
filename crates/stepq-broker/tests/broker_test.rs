// Integration tests for the priority broker against the in-process queue
// emulator and object store.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use stepq_broker::{
    BrokerConfig, BrokerError, DedupRegistry, MemoryQueue, PriorityBroker, QueueService,
    SendRequest, StoreDedup,
};
use stepq_core::{Priority, ResultStatus, RetryPolicy, TaskId, TaskMessage, TaskRequest, TaskResult};
use stepq_offload::{MemoryObjectStore, ObjectStore, OffloadBackend};
use stepq_protocol::Body;

const WAIT: Duration = Duration::from_secs(1);

struct Harness {
    broker: PriorityBroker,
    queues: Vec<Arc<MemoryQueue>>,
    results: Arc<MemoryQueue>,
    store: Arc<MemoryObjectStore>,
}

fn base_config() -> BrokerConfig {
    BrokerConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        retry_max_attempts: 3,
        ..Default::default()
    }
}

fn harness(config: BrokerConfig, labels: &[(&str, u32)]) -> Harness {
    let store = Arc::new(MemoryObjectStore::new());
    let results = Arc::new(MemoryQueue::new("memory://results", config.dedup_window()));
    let mut queues = Vec::new();
    let mut builder = PriorityBroker::builder(config.clone())
        .object_store(store.clone())
        .result_queue(results.clone());

    for (label, weight) in labels {
        let queue = Arc::new(MemoryQueue::new(
            format!("memory://{label}"),
            config.dedup_window(),
        ));
        builder = builder.queue(*label, *weight, queue.clone());
        queues.push(queue);
    }

    Harness {
        broker: builder.build().unwrap(),
        queues,
        results,
        store,
    }
}

fn single() -> Harness {
    harness(base_config(), &[("dagster", 1)])
}

fn request(name: &str, args: Vec<u8>) -> TaskRequest {
    TaskRequest::builder(name, args).build().unwrap()
}

#[tokio::test]
async fn test_inline_round_trip() {
    let h = single();
    let args = vec![42u8; 2 * 1024];
    let task_id = h
        .broker
        .send(
            TaskRequest::builder("execute_plan", args.clone())
                .priority(Priority::new(5))
                .queue("dagster")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let deliveries = h.broker.receive(10, WAIT).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    assert_eq!(delivery.task_id(), task_id);
    assert!(matches!(delivery.envelope.body, Body::Inline(_)));
    assert!(delivery.lease.pointer.is_none());
    assert_eq!(delivery.receive_count(), 1);

    let message: TaskMessage = h.broker.resolve(delivery).await.unwrap();
    assert_eq!(message.args, args);
    assert_eq!(message.task_name, "execute_plan");
    assert_eq!(message.queue_label, "dagster");
    assert_eq!(message.priority, Priority::new(5));

    h.broker.ack(&delivery.lease).await.unwrap();
    assert!(h.queues[0].is_empty());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_oversized_payload_is_offloaded() {
    let h = single();
    let args: Vec<u8> = (0..5 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let task_id = h
        .broker
        .send(request("execute_job", args.clone()))
        .await
        .unwrap();
    assert_eq!(h.store.len(), 1);

    let deliveries = h.broker.receive(1, WAIT).await.unwrap();
    let delivery = &deliveries[0];
    assert_eq!(delivery.task_id(), task_id);
    let pointer = delivery.lease.pointer.clone().unwrap();
    assert_eq!(delivery.envelope.body, Body::Offloaded(pointer.clone()));
    assert_eq!(pointer.size, args.len() as u64);

    let message = h.broker.resolve(delivery).await.unwrap();
    assert_eq!(message.args, args);

    h.broker.ack(&delivery.lease).await.unwrap();
    assert!(!h.store.contains(&pointer.object_key));
}

#[tokio::test]
async fn test_missing_offloaded_object_is_fatal() {
    let h = single();
    h.broker
        .send(request("execute_job", vec![1u8; 300 * 1024]))
        .await
        .unwrap();
    for key in h.store.keys() {
        h.store.delete_object(&key).await.unwrap();
    }

    let deliveries = h.broker.receive(1, WAIT).await.unwrap();
    let err = h.broker.resolve(&deliveries[0]).await.unwrap_err();
    assert_eq!(err.kind(), stepq_core::FailureKind::ObjectNotFound);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_payload_too_large_even_after_offload() {
    let config = BrokerConfig {
        max_message_size: 64,
        ..base_config()
    };
    let h = harness(config, &[("dagster", 1)]);

    let err = h
        .broker
        .send(request("execute_plan", vec![0u8; 1024]))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PayloadTooLarge { max: 64, .. }));
    assert!(h.store.is_empty());
    assert!(h.queues[0].is_empty());
}

#[tokio::test]
async fn test_ack_twice_is_noop() {
    let h = single();
    h.broker.send(request("execute_plan", vec![])).await.unwrap();
    let deliveries = h.broker.receive(1, WAIT).await.unwrap();

    h.broker.ack(&deliveries[0].lease).await.unwrap();
    h.queues[0].fail_next(10);
    h.broker.ack(&deliveries[0].lease).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dedup_window() {
    let config = BrokerConfig {
        use_task_id_for_deduplication: true,
        dedup_window_secs: 300,
        ..base_config()
    };
    let h = harness(config, &[("dagster", 1)]);
    let keyed = || {
        TaskRequest::builder("execute_plan", b"step".to_vec())
            .dedup_key("run-1:step_a")
            .build()
            .unwrap()
    };

    let first = h.broker.send(keyed()).await.unwrap();
    let second = h.broker.send(keyed()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.queues[0].len(), 1);

    tokio::time::advance(Duration::from_secs(301)).await;
    let third = h.broker.send(keyed()).await.unwrap();
    assert_ne!(first, third);
    assert_eq!(h.queues[0].len(), 2);
}

/// A broker in its own "process": private dedup records unless `shared`
/// records are given, but the same FIFO queue as its peers.
fn peer_broker(
    config: &BrokerConfig,
    queue: &Arc<MemoryQueue>,
    store: &Arc<MemoryObjectStore>,
    shared: Option<Arc<dyn DedupRegistry>>,
) -> PriorityBroker {
    let mut builder = PriorityBroker::builder(config.clone())
        .object_store(store.clone())
        .queue("dagster", 1, queue.clone());
    if let Some(shared) = shared {
        builder = builder.dedup(shared);
    }
    builder.build().unwrap()
}

async fn drain_task_ids(broker: &PriorityBroker) -> Vec<TaskId> {
    let mut ids = Vec::new();
    loop {
        let deliveries = broker.receive(10, Duration::ZERO).await.unwrap();
        if deliveries.is_empty() {
            return ids;
        }
        for delivery in deliveries {
            ids.push(delivery.task_id());
            broker.ack(&delivery.lease).await.unwrap();
        }
    }
}

fn step_a() -> TaskRequest {
    TaskRequest::builder("execute_plan", b"step".to_vec())
        .dedup_key("run-1:step_a")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_shared_dedup_records_across_brokers() {
    let config = BrokerConfig {
        use_task_id_for_deduplication: true,
        ..base_config()
    };
    let queue = Arc::new(MemoryQueue::new("memory://dagster.fifo", config.dedup_window()));
    let store = Arc::new(MemoryObjectStore::new());
    let records = || -> Arc<dyn DedupRegistry> {
        Arc::new(StoreDedup::new(
            OffloadBackend::new(store.clone(), "stepq/payloads", RetryPolicy::none()),
            "stepq/dedup",
            config.dedup_window(),
        ))
    };
    let here = peer_broker(&config, &queue, &store, Some(records()));
    let there = peer_broker(&config, &queue, &store, Some(records()));

    let first = here.send(step_a()).await.unwrap();
    let second = there.send(step_a()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(queue.len(), 1);
    assert_eq!(drain_task_ids(&there).await, [first]);
}

#[tokio::test]
async fn test_every_returned_task_id_is_queued_on_fifo() {
    let config = BrokerConfig {
        use_task_id_for_deduplication: true,
        ..base_config()
    };
    let queue = Arc::new(MemoryQueue::new("memory://dagster.fifo", config.dedup_window()));
    let store = Arc::new(MemoryObjectStore::new());
    let here = peer_broker(&config, &queue, &store, None);
    let there = peer_broker(&config, &queue, &store, None);

    // Neither broker sees the other's record; the provider must not turn
    // the second send into an id that no message carries.
    let first = here.send(step_a()).await.unwrap();
    let second = there.send(step_a()).await.unwrap();

    let mut delivered = drain_task_ids(&here).await;
    delivered.sort();
    let mut returned = vec![first, second];
    returned.sort();
    assert_eq!(delivered, returned);
}

#[tokio::test]
async fn test_fifo_resend_of_same_task_is_suppressed() {
    let config = BrokerConfig {
        use_task_id_for_deduplication: true,
        ..base_config()
    };
    let queue = Arc::new(MemoryQueue::new("memory://dagster.fifo", config.dedup_window()));
    let store = Arc::new(MemoryObjectStore::new());
    let broker = peer_broker(&config, &queue, &store, None);

    // A retried send the provider had already accepted carries the same
    // task id as its dedup id.
    let first = broker.send(step_a()).await.unwrap();
    queue
        .send_message(SendRequest {
            body: "resend".into(),
            dedup_id: Some(first.to_string()),
            group_id: Some("dagster".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(drain_task_ids(&broker).await, [first]);
}

#[tokio::test]
async fn test_dedup_disabled_sends_every_time() {
    let h = single();
    let keyed = || {
        TaskRequest::builder("execute_plan", vec![])
            .dedup_key("run-1")
            .build()
            .unwrap()
    };
    let a = h.broker.send(keyed()).await.unwrap();
    let b = h.broker.send(keyed()).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(h.queues[0].len(), 2);
}

#[tokio::test]
async fn test_failed_send_releases_dedup_key() {
    let config = BrokerConfig {
        use_task_id_for_deduplication: true,
        ..base_config()
    };
    let h = harness(config, &[("dagster", 1)]);
    let keyed = || {
        TaskRequest::builder("execute_plan", vec![])
            .dedup_key("run-2")
            .build()
            .unwrap()
    };

    h.queues[0].fail_next(10);
    let err = h.broker.send(keyed()).await.unwrap_err();
    assert!(matches!(err, BrokerError::BrokerUnavailable(_)));
    assert!(err.is_retryable());

    h.queues[0].fail_next(0);
    h.broker.send(keyed()).await.unwrap();
    assert_eq!(h.queues[0].len(), 1);
}

#[tokio::test]
async fn test_transient_faults_are_retried() {
    let h = single();
    h.queues[0].fail_next(2);
    h.broker.send(request("execute_plan", vec![])).await.unwrap();
    h.queues[0].fail_next(2);
    assert_eq!(h.broker.receive(1, WAIT).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_queue_label() {
    let h = single();
    let err = h
        .broker
        .send(
            TaskRequest::builder("execute_plan", vec![])
                .queue("nowhere")
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnknownQueue(label) if label == "nowhere"));
}

async fn fill(h: &Harness, label: &str, count: usize) {
    for _ in 0..count {
        h.broker
            .send(
                TaskRequest::builder("execute_plan", label.as_bytes().to_vec())
                    .queue(label)
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_fair_mode_serves_low_priority_label() {
    let config = BrokerConfig {
        is_fair_queue: Some(true),
        task_default_queue: "high".into(),
        ..base_config()
    };
    let h = harness(config, &[("high", 10), ("low", 1)]);
    fill(&h, "high", 30).await;
    fill(&h, "low", 30).await;

    let mut served = Vec::new();
    for _ in 0..22 {
        let deliveries = h.broker.receive(1, WAIT).await.unwrap();
        served.push(deliveries[0].lease.queue_label.clone());
    }

    for window in served.chunks(11) {
        assert_eq!(window.iter().filter(|l| *l == "high").count(), 10);
        assert_eq!(window.iter().filter(|l| *l == "low").count(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_strict_mode_drains_high_first() {
    let config = BrokerConfig {
        task_default_queue: "high".into(),
        ..base_config()
    };
    let h = harness(config, &[("low", 1), ("high", 10)]);
    fill(&h, "high", 3).await;
    fill(&h, "low", 3).await;

    let mut served = Vec::new();
    for _ in 0..6 {
        let deliveries = h.broker.receive(1, WAIT).await.unwrap();
        served.push(deliveries[0].lease.queue_label.clone());
    }
    assert_eq!(served, ["high", "high", "high", "low", "low", "low"]);
    assert!(h.broker.receive(1, WAIT).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_multi_label_wait_sees_late_send() {
    let config = BrokerConfig {
        task_default_queue: "high".into(),
        poll_interval_ms: 200,
        ..base_config()
    };
    let h = Arc::new(harness(config, &[("high", 10), ("low", 1)]));

    let sender = {
        let h = h.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            fill(&h, "low", 1).await;
        })
    };

    let deliveries = h.broker.receive(1, Duration::from_secs(20)).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].lease.queue_label, "low");
    sender.await.unwrap();
}

#[tokio::test]
async fn test_batch_is_ordered_by_priority() {
    let h = single();
    for priority in [1, 9, 5] {
        h.broker
            .send(
                TaskRequest::builder("execute_plan", vec![])
                    .priority(Priority::new(priority))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
    }

    let deliveries = h.broker.receive(10, WAIT).await.unwrap();
    let priorities: Vec<i32> = deliveries
        .iter()
        .map(|d| d.envelope.priority.value())
        .collect();
    assert_eq!(priorities, [9, 5, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_unrenewed_lease_is_redelivered() {
    let config = BrokerConfig {
        visibility_timeout_secs: 2,
        ..base_config()
    };
    let h = harness(config, &[("dagster", 1)]);
    let task_id = h
        .broker
        .send(request("execute_plan", b"x".to_vec()))
        .await
        .unwrap();

    let first = h.broker.receive(1, Duration::ZERO).await.unwrap();
    assert!(h.broker.receive(1, Duration::ZERO).await.unwrap().is_empty());

    tokio::time::advance(Duration::from_secs(3)).await;
    let second = h.broker.receive(1, Duration::ZERO).await.unwrap();
    assert_eq!(second[0].task_id(), task_id);
    assert_eq!(second[0].receive_count(), 2);

    let stale = &first[0].lease;
    assert!(matches!(
        h.broker.renew_lease(stale, Duration::from_secs(2)).await,
        Err(BrokerError::LeaseExpired { .. })
    ));
    let err = h.broker.ack(stale).await.unwrap_err();
    assert_eq!(err.kind(), stepq_core::FailureKind::LeaseExpired);

    h.broker.ack(&second[0].lease).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_renewed_lease_stays_hidden() {
    let config = BrokerConfig {
        visibility_timeout_secs: 2,
        ..base_config()
    };
    let h = harness(config, &[("dagster", 1)]);
    h.broker.send(request("execute_plan", vec![])).await.unwrap();

    let deliveries = h.broker.receive(1, Duration::ZERO).await.unwrap();
    let mut lease = deliveries[0].lease.clone();
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(1)).await;
        lease = h
            .broker
            .renew_lease(&lease, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(h.broker.receive(1, Duration::ZERO).await.unwrap().is_empty());
    }
    h.broker.ack(&lease).await.unwrap();
    assert!(h.queues[0].is_empty());
}

#[tokio::test]
async fn test_cancellation_disabled() {
    let h = single();
    let task_id = h.broker.send(request("execute_plan", vec![])).await.unwrap();

    assert!(matches!(
        h.broker.cancel(task_id).await,
        Err(BrokerError::CancellationDisabled)
    ));
    assert!(!h.broker.is_cancelled(task_id).await.unwrap());
}

#[tokio::test]
async fn test_cancellation_marker_lifecycle() {
    let config = BrokerConfig {
        enable_cancellation: true,
        ..base_config()
    };
    let h = harness(config, &[("dagster", 1)]);
    let task_id = h.broker.send(request("execute_plan", vec![])).await.unwrap();
    assert!(!h.broker.is_cancelled(task_id).await.unwrap());

    h.broker.cancel(task_id).await.unwrap();
    assert!(h.broker.is_cancelled(task_id).await.unwrap());
    // Marker only: the message is still queued.
    assert_eq!(h.queues[0].len(), 1);

    h.broker.clear_cancellation(task_id).await.unwrap();
    assert!(!h.broker.is_cancelled(task_id).await.unwrap());
}

#[tokio::test]
async fn test_result_path_round_trip() {
    let h = single();
    let message = TaskMessage::from_request(
        request("execute_plan", vec![]),
        uuid::Uuid::new_v4(),
        Priority::DEFAULT,
        "dagster".into(),
    );
    let small = TaskResult::succeeded(&message, b"done".to_vec());
    let large = TaskResult::succeeded(&message, vec![9u8; 400 * 1024]);
    let failed = TaskResult::failed(&message, "boom");

    for result in [&small, &large, &failed] {
        h.broker.publish_result(result).await.unwrap();
    }
    assert_eq!(h.results.len(), 3);
    assert_eq!(h.store.len(), 1);

    let mut received = h.broker.receive_results(10, WAIT).await.unwrap();
    received.sort_by_key(|r| r.output.len());
    assert_eq!(received.len(), 3);
    assert_eq!(received[0].status, ResultStatus::Failed);
    assert_eq!(received[0].error.as_deref(), Some("boom"));
    assert_eq!(received[1], small);
    assert_eq!(received[2], large);

    assert!(h.results.is_empty());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_unreadable_results_are_discarded() {
    let h = single();
    let message = TaskMessage::from_request(
        request("execute_plan", vec![]),
        uuid::Uuid::new_v4(),
        Priority::DEFAULT,
        "dagster".into(),
    );
    h.results
        .send_message(SendRequest {
            body: "not an envelope".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    h.broker
        .publish_result(&TaskResult::succeeded(&message, vec![3u8; 400 * 1024]))
        .await
        .unwrap();
    for key in h.store.keys() {
        h.store.delete_object(&key).await.unwrap();
    }
    h.broker
        .publish_result(&TaskResult::failed(&message, "boom"))
        .await
        .unwrap();

    let received = h.broker.receive_results(10, WAIT).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].status, ResultStatus::Failed);
    assert!(h.results.is_empty());
}

#[tokio::test]
async fn test_results_without_result_queue() {
    let store = Arc::new(MemoryObjectStore::new());
    let broker = PriorityBroker::builder(base_config())
        .queue("dagster", 1, Arc::new(MemoryQueue::new("memory://dagster", Duration::from_secs(300))))
        .object_store(store)
        .build()
        .unwrap();
    let message = TaskMessage::from_request(
        request("execute_plan", vec![]),
        uuid::Uuid::new_v4(),
        Priority::DEFAULT,
        "dagster".into(),
    );

    broker
        .publish_result(&TaskResult::succeeded(&message, vec![]))
        .await
        .unwrap();
    assert!(matches!(
        broker.receive_results(1, Duration::ZERO).await,
        Err(BrokerError::ResultQueueNotConfigured)
    ));
}

#[tokio::test]
async fn test_undecodable_message_is_discarded() {
    let h = single();
    h.queues[0]
        .send_message(SendRequest {
            body: "not an envelope".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    h.broker.send(request("execute_plan", vec![])).await.unwrap();

    let deliveries = h.broker.receive(10, WAIT).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(h.queues[0].len(), 1);
}

#[tokio::test]
async fn test_queue_depths() {
    let config = BrokerConfig {
        task_default_queue: "high".into(),
        ..base_config()
    };
    let h = harness(config, &[("low", 1), ("high", 10)]);
    fill(&h, "high", 2).await;
    fill(&h, "low", 1).await;
    h.broker.receive(1, WAIT).await.unwrap();

    let depths = h.broker.queue_depths().await.unwrap();
    assert_eq!(depths[0].label, "high");
    assert_eq!(depths[0].depth.visible, 1);
    assert_eq!(depths[0].depth.in_flight, 1);
    assert_eq!(depths[1].label, "low");
    assert_eq!(depths[1].depth.visible, 1);
    assert_eq!(depths[1].url, "memory://low");

    let text = h.broker.metrics().gather_text();
    assert!(text.contains("stepq_queue_depth{label=\"high\",state=\"in_flight\"} 1"));
}

#[tokio::test]
async fn test_stream_yields_deliveries() {
    let h = single();
    for _ in 0..3 {
        h.broker.send(request("execute_plan", vec![])).await.unwrap();
    }

    let stream = h.broker.stream(2, WAIT);
    futures::pin_mut!(stream);
    let mut seen = Vec::new();
    while seen.len() < 3 {
        let delivery = stream.next().await.unwrap().unwrap();
        seen.push(delivery.task_id());
    }
    seen.dedup();
    assert_eq!(seen.len(), 3);
}
