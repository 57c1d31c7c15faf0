use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics for the broker and the tasks it delivers
pub struct BrokerMetrics {
    pub registry: Registry,

    // Message flow per label
    pub messages_sent: IntCounterVec,
    pub messages_received: IntCounterVec,
    pub messages_acked: IntCounterVec,

    pub payloads_offloaded: IntCounter,
    pub dedup_suppressed: IntCounter,

    // Leases
    pub lease_renewals: IntCounter,
    pub lease_expirations: IntCounter,

    // Queue depth by label and state
    pub queue_depth: IntGaugeVec,

    // Task outcomes
    pub task_outcomes: IntCounterVec,
    pub task_duration: HistogramVec,
}

impl BrokerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let messages_sent = IntCounterVec::new(
            Opts::new("stepq_messages_sent_total", "Messages sent by queue label"),
            &["label"],
        )?;
        registry.register(Box::new(messages_sent.clone()))?;

        let messages_received = IntCounterVec::new(
            Opts::new("stepq_messages_received_total", "Messages received by queue label"),
            &["label"],
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let messages_acked = IntCounterVec::new(
            Opts::new("stepq_messages_acked_total", "Messages deleted by queue label"),
            &["label"],
        )?;
        registry.register(Box::new(messages_acked.clone()))?;

        let payloads_offloaded = IntCounter::new(
            "stepq_payloads_offloaded_total",
            "Payloads moved to the object store",
        )?;
        registry.register(Box::new(payloads_offloaded.clone()))?;

        let dedup_suppressed = IntCounter::new(
            "stepq_dedup_suppressed_total",
            "Sends suppressed by an unexpired dedup key",
        )?;
        registry.register(Box::new(dedup_suppressed.clone()))?;

        let lease_renewals = IntCounter::new("stepq_lease_renewals_total", "Successful lease renewals")?;
        registry.register(Box::new(lease_renewals.clone()))?;

        let lease_expirations = IntCounter::new(
            "stepq_lease_expirations_total",
            "Renewals or acks that found the lease already expired",
        )?;
        registry.register(Box::new(lease_expirations.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("stepq_queue_depth", "Approximate queue depth by label and state"),
            &["label", "state"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let task_outcomes = IntCounterVec::new(
            Opts::new("stepq_task_outcomes_total", "Task executions by name and outcome"),
            &["task_name", "outcome"],
        )?;
        registry.register(Box::new(task_outcomes.clone()))?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "stepq_task_duration_seconds",
                "Task execution duration in seconds",
            ),
            &["task_name"],
        )?;
        registry.register(Box::new(task_duration.clone()))?;

        Ok(BrokerMetrics {
            registry,
            messages_sent,
            messages_received,
            messages_acked,
            payloads_offloaded,
            dedup_suppressed,
            lease_renewals,
            lease_expirations,
            queue_depth,
            task_outcomes,
            task_duration,
        })
    }

    pub fn set_queue_depth(&self, label: &str, visible: u64, in_flight: u64, delayed: u64) {
        for (state, value) in [
            ("visible", visible),
            ("in_flight", in_flight),
            ("delayed", delayed),
        ] {
            self.queue_depth
                .with_label_values(&[label, state])
                .set(value as i64);
        }
    }

    /// Record one finished task execution
    pub fn observe_task(&self, task_name: &str, outcome: &str, duration_secs: f64) {
        self.task_outcomes
            .with_label_values(&[task_name, outcome])
            .inc();
        self.task_duration
            .with_label_values(&[task_name])
            .observe(duration_secs);
    }

    /// Text exposition format, as served at `/metrics`
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
