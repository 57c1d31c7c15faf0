use crate::config::WorkerConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepq_bridge::{DispatchBridge, Disposition};
use stepq_broker::queue::MAX_RECEIVE_BATCH;
use stepq_broker::{Delivery, PriorityBroker};
use stepq_core::Lease;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polls the broker and runs up to `max_in_flight` deliveries at once.
pub struct Worker {
    config: WorkerConfig,
    worker_id: String,
    bridge: Arc<DispatchBridge>,
    permits: Arc<Semaphore>,
}

impl Worker {
    pub fn new(config: WorkerConfig, bridge: Arc<DispatchBridge>) -> Self {
        let worker_id = config.generate_worker_id();
        let permits = Arc::new(Semaphore::new(config.max_in_flight));

        Worker {
            config,
            worker_id,
            bridge,
            permits,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Units currently running.
    pub fn in_flight(&self) -> usize {
        self.config.max_in_flight - self.permits.available_permits()
    }

    /// Run until `shutdown` is cancelled, then drain in-flight units for
    /// the grace period and abort whatever is left.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let broker = self.bridge.broker().clone();
        let wait = broker.config().wait_time();
        info!(
            worker_id = %self.worker_id,
            max_in_flight = self.config.max_in_flight,
            labels = ?broker.labels().collect::<Vec<_>>(),
            handlers = ?self.bridge.handlers().task_names(),
            "starting worker"
        );

        let mut units: JoinSet<Disposition> = JoinSet::new();
        loop {
            while let Some(joined) = units.try_join_next() {
                log_unit_exit(joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => permit?,
            };
            let batch = (1 + self.permits.available_permits()).min(MAX_RECEIVE_BATCH);

            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = broker.receive(batch, wait) => received,
            };
            let deliveries = match received {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    warn!(
                        worker_id = %self.worker_id,
                        kind = %e.kind(),
                        error = %e,
                        "receive failed; backing off"
                    );
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff()) => continue,
                    }
                }
            };

            let mut held = Some(permit);
            for delivery in deliveries {
                let permit = match held.take() {
                    Some(permit) => permit,
                    None => self.permits.clone().acquire_owned().await?,
                };
                let bridge = self.bridge.clone();
                let renew_every = self.config.renew_interval(broker.config().visibility_timeout());
                units.spawn(async move {
                    let disposition = run_unit(&bridge, delivery, renew_every).await;
                    drop(permit);
                    disposition
                });
            }
        }

        self.drain(units).await;
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn drain(&self, mut units: JoinSet<Disposition>) {
        if units.is_empty() {
            return;
        }
        info!(in_flight = units.len(), "draining in-flight units");

        let drained = tokio::time::timeout(self.config.shutdown_grace(), async {
            while let Some(joined) = units.join_next().await {
                log_unit_exit(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = units.len(),
                "shutdown grace period elapsed; aborting units"
            );
            units.shutdown().await;
        }
    }
}

fn log_unit_exit(joined: Result<Disposition, JoinError>) {
    match joined {
        Ok(disposition) => debug!(disposition = disposition.as_str(), "unit finished"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "unit panicked"),
    }
}

/// Process one delivery while keeping its lease alive.
async fn run_unit(bridge: &DispatchBridge, delivery: Delivery, renew_every: Duration) -> Disposition {
    let started = Instant::now();
    let cancel = CancellationToken::new();
    let broker = bridge.broker();

    tokio::select! {
        disposition = bridge.process(&delivery, cancel.clone()) => disposition,
        () = keep_lease(broker, delivery.lease.clone(), renew_every, &cancel) => {
            broker.metrics().observe_task(
                delivery.task_name(),
                Disposition::Abandoned.as_str(),
                started.elapsed().as_secs_f64(),
            );
            Disposition::Abandoned
        }
    }
}

/// Renews the lease every `renew_every` and flips `cancel` once a
/// cancellation marker appears. Returns only when the lease is lost.
async fn keep_lease(
    broker: &PriorityBroker,
    mut lease: Lease,
    renew_every: Duration,
    cancel: &CancellationToken,
) {
    let visibility = broker.config().visibility_timeout();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !cancel.is_cancelled() {
            match broker.is_cancelled(lease.task_id).await {
                Ok(true) => {
                    info!(task_id = %lease.task_id, "cancellation requested; signalling handler");
                    cancel.cancel();
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(task_id = %lease.task_id, kind = %e.kind(), error = %e, "could not check cancellation")
                }
            }
        }

        match broker.renew_lease(&lease, visibility).await {
            Ok(renewed) => lease = renewed,
            Err(e) if e.is_retryable() && !lease.is_expired() => {
                warn!(task_id = %lease.task_id, kind = %e.kind(), error = %e, "lease renewal failed; will retry");
            }
            Err(e) => {
                error!(
                    task_id = %lease.task_id,
                    kind = %e.kind(),
                    error = %e,
                    "lease lost; abandoning unit"
                );
                return;
            }
        }
    }
}
