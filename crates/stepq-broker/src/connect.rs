//! Build a broker from configuration alone.

use crate::cancellation::StoreCancellations;
use crate::config::{BrokerConfig, ConfigError, ObjectStoreKind};
use crate::dedup::StoreDedup;
use crate::queue::{MemoryQueue, QueueService};
use crate::PriorityBroker;
use std::sync::Arc;
use stepq_offload::{FsObjectStore, MemoryObjectStore, ObjectStore, OffloadBackend};
use tracing::info;

const MEMORY_SCHEME: &str = "memory://";

/// Open every configured queue and the object store, and assemble the broker.
///
/// `memory://` URLs select the in-process emulator, with a redrive policy at
/// `max_receive_count`; `http(s)://` URLs need the `aws` feature. Dedup
/// records and cancellation markers live in the object store, so brokers
/// sharing a store share them.
pub async fn connect(config: BrokerConfig) -> Result<PriorityBroker, ConfigError> {
    config.validate()?;

    let mut builder = PriorityBroker::builder(config.clone());
    for spec in config.queue_specs()? {
        let queue = open_queue(&config, &spec.url, Some(config.max_receive_count)).await?;
        info!(label = %spec.label, weight = spec.weight, url = %spec.url, "opened queue");
        builder = builder.queue(spec.label, spec.weight, queue);
    }
    if let Some(url) = &config.result_queue_url {
        builder = builder.result_queue(open_queue(&config, url, None).await?);
    }

    let store = open_store(&config).await?;
    info!(store = %store.describe(), "opened object store");
    let records = OffloadBackend::new(
        store.clone(),
        config.payload_prefix.clone(),
        config.retry_policy(),
    );
    if config.use_task_id_for_deduplication {
        builder = builder.dedup(Arc::new(StoreDedup::new(
            records.clone(),
            config.dedup_prefix.clone(),
            config.dedup_window(),
        )));
    }
    if config.enable_cancellation {
        builder = builder.cancellations(Arc::new(StoreCancellations::new(
            records,
            config.cancellation_prefix.clone(),
        )));
    }

    builder.object_store(store).build()
}

async fn open_queue(
    config: &BrokerConfig,
    url: &str,
    max_receive_count: Option<u32>,
) -> Result<Arc<dyn QueueService>, ConfigError> {
    if url.starts_with(MEMORY_SCHEME) {
        let queue = MemoryQueue::new(url, config.dedup_window());
        return Ok(Arc::new(match max_receive_count {
            Some(max) => queue.with_redrive(max),
            None => queue,
        }));
    }
    if url.starts_with("https://") || url.starts_with("http://") {
        return open_cloud_queue(config, url).await;
    }
    Err(ConfigError::Invalid(format!("unsupported queue URL {url:?}")))
}

#[cfg(feature = "aws")]
async fn open_cloud_queue(
    config: &BrokerConfig,
    url: &str,
) -> Result<Arc<dyn QueueService>, ConfigError> {
    let queue = crate::sqs::SqsQueue::connect(
        url,
        &config.region,
        config.queue_endpoint.as_deref(),
    )
    .await;
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "aws"))]
async fn open_cloud_queue(
    _config: &BrokerConfig,
    url: &str,
) -> Result<Arc<dyn QueueService>, ConfigError> {
    Err(ConfigError::FeatureDisabled {
        what: format!("queue URL {url:?}"),
    })
}

async fn open_store(config: &BrokerConfig) -> Result<Arc<dyn ObjectStore>, ConfigError> {
    match config.object_store {
        ObjectStoreKind::Memory => Ok(Arc::new(MemoryObjectStore::new())),
        ObjectStoreKind::Filesystem => Ok(Arc::new(FsObjectStore::new(
            config.local_store_dir.clone(),
        ))),
        ObjectStoreKind::S3 => open_s3_store(config).await,
    }
}

#[cfg(feature = "aws")]
async fn open_s3_store(config: &BrokerConfig) -> Result<Arc<dyn ObjectStore>, ConfigError> {
    let mut s3_config = stepq_offload::S3StoreConfig::new(&config.bucket, &config.region);
    if let Some(endpoint) = &config.bucket_endpoint {
        s3_config = s3_config.with_endpoint(endpoint);
    }
    Ok(Arc::new(
        stepq_offload::S3ObjectStore::connect(s3_config).await,
    ))
}

#[cfg(not(feature = "aws"))]
async fn open_s3_store(_config: &BrokerConfig) -> Result<Arc<dyn ObjectStore>, ConfigError> {
    Err(ConfigError::FeatureDisabled {
        what: "object_store = s3".to_string(),
    })
}
