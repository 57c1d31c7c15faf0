use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stepq_core::{Priority, QueueLabel, RetryPolicy, DEFAULT_QUEUE_LABEL};
use stepq_offload::DEFAULT_PAYLOAD_PREFIX;
use thiserror::Error;

/// Provider ceiling for a long-poll wait.
pub const MAX_WAIT_TIME_SECONDS: u64 = 20;

/// Provider ceiling for a visibility timeout (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

/// Prefix for environment overrides, e.g. `STEPQ_QUEUE_URL`.
pub const ENV_PREFIX: &str = "STEPQ";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("{what} requires the `aws` feature")]
    FeatureDisabled { what: String },

    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Where offloaded payloads (and shared cancellation markers) live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreKind {
    #[default]
    Memory,
    Filesystem,
    S3,
}

/// One labeled queue of the priority queue set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub label: QueueLabel,
    pub url: String,
    /// Relative priority of the label; also its fair-share weight
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub queue_url: String,
    pub queue_endpoint: Option<String>,
    pub region: String,

    /// Explicit queue set; takes precedence over `queue_weights`
    pub queues: Vec<QueueSpec>,
    /// `label=weight,...`, URLs derived from `queue_url`
    pub queue_weights: Option<String>,

    pub task_default_priority: i32,
    pub task_default_queue: QueueLabel,

    pub wait_time_seconds: u64,
    pub visibility_timeout_secs: u64,

    /// `None` selects strict priority order
    pub is_fair_queue: Option<bool>,
    pub use_task_id_for_deduplication: bool,
    pub enable_cancellation: bool,
    pub dedup_window_secs: u64,

    pub max_message_size: usize,
    pub poll_interval_ms: u64,
    pub max_receive_count: u32,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    pub result_queue_url: Option<String>,

    pub object_store: ObjectStoreKind,
    pub bucket: String,
    pub bucket_endpoint: Option<String>,
    pub local_store_dir: PathBuf,
    pub payload_prefix: String,
    pub cancellation_prefix: String,
    pub dedup_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            queue_url: format!("memory://{DEFAULT_QUEUE_LABEL}"),
            queue_endpoint: None,
            region: "us-east-1".to_string(),
            queues: Vec::new(),
            queue_weights: None,
            task_default_priority: Priority::DEFAULT.value(),
            task_default_queue: DEFAULT_QUEUE_LABEL.to_string(),
            wait_time_seconds: MAX_WAIT_TIME_SECONDS,
            visibility_timeout_secs: 300,
            is_fair_queue: None,
            use_task_id_for_deduplication: false,
            enable_cancellation: false,
            dedup_window_secs: 300,
            max_message_size: stepq_protocol::MAX_MESSAGE_SIZE,
            poll_interval_ms: 1000,
            max_receive_count: 3,
            retry_max_attempts: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5000,
            result_queue_url: None,
            object_store: ObjectStoreKind::Memory,
            bucket: "stepq-payloads".to_string(),
            bucket_endpoint: None,
            local_store_dir: PathBuf::from("./stepq-objects"),
            payload_prefix: DEFAULT_PAYLOAD_PREFIX.to_string(),
            cancellation_prefix: "stepq/cancelled".to_string(),
            dedup_prefix: "stepq/dedup".to_string(),
        }
    }
}

/// Optional file, then `STEPQ_*` environment variables. The explicit
/// `queues` list can only come from the file.
pub fn config_sources(path: Option<&Path>) -> Result<config::Config, config::ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    builder
        .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()
}

impl BrokerConfig {
    /// Load from an optional file plus the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: BrokerConfig = config_sources(path)?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;
        let specs = self.queue_specs()?;
        if specs.iter().any(|spec| spec.url.is_empty()) {
            return Err(invalid("queue url must not be empty"));
        }
        validate_queue_set(
            specs.iter().map(|spec| (spec.label.as_str(), spec.weight)),
            &self.task_default_queue,
        )
    }

    /// Everything except the queue set.
    pub(crate) fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.wait_time_seconds > MAX_WAIT_TIME_SECONDS {
            return Err(invalid(format!(
                "wait_time_seconds must be at most {MAX_WAIT_TIME_SECONDS}"
            )));
        }
        if self.visibility_timeout_secs == 0
            || self.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS
        {
            return Err(invalid(format!(
                "visibility_timeout_secs must be in 1..={MAX_VISIBILITY_TIMEOUT_SECS}"
            )));
        }
        if self.max_message_size == 0 {
            return Err(invalid("max_message_size must be positive"));
        }
        if self.max_receive_count == 0 {
            return Err(invalid("max_receive_count must be at least 1"));
        }
        if self.retry_max_attempts == 0 {
            return Err(invalid("retry_max_attempts must be at least 1"));
        }
        if self.payload_prefix.trim_matches('/').is_empty() {
            return Err(invalid("payload_prefix must not be empty"));
        }
        Ok(())
    }

    /// The static label → queue mapping, in descending weight order.
    pub fn queue_specs(&self) -> Result<Vec<QueueSpec>, ConfigError> {
        let mut specs = if !self.queues.is_empty() {
            self.queues.clone()
        } else if let Some(weights) = self.queue_weights.as_deref().filter(|w| !w.trim().is_empty())
        {
            parse_queue_weights(weights)?
                .into_iter()
                .map(|(label, weight)| QueueSpec {
                    url: derive_queue_url(&self.queue_url, &label),
                    label,
                    weight,
                })
                .collect()
        } else {
            vec![QueueSpec {
                label: self.task_default_queue.clone(),
                url: self.queue_url.clone(),
                weight: default_weight(),
            }]
        };
        specs.sort_by(|a, b| b.weight.cmp(&a.weight));
        Ok(specs)
    }

    pub fn is_fair(&self) -> bool {
        self.is_fair_queue.unwrap_or(false)
    }

    pub fn default_priority(&self) -> Priority {
        Priority::new(self.task_default_priority)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_seconds)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

/// Labels must be unique and non-empty, weights positive, and the default
/// queue must be one of them.
pub(crate) fn validate_queue_set<'a>(
    queues: impl IntoIterator<Item = (&'a str, u32)>,
    default_queue: &str,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for (label, weight) in queues {
        if label.is_empty() {
            return Err(invalid("queue label must not be empty"));
        }
        if weight == 0 {
            return Err(invalid(format!("queue {label:?} has weight 0")));
        }
        if !seen.insert(label) {
            return Err(invalid(format!("duplicate queue label {label:?}")));
        }
    }
    if !seen.contains(default_queue) {
        return Err(invalid(format!(
            "task_default_queue {default_queue:?} is not one of the configured queues"
        )));
    }
    Ok(())
}

/// Parse `high=10,low=1`. A bare label gets weight 1.
pub fn parse_queue_weights(input: &str) -> Result<Vec<(QueueLabel, u32)>, ConfigError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((label, weight)) => {
                let weight = weight
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| invalid(format!("bad weight in {part:?}")))?;
                Ok((label.trim().to_string(), weight))
            }
            None => Ok((part.to_string(), default_weight())),
        })
        .collect()
}

/// Replace the last path segment of `base` with `label`, keeping a `.fifo`
/// suffix so every label shares the base queue's type.
pub fn derive_queue_url(base: &str, label: &str) -> String {
    let (prefix, last) = base.rsplit_once('/').unwrap_or(("", base));
    let suffix = if last.ends_with(".fifo") { ".fifo" } else { "" };
    if prefix.is_empty() {
        format!("{label}{suffix}")
    } else {
        format!("{prefix}/{label}{suffix}")
    }
}
