use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use stepq_broker::config::config_sources;
use stepq_broker::ConfigError;
use uuid::Uuid;

/// Worker runtime settings. Read from the same file and `STEPQ_*`
/// environment as the broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: Option<String>,
    pub max_in_flight: usize,
    pub shutdown_grace_secs: u64,
    /// Fraction of the visibility timeout after which a lease is renewed
    pub renew_fraction: f64,
    pub metrics_port: Option<u16>,
    pub handler_command: Option<String>,
    pub error_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: None,
            max_in_flight: 1,
            shutdown_grace_secs: 60,
            renew_fraction: 0.5,
            metrics_port: None,
            handler_command: None,
            error_backoff_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: WorkerConfig = config_sources(path)?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if !(self.renew_fraction > 0.0 && self.renew_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "renew_fraction must be between 0 and 1, got {}",
                self.renew_fraction
            )));
        }
        Ok(())
    }

    /// Interval between lease renewals for a given visibility timeout.
    pub fn renew_interval(&self, visibility_timeout: Duration) -> Duration {
        visibility_timeout
            .mul_f64(self.renew_fraction)
            .max(Duration::from_millis(100))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Configured id, or `<hostname>-<pid>-<random>`.
    pub fn generate_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let random = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, std::process::id(), &random[..8])
    }
}
