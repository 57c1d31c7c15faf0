use crate::{ObjectStore, StoreError};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Region},
    error::{ProvideErrorMetadata, SdkError},
    operation::get_object::GetObjectError,
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use tracing::debug;

/// Connection settings for an S3 (or S3-compatible) bucket.
#[derive(Debug, Clone)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint, e.g. MinIO or LocalStack
    pub endpoint: Option<String>,
}

impl S3StoreConfig {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        S3StoreConfig {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Object store backed by an S3 bucket. Credentials come from the default
/// AWS provider chain.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    config: S3StoreConfig,
}

impl S3ObjectStore {
    pub async fn connect(config: S3StoreConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        S3ObjectStore {
            client: Client::from_conf(builder.build()),
            config,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }
}

fn map_sdk_error<E, R>(err: &SdkError<E, R>, key: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if let SdkError::ServiceError(service_err) = err {
        match service_err.err().code() {
            Some("NoSuchKey") | Some("NotFound") => {
                return StoreError::NotFound {
                    key: key.to_string(),
                }
            }
            Some("QuotaExceeded") | Some("EntityTooLarge") => {
                return StoreError::QuotaExceeded(format!("{key}: {err}"))
            }
            _ => {}
        }
    }
    StoreError::Unavailable(format!("{key}: {err}"))
}

fn map_get_error<R: std::fmt::Debug>(err: &SdkError<GetObjectError, R>, key: &str) -> StoreError {
    if let SdkError::ServiceError(service_err) = err {
        if matches!(service_err.err(), GetObjectError::NoSuchKey(_)) {
            return StoreError::NotFound {
                key: key.to_string(),
            };
        }
    }
    map_sdk_error(err, key)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|ref err| map_sdk_error(err, key))?;

        debug!(bucket = %self.config.bucket, key, bytes = size, "stored object");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|ref err| map_get_error(err, key))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Unavailable(format!("{key}: failed to read body: {err}")))?;
        Ok(body.into_bytes())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        // S3 reports success for missing keys.
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|ref err| map_sdk_error(err, key))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.config.bucket)
    }
}
