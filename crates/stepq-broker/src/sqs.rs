use crate::config::MAX_WAIT_TIME_SECONDS;
use crate::queue::{QueueDepth, QueueError, QueueService, ReceivedMessage, SendRequest};
use async_trait::async_trait;
use aws_sdk_sqs::{
    config::{BehaviorVersion, Region},
    error::{ProvideErrorMetadata, SdkError},
    types::{MessageSystemAttributeName, QueueAttributeName},
    Client,
};
use std::time::Duration;

/// Queue handle backed by a cloud queue URL. Credentials come from the
/// default AWS provider chain.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: Client,
    url: String,
    fifo: bool,
}

impl SqsQueue {
    pub async fn connect(url: impl Into<String>, region: &str, endpoint: Option<&str>) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        let mut builder = aws_sdk_sqs::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let url = url.into();
        SqsQueue {
            client: Client::from_conf(builder.build()),
            fifo: url.ends_with(".fifo"),
            url,
        }
    }
}

fn map_error<E, R>(err: &SdkError<E, R>) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if let SdkError::ServiceError(service_err) = err {
        let inner = service_err.err();
        let stale_receipt = match inner.code() {
            Some(code) if code.contains("ReceiptHandleIsInvalid") => true,
            Some(code) if code.contains("MessageNotInflight") => true,
            // Expired receipts on visibility changes come back this way.
            Some("InvalidParameterValue") => inner
                .message()
                .is_some_and(|m| m.to_ascii_lowercase().contains("receipt handle")),
            _ => false,
        };
        if stale_receipt {
            return QueueError::ReceiptInvalid(inner.message().unwrap_or_default().to_string());
        }
    }
    QueueError::Transport(err.to_string())
}

fn secs_i32(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn attribute_u64(
    attributes: Option<&std::collections::HashMap<QueueAttributeName, String>>,
    name: QueueAttributeName,
) -> u64 {
    attributes
        .and_then(|attrs| attrs.get(&name))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl QueueService for SqsQueue {
    async fn send_message(&self, request: SendRequest) -> Result<String, QueueError> {
        let mut call = self
            .client
            .send_message()
            .queue_url(&self.url)
            .message_body(request.body)
            .set_message_deduplication_id(request.dedup_id)
            .set_message_group_id(request.group_id);
        // FIFO queues reject per-message delays.
        if !self.fifo && request.delay_seconds > 0 {
            call = call.delay_seconds(i32::try_from(request.delay_seconds).unwrap_or(i32::MAX));
        }

        let output = call.send().await.map_err(|ref err| map_error(err))?;
        Ok(output.message_id().unwrap_or_default().to_string())
    }

    async fn receive_messages(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(i32::try_from(max_messages).unwrap_or(10))
            .wait_time_seconds(secs_i32(wait.min(Duration::from_secs(MAX_WAIT_TIME_SECONDS))))
            .visibility_timeout(secs_i32(visibility_timeout))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|ref err| map_error(err))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| {
                let receive_count = message
                    .attributes()
                    .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(1);
                Some(ReceivedMessage {
                    message_id: message.message_id()?.to_string(),
                    receipt_handle: message.receipt_handle()?.to_string(),
                    body: message.body().unwrap_or_default().to_string(),
                    receive_count,
                })
            })
            .collect();
        Ok(messages)
    }

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(secs_i32(timeout))
            .send()
            .await
            .map_err(|ref err| map_error(err))?;
        Ok(())
    }

    async fn delete_message(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|ref err| map_error(err))?;
        Ok(())
    }

    async fn approximate_depth(&self) -> Result<QueueDepth, QueueError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesDelayed)
            .send()
            .await
            .map_err(|ref err| map_error(err))?;

        let attributes = output.attributes();
        Ok(QueueDepth {
            visible: attribute_u64(attributes, QueueAttributeName::ApproximateNumberOfMessages),
            in_flight: attribute_u64(
                attributes,
                QueueAttributeName::ApproximateNumberOfMessagesNotVisible,
            ),
            delayed: attribute_u64(
                attributes,
                QueueAttributeName::ApproximateNumberOfMessagesDelayed,
            ),
        })
    }

    fn is_fifo(&self) -> bool {
        self.fifo
    }

    fn url(&self) -> &str {
        &self.url
    }
}
