//! Amazon SQS backend.

use std::time::Duration;

use aws_sdk_sqs::Client;
use aws_sdk_sqs::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_sqs::error::{DisplayErrorContext, SdkError};
use aws_sdk_sqs::types::MessageSystemAttributeName;
use chrono::Utc;
use ingest_core::{MessageId, QueueMessage, ReceiptToken};

use crate::{LOCALSTACK_ENDPOINT, MessageQueue, QueueConfig, QueueError, QueueFuture, ReceiveRequest};

/// SQS caps long polling at 20 seconds and batches at 10 messages.
const MAX_WAIT_SECS: u64 = 20;
const MAX_BATCH: u32 = 10;

/// Build an SQS client for `cfg`, honouring endpoint overrides.
pub(crate) async fn client(cfg: &QueueConfig) -> Client {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));

    if let Some(endpoint) = &cfg.endpoint {
        loader = loader.endpoint_url(endpoint);
        if endpoint == LOCALSTACK_ENDPOINT {
            loader = loader.credentials_provider(Credentials::new(
                "test",
                "test",
                None,
                None,
                "localstack",
            ));
        }
    }

    let shared = loader.load().await;
    tracing::info!(region = %cfg.region, endpoint = ?cfg.endpoint, "SQS client configured");
    Client::new(&shared)
}

/// A single SQS queue addressed by URL.
#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    async fn receive_inner(&self, request: ReceiveRequest) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(request.max_messages.clamp(1, MAX_BATCH) as i32)
            .visibility_timeout(request.visibility_timeout.as_secs() as i32)
            .wait_time_seconds(request.wait_time.as_secs().min(MAX_WAIT_SECS) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(sdk_error)?;

        let received_at = Utc::now();
        let mut messages = Vec::new();
        for message in output.messages() {
            let (Some(id), Some(receipt)) = (message.message_id(), message.receipt_handle()) else {
                tracing::warn!(queue_url = %self.queue_url, "Skipping SQS message without id or receipt handle");
                continue;
            };

            let receive_count = message
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|count| count.parse::<u32>().ok())
                .unwrap_or(1);

            messages.push(QueueMessage {
                id: MessageId::new(id),
                receipt: ReceiptToken::new(receipt),
                body: message.body().unwrap_or_default().to_string(),
                receive_count,
                received_at,
                visibility_timeout: request.visibility_timeout,
            });
        }

        Ok(messages)
    }

    /// SQS accepts a delete with a stale receipt for a message that is
    /// already gone, so this never reports `MessageNotFound` or
    /// `AlreadyDeleted`. A redelivery that races a delete is caught by the
    /// processed ledger instead.
    async fn delete_inner(&self, receipt: &ReceiptToken) -> Result<(), QueueError> {
        let result = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt.as_str())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_receipt_handle_is_invalid() => {
                Err(QueueError::ReceiptExpired)
            }
            Err(e) => Err(sdk_error(e)),
        }
    }

    async fn change_visibility_inner(
        &self,
        receipt: &ReceiptToken,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let result = self
            .client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt.as_str())
            .visibility_timeout(timeout.as_secs() as i32)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(ctx))
                if ctx.err().is_message_not_inflight()
                    || ctx.err().is_receipt_handle_is_invalid() =>
            {
                Err(QueueError::ReceiptExpired)
            }
            Err(e) => Err(sdk_error(e)),
        }
    }

    async fn send_inner(&self, body: String) -> Result<MessageId, QueueError> {
        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(sdk_error)?;

        output
            .message_id()
            .map(MessageId::new)
            .ok_or_else(|| QueueError::transport("SQS returned no message id", false))
    }
}

fn sdk_error<E, R>(e: SdkError<E, R>) -> QueueError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    // The SDK has already retried throttling and transport failures.
    let retryable = !matches!(e, SdkError::ServiceError(_) | SdkError::ConstructionFailure(_));
    QueueError::transport(DisplayErrorContext(&e).to_string(), retryable)
}

impl MessageQueue for SqsQueue {
    fn name(&self) -> &str {
        &self.queue_url
    }

    fn receive(&self, request: ReceiveRequest) -> QueueFuture<'_, Vec<QueueMessage>> {
        Box::pin(self.receive_inner(request))
    }

    fn delete<'a>(&'a self, receipt: &'a ReceiptToken) -> QueueFuture<'a, ()> {
        Box::pin(self.delete_inner(receipt))
    }

    fn change_visibility<'a>(
        &'a self,
        receipt: &'a ReceiptToken,
        timeout: Duration,
    ) -> QueueFuture<'a, ()> {
        Box::pin(self.change_visibility_inner(receipt, timeout))
    }

    fn send(&self, body: String) -> QueueFuture<'_, MessageId> {
        Box::pin(self.send_inner(body))
    }
}
