//! Async RabbitMQ publisher for conversion jobs.
//!
//! Two modes:
//! - `publish`: request/reply over a private, broker-named reply queue, bounded
//!   by the configured timeout
//! - `enqueue`: fire-and-forget on the broker's control channel

use std::time::Duration;

use futures::{future, StreamExt};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reply::{await_reply, Reply, Waited};
use super::types::{ConversionMessage, LambdaResponse};
use crate::broker::Broker;
use crate::error::DispatchError;

/// Publishes jobs to the work queue through a shared [`Broker`].
#[derive(Clone)]
pub struct Publisher {
    broker: Broker,
    timeout: Duration,
}

impl Publisher {
    /// Create a publisher using the broker's configured RPC timeout.
    pub fn new(broker: Broker) -> Self {
        let timeout = broker.config().rpc_timeout();
        Self { broker, timeout }
    }

    /// Publish a job and wait for the worker's result.
    ///
    /// Returns the worker's result (error detail replaced by a generic retry
    /// message), or the synthetic 202 "accepted" result when the timeout
    /// fires first. The job is never cancelled by the timeout.
    pub async fn publish(
        &self,
        job: &ConversionMessage,
        cancel: &CancellationToken,
    ) -> Result<LambdaResponse, DispatchError> {
        let channel = self.broker.create_channel().await?;

        let result = self.call(&channel, job, cancel).await;

        if let Err(e) = channel.close(200, "rpc finished").await {
            debug!(file_id = %job.file_id, error = %e, "rabbitmq_channel_close_error");
        }

        result
    }

    async fn call(
        &self,
        channel: &Channel,
        job: &ConversionMessage,
        cancel: &CancellationToken,
    ) -> Result<LambdaResponse, DispatchError> {
        let reply_queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    durable: false,
                    auto_delete: true,
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_queue = reply_queue.name().as_str().to_owned();

        let consumer_tag = format!("srt-rpc-{}", job.file_id);
        let consumer = channel
            .basic_consume(
                &reply_queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let body = match serde_json::to_vec(job) {
            Ok(body) => body,
            Err(e) => {
                delete_queue(channel, &reply_queue).await;
                return Err(DispatchError::Encode(e));
            }
        };

        let properties = BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into())
            .with_reply_to(reply_queue.clone().into())
            .with_correlation_id(job.file_id.clone().into());

        let queue = &self.broker.config().work_queue;
        if let Err(e) = publish_confirmed(channel, queue, &body, properties).await {
            delete_queue(channel, &reply_queue).await;
            return Err(e);
        }

        info!(
            queue = %queue,
            file_id = %job.file_id,
            reply_queue = %reply_queue,
            body_length = body.len(),
            "rabbitmq_job_published"
        );

        let replies = consumer.filter_map(|delivery| future::ready(delivery.ok().map(Reply::from)));

        match await_reply(replies, &job.file_id, self.timeout, cancel).await {
            Ok(Waited::TimedOut) => {
                info!(
                    file_id = %job.file_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "rpc_wait_timed_out"
                );
                Ok(LambdaResponse::accepted())
            }
            Ok(Waited::Replied(response)) => {
                teardown(channel, &consumer_tag, &reply_queue).await;
                info!(
                    file_id = %job.file_id,
                    status_code = response.status_code,
                    "rpc_reply_received"
                );
                Ok(response.redacted())
            }
            Err(e) => {
                teardown(channel, &consumer_tag, &reply_queue).await;
                warn!(file_id = %job.file_id, error = %e, "rpc_wait_failed");
                Err(e)
            }
        }
    }

    /// Publish a job on the control channel without waiting for a result.
    pub async fn enqueue(&self, job: &ConversionMessage) -> Result<(), DispatchError> {
        let channel = self.broker.control_channel().await?;

        let body = serde_json::to_vec(job).map_err(DispatchError::Encode)?;
        let queue = &self.broker.config().work_queue;

        publish_confirmed(
            &channel,
            queue,
            &body,
            BasicProperties::default()
                .with_delivery_mode(2) // Persistent
                .with_content_type("application/json".into())
                .with_message_id(job.file_id.clone().into()),
        )
        .await?;

        info!(
            queue = %queue,
            file_id = %job.file_id,
            body_length = body.len(),
            "rabbitmq_job_enqueued"
        );

        Ok(())
    }
}

async fn publish_confirmed(
    channel: &Channel,
    queue: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<(), DispatchError> {
    channel
        .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
        .await?
        .await?;
    Ok(())
}

async fn teardown(channel: &Channel, consumer_tag: &str, reply_queue: &str) {
    if let Err(e) = channel
        .basic_cancel(consumer_tag, BasicCancelOptions::default())
        .await
    {
        debug!(consumer_tag = %consumer_tag, error = %e, "rabbitmq_cancel_failed");
    }
    delete_queue(channel, reply_queue).await;
}

async fn delete_queue(channel: &Channel, queue: &str) {
    if let Err(e) = channel
        .queue_delete(queue, QueueDeleteOptions::default())
        .await
    {
        debug!(queue = %queue, error = %e, "rabbitmq_queue_delete_failed");
    }
}
