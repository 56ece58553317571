//! Worker pool consuming the work queue.
//!
//! Each worker borrows a channel from the pool, consumes the work queue with
//! manual acknowledgement and runs one job at a time through the injected
//! [`Processor`]:
//! - decode failure: reject without requeue, no reply
//! - processing success: ack, reply with the result
//! - processing failure: reject with requeue, reply with a 500 result

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicRejectOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::broker::{Broker, PooledChannel};
use crate::error::DispatchError;
use crate::processor::Processor;
use crate::queue::{ConversionMessage, LambdaResponse};

/// A long-lived consumer identity.
///
/// The same `Worker` is relaunched after every reconnect; `task` holds the
/// join handle of its current run.
pub struct Worker {
    pub id: usize,
    pub queue: String,
    stop: CancellationToken,
    processor: Arc<dyn Processor>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        queue: String,
        stop: CancellationToken,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            id,
            queue,
            stop,
            processor,
            task: Mutex::new(None),
        }
    }

    /// Ask this worker to exit once its current job is settled.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn consumer_tag(&self) -> String {
        format!("srt-worker-{}", self.id)
    }

    /// Spawn `run` on `tracker` so that it starts only after the previous run
    /// of this worker has exited.
    pub(crate) async fn relaunch<F>(&self, tracker: &TaskTracker, run: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut task = self.task.lock().await;
        let previous = task.take();

        *task = Some(tracker.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            run.await;
        }));
    }
}

/// What to do with a delivery once the processor has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

#[derive(Debug, PartialEq)]
pub struct Settlement {
    pub disposition: Disposition,
    /// Sent to the delivery's reply-to address, if it has one.
    pub reply: Option<LambdaResponse>,
}

/// Decode and process one message body.
pub async fn settle(processor: &dyn Processor, body: &[u8]) -> Settlement {
    let job: ConversionMessage = match serde_json::from_slice(body) {
        Ok(job) => job,
        Err(e) => {
            error!(
                error = %e,
                body_length = body.len(),
                body_preview = %String::from_utf8_lossy(&body[..body.len().min(200)]),
                "worker_job_decode_failed"
            );
            return Settlement {
                disposition: Disposition::Reject { requeue: false },
                reply: None,
            };
        }
    };

    let file_id = job.file_id.clone();
    info!(
        file_id = %file_id,
        user_id = %job.user_id,
        file_name = %job.file_name,
        file_size = job.file_size,
        "worker_job_received"
    );

    match processor.process(job).await {
        Ok(response) => {
            info!(
                file_id = %file_id,
                status_code = response.status_code,
                "worker_job_completed"
            );
            Settlement {
                disposition: Disposition::Ack,
                reply: Some(response),
            }
        }
        Err(e) => {
            error!(file_id = %file_id, error = %format!("{e:#}"), "worker_job_failed");
            Settlement {
                disposition: Disposition::Reject { requeue: true },
                reply: Some(LambdaResponse::failure(format!("{e:#}"))),
            }
        }
    }
}

/// Run a worker until its stop signal fires or its connection goes away.
///
/// `lifeline` is cancelled when the connection this run belongs to is lost;
/// the reconnect supervisor launches a fresh run afterwards.
pub(crate) async fn run_worker(broker: Broker, worker: Arc<Worker>, lifeline: CancellationToken) {
    info!(worker_id = worker.id, queue = %worker.queue, "worker_started");

    loop {
        if worker.is_stopped() || lifeline.is_cancelled() {
            break;
        }

        if let Err(e) = consume(&broker, &worker, &lifeline).await {
            warn!(worker_id = worker.id, error = %e, "worker_consume_failed");
        }

        tokio::select! {
            _ = worker.stop.cancelled() => break,
            _ = lifeline.cancelled() => break,
            _ = sleep(broker.config().worker_retry_delay()) => {}
        }
    }

    info!(worker_id = worker.id, "worker_stopped");
}

/// Borrow a channel, consume until the stream ends, then hand the channel back.
async fn consume(
    broker: &Broker,
    worker: &Worker,
    lifeline: &CancellationToken,
) -> Result<(), DispatchError> {
    let pool = broker.pool().await;
    let channel = pool.get()?;

    let result = drain(&channel, worker, lifeline).await;

    let open = channel.is_open();
    pool.put(channel).await;
    if !open {
        warn!(worker_id = worker.id, "rabbitmq_channel_lost");
        broker.replenish(&pool).await;
    }
    result
}

async fn drain(
    channel: &Channel,
    worker: &Worker,
    lifeline: &CancellationToken,
) -> Result<(), DispatchError> {
    let tag = worker.consumer_tag();
    let mut consumer = channel
        .basic_consume(
            &worker.queue,
            &tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(worker_id = worker.id, queue = %worker.queue, channel_id = channel.id(), "rabbitmq_consumer_started");

    loop {
        // Stop signals are only observed between deliveries; a job that has
        // been pulled always runs to completion.
        let delivery = tokio::select! {
            _ = worker.stop.cancelled() => {
                if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                    warn!(worker_id = worker.id, error = %e, "rabbitmq_cancel_failed");
                }
                return Ok(());
            }
            _ = lifeline.cancelled() => return Ok(()),
            delivery = consumer.next() => delivery,
        };

        match delivery {
            Some(Ok(delivery)) => handle_delivery(channel, worker, delivery).await,
            Some(Err(e)) => return Err(e.into()),
            None => {
                warn!(worker_id = worker.id, "rabbitmq_consumer_closed");
                return Ok(());
            }
        }
    }
}

async fn handle_delivery(channel: &Channel, worker: &Worker, delivery: Delivery) {
    let delivery_tag = delivery.delivery_tag;
    let settlement = settle(worker.processor.as_ref(), &delivery.data).await;

    let settled = match settlement.disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::Reject { requeue } => {
            delivery.reject(BasicRejectOptions { requeue }).await
        }
    };
    if let Err(e) = settled {
        error!(
            worker_id = worker.id,
            delivery_tag = delivery_tag,
            disposition = ?settlement.disposition,
            error = %e,
            "rabbitmq_settle_failed"
        );
    }

    let Some(reply) = settlement.reply else {
        return;
    };
    let Some((reply_to, correlation_id)) = reply_target(&delivery.properties) else {
        return;
    };

    send_reply(channel, &reply_to, &correlation_id, &reply).await;
}

/// The reply queue of a delivery and the correlation id to echo back.
///
/// Jobs published without `reply_to` get no reply.
fn reply_target(properties: &BasicProperties) -> Option<(String, String)> {
    let reply_to = properties.reply_to().as_ref()?.as_str().to_string();
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default();
    Some((reply_to, correlation_id))
}

/// Best-effort reply; a lost reply leaves the caller on its timeout path.
async fn send_reply(channel: &Channel, reply_to: &str, correlation_id: &str, reply: &LambdaResponse) {
    let body = match serde_json::to_vec(reply) {
        Ok(body) => body,
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "rpc_reply_encode_failed");
            return;
        }
    };

    let published = channel
        .basic_publish(
            "",
            reply_to,
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default()
                .with_content_type("application/json".into())
                .with_correlation_id(correlation_id.into()),
        )
        .await;

    match published {
        Ok(_) => info!(
            reply_to = %reply_to,
            correlation_id = %correlation_id,
            status_code = reply.status_code,
            "rpc_reply_published"
        ),
        Err(e) => warn!(
            reply_to = %reply_to,
            correlation_id = %correlation_id,
            error = %e,
            "rpc_reply_publish_failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ConversionParams, STATUS_FAILED};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingProcessor {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Processor for CountingProcessor {
        async fn process(&self, job: ConversionMessage) -> Result<LambdaResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("upstream 502").context("lambda invocation failed"));
            }
            Ok(LambdaResponse::success(format!("https://cdn/{}.srt", job.file_id), job.file_duration))
        }
    }

    fn job_body(file_id: &str) -> Vec<u8> {
        let mut job = ConversionMessage::new(
            "u1",
            "a@example.com",
            "clip.mp3",
            b"ID3".to_vec(),
            2.0,
            ConversionParams {
                words_per_line: 1,
                punctuation: false,
                consider_punctuation: false,
            },
        );
        job.file_id = file_id.to_string();
        serde_json::to_vec(&job).unwrap()
    }

    #[tokio::test]
    async fn test_success_is_acked_with_reply() {
        let processor = CountingProcessor::new(false);

        let settlement = settle(&processor, &job_body("f1")).await;

        assert_eq!(settlement.disposition, Disposition::Ack);
        assert_eq!(
            settlement.reply,
            Some(LambdaResponse::success("https://cdn/f1.srt", 2.0))
        );
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_requeued_with_error_reply() {
        let processor = CountingProcessor::new(true);

        let settlement = settle(&processor, &job_body("f1")).await;

        assert_eq!(settlement.disposition, Disposition::Reject { requeue: true });
        let reply = settlement.reply.unwrap();
        assert_eq!(reply.status_code, STATUS_FAILED);
        assert_eq!(reply.body.message, "lambda invocation failed: upstream 502");
    }

    #[tokio::test]
    async fn test_poison_message_is_dropped_without_processing() {
        let processor = CountingProcessor::new(false);

        let bodies: [&[u8]; 3] = [b"not json", br#"{"file_id": 42}"#, b""];
        for body in bodies {
            let settlement = settle(&processor, body).await;
            assert_eq!(settlement.disposition, Disposition::Reject { requeue: false });
            assert!(settlement.reply.is_none());
        }

        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_worker_stop_signal() {
        let parent = CancellationToken::new();
        let worker = Worker::new(
            3,
            "srt_conversions".to_string(),
            parent.child_token(),
            Arc::new(CountingProcessor::new(false)),
        );

        assert_eq!(worker.consumer_tag(), "srt-worker-3");
        assert!(!worker.is_stopped());
        parent.cancel();
        assert!(worker.is_stopped());
    }

    #[test]
    fn test_reply_target_echoes_correlation_id() {
        let properties = BasicProperties::default()
            .with_reply_to("amq.gen-reply".into())
            .with_correlation_id("f1".into());

        assert_eq!(
            reply_target(&properties),
            Some(("amq.gen-reply".to_string(), "f1".to_string()))
        );
    }

    #[test]
    fn test_reply_target_requires_reply_to() {
        let enqueued = BasicProperties::default()
            .with_message_id("f1".into())
            .with_correlation_id("f1".into());
        assert_eq!(reply_target(&enqueued), None);

        let uncorrelated = BasicProperties::default().with_reply_to("amq.gen-reply".into());
        assert_eq!(
            reply_target(&uncorrelated),
            Some(("amq.gen-reply".to_string(), String::new()))
        );
    }

    #[tokio::test]
    async fn test_relaunch_waits_for_previous_run() {
        let worker = Worker::new(
            1,
            "srt_conversions".to_string(),
            CancellationToken::new(),
            Arc::new(CountingProcessor::new(false)),
        );
        let tracker = TaskTracker::new();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let log = Arc::clone(&events);
        worker
            .relaunch(&tracker, async move {
                log.lock().unwrap().push("first_started");
                let _ = released.await;
                log.lock().unwrap().push("first_exited");
            })
            .await;

        let log = Arc::clone(&events);
        worker
            .relaunch(&tracker, async move {
                log.lock().unwrap().push("second_started");
            })
            .await;

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*events.lock().unwrap(), vec!["first_started"]);

        release.send(()).unwrap();
        tracker.close();
        tracker.wait().await;

        assert_eq!(
            *events.lock().unwrap(),
            vec!["first_started", "first_exited", "second_started"]
        );
    }
}
