//! Waiting for the reply of a synchronous publish.
//!
//! A scanner task watches the private reply queue for the delivery whose
//! correlation id matches the job, while the caller waits on the first of:
//! its own cancellation, the decoded reply, or the timeout.

use std::future;
use std::time::Duration;

use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::LambdaResponse;
use crate::error::DispatchError;

/// A delivery from a reply queue, reduced to what correlation needs.
#[derive(Debug, Clone)]
pub struct Reply {
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

impl From<Delivery> for Reply {
    fn from(delivery: Delivery) -> Self {
        Self {
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.to_string()),
            body: delivery.data,
        }
    }
}

/// How a wait ended when it did not fail.
#[derive(Debug, PartialEq)]
pub enum Waited {
    /// The worker answered in time.
    Replied(LambdaResponse),
    /// The timeout fired first; the job itself keeps running.
    TimedOut,
}

/// Wait for the reply correlated with `correlation_id`.
///
/// On reply, decode failure or cancellation the scanner is stopped and joined
/// before returning. On timeout it is only told to stop; nothing is joined so
/// the caller returns right away.
pub async fn await_reply<S>(
    replies: S,
    correlation_id: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Waited, DispatchError>
where
    S: Stream<Item = Reply> + Send + 'static,
{
    let (result_tx, result_rx) = oneshot::channel();
    let stop = CancellationToken::new();
    let scanner = tokio::spawn(scan_replies(
        replies,
        correlation_id.to_owned(),
        result_tx,
        stop.clone(),
    ));

    // A reply stream that ends without a match leaves the timeout in charge.
    let reply = async move {
        match result_rx.await {
            Ok(result) => result,
            Err(_) => future::pending().await,
        }
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        result = reply => result.map(Waited::Replied),
        _ = sleep(timeout) => {
            stop.cancel();
            return Ok(Waited::TimedOut);
        }
    };

    stop.cancel();
    if let Err(e) = scanner.await {
        warn!(error = %e, "rpc_reply_scanner_failed");
    }

    outcome
}

async fn scan_replies<S>(
    replies: S,
    correlation_id: String,
    result_tx: oneshot::Sender<Result<LambdaResponse, DispatchError>>,
    stop: CancellationToken,
) where
    S: Stream<Item = Reply> + Send + 'static,
{
    let mut replies = Box::pin(replies);

    loop {
        let reply = tokio::select! {
            _ = stop.cancelled() => return,
            next = replies.next() => match next {
                Some(reply) => reply,
                None => {
                    debug!(correlation_id = %correlation_id, "rpc_reply_stream_closed");
                    return;
                }
            },
        };

        if reply.correlation_id.as_deref() != Some(correlation_id.as_str()) {
            debug!(
                expected = %correlation_id,
                received = ?reply.correlation_id,
                "rpc_reply_ignored"
            );
            continue;
        }

        let result = serde_json::from_slice(&reply.body).map_err(DispatchError::Decode);
        let _ = result_tx.send(result);
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use tokio::time::Instant;

    fn reply(correlation_id: &str, response: &LambdaResponse) -> Reply {
        Reply {
            correlation_id: Some(correlation_id.to_string()),
            body: serde_json::to_vec(response).unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_worker_reply_is_returned() {
        let (tx, rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();
        let expected = LambdaResponse::success("https://cdn.example.com/f1.srt", 2.0);

        let sent = expected.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            tx.unbounded_send(reply("f1", &sent)).unwrap();
        });

        let started = Instant::now();
        let waited = await_reply(rx, "f1", Duration::from_secs(10), &cancel).await.unwrap();

        assert_eq!(waited, Waited::Replied(expected));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_worker_times_out_at_deadline() {
        let (tx, rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            sleep(Duration::from_secs(15)).await;
            let _ = tx.unbounded_send(reply("f1", &LambdaResponse::success("late", 2.0)));
        });

        let started = Instant::now();
        let waited = await_reply(rx, "f1", Duration::from_secs(10), &cancel).await.unwrap();

        assert_eq!(waited, Waited::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncorrelated_replies_are_skipped() {
        let (tx, rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();

        tx.unbounded_send(reply("other", &LambdaResponse::failure("not mine"))).unwrap();
        tx.unbounded_send(Reply {
            correlation_id: None,
            body: b"{}".to_vec(),
        })
        .unwrap();
        tx.unbounded_send(reply("f1", &LambdaResponse::success("mine", 1.0))).unwrap();

        let waited = await_reply(rx, "f1", Duration::from_secs(10), &cancel).await.unwrap();
        assert_eq!(waited, Waited::Replied(LambdaResponse::success("mine", 1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_reply_is_an_error() {
        let (tx, rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();

        tx.unbounded_send(Reply {
            correlation_id: Some("f1".to_string()),
            body: b"not json".to_vec(),
        })
        .unwrap();

        let result = await_reply(rx, "f1", Duration::from_secs(10), &cancel).await;
        assert!(matches!(result, Err(DispatchError::Decode(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation() {
        let (_tx, rx) = mpsc::unbounded::<Reply>();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = await_reply(rx, "f1", Duration::from_secs(10), &cancel).await;

        assert!(matches!(result, Err(DispatchError::Cancelled)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_falls_back_to_timeout() {
        let (tx, rx) = mpsc::unbounded::<Reply>();
        drop(tx);
        let cancel = CancellationToken::new();

        let waited = await_reply(rx, "f1", Duration::from_secs(10), &cancel).await.unwrap();
        assert_eq!(waited, Waited::TimedOut);
    }
}
