//! Error type shared by the dispatch layer.

use thiserror::Error;

/// Errors surfaced by the broker, pool, worker and publisher code.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Any failure reported by the AMQP client (dial, declare, channel, publish).
    #[error("rabbitmq error: {0}")]
    Broker(#[from] lapin::Error),

    /// The connection is down and the reconnect supervisor has not restored it yet.
    #[error("rabbitmq is not connected")]
    NotConnected,

    /// `Broker::close` has already run.
    #[error("dispatcher has been shut down")]
    Closed,

    /// No idle channel was available; acquisition never waits.
    #[error("channel pool is empty")]
    PoolEmpty,

    /// The pool was closed together with its connection.
    #[error("channel pool is closed")]
    PoolClosed,

    #[error("failed to encode job: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),

    /// The caller gave up waiting for the reply.
    #[error("request was cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Connectivity failures are retried by the reconnect supervisor rather
    /// than being the caller's fault.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DispatchError::Broker(_) | DispatchError::NotConnected | DispatchError::PoolClosed
        )
    }
}
