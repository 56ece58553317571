//! Fixed-capacity pool of consumption channels.
//!
//! Channels are opened up front with a prefetch of 1, so whichever worker
//! holds one receives at most one unacknowledged delivery at a time.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use lapin::Channel;
use tracing::debug;

use crate::error::DispatchError;

/// A broker channel that can be handed out by a [`ChannelPool`].
#[async_trait]
pub trait PooledChannel: Send + Sync + 'static {
    /// Whether the channel can still carry traffic.
    fn is_open(&self) -> bool;

    /// Close the channel for good.
    async fn discard(self);
}

#[async_trait]
impl PooledChannel for Channel {
    fn is_open(&self) -> bool {
        self.status().connected()
    }

    async fn discard(self) {
        if !self.status().connected() {
            return;
        }
        if let Err(e) = self.close(200, "channel released").await {
            debug!(channel_id = self.id(), error = %e, "rabbitmq_channel_close_error");
        }
    }
}

struct PoolState<C> {
    idle: VecDeque<C>,
    closed: bool,
}

/// Bounded set of ready channels.
///
/// `get` never waits: it hands out an idle channel or fails. `put` returns a
/// channel, closing it instead when it is dead, the pool is full or the pool
/// is already closed.
pub struct ChannelPool<C> {
    capacity: usize,
    state: Mutex<PoolState<C>>,
}

impl<C: PooledChannel> ChannelPool<C> {
    /// Create a pool pre-filled with `channels`; extras beyond `capacity` are dropped.
    pub fn with_channels(capacity: usize, channels: Vec<C>) -> Self {
        let mut idle: VecDeque<C> = channels.into();
        idle.truncate(capacity);

        Self {
            capacity,
            state: Mutex::new(PoolState { idle, closed: false }),
        }
    }

    /// Take an idle channel without waiting.
    pub fn get(&self) -> Result<C, DispatchError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(DispatchError::PoolClosed);
        }
        state.idle.pop_front().ok_or(DispatchError::PoolEmpty)
    }

    /// Return a channel to the pool or close it if there is no room for it.
    ///
    /// A channel the broker has already closed is never pooled again.
    pub async fn put(&self, channel: C) {
        if !channel.is_open() {
            debug!("channel_pool_dead_channel_dropped");
            channel.discard().await;
            return;
        }

        let rejected = match self.lock() {
            Ok(mut state) if !state.closed && state.idle.len() < self.capacity => {
                state.idle.push_back(channel);
                None
            }
            _ => Some(channel),
        };

        if let Some(channel) = rejected {
            channel.discard().await;
        }
    }

    /// Stop accepting channels and close every idle one.
    pub async fn close(&self) {
        let drained: Vec<C> = match self.lock() {
            Ok(mut state) => {
                state.closed = true;
                state.idle.drain(..).collect()
            }
            Err(_) => Vec::new(),
        };

        debug!(closed_channels = drained.len(), "channel_pool_closed");

        for channel in drained {
            channel.discard().await;
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle channels.
    pub fn len(&self) -> usize {
        self.lock().map(|state| state.idle.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|state| state.closed).unwrap_or(true)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PoolState<C>>, DispatchError> {
        // A poisoned pool is treated as closed.
        self.state.lock().map_err(|_| DispatchError::PoolClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    struct FakeChannel {
        id: usize,
        open: bool,
        discarded: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PooledChannel for FakeChannel {
        fn is_open(&self) -> bool {
            self.open
        }

        async fn discard(self) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_pool(capacity: usize, filled: usize) -> (ChannelPool<FakeChannel>, Arc<AtomicUsize>) {
        let discarded = Arc::new(AtomicUsize::new(0));
        let channels = (0..filled)
            .map(|id| FakeChannel {
                id,
                open: true,
                discarded: Arc::clone(&discarded),
            })
            .collect();
        (ChannelPool::with_channels(capacity, channels), discarded)
    }

    #[test]
    fn test_get_fails_fast_when_empty() {
        let (pool, _) = fake_pool(2, 2);

        assert_eq!(pool.get().unwrap().id, 0);
        assert_eq!(pool.get().unwrap().id, 1);
        assert!(matches!(pool.get(), Err(DispatchError::PoolEmpty)));
    }

    #[tokio::test]
    async fn test_put_returns_channel() {
        let (pool, discarded) = fake_pool(2, 2);

        let ch = pool.get().unwrap();
        assert_eq!(pool.len(), 1);
        pool.put(ch).await;
        assert_eq!(pool.len(), 2);
        assert_eq!(discarded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_put_closes_overflow() {
        let (pool, discarded) = fake_pool(1, 1);

        let extra = FakeChannel {
            id: 99,
            open: true,
            discarded: Arc::clone(&discarded),
        };
        pool.put(extra).await;

        assert_eq!(pool.len(), 1);
        assert_eq!(discarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_discards_idle_and_later_puts() {
        let (pool, discarded) = fake_pool(3, 3);
        let checked_out = pool.get().unwrap();

        pool.close().await;
        assert!(pool.is_closed());
        assert!(pool.is_empty());
        assert_eq!(discarded.load(Ordering::SeqCst), 2);
        assert!(matches!(pool.get(), Err(DispatchError::PoolClosed)));

        // A worker returning its channel after the close must not leak it.
        pool.put(checked_out).await;
        assert!(pool.is_empty());
        assert_eq!(discarded.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_with_channels_truncates_to_capacity() {
        let (pool, _) = fake_pool(2, 5);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[tokio::test]
    async fn test_put_discards_dead_channel() {
        let (pool, discarded) = fake_pool(2, 2);

        let mut ch = pool.get().unwrap();
        ch.open = false;
        pool.put(ch).await;

        assert_eq!(pool.len(), 1);
        assert_eq!(discarded.load(Ordering::SeqCst), 1);
        assert_eq!(pool.get().unwrap().id, 1);
        assert!(matches!(pool.get(), Err(DispatchError::PoolEmpty)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_put_never_exceeds_capacity() {
        let (pool, discarded) = fake_pool(4, 4);
        let pool = Arc::new(pool);
        let served = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            let served = Arc::clone(&served);
            handles.push(tokio::spawn(async move {
                for _ in 0..200 {
                    // A get that blocked would trip the timeout.
                    let got = tokio::time::timeout(Duration::from_millis(100), async { pool.get() })
                        .await
                        .expect("get must not block");
                    if let Ok(ch) = got {
                        served.fetch_add(1, Ordering::SeqCst);
                        assert!(pool.len() < pool.capacity());
                        tokio::task::yield_now().await;
                        pool.put(ch).await;
                    }
                    assert!(pool.len() <= pool.capacity());
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(pool.len(), 4);
        assert_eq!(discarded.load(Ordering::SeqCst), 0);
        assert!(served.load(Ordering::SeqCst) > 0);
    }
}
