//! Broker connection lifecycle.
//!
//! [`Broker`] owns the single AMQP connection, the control channel, the
//! channel pool and the worker registry. A supervisor task watches for
//! connection loss; it closes the pool, retries `establish` with a fixed delay
//! for as long as the process runs, and relaunches every registered worker
//! once a new connection is up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lapin::{
    options::{BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::pool::ChannelPool;
use crate::config::Config;
use crate::consumer::{run_worker, Worker};
use crate::error::DispatchError;
use crate::processor::Processor;

/// The live connection and the channel used for publishing.
struct Link {
    connection: Connection,
    control: Channel,
}

impl Link {
    async fn close(self) {
        if let Err(e) = self.control.close(200, "Normal shutdown").await {
            debug!(error = %e, "rabbitmq_channel_close_error");
        }
        if let Err(e) = self.connection.close(200, "Normal shutdown").await {
            debug!(error = %e, "rabbitmq_connection_close_error");
        }
    }
}

/// Handle to the broker connection state.
///
/// Created once by the composition root and cloned into the publisher and the
/// web layer; all clones share the same state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: Arc<Config>,
    link: RwLock<Option<Link>>,
    pool: RwLock<Arc<ChannelPool<Channel>>>,
    /// Cancelled when the current connection is lost; parent of each worker run.
    lifeline: RwLock<CancellationToken>,
    connected: AtomicBool,
    closed: AtomicBool,
    /// Bumped on every successful connect so late events from an old
    /// connection can be told apart.
    generation: AtomicU64,
    shutdown: CancellationToken,
    workers: Mutex<Vec<Arc<Worker>>>,
    tracker: TaskTracker,
    disconnect_tx: mpsc::UnboundedSender<u64>,
}

impl Broker {
    /// Dial the broker, declare the work queue, fill the channel pool and
    /// start the reconnect supervisor.
    pub async fn connect(config: Arc<Config>) -> Result<Self, DispatchError> {
        info!(url_length = config.amqp_url.len(), "rabbitmq_connecting");

        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let (link, pool) = establish(&config, 1, disconnect_tx.clone()).await?;

        let shutdown = CancellationToken::new();
        let inner = BrokerInner {
            link: RwLock::new(Some(link)),
            pool: RwLock::new(Arc::new(pool)),
            lifeline: RwLock::new(shutdown.child_token()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(1),
            shutdown,
            workers: Mutex::new(Vec::new()),
            tracker: TaskTracker::new(),
            disconnect_tx,
            config,
        };

        let broker = Broker {
            inner: Arc::new(inner),
        };

        let supervisor = broker.clone();
        broker
            .inner
            .tracker
            .spawn(async move { supervisor.handle_reconnect(disconnect_rx).await });

        info!(queue = %broker.inner.config.work_queue, "rabbitmq_connected");
        Ok(broker)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of connections established so far, including the first.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// The pool belonging to the current connection.
    pub async fn pool(&self) -> Arc<ChannelPool<Channel>> {
        Arc::clone(&*self.inner.pool.read().await)
    }

    /// Open a fresh channel on the live connection.
    pub async fn create_channel(&self) -> Result<Channel, DispatchError> {
        self.ensure_usable()?;
        let link = self.inner.link.read().await;
        let link = link.as_ref().ok_or(DispatchError::NotConnected)?;
        Ok(link.connection.create_channel().await?)
    }

    /// The long-lived channel used for fire-and-forget publishing.
    pub async fn control_channel(&self) -> Result<Channel, DispatchError> {
        self.ensure_usable()?;
        let link = self.inner.link.read().await;
        let link = link.as_ref().ok_or(DispatchError::NotConnected)?;
        Ok(link.control.clone())
    }

    fn ensure_usable(&self) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        if !self.is_connected() {
            return Err(DispatchError::NotConnected);
        }
        Ok(())
    }

    /// Register `size` workers that share `processor` and start them.
    pub async fn start_worker_pool(
        &self,
        size: usize,
        processor: Arc<dyn Processor>,
    ) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let mut workers = self.inner.workers.lock().await;
        let lifeline = self.inner.lifeline.read().await.clone();
        let first_id = workers.len() + 1;

        for id in first_id..first_id + size {
            let worker = Arc::new(Worker::new(
                id,
                self.inner.config.work_queue.clone(),
                self.inner.shutdown.child_token(),
                Arc::clone(&processor),
            ));
            self.launch(&worker, lifeline.clone()).await;
            workers.push(worker);
        }

        info!(
            workers = size,
            total_workers = workers.len(),
            queue = %self.inner.config.work_queue,
            "worker_pool_started"
        );
        Ok(())
    }

    /// Start a run of `worker`, chained after its previous run so that one
    /// identity never consumes twice at the same time.
    async fn launch(&self, worker: &Arc<Worker>, lifeline: CancellationToken) {
        let run = run_worker(self.clone(), Arc::clone(worker), lifeline);
        worker.relaunch(&self.inner.tracker, run).await;
    }

    async fn relaunch_workers(&self) {
        let workers = self.inner.workers.lock().await.clone();
        let lifeline = self.inner.lifeline.read().await.clone();

        for worker in workers.iter().filter(|w| !w.is_stopped()) {
            self.launch(worker, lifeline.clone()).await;
        }

        info!(workers = workers.len(), "workers_relaunched");
    }

    /// Supervisor loop: wait for a disconnect of the current connection, then
    /// reconnect with a fixed delay until it succeeds or shutdown begins.
    async fn handle_reconnect(self, mut disconnects: mpsc::UnboundedReceiver<u64>) {
        loop {
            let generation = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                event = disconnects.recv() => match event {
                    Some(generation) => generation,
                    None => return,
                },
            };

            let current = self.generation();
            if generation != current {
                debug!(generation, current, "rabbitmq_stale_disconnect_ignored");
                continue;
            }

            warn!(generation, "rabbitmq_disconnected");
            self.inner.connected.store(false, Ordering::SeqCst);
            self.inner.lifeline.read().await.cancel();
            self.pool().await.close().await;

            let mut attempt: u64 = 0;
            loop {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return,
                    _ = sleep(self.inner.config.reconnect_delay()) => {}
                }

                attempt += 1;
                let next = current + 1;
                match establish(&self.inner.config, next, self.inner.disconnect_tx.clone()).await {
                    Ok((link, pool)) => {
                        if self.inner.shutdown.is_cancelled() {
                            link.close().await;
                            pool.close().await;
                            return;
                        }
                        self.install(next, link, pool).await;
                        info!(generation = next, attempt, "rabbitmq_reconnected");
                        self.relaunch_workers().await;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "rabbitmq_reconnect_failed");
                    }
                }
            }
        }
    }

    /// Replace a pooled channel that the broker closed while the connection
    /// stayed up, such as after a channel-level exception on `basic_consume`.
    ///
    /// The work queue is declared again first, in case its loss was the cause.
    pub(crate) async fn replenish(&self, pool: &Arc<ChannelPool<Channel>>) {
        if pool.is_closed() || !Arc::ptr_eq(pool, &*self.inner.pool.read().await) {
            return;
        }

        match self.open_pooled_channel().await {
            Ok(channel) => {
                info!(channel_id = channel.id(), generation = self.generation(), "channel_pool_replenished");
                pool.put(channel).await;
            }
            Err(e) => warn!(error = %e, "channel_pool_replenish_failed"),
        }
    }

    async fn open_pooled_channel(&self) -> Result<Channel, DispatchError> {
        let channel = self.create_channel().await?;
        declare_work_queue(&channel, &self.inner.config.work_queue).await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        Ok(channel)
    }

    async fn install(&self, generation: u64, link: Link, pool: ChannelPool<Channel>) {
        let previous = self.inner.link.write().await.replace(link);
        *self.inner.pool.write().await = Arc::new(pool);
        *self.inner.lifeline.write().await = self.inner.shutdown.child_token();
        self.inner.generation.store(generation, Ordering::SeqCst);
        self.inner.connected.store(true, Ordering::SeqCst);

        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// Stop every worker, wait for them to exit and release the connection.
    ///
    /// Runs once; later calls return immediately.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("rabbitmq_closing");
        self.inner.connected.store(false, Ordering::SeqCst);
        self.pool().await.close().await;

        self.inner.shutdown.cancel();
        for worker in self.inner.workers.lock().await.iter() {
            worker.stop();
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let link = self.inner.link.write().await.take();
        if let Some(link) = link {
            link.close().await;
        }

        info!("rabbitmq_closed");
    }

    /// Feed a disconnect event for the current connection to the supervisor,
    /// exactly as a lost connection would.
    #[cfg(test)]
    fn simulate_disconnect(&self) {
        let _ = self.inner.disconnect_tx.send(self.generation());
    }
}

/// Dial, declare the work queue and open a fully configured channel pool.
async fn establish(
    config: &Config,
    generation: u64,
    disconnect_tx: mpsc::UnboundedSender<u64>,
) -> Result<(Link, ChannelPool<Channel>), DispatchError> {
    let connection = Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?;

    match open_channels(&connection, config).await {
        Ok((control, channels)) => {
            connection.on_error(move |err| {
                warn!(generation, error = %err, "rabbitmq_connection_error");
                let _ = disconnect_tx.send(generation);
            });

            info!(
                generation,
                pool_size = channels.len(),
                queue = %config.work_queue,
                "rabbitmq_link_established"
            );

            let pool = ChannelPool::with_channels(config.channel_pool_size, channels);
            Ok((Link { connection, control }, pool))
        }
        Err(e) => {
            if let Err(close_err) = connection.close(200, "Setup failed").await {
                debug!(error = %close_err, "rabbitmq_connection_close_error");
            }
            Err(e)
        }
    }
}

async fn open_channels(
    connection: &Connection,
    config: &Config,
) -> Result<(Channel, Vec<Channel>), DispatchError> {
    let control = connection.create_channel().await?;

    declare_work_queue(&control, &config.work_queue).await?;

    let mut channels = Vec::with_capacity(config.channel_pool_size);
    for _ in 0..config.channel_pool_size {
        let channel = connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        channels.push(channel);
    }

    Ok((control, channels))
}

async fn declare_work_queue(channel: &Channel, queue: &str) -> Result<(), DispatchError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                auto_delete: false,
                exclusive: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}
