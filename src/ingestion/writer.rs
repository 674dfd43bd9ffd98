//! Batch writer pool for asynchronous saves
//!
//! Values handed to [`BatchWriterPool::enqueue`] are routed to one of
//! `num_workers` tokio tasks by `series_id % num_workers`. Each worker owns its
//! shard exclusively and writes one batch at a time, so values of one series
//! reach the backend in submission order. A worker closes a batch when it
//! holds `max_batch_size` values, when `max_batch_delay_ms` has passed since
//! its first value, or when a flush is requested, then issues a single
//! `insert_batch` on the blocking pool.
//!
//! Failed batches are logged and counted; they are never reported back to
//! the producers that enqueued them.

use crate::engine::traits::{BatchEntry, PointValueStore};
use crate::error::IngestionError;
use crate::types::{PointValueTime, SeriesId};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backpressure::{Admission, OverflowPolicy, QueueCapacity};
use super::metrics::WriteMetrics;

/// Configuration for the batch writer pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Number of worker tasks
    pub num_workers: usize,
    /// Largest batch handed to the backend
    pub max_batch_size: usize,
    /// Longest time a value waits for its batch to fill
    pub max_batch_delay_ms: u64,
    /// Values that may be queued or in flight at once
    pub queue_capacity: usize,
    /// Behavior when the queue is full
    pub overflow: OverflowPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            max_batch_size: 1000,
            max_batch_delay_ms: 100,
            queue_capacity: 100_000,
            overflow: OverflowPolicy::Block,
        }
    }
}

impl WriterConfig {
    /// Maximum allowed number of workers
    pub const MAX_WORKERS: usize = 64;

    /// Maximum allowed queue capacity
    pub const MAX_QUEUE_CAPACITY: usize = 100_000_000;

    /// Validate the configuration
    ///
    /// - `num_workers` must be between 1 and 64
    /// - `max_batch_size` must be > 0
    /// - `queue_capacity` must be between 1 and 100,000,000
    pub fn validate(&self) -> Result<(), String> {
        if self.num_workers == 0 {
            return Err("num_workers must be > 0".to_string());
        }
        if self.num_workers > Self::MAX_WORKERS {
            return Err(format!(
                "num_workers {} exceeds maximum allowed {}",
                self.num_workers,
                Self::MAX_WORKERS
            ));
        }
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be > 0".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be > 0".to_string());
        }
        if self.queue_capacity > Self::MAX_QUEUE_CAPACITY {
            return Err(format!(
                "queue_capacity {} exceeds maximum allowed {}",
                self.queue_capacity,
                Self::MAX_QUEUE_CAPACITY
            ));
        }
        Ok(())
    }

    fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }
}

/// A value waiting for its batch, holding its share of queue capacity
struct QueuedWrite {
    entry: BatchEntry,
    _permit: OwnedSemaphorePermit,
}

/// State shared by the pool handle and its workers
struct Shared {
    store: Arc<dyn PointValueStore>,
    metrics: Arc<WriteMetrics>,
    /// Values accepted but not yet written (or failed)
    pending: AtomicUsize,
    /// Signalled whenever `pending` drops to zero
    idle: Notify,
    /// Number of callers currently inside `flush`
    flushers: AtomicUsize,
    flush_signal: Notify,
}

impl Shared {
    fn flush_requested(&self) -> bool {
        self.flushers.load(Ordering::SeqCst) > 0
    }

    fn complete(&self, count: usize) {
        if self.pending.fetch_sub(count, Ordering::SeqCst) == count {
            self.idle.notify_waiters();
        }
    }
}

/// Pool of workers draining the asynchronous write queue
pub struct BatchWriterPool {
    config: WriterConfig,
    shared: Arc<Shared>,
    capacity: QueueCapacity,
    senders: RwLock<Vec<mpsc::UnboundedSender<QueuedWrite>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BatchWriterPool {
    /// Time allowed for workers to drain on shutdown
    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

    /// Validate `config` and start the workers on `runtime`
    pub fn start(
        store: Arc<dyn PointValueStore>,
        config: WriterConfig,
        metrics: Arc<WriteMetrics>,
        runtime: &Handle,
    ) -> Result<Self, IngestionError> {
        config.validate().map_err(IngestionError::ConfigError)?;

        let shared = Arc::new(Shared {
            store,
            metrics,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            flushers: AtomicUsize::new(0),
            flush_signal: Notify::new(),
        });

        let mut senders = Vec::with_capacity(config.num_workers);
        let mut workers = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            workers.push(runtime.spawn(run_worker(
                worker_id,
                rx,
                shared.clone(),
                config.max_batch_size,
                config.batch_delay(),
            )));
        }

        info!(
            workers = config.num_workers,
            max_batch_size = config.max_batch_size,
            queue_capacity = config.queue_capacity,
            overflow = ?config.overflow,
            "batch writer pool started"
        );

        Ok(Self {
            capacity: QueueCapacity::new(config.queue_capacity, config.overflow),
            config,
            shared,
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue a value for a later batch insert
    ///
    /// Returns once the value is queued (or dropped by
    /// [`OverflowPolicy::DropNewest`]); it does not wait for the write.
    pub async fn enqueue(
        &self,
        series_id: SeriesId,
        value: PointValueTime,
    ) -> Result<(), IngestionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IngestionError::ChannelClosed("write queue is shut down".to_string()));
        }

        let permit = match self.capacity.admit().await {
            Ok(Admission::Admitted(permit)) => permit,
            Ok(Admission::Dropped) => {
                self.shared.metrics.record_dropped(1);
                warn!(series_id, "write queue full, dropping value");
                return Ok(());
            }
            Err(e) => {
                if matches!(e, IngestionError::Backpressure(_)) {
                    self.shared.metrics.record_rejected(1);
                    warn!(series_id, "write queue full, rejecting value");
                }
                return Err(e);
            }
        };

        let sender = {
            let senders = self.senders.read();
            senders.get(self.shard_of(series_id)).cloned()
        };
        let Some(sender) = sender else {
            return Err(IngestionError::ChannelClosed("write queue is shut down".to_string()));
        };

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.shared.metrics.record_enqueued();
        let write = QueuedWrite {
            entry: BatchEntry::new(series_id, value),
            _permit: permit,
        };
        if sender.send(write).is_err() {
            self.shared.metrics.record_unqueued();
            self.shared.complete(1);
            return Err(IngestionError::ChannelClosed("write queue is shut down".to_string()));
        }
        Ok(())
    }

    /// Wait until every value queued so far has been written or failed
    pub async fn flush(&self) {
        self.shared.flushers.fetch_add(1, Ordering::SeqCst);
        self.shared.flush_signal.notify_waiters();

        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }

        self.shared.flushers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Stop accepting values, drain the queue and stop the workers
    pub async fn shutdown(&self) -> Result<(), IngestionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.capacity.close();
        // Dropping the senders lets each worker finish its shard and exit
        self.senders.write().clear();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let drained = tokio::time::timeout(Self::SHUTDOWN_TIMEOUT, async {
            for worker in workers {
                if let Err(e) = worker.await {
                    error!(error = %e, "writer task ended abnormally");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!("batch writer pool stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = self.queue_size();
                warn!(remaining, "shutdown timed out with writes still pending");
                Err(IngestionError::ShutdownError(format!(
                    "timed out waiting for {} queued writes",
                    remaining
                )))
            }
        }
    }

    /// Values queued or being written
    pub fn queue_size(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Workers currently inside a backend batch insert
    pub fn active_writers(&self) -> usize {
        self.shared.metrics.active_writers()
    }

    /// Shared metrics holder
    pub fn metrics(&self) -> &Arc<WriteMetrics> {
        &self.shared.metrics
    }

    /// Configuration the pool was started with
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn shard_of(&self, series_id: SeriesId) -> usize {
        (series_id % self.config.num_workers as u64) as usize
    }
}

async fn run_worker(
    worker_id: usize,
    mut rx: mpsc::UnboundedReceiver<QueuedWrite>,
    shared: Arc<Shared>,
    max_batch_size: usize,
    max_delay: Duration,
) {
    debug!(worker_id, "writer started");
    let mut batch: Vec<QueuedWrite> = Vec::with_capacity(max_batch_size.min(4096));

    while let Some(first) = rx.recv().await {
        batch.push(first);
        let deadline = Instant::now() + max_delay;
        let mut open = true;

        while open && batch.len() < max_batch_size {
            match rx.try_recv() {
                Ok(write) => {
                    batch.push(write);
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            if shared.flush_requested() {
                break;
            }
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(write) => batch.push(write),
                    None => open = false,
                },
                _ = shared.flush_signal.notified() => open = false,
                _ = tokio::time::sleep_until(deadline) => open = false,
            }
        }

        write_batch(worker_id, &shared, std::mem::take(&mut batch)).await;
    }
    debug!(worker_id, "writer stopped");
}

async fn write_batch(worker_id: usize, shared: &Arc<Shared>, batch: Vec<QueuedWrite>) {
    let size = batch.len();
    // Permits are released only after the backend call returns
    let (entries, permits): (Vec<BatchEntry>, Vec<OwnedSemaphorePermit>) =
        batch.into_iter().map(|w| (w.entry, w._permit)).unzip();

    shared.metrics.writer_started();
    let store = shared.store.clone();
    let result = tokio::task::spawn_blocking(move || store.insert_batch(entries)).await;
    shared.metrics.writer_finished();

    let ok = match result {
        Ok(Ok(())) => {
            debug!(worker_id, batch_size = size, "wrote batch");
            true
        }
        Ok(Err(e)) => {
            error!(worker_id, batch_size = size, error = %e, "failed to write batch");
            false
        }
        Err(e) => {
            error!(worker_id, batch_size = size, error = %e, "batch write task failed");
            false
        }
    };

    shared.metrics.record_batch(size, ok);
    drop(permits);
    shared.complete(size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryStore;

    fn pool_for(store: &Arc<MemoryStore>, config: WriterConfig) -> BatchWriterPool {
        BatchWriterPool::start(
            store.clone(),
            config,
            Arc::new(WriteMetrics::new()),
            &Handle::current(),
        )
        .unwrap()
    }

    #[test]
    fn test_writer_config_validation() {
        assert!(WriterConfig::default().validate().is_ok());

        let config = WriterConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WriterConfig {
            num_workers: 65,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WriterConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_flush_makes_values_durable() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_for(&store, WriterConfig::default());

        for t in 0..50 {
            pool.enqueue(t as u64 % 3, PointValueTime::numeric(t, 0.0))
                .await
                .unwrap();
        }
        pool.flush().await;

        assert_eq!(store.value_count(), 50);
        assert_eq!(pool.queue_size(), 0);
        assert_eq!(pool.metrics().written(), 50);
    }

    #[tokio::test]
    async fn test_batches_respect_max_size() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_for(
            &store,
            WriterConfig {
                num_workers: 1,
                max_batch_size: 10,
                max_batch_delay_ms: 10_000,
                ..Default::default()
            },
        );

        for t in 0..25 {
            pool.enqueue(1, PointValueTime::numeric(t, 0.0)).await.unwrap();
        }
        pool.flush().await;

        assert_eq!(store.series_len(1), 25);
        assert!(store.batch_calls() >= 3);
    }

    #[tokio::test]
    async fn test_failed_batch_is_metered_not_surfaced() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_for(
            &store,
            WriterConfig {
                num_workers: 1,
                ..Default::default()
            },
        );

        store.fail_next_writes(1);
        pool.enqueue(1, PointValueTime::numeric(1, 0.0)).await.unwrap();
        pool.flush().await;

        assert_eq!(store.value_count(), 0);
        assert_eq!(pool.metrics().failed(), 1);
        assert_eq!(pool.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_for(&store, WriterConfig::default());

        pool.enqueue(1, PointValueTime::numeric(1, 0.0)).await.unwrap();
        pool.shutdown().await.unwrap();

        assert_eq!(store.value_count(), 1);
        assert!(matches!(
            pool.enqueue(1, PointValueTime::numeric(2, 0.0)).await,
            Err(IngestionError::ChannelClosed(_))
        ));
    }
}
