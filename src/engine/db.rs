//! Point-value database handle
//!
//! [`PointValueDb`] ties a [`PointValueStore`] backend to the read pipeline
//! (see [`crate::query`]), the optional asynchronous writer pool and the
//! delete operations. Backend capabilities are resolved once in
//! [`PointValueDbBuilder::build`]; calls needing a capability the backend
//! did not declare fail with [`Error::UnsupportedCapability`] before the
//! backend is reached.
//!
//! # Example
//!
//! ```rust
//! use kuba_pointvalues::engine::{MemoryStore, PointValueDb};
//! use kuba_pointvalues::types::{PointRef, PointValueTime};
//!
//! let db = PointValueDb::builder().with_store(MemoryStore::new()).build().unwrap();
//! let point = PointRef::new(1, 1);
//! db.save_sync(&point, PointValueTime::numeric(100, 1.0)).unwrap();
//! assert_eq!(db.latest_value(&point).unwrap().unwrap().timestamp, 100);
//! ```

use super::traits::{BatchEntry, Capabilities, Capability, PointValueStore};
use crate::config::{Config, StoreConfig};
use crate::error::{Error, IngestionError, Result};
use crate::ingestion::{BatchWriterPool, WriteMetrics, WriterConfig};
use crate::services::purge::PurgePeriod;
use crate::types::{PointRef, PointValueTime, SeriesCount, SeriesId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Builder for [`PointValueDb`]
pub struct PointValueDbBuilder {
    store: Option<Arc<dyn PointValueStore>>,
    config: StoreConfig,
    writer: Option<WriterConfig>,
    metrics: Option<Arc<WriteMetrics>>,
}

impl PointValueDbBuilder {
    /// Create a builder with default settings and no backend
    pub fn new() -> Self {
        Self {
            store: None,
            config: StoreConfig::default(),
            writer: None,
            metrics: None,
        }
    }

    /// Set the storage backend
    pub fn with_store<S>(mut self, store: S) -> Self
    where
        S: PointValueStore + 'static,
    {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set the storage backend from an existing `Arc`
    ///
    /// Use this to keep a handle to the backend for direct inspection.
    pub fn with_store_arc(mut self, store: Arc<dyn PointValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Read path settings
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size = Some(chunk_size);
        self
    }

    /// Enable asynchronous writes; requires a tokio runtime at `build` time
    pub fn with_async_writes(mut self, writer: WriterConfig) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Use a caller-provided metrics holder for the writer pool
    pub fn with_metrics(mut self, metrics: Arc<WriteMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply the `store` and `writer` sections of a [`Config`]
    pub fn with_settings(mut self, config: &Config) -> Self {
        self.config = config.store.clone();
        self.writer = config.writer.clone();
        self
    }

    /// Build the database
    pub fn build(self) -> Result<PointValueDb> {
        let store = self
            .store
            .ok_or_else(|| Error::Configuration("a storage backend is required".to_string()))?;

        let chunk_size = self.config.chunk_size.unwrap_or_else(|| store.chunk_size());
        if chunk_size == 0 {
            return Err(Error::invalid("chunk size must be greater than zero"));
        }
        if self.config.min_combined_chunk_size == 0 {
            return Err(Error::invalid("minimum combined chunk size must be greater than zero"));
        }

        let capabilities = store.capabilities();

        let writer = match self.writer {
            Some(writer_config) => {
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                    Error::Configuration("asynchronous writes require a tokio runtime".to_string())
                })?;
                let metrics = self.metrics.unwrap_or_else(|| Arc::new(WriteMetrics::new()));
                Some(BatchWriterPool::start(store.clone(), writer_config, metrics, &runtime)?)
            }
            None => None,
        };

        info!(
            store = store.store_id(),
            chunk_size,
            async_writes = writer.is_some(),
            "point value database ready"
        );

        Ok(PointValueDb {
            store,
            capabilities,
            chunk_size,
            min_combined_chunk_size: self.config.min_combined_chunk_size,
            writer,
        })
    }
}

impl Default for PointValueDbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-value database: reads, writes and deletes over one backend
pub struct PointValueDb {
    pub(crate) store: Arc<dyn PointValueStore>,
    pub(crate) capabilities: Capabilities,
    pub(crate) chunk_size: usize,
    pub(crate) min_combined_chunk_size: usize,
    writer: Option<BatchWriterPool>,
}

impl PointValueDb {
    /// Start building a database
    pub fn builder() -> PointValueDbBuilder {
        PointValueDbBuilder::new()
    }

    /// The backend
    pub fn store(&self) -> &Arc<dyn PointValueStore> {
        &self.store
    }

    /// Capabilities resolved at construction
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Values fetched per backend round trip
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn require(&self, capability: Capability) -> Result<()> {
        Ok(self.capabilities.require(capability)?)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value now, returning the stored representation
    pub fn save_sync(&self, point: &PointRef, value: PointValueTime) -> Result<PointValueTime> {
        Ok(self.store.insert(point.series_id, value)?)
    }

    /// Store values now, `chunk_size` per backend batch
    pub fn save_batch_sync<I>(&self, values: I, chunk_size: usize) -> Result<usize>
    where
        I: IntoIterator<Item = (PointRef, PointValueTime)>,
    {
        if chunk_size == 0 {
            return Err(Error::invalid("chunk size must be greater than zero"));
        }
        let mut saved = 0;
        let mut batch = Vec::with_capacity(chunk_size.min(4096));
        for (point, value) in values {
            batch.push(BatchEntry::new(point.series_id, value));
            if batch.len() == chunk_size {
                saved += batch.len();
                self.store.insert_batch(std::mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            saved += batch.len();
            self.store.insert_batch(batch)?;
        }
        debug!(saved, "saved batch");
        Ok(saved)
    }

    /// Queue a value for a later batched write
    ///
    /// Returns once queued; a failure of the eventual write is logged and
    /// counted by the writer pool, not reported here.
    pub async fn save_async(&self, point: &PointRef, value: PointValueTime) -> Result<()> {
        let writer = self.writer.as_ref().ok_or(IngestionError::AsyncWritesDisabled)?;
        Ok(writer.enqueue(point.series_id, value).await?)
    }

    /// Wait until all queued values have been written (or failed)
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    /// Stop the writer pool after draining its queue
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(writer) = &self.writer {
            writer.shutdown().await?;
        }
        Ok(())
    }

    /// Values written per second by the writer pool (one-minute average)
    pub fn write_speed(&self) -> f64 {
        self.writer.as_ref().map_or(0.0, |w| w.metrics().write_rate())
    }

    /// Values queued or being written
    pub fn queue_size(&self) -> usize {
        self.writer.as_ref().map_or(0, |w| w.queue_size())
    }

    /// Writer workers currently inside a backend batch insert
    pub fn thread_count(&self) -> usize {
        self.writer.as_ref().map_or(0, |w| w.active_writers())
    }

    /// Writer pool metrics, if async writes are enabled
    pub fn write_metrics(&self) -> Option<&Arc<WriteMetrics>> {
        self.writer.as_ref().map(|w| w.metrics())
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Delete a point's values in `[from, to)`
    pub fn delete_between(
        &self,
        point: &PointRef,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Option<u64>> {
        if let (Some(f), Some(t)) = (from, to) {
            if t < f {
                return Err(Error::invalid(format!(
                    "to time {} must be greater than or equal to from time {}",
                    t, f
                )));
            }
        }
        self.require(Capability::Delete)?;
        Ok(self.store.delete_between(point.series_id, from, to)?)
    }

    /// Delete a point's values before `end`
    pub fn delete_before(&self, point: &PointRef, end: i64) -> Result<Option<u64>> {
        self.delete_between(point, None, Some(end))
    }

    /// Delete a point's value at exactly `timestamp`
    pub fn delete_at(&self, point: &PointRef, timestamp: i64) -> Result<Option<u64>> {
        self.delete_between(point, Some(timestamp), timestamp.checked_add(1))
    }

    /// Delete all of a point's values
    pub fn delete_all_for(&self, point: &PointRef) -> Result<Option<u64>> {
        self.delete_between(point, None, None)
    }

    /// Delete every stored value
    pub fn delete_all(&self) -> Result<Option<u64>> {
        self.require(Capability::DeleteAll)?;
        Ok(self.store.delete_all()?)
    }

    /// Delete every point's values before `end`
    pub fn delete_all_before(&self, end: i64) -> Result<Option<u64>> {
        self.require(Capability::DeleteAllBefore)?;
        Ok(self.store.delete_all_before(end)?)
    }

    /// Delete values of series not in `live`
    pub fn delete_orphaned(&self, live: &HashSet<SeriesId>) -> Result<Option<u64>> {
        self.require(Capability::DeleteOrphaned)?;
        Ok(self.store.delete_orphaned(live)?)
    }

    /// Hand retention to the backend
    pub fn set_retention_policy(&self, period: PurgePeriod) -> Result<()> {
        self.require(Capability::RetentionPolicy)?;
        Ok(self.store.set_retention_policy(period)?)
    }

    /// Series with the most stored values
    pub fn top_series(&self, limit: usize) -> Result<Vec<SeriesCount>> {
        self.require(Capability::TopSeries)?;
        Ok(self.store.top_series(limit)?)
    }

    /// Whether the backend wants per-point purge
    pub fn per_point_purge_enabled(&self) -> bool {
        self.store.per_point_purge_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryStore;

    #[test]
    fn test_builder_requires_store() {
        let err = PointValueDb::builder().build().err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_builder_rejects_zero_chunk_size() {
        let err = PointValueDb::builder()
            .with_store(MemoryStore::new())
            .with_chunk_size(0)
            .build()
            .err()
            .unwrap();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_chunk_size_defaults_to_backend() {
        let db = PointValueDb::builder()
            .with_store(MemoryStore::new().with_chunk_size(42))
            .build()
            .unwrap();
        assert_eq!(db.chunk_size(), 42);
    }

    #[test]
    fn test_async_writes_need_runtime() {
        let err = PointValueDb::builder()
            .with_store(MemoryStore::new())
            .with_async_writes(WriterConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_save_async_without_pool() {
        let db = PointValueDb::builder()
            .with_store(MemoryStore::new())
            .build()
            .unwrap();
        let err = db
            .save_async(&PointRef::new(1, 1), PointValueTime::numeric(1, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Ingestion(IngestionError::AsyncWritesDisabled)
        ));
        assert_eq!(db.queue_size(), 0);
        assert_eq!(db.thread_count(), 0);
        assert_eq!(db.write_speed(), 0.0);
    }

    #[test]
    fn test_save_batch_sync_chunks() {
        let store = Arc::new(MemoryStore::new());
        let db = PointValueDb::builder()
            .with_store_arc(store.clone())
            .build()
            .unwrap();
        let point = PointRef::new(1, 9);
        let values = (0..25).map(|t| (point, PointValueTime::numeric(t, 0.0)));

        assert_eq!(db.save_batch_sync(values, 10).unwrap(), 25);
        assert_eq!(store.batch_calls(), 3);
        assert_eq!(store.series_len(9), 25);
    }

    #[test]
    fn test_unsupported_delete_refused_before_backend() {
        let store = Arc::new(MemoryStore::new().with_capabilities(Capabilities::none()));
        let db = PointValueDb::builder()
            .with_store_arc(store.clone())
            .build()
            .unwrap();

        for result in [
            db.delete_before(&PointRef::new(1, 1), 10),
            db.delete_all(),
            db.delete_all_before(10),
            db.delete_orphaned(&HashSet::new()),
        ] {
            assert!(result.unwrap_err().is_unsupported());
        }
        assert!(db.set_retention_policy(PurgePeriod::days(1)).unwrap_err().is_unsupported());
        assert!(db.top_series(3).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_delete_rejects_inverted_range() {
        let db = PointValueDb::builder()
            .with_store(MemoryStore::new())
            .build()
            .unwrap();
        let err = db
            .delete_between(&PointRef::new(1, 1), Some(10), Some(5))
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }
}
