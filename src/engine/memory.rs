//! In-memory point-value store
//!
//! Reference implementation of [`PointValueStore`] used by tests, benchmarks
//! and embedded deployments. Each series is a `BTreeMap` keyed by timestamp,
//! sharded across a `DashMap` so writers to different series do not contend.
//!
//! A write to an occupied timestamp overwrites the stored value.
//!
//! Besides storage it keeps a few counters (scan calls, batch calls, open
//! leases) and lets tests inject failures or hold batch writes at a gate.
//!
//! # Example
//!
//! ```rust
//! use kuba_pointvalues::engine::{MemoryStore, PointValueStore};
//! use kuba_pointvalues::types::PointValueTime;
//!
//! let store = MemoryStore::new();
//! store.insert(1, PointValueTime::numeric(100, 1.0)).unwrap();
//! assert_eq!(store.value_count(), 1);
//! ```

use crate::engine::traits::{
    BatchEntry, Capabilities, Capability, PointValueStore, ReadLease, ScanRequest,
    DEFAULT_CHUNK_SIZE,
};
use crate::error::StorageError;
use crate::services::purge::PurgePeriod;
use crate::types::{DataValue, IdPointValueTime, PointValueTime, SeriesCount, SeriesId, TimeOrder};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredValue {
    value: DataValue,
    annotation: Option<String>,
}

/// Operation counters of a [`MemoryStore`]
#[derive(Debug, Default)]
struct StoreCounters {
    scans: AtomicU64,
    inserts: AtomicU64,
    batches: AtomicU64,
    deletes: AtomicU64,
}

/// Gate that holds batch inserts while closed
#[derive(Default)]
struct WriteGate {
    paused: Mutex<bool>,
    cond: Condvar,
}

impl WriteGate {
    fn wait_open(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.cond.wait(&mut paused);
        }
    }

    fn set(&self, paused: bool) {
        *self.paused.lock() = paused;
        if !paused {
            self.cond.notify_all();
        }
    }
}

/// Point-value store held entirely in memory
pub struct MemoryStore {
    id: String,
    series: DashMap<SeriesId, BTreeMap<i64, StoredValue>>,
    capabilities: RwLock<Capabilities>,
    per_point_purge: AtomicBool,
    chunk_size: usize,
    retention: RwLock<Option<PurgePeriod>>,
    counters: StoreCounters,
    open_leases: Arc<AtomicUsize>,
    fail_writes: AtomicUsize,
    fail_scans: AtomicUsize,
    gate: WriteGate,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store declaring every optional capability
    pub fn new() -> Self {
        Self {
            id: "memory".to_string(),
            series: DashMap::new(),
            capabilities: RwLock::new(Capabilities::all()),
            per_point_purge: AtomicBool::new(true),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retention: RwLock::new(None),
            counters: StoreCounters::default(),
            open_leases: Arc::new(AtomicUsize::new(0)),
            fail_writes: AtomicUsize::new(0),
            fail_scans: AtomicUsize::new(0),
            gate: WriteGate::default(),
        }
    }

    /// Override the backend identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Declare a different capability set
    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        *self.capabilities.write() = capabilities;
        self
    }

    /// Override the preferred chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Opt in or out of per-point purge
    pub fn with_per_point_purge(self, enabled: bool) -> Self {
        self.per_point_purge.store(enabled, Ordering::Relaxed);
        self
    }

    /// Total number of stored values
    pub fn value_count(&self) -> usize {
        self.series.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of stored values of one series
    pub fn series_len(&self, series_id: SeriesId) -> usize {
        self.series.get(&series_id).map_or(0, |s| s.len())
    }

    /// Number of `scan` calls served so far
    pub fn scan_calls(&self) -> u64 {
        self.counters.scans.load(Ordering::Relaxed)
    }

    /// Number of `insert_batch` calls served so far
    pub fn batch_calls(&self) -> u64 {
        self.counters.batches.load(Ordering::Relaxed)
    }

    /// Number of leases currently held by open streams
    pub fn open_leases(&self) -> usize {
        self.open_leases.load(Ordering::SeqCst)
    }

    /// Retention period last handed to the store
    pub fn retention_policy(&self) -> Option<PurgePeriod> {
        *self.retention.read()
    }

    /// Fail the next `n` insert or batch calls
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` scan calls
    pub fn fail_next_scans(&self, n: usize) {
        self.fail_scans.store(n, Ordering::SeqCst);
    }

    /// Hold batch inserts until [`resume_writes`](Self::resume_writes)
    pub fn pause_writes(&self) {
        self.gate.set(true);
    }

    /// Release held batch inserts
    pub fn resume_writes(&self) {
        self.gate.set(false);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn require(&self, capability: Capability) -> Result<(), StorageError> {
        self.capabilities.read().require(capability)
    }

    fn put(&self, series_id: SeriesId, value: PointValueTime) {
        self.series.entry(series_id).or_default().insert(
            value.timestamp,
            StoredValue {
                value: value.value,
                annotation: value.annotation,
            },
        );
    }

    fn remove_before(&self, series_id: SeriesId, from: Option<i64>, to: Option<i64>) -> u64 {
        let Some(mut values) = self.series.get_mut(&series_id) else {
            return 0;
        };
        let before = values.len();
        values.retain(|ts, _| {
            let inside = from.map_or(true, |f| *ts >= f) && to.map_or(true, |t| *ts < t);
            !inside
        });
        (before - values.len()) as u64
    }
}

impl PointValueStore for MemoryStore {
    fn store_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.read().clone()
    }

    fn scan(
        &self,
        request: &ScanRequest,
        sink: &mut dyn FnMut(IdPointValueTime),
    ) -> Result<(), StorageError> {
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.fail_scans) {
            return Err(StorageError::Unavailable("injected scan failure".to_string()));
        }
        if request.range.is_empty() || request.limit == Some(0) {
            return Ok(());
        }

        let mut series = request.series.clone();
        series.sort_unstable();
        series.dedup();

        let lower = request.range.from.map_or(Bound::Unbounded, Bound::Included);
        let upper = request.range.to.map_or(Bound::Unbounded, Bound::Excluded);
        let limit = request.limit.unwrap_or(usize::MAX);

        for series_id in series {
            let Some(values) = self.series.get(&series_id) else {
                continue;
            };
            // Collected first so the shard lock is not held while the sink runs
            let window = values.range((lower, upper));
            let batch: Vec<IdPointValueTime> = match request.order {
                TimeOrder::Ascending => window
                    .take(limit)
                    .map(|(ts, v)| to_id_value(series_id, *ts, v))
                    .collect(),
                TimeOrder::Descending => window
                    .rev()
                    .take(limit)
                    .map(|(ts, v)| to_id_value(series_id, *ts, v))
                    .collect(),
            };
            drop(values);
            for value in batch {
                sink(value);
            }
        }
        Ok(())
    }

    fn insert(
        &self,
        series_id: SeriesId,
        value: PointValueTime,
    ) -> Result<PointValueTime, StorageError> {
        if Self::take_failure(&self.fail_writes) {
            return Err(StorageError::Unavailable("injected write failure".to_string()));
        }
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        self.put(series_id, value.clone());
        Ok(value)
    }

    fn insert_batch(&self, entries: Vec<BatchEntry>) -> Result<(), StorageError> {
        self.gate.wait_open();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.fail_writes) {
            return Err(StorageError::Unavailable("injected batch failure".to_string()));
        }
        for entry in entries {
            self.put(entry.series_id, entry.value);
        }
        Ok(())
    }

    fn delete_between(
        &self,
        series_id: SeriesId,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Option<u64>, StorageError> {
        self.require(Capability::Delete)?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(Some(self.remove_before(series_id, from, to)))
    }

    fn delete_all_before(&self, end: i64) -> Result<Option<u64>, StorageError> {
        self.require(Capability::DeleteAllBefore)?;
        let ids: Vec<SeriesId> = self.series.iter().map(|e| *e.key()).collect();
        let deleted = ids
            .into_iter()
            .map(|id| self.remove_before(id, None, Some(end)))
            .sum();
        Ok(Some(deleted))
    }

    fn delete_all(&self) -> Result<Option<u64>, StorageError> {
        self.require(Capability::DeleteAll)?;
        let deleted = self.value_count() as u64;
        self.series.clear();
        Ok(Some(deleted))
    }

    fn delete_orphaned(&self, live: &HashSet<SeriesId>) -> Result<Option<u64>, StorageError> {
        self.require(Capability::DeleteOrphaned)?;
        let mut deleted = 0u64;
        self.series.retain(|id, values| {
            if live.contains(id) {
                true
            } else {
                deleted += values.len() as u64;
                false
            }
        });
        Ok(Some(deleted))
    }

    fn set_retention_policy(&self, period: PurgePeriod) -> Result<(), StorageError> {
        self.require(Capability::RetentionPolicy)?;
        *self.retention.write() = Some(period);
        Ok(())
    }

    fn enforce_retention(&self, now: i64) -> Result<Option<u64>, StorageError> {
        self.require(Capability::RetentionPolicy)?;
        let Some(cutoff) = self.retention_policy().and_then(|p| p.cutoff(now)) else {
            return Ok(Some(0));
        };
        let mut expired = 0u64;
        for mut entry in self.series.iter_mut() {
            let values = entry.value_mut();
            let before = values.len();
            values.retain(|ts, _| *ts >= cutoff);
            expired += (before - values.len()) as u64;
        }
        Ok(Some(expired))
    }

    fn top_series(&self, limit: usize) -> Result<Vec<SeriesCount>, StorageError> {
        self.require(Capability::TopSeries)?;
        let mut counts: Vec<SeriesCount> = self
            .series
            .iter()
            .map(|e| SeriesCount {
                series_id: *e.key(),
                count: e.value().len() as u64,
            })
            .collect();
        counts.sort_by(|a, b| b.count.cmp(&a.count).then(a.series_id.cmp(&b.series_id)));
        counts.truncate(limit);
        Ok(counts)
    }

    fn per_point_purge_enabled(&self) -> bool {
        self.per_point_purge.load(Ordering::Relaxed)
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn open_lease(&self) -> Result<ReadLease, StorageError> {
        let leases = self.open_leases.clone();
        leases.fetch_add(1, Ordering::SeqCst);
        Ok(ReadLease::new(move || {
            leases.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

fn to_id_value(series_id: SeriesId, timestamp: i64, stored: &StoredValue) -> IdPointValueTime {
    IdPointValueTime {
        series_id,
        timestamp,
        value: stored.value.clone(),
        annotation: stored.annotation.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeRange;

    fn collect(store: &MemoryStore, request: &ScanRequest) -> Vec<(SeriesId, i64)> {
        let mut out = Vec::new();
        store
            .scan(request, &mut |v| out.push((v.series_id, v.timestamp)))
            .unwrap();
        out
    }

    #[test]
    fn test_duplicate_timestamp_overwrites() {
        let store = MemoryStore::new();
        store.insert(1, PointValueTime::numeric(100, 1.0)).unwrap();
        store.insert(1, PointValueTime::numeric(100, 2.0)).unwrap();

        let mut seen = Vec::new();
        store
            .scan(
                &ScanRequest::single(1, TimeRange::all(), None, TimeOrder::Ascending),
                &mut |v| seen.push(v.value),
            )
            .unwrap();
        assert_eq!(seen, vec![DataValue::Numeric(2.0)]);
    }

    #[test]
    fn test_scan_groups_by_series_and_orders() {
        let store = MemoryStore::new();
        for (s, t) in [(2, 10), (1, 30), (1, 10), (2, 20), (1, 20)] {
            store.insert(s, PointValueTime::numeric(t, 0.0)).unwrap();
        }

        let request = ScanRequest {
            series: vec![2, 1],
            range: TimeRange::new(Some(10), Some(30)).unwrap(),
            limit: None,
            order: TimeOrder::Descending,
        };
        assert_eq!(collect(&store, &request), vec![(1, 20), (1, 10), (2, 20), (2, 10)]);
    }

    #[test]
    fn test_scan_limit_is_per_series() {
        let store = MemoryStore::new();
        for t in 0..5 {
            store.insert(1, PointValueTime::numeric(t, 0.0)).unwrap();
            store.insert(2, PointValueTime::numeric(t, 0.0)).unwrap();
        }
        let request = ScanRequest {
            series: vec![1, 2],
            range: TimeRange::all(),
            limit: Some(2),
            order: TimeOrder::Ascending,
        };
        assert_eq!(collect(&store, &request), vec![(1, 0), (1, 1), (2, 0), (2, 1)]);
    }

    #[test]
    fn test_undeclared_capability_is_refused() {
        let store = MemoryStore::new().with_capabilities(Capabilities::none());
        assert!(matches!(
            store.delete_between(1, None, None),
            Err(StorageError::Unsupported(Capability::Delete))
        ));
        assert!(matches!(
            store.top_series(5),
            Err(StorageError::Unsupported(Capability::TopSeries))
        ));
    }

    #[test]
    fn test_delete_orphaned_keeps_live_series() {
        let store = MemoryStore::new();
        store.insert(1, PointValueTime::numeric(1, 0.0)).unwrap();
        store.insert(2, PointValueTime::numeric(1, 0.0)).unwrap();
        store.insert(2, PointValueTime::numeric(2, 0.0)).unwrap();

        let live: HashSet<SeriesId> = [1].into_iter().collect();
        assert_eq!(store.delete_orphaned(&live).unwrap(), Some(2));
        assert_eq!(store.series_len(1), 1);
        assert_eq!(store.series_len(2), 0);
    }

    #[test]
    fn test_top_series_ranks_by_count() {
        let store = MemoryStore::new();
        for t in 0..3 {
            store.insert(7, PointValueTime::numeric(t, 0.0)).unwrap();
        }
        store.insert(3, PointValueTime::numeric(0, 0.0)).unwrap();
        let top = store.top_series(1).unwrap();
        assert_eq!(top, vec![SeriesCount { series_id: 7, count: 3 }]);
    }

    #[test]
    fn test_retention_expires_relative_to_given_time() {
        const DAY: i64 = 24 * 60 * 60 * 1000;
        let store = MemoryStore::new();
        for d in 0..10 {
            store.insert(1, PointValueTime::numeric(d * DAY, 0.0)).unwrap();
        }
        assert_eq!(store.enforce_retention(9 * DAY).unwrap(), Some(0));

        store.set_retention_policy(PurgePeriod::days(3)).unwrap();
        assert_eq!(store.series_len(1), 10);
        assert_eq!(store.enforce_retention(9 * DAY).unwrap(), Some(6));
        assert_eq!(store.series_len(1), 4);
        assert_eq!(store.enforce_retention(9 * DAY).unwrap(), Some(0));
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.insert(1, PointValueTime::numeric(1, 0.0)).is_err());
        assert!(store.insert(1, PointValueTime::numeric(1, 0.0)).is_ok());
    }

    #[test]
    fn test_leases_are_counted() {
        let store = MemoryStore::new();
        let a = store.open_lease().unwrap();
        let b = store.open_lease().unwrap();
        assert_eq!(store.open_leases(), 2);
        drop(a);
        drop(b);
        assert_eq!(store.open_leases(), 0);
    }
}
