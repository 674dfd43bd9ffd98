//! Backend contract for pluggable point-value stores
//!
//! Everything above this module (iterators, merges, the query façade, the
//! writer pool and purge) talks to storage only through [`PointValueStore`].
//! Mandatory operations are range scan and insert; everything else is an
//! optional [`Capability`] that defaults to [`StorageError::Unsupported`].

use crate::error::StorageError;
use crate::services::purge::PurgePeriod;
use crate::types::{IdPointValueTime, PointValueTime, SeriesCount, SeriesId, TimeOrder, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Default number of values fetched per backend round trip
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

// =============================================================================
// Capabilities
// =============================================================================

/// Optional backend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Delete a time range of one series
    Delete,
    /// Delete every series' values before a timestamp
    DeleteAllBefore,
    /// Delete all stored values
    DeleteAll,
    /// Delete values of series that no longer have a point
    DeleteOrphaned,
    /// Backend-native retention policy
    RetentionPolicy,
    /// Rank series by stored value count
    TopSeries,
}

impl Capability {
    /// Every optional capability
    pub const ALL: [Capability; 6] = [
        Capability::Delete,
        Capability::DeleteAllBefore,
        Capability::DeleteAll,
        Capability::DeleteOrphaned,
        Capability::RetentionPolicy,
        Capability::TopSeries,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Delete => "delete",
            Capability::DeleteAllBefore => "delete-all-before",
            Capability::DeleteAll => "delete-all",
            Capability::DeleteOrphaned => "delete-orphaned",
            Capability::RetentionPolicy => "retention-policy",
            Capability::TopSeries => "top-series",
        };
        f.write_str(name)
    }
}

/// Set of capabilities a backend declares
///
/// Resolved once when a [`PointValueDb`](crate::engine::PointValueDb) is
/// built; unsupported calls are refused before reaching the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    supported: HashSet<Capability>,
}

impl Capabilities {
    /// No optional capabilities
    pub fn none() -> Self {
        Self::default()
    }

    /// Every optional capability
    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    /// Add a capability
    pub fn with(mut self, capability: Capability) -> Self {
        self.supported.insert(capability);
        self
    }

    /// Remove a capability
    pub fn without(mut self, capability: Capability) -> Self {
        self.supported.remove(&capability);
        self
    }

    /// Whether the capability is declared
    pub fn supports(&self, capability: Capability) -> bool {
        self.supported.contains(&capability)
    }

    /// Fail with [`StorageError::Unsupported`] unless declared
    pub fn require(&self, capability: Capability) -> Result<(), StorageError> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(StorageError::Unsupported(capability))
        }
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self {
            supported: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Range scan over one or more series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Series to scan; results are grouped by ascending series id
    pub series: Vec<SeriesId>,
    /// Half-open time window
    pub range: TimeRange,
    /// Maximum values per series (`None` = unlimited)
    pub limit: Option<usize>,
    /// Timestamp order within each series
    pub order: TimeOrder,
}

impl ScanRequest {
    /// Scan a single series
    pub fn single(
        series_id: SeriesId,
        range: TimeRange,
        limit: Option<usize>,
        order: TimeOrder,
    ) -> Self {
        Self {
            series: vec![series_id],
            range,
            limit,
            order,
        }
    }
}

/// One entry of a batch insert
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Target series
    pub series_id: SeriesId,
    /// Value to store
    pub value: PointValueTime,
}

impl BatchEntry {
    /// Create a batch entry
    pub fn new(series_id: SeriesId, value: PointValueTime) -> Self {
        Self { series_id, value }
    }
}

// =============================================================================
// Read leases
// =============================================================================

/// Backend resource held by an open stream (a cursor, a connection, ...)
///
/// Released exactly once, when the lease is dropped.
pub struct ReadLease {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ReadLease {
    /// Lease that runs `release` when dropped
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Lease holding nothing
    pub fn detached() -> Self {
        Self { release: None }
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for ReadLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadLease")
            .field("held", &self.release.is_some())
            .finish()
    }
}

// =============================================================================
// PointValueStore Trait
// =============================================================================

/// Storage backend for point values
///
/// Calls are blocking; async callers go through `spawn_blocking`.
/// Implementations must keep at most one value per `(series, timestamp)`.
pub trait PointValueStore: Send + Sync + 'static {
    /// Unique identifier for this backend
    fn store_id(&self) -> &str;

    /// Optional operations this backend implements
    fn capabilities(&self) -> Capabilities;

    /// Scan values in `request.range`, pushing them to `sink` grouped by
    /// ascending series id, each series in `request.order`
    fn scan(
        &self,
        request: &ScanRequest,
        sink: &mut dyn FnMut(IdPointValueTime),
    ) -> Result<(), StorageError>;

    /// Insert one value, returning the stored representation
    fn insert(
        &self,
        series_id: SeriesId,
        value: PointValueTime,
    ) -> Result<PointValueTime, StorageError>;

    /// Insert a batch of values, applied in order
    fn insert_batch(&self, entries: Vec<BatchEntry>) -> Result<(), StorageError>;

    /// Delete values of one series in `[from, to)`, returning the count if known
    fn delete_between(
        &self,
        _series_id: SeriesId,
        _from: Option<i64>,
        _to: Option<i64>,
    ) -> Result<Option<u64>, StorageError> {
        Err(StorageError::Unsupported(Capability::Delete))
    }

    /// Delete every series' values before `end`
    fn delete_all_before(&self, _end: i64) -> Result<Option<u64>, StorageError> {
        Err(StorageError::Unsupported(Capability::DeleteAllBefore))
    }

    /// Delete all stored values
    fn delete_all(&self) -> Result<Option<u64>, StorageError> {
        Err(StorageError::Unsupported(Capability::DeleteAll))
    }

    /// Delete values of series not in `live`
    fn delete_orphaned(&self, _live: &HashSet<SeriesId>) -> Result<Option<u64>, StorageError> {
        Err(StorageError::Unsupported(Capability::DeleteOrphaned))
    }

    /// Hand retention to the backend
    fn set_retention_policy(&self, _period: PurgePeriod) -> Result<(), StorageError> {
        Err(StorageError::Unsupported(Capability::RetentionPolicy))
    }

    /// Expire values older than the retention policy as of `now` (epoch ms)
    ///
    /// Backends that expire values on their own keep this no-op.
    fn enforce_retention(&self, _now: i64) -> Result<Option<u64>, StorageError> {
        Ok(None)
    }

    /// Series with the most stored values, largest first
    fn top_series(&self, _limit: usize) -> Result<Vec<SeriesCount>, StorageError> {
        Err(StorageError::Unsupported(Capability::TopSeries))
    }

    /// Whether purge should issue per-point deletes against this backend
    fn per_point_purge_enabled(&self) -> bool {
        true
    }

    /// Preferred values per round trip
    fn chunk_size(&self) -> usize {
        DEFAULT_CHUNK_SIZE
    }

    /// Acquire the resource backing a stream
    fn open_lease(&self) -> Result<ReadLease, StorageError> {
        Ok(ReadLease::detached())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_capabilities_require() {
        let caps = Capabilities::none().with(Capability::Delete);
        assert!(caps.supports(Capability::Delete));
        assert!(caps.require(Capability::Delete).is_ok());
        assert!(matches!(
            caps.require(Capability::DeleteAll),
            Err(StorageError::Unsupported(Capability::DeleteAll))
        ));
        assert!(!Capabilities::all()
            .without(Capability::TopSeries)
            .supports(Capability::TopSeries));
    }

    #[test]
    fn test_read_lease_released_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let lease = ReadLease::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(lease);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capability_display() {
        assert_eq!(Capability::RetentionPolicy.to_string(), "retention-policy");
    }
}
