//! Chunked single-series iterator
//!
//! Pulls one series from a [`PointValueStore`] in bounded chunks. Each refill
//! is one backend `scan` of at most `chunk_size` values; the scan window is
//! then moved past the last value returned so no timestamp is fetched twice.
//! The series is exhausted only once a fetch comes back empty: a short chunk
//! does not prove there is nothing left for every backend.

use crate::engine::traits::{PointValueStore, ScanRequest};
use crate::error::{Error, Result};
use crate::types::{IdPointValueTime, SeriesId, TimeOrder, TimeRange};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Lazy iterator over one series' values in a time range
///
/// Yields `Err` once if the backend fails, then ends.
pub struct SeriesValueIterator {
    store: Arc<dyn PointValueStore>,
    series_id: SeriesId,
    from: Option<i64>,
    to: Option<i64>,
    chunk_size: usize,
    order: TimeOrder,
    buffer: VecDeque<IdPointValueTime>,
    exhausted: bool,
    fetches: u64,
}

impl SeriesValueIterator {
    /// Create an iterator over `series_id` in `range`
    ///
    /// Nothing is fetched until the first `peek` or `next`.
    pub fn new(
        store: Arc<dyn PointValueStore>,
        series_id: SeriesId,
        range: TimeRange,
        chunk_size: usize,
        order: TimeOrder,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::invalid("chunk size must be greater than zero"));
        }
        let range = TimeRange::new(range.from, range.to)?;

        Ok(Self {
            store,
            series_id,
            from: range.from,
            to: range.to,
            chunk_size,
            order,
            buffer: VecDeque::with_capacity(chunk_size.min(1024)),
            exhausted: false,
            fetches: 0,
        })
    }

    /// Series this iterator reads
    pub fn series_id(&self) -> SeriesId {
        self.series_id
    }

    /// Number of backend fetches issued so far
    pub fn fetches(&self) -> u64 {
        self.fetches
    }

    /// Look at the next value without consuming it
    pub fn peek(&mut self) -> Result<Option<&IdPointValueTime>> {
        self.fill()?;
        Ok(self.buffer.front())
    }

    fn fill(&mut self) -> Result<()> {
        if !self.buffer.is_empty() || self.exhausted {
            return Ok(());
        }

        let request = ScanRequest::single(
            self.series_id,
            TimeRange {
                from: self.from,
                to: self.to,
            },
            Some(self.chunk_size),
            self.order,
        );

        let buffer = &mut self.buffer;
        let scanned = self.store.scan(&request, &mut |value| buffer.push_back(value));
        self.fetches += 1;
        if let Err(e) = scanned {
            self.buffer.clear();
            self.exhausted = true;
            return Err(e.into());
        }

        debug!(
            series_id = self.series_id,
            fetched = self.buffer.len(),
            chunk_size = self.chunk_size,
            "fetched chunk"
        );

        match self.buffer.back().map(|v| v.timestamp) {
            None => self.exhausted = true,
            Some(last) => match self.order {
                TimeOrder::Ascending => match last.checked_add(1) {
                    Some(next) => self.from = Some(next),
                    None => self.exhausted = true,
                },
                // `to` is exclusive, so the next chunk ends just before `last`
                TimeOrder::Descending => self.to = Some(last),
            },
        }
        Ok(())
    }
}

impl Iterator for SeriesValueIterator {
    type Item = Result<IdPointValueTime>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryStore, PointValueStore};
    use crate::types::PointValueTime;

    fn store_with(values: &[(SeriesId, i64)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (series, ts) in values {
            store
                .insert(*series, PointValueTime::numeric(*ts, *ts as f64))
                .unwrap();
        }
        store
    }

    fn timestamps(iter: SeriesValueIterator) -> Vec<i64> {
        iter.map(|v| v.unwrap().timestamp).collect()
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let store = store_with(&[]);
        let err = SeriesValueIterator::new(store, 1, TimeRange::all(), 0, TimeOrder::Ascending)
            .err()
            .unwrap();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_fetch_count_by_chunk_size() {
        let store = store_with(&[(1, 10), (1, 20), (1, 30)]);

        let mut small =
            SeriesValueIterator::new(store.clone(), 1, TimeRange::all(), 1, TimeOrder::Ascending)
                .unwrap();
        let small_values: Vec<i64> = small.by_ref().map(|v| v.unwrap().timestamp).collect();
        // three non-empty chunks, then the empty one that ends the series
        assert_eq!(small.fetches(), 4);

        let before = store.scan_calls();
        let large_values = timestamps(
            SeriesValueIterator::new(store.clone(), 1, TimeRange::all(), 100, TimeOrder::Ascending)
                .unwrap(),
        );
        assert_eq!(small_values, vec![10, 20, 30]);
        assert_eq!(small_values, large_values);
        assert_eq!(store.scan_calls() - before, 2);
    }

    #[test]
    fn test_descending_advances_exclusive_bound() {
        let store = store_with(&[(1, 10), (1, 11), (1, 12), (1, 13)]);
        let iter =
            SeriesValueIterator::new(store, 1, TimeRange::all(), 2, TimeOrder::Descending).unwrap();
        assert_eq!(timestamps(iter), vec![13, 12, 11, 10]);
    }

    #[test]
    fn test_range_bounds_respected() {
        let store = store_with(&[(1, 5), (1, 10), (1, 15), (1, 20), (2, 12)]);
        let range = TimeRange::new(Some(10), Some(20)).unwrap();
        let iter = SeriesValueIterator::new(store, 1, range, 1, TimeOrder::Ascending).unwrap();
        assert_eq!(timestamps(iter), vec![10, 15]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let store = store_with(&[(1, 1), (1, 2)]);
        let mut iter =
            SeriesValueIterator::new(store, 1, TimeRange::all(), 1, TimeOrder::Ascending).unwrap();
        assert_eq!(iter.peek().unwrap().map(|v| v.timestamp), Some(1));
        assert_eq!(iter.peek().unwrap().map(|v| v.timestamp), Some(1));
        assert_eq!(iter.next().unwrap().unwrap().timestamp, 1);
        assert_eq!(iter.peek().unwrap().map(|v| v.timestamp), Some(2));
    }

    #[test]
    fn test_backend_error_fuses() {
        let store = store_with(&[(1, 1)]);
        store.fail_next_scans(1);
        let mut iter =
            SeriesValueIterator::new(store, 1, TimeRange::all(), 10, TimeOrder::Ascending).unwrap();
        assert!(matches!(iter.next(), Some(Err(Error::Storage(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_max_timestamp_terminates() {
        let store = store_with(&[(1, i64::MAX)]);
        let iter =
            SeriesValueIterator::new(store, 1, TimeRange::all(), 1, TimeOrder::Ascending).unwrap();
        assert_eq!(timestamps(iter), vec![i64::MAX]);
    }
}
