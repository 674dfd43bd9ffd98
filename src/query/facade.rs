//! Read queries over a [`PointValueDb`]
//!
//! Every query shape is assembled from the same two parts: one
//! [`SeriesValueIterator`] per series and, for combined multi-series reads, a
//! [`MergingIterator`] ordering them by time then series id. Arguments are
//! validated before any backend call.
//!
//! Multi-point queries visit series in ascending series id order, each
//! series once, whatever order the points were passed in.

use super::callback::{BookendCallback, WideCallback};
use super::iterator::SeriesValueIterator;
use super::merge::MergingIterator;
use super::stream::PointValueStream;
use crate::engine::PointValueDb;
use crate::error::{Error, Result};
use crate::types::{
    BookendValue, IdPointValueTime, PointRef, PointValueTime, SeriesId, StartAndEndTime,
    TimeOrder, TimeRange,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Validate an optional limit, converting it to a count
fn check_limit(limit: Option<i64>) -> Result<Option<usize>> {
    match limit {
        None => Ok(None),
        Some(l) if l < 0 => Err(Error::invalid(format!("limit {} must not be negative", l))),
        Some(l) => Ok(Some(usize::try_from(l).unwrap_or(usize::MAX))),
    }
}

/// Distinct series of `points`, ascending
fn series_of(points: &[PointRef]) -> Vec<SeriesId> {
    let mut series: Vec<SeriesId> = points.iter().map(|p| p.series_id).collect();
    series.sort_unstable();
    series.dedup();
    series
}

impl PointValueDb {
    fn series_iter(
        &self,
        series_id: SeriesId,
        range: TimeRange,
        chunk_size: usize,
        order: TimeOrder,
    ) -> Result<SeriesValueIterator> {
        SeriesValueIterator::new(self.store.clone(), series_id, range, chunk_size, order)
    }

    /// Chunk size for a read that stops after `limit` values
    fn limited_chunk(&self, limit: Option<usize>) -> usize {
        match limit {
            Some(l) => l.clamp(1, self.chunk_size),
            None => self.chunk_size,
        }
    }

    /// Per-point chunk size of a combined query over `points` series
    ///
    /// A global limit spread over many points rarely needs a full chunk from
    /// each, so the chunk shrinks towards `limit / points`, but never below
    /// the configured minimum.
    pub fn combined_chunk_size(&self, limit: Option<usize>, points: usize) -> usize {
        match limit {
            Some(l) if points > 0 => (l / points)
                .saturating_add(1)
                .min(self.chunk_size)
                .max(self.min_combined_chunk_size),
            _ => self.chunk_size,
        }
    }

    fn drain(
        &self,
        series_id: SeriesId,
        range: TimeRange,
        limit: Option<usize>,
        order: TimeOrder,
        callback: &mut dyn FnMut(IdPointValueTime),
    ) -> Result<()> {
        if limit == Some(0) {
            return Ok(());
        }
        let iter = self.series_iter(series_id, range, self.limited_chunk(limit), order)?;
        for value in iter.take(limit.unwrap_or(usize::MAX)) {
            callback(value?);
        }
        Ok(())
    }

    fn collect_one(
        &self,
        point: &PointRef,
        range: TimeRange,
        limit: Option<usize>,
        order: TimeOrder,
    ) -> Result<Vec<PointValueTime>> {
        let mut values = Vec::new();
        self.drain(point.series_id, range, limit, order, &mut |v| {
            values.push(v.into_point_value())
        })?;
        Ok(values)
    }

    fn first_one(
        &self,
        point: &PointRef,
        range: TimeRange,
        order: TimeOrder,
    ) -> Result<Option<PointValueTime>> {
        Ok(self.collect_one(point, range, Some(1), order)?.pop())
    }

    // =========================================================================
    // Single point
    // =========================================================================

    /// Up to `limit` most recent values, newest first
    pub fn latest(&self, point: &PointRef, limit: i64) -> Result<Vec<PointValueTime>> {
        let limit = check_limit(Some(limit))?;
        self.collect_one(point, TimeRange::all(), limit, TimeOrder::Descending)
    }

    /// Up to `limit` values before `to`, newest first
    pub fn latest_before(
        &self,
        point: &PointRef,
        to: i64,
        limit: i64,
    ) -> Result<Vec<PointValueTime>> {
        let limit = check_limit(Some(limit))?;
        self.collect_one(point, TimeRange::new(None, Some(to))?, limit, TimeOrder::Descending)
    }

    /// Most recent value
    pub fn latest_value(&self, point: &PointRef) -> Result<Option<PointValueTime>> {
        self.first_one(point, TimeRange::all(), TimeOrder::Descending)
    }

    /// Last value strictly before `t`
    pub fn value_before(&self, point: &PointRef, t: i64) -> Result<Option<PointValueTime>> {
        self.first_one(point, TimeRange::new(None, Some(t))?, TimeOrder::Descending)
    }

    /// First value at or after `t`
    pub fn value_after(&self, point: &PointRef, t: i64) -> Result<Option<PointValueTime>> {
        self.first_one(point, TimeRange::new(Some(t), None)?, TimeOrder::Ascending)
    }

    /// Value stored at exactly `t`
    pub fn value_at(&self, point: &PointRef, t: i64) -> Result<Option<PointValueTime>> {
        self.first_one(point, TimeRange::at(t), TimeOrder::Ascending)
    }

    /// Values in `[from, to)`, oldest first
    pub fn range(&self, point: &PointRef, from: i64, to: i64) -> Result<Vec<PointValueTime>> {
        let range = TimeRange::new(Some(from), Some(to))?;
        self.collect_one(point, range, None, TimeOrder::Ascending)
    }

    /// Values at or after `from`, oldest first
    pub fn range_from(&self, point: &PointRef, from: i64) -> Result<Vec<PointValueTime>> {
        self.collect_one(point, TimeRange::new(Some(from), None)?, None, TimeOrder::Ascending)
    }

    /// Feed values in `[from, to)` to `callback`, oldest first
    pub fn range_with(
        &self,
        point: &PointRef,
        from: i64,
        to: i64,
        mut callback: impl FnMut(IdPointValueTime),
    ) -> Result<()> {
        let range = TimeRange::new(Some(from), Some(to))?;
        self.drain(point.series_id, range, None, TimeOrder::Ascending, &mut callback)
    }

    /// Number of values in `[from, to)`
    pub fn count(&self, point: &PointRef, from: Option<i64>, to: Option<i64>) -> Result<u64> {
        let range = TimeRange::new(from, to)?;
        let mut count = 0u64;
        self.drain(point.series_id, range, None, TimeOrder::Ascending, &mut |_| count += 1)?;
        Ok(count)
    }

    /// Timestamp of a point's oldest value
    pub fn inception_date(&self, point: &PointRef) -> Result<Option<i64>> {
        Ok(self
            .first_one(point, TimeRange::all(), TimeOrder::Ascending)?
            .map(|v| v.timestamp))
    }

    // =========================================================================
    // Multiple points
    // =========================================================================

    /// Values of each point in `[from, to)`, point by point, at most `limit`
    /// per point
    pub fn values_per_point(
        &self,
        points: &[PointRef],
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<i64>,
        order: TimeOrder,
        mut callback: impl FnMut(IdPointValueTime),
    ) -> Result<()> {
        let range = TimeRange::new(from, to)?;
        let limit = check_limit(limit)?;
        for series_id in series_of(points) {
            self.drain(series_id, range, limit, order, &mut callback)?;
        }
        Ok(())
    }

    /// Values of all points in `[from, to)` as one sequence ordered by time
    /// then series id, at most `limit` in total
    pub fn values_combined(
        &self,
        points: &[PointRef],
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<i64>,
        order: TimeOrder,
        mut callback: impl FnMut(IdPointValueTime),
    ) -> Result<()> {
        let range = TimeRange::new(from, to)?;
        let limit = check_limit(limit)?;
        let series = series_of(points);
        if series.is_empty() || limit == Some(0) {
            return Ok(());
        }

        let chunk_size = self.combined_chunk_size(limit, series.len());
        debug!(points = series.len(), chunk_size, ?limit, "combined query");
        let sources = series
            .into_iter()
            .map(|s| self.series_iter(s, range, chunk_size, order))
            .collect::<Result<Vec<_>>>()?;

        let merged = MergingIterator::new(sources, order.merge_key());
        for value in merged.take(limit.unwrap_or(usize::MAX)) {
            callback(value?);
        }
        Ok(())
    }

    /// Earliest timestamp across `points`
    pub fn first_timestamp(&self, points: &[PointRef]) -> Result<Option<i64>> {
        let mut first = None;
        self.values_combined(points, None, None, Some(1), TimeOrder::Ascending, |v| {
            first = Some(v.timestamp)
        })?;
        Ok(first)
    }

    /// Latest timestamp across `points`
    pub fn last_timestamp(&self, points: &[PointRef]) -> Result<Option<i64>> {
        let mut last = None;
        self.values_combined(points, None, None, Some(1), TimeOrder::Descending, |v| {
            last = Some(v.timestamp)
        })?;
        Ok(last)
    }

    /// Earliest and latest timestamps across `points`
    pub fn start_and_end(&self, points: &[PointRef]) -> Result<Option<StartAndEndTime>> {
        match (self.first_timestamp(points)?, self.last_timestamp(points)?) {
            (Some(start_time), Some(end_time)) => Ok(Some(StartAndEndTime {
                start_time,
                end_time,
            })),
            _ => Ok(None),
        }
    }

    /// Value in effect at `t` for every point: the last value at or before
    /// `t`, or an empty entry at `t` when there is none
    pub fn initial_values(
        &self,
        points: &[PointRef],
        t: i64,
    ) -> Result<BTreeMap<SeriesId, BookendValue>> {
        let mut values = BTreeMap::new();
        let range = TimeRange::new(None, t.checked_add(1))?;
        self.values_per_point(points, range.from, range.to, Some(1), TimeOrder::Descending, |v| {
            values.insert(v.series_id, BookendValue::from(v));
        })?;
        for point in points {
            values
                .entry(point.series_id)
                .or_insert_with(|| BookendValue::empty(point.series_id, t));
        }
        Ok(values)
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Stream one point's values in `[from, to)`
    pub fn stream_values(
        &self,
        point: &PointRef,
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<i64>,
        order: TimeOrder,
    ) -> Result<PointValueStream> {
        self.stream_per_point(std::slice::from_ref(point), from, to, limit, order)
    }

    /// Stream values point by point, at most `limit` per point
    pub fn stream_per_point(
        &self,
        points: &[PointRef],
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<i64>,
        order: TimeOrder,
    ) -> Result<PointValueStream> {
        let range = TimeRange::new(from, to)?;
        let limit = check_limit(limit)?;
        if limit == Some(0) {
            return Ok(PointValueStream::empty());
        }
        let chunk_size = self.limited_chunk(limit);
        let per_point = limit.unwrap_or(usize::MAX);
        let sources = series_of(points)
            .into_iter()
            .map(|s| self.series_iter(s, range, chunk_size, order).map(|it| it.take(per_point)))
            .collect::<Result<Vec<_>>>()?;

        let lease = self.store.open_lease()?;
        Ok(PointValueStream::new(sources.into_iter().flatten(), lease, None))
    }

    /// Stream values of all points ordered by time then series id, at most
    /// `limit` in total
    pub fn stream_combined(
        &self,
        points: &[PointRef],
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<i64>,
        order: TimeOrder,
    ) -> Result<PointValueStream> {
        let range = TimeRange::new(from, to)?;
        let limit = check_limit(limit)?;
        if limit == Some(0) {
            return Ok(PointValueStream::empty());
        }
        let chunk_size = self.limited_chunk(limit);
        // A total limit also bounds what any single point can contribute
        let per_point = limit.unwrap_or(usize::MAX);
        let sources = series_of(points)
            .into_iter()
            .map(|s| self.series_iter(s, range, chunk_size, order).map(|it| it.take(per_point)))
            .collect::<Result<Vec<_>>>()?;

        let lease = self.store.open_lease()?;
        let merged = MergingIterator::new(sources, order.merge_key());
        Ok(PointValueStream::new(merged, lease, limit))
    }

    // =========================================================================
    // Wide and bookend queries
    // =========================================================================

    /// Values in `[from, to)` plus the value just before `from` and the value
    /// at or after `to`, when those exist
    pub fn wide_query(
        &self,
        point: &PointRef,
        from: i64,
        to: i64,
        callback: &mut impl WideCallback,
    ) -> Result<()> {
        let range = TimeRange::new(Some(from), Some(to))?;
        if let Some(before) = self.value_before(point, from)? {
            callback.first_value(before.with_series(point.series_id));
        }
        self.drain(point.series_id, range, None, TimeOrder::Ascending, &mut |v| callback.row(v))?;
        if let Some(after) = self.value_after(point, to)? {
            callback.last_value(after.with_series(point.series_id));
        }
        Ok(())
    }

    /// Bookend query reported point by point
    ///
    /// For every point: an entry at exactly `from` carrying the value in
    /// effect there, up to `limit` values in `(from, to)`, and an entry at
    /// exactly `to` carrying the last value seen. The limit does not count
    /// the boundary entries.
    pub fn wide_bookend_per_point(
        &self,
        points: &[PointRef],
        from: i64,
        to: i64,
        limit: Option<i64>,
        callback: &mut impl BookendCallback,
    ) -> Result<()> {
        let range = TimeRange::new(Some(from), Some(to))?;
        let limit = check_limit(limit)?;
        if points.is_empty() {
            return Ok(());
        }

        let mut current = self.initial_values(points, from)?;
        for series_id in series_of(points) {
            let Some(first) = current.get(&series_id) else {
                continue;
            };
            let synthesized = first.value.is_none() || first.timestamp != from;
            callback.first_value(first.with_time(from), synthesized);

            self.drain(series_id, range, limit, TimeOrder::Ascending, &mut |v| {
                advance(&mut current, v, callback)
            })?;

            if let Some(last) = current.get(&series_id) {
                callback.last_value(last.with_time(to), true);
            }
        }
        Ok(())
    }

    /// Bookend query with the body merged across points
    ///
    /// All start entries first, then up to `limit` values in total ordered by
    /// time then series id, then all end entries.
    pub fn wide_bookend_combined(
        &self,
        points: &[PointRef],
        from: i64,
        to: i64,
        limit: Option<i64>,
        callback: &mut impl BookendCallback,
    ) -> Result<()> {
        TimeRange::new(Some(from), Some(to))?;
        check_limit(limit)?;
        if points.is_empty() {
            return Ok(());
        }

        let mut current = self.initial_values(points, from)?;
        for first in current.values() {
            let synthesized = first.value.is_none() || first.timestamp != from;
            callback.first_value(first.with_time(from), synthesized);
        }
        self.values_combined(points, Some(from), Some(to), limit, TimeOrder::Ascending, |v| {
            advance(&mut current, v, callback)
        })?;
        for last in current.values() {
            callback.last_value(last.with_time(to), true);
        }
        Ok(())
    }
}

/// Record `value` as its series' latest and report it, unless it is the
/// value already reported as the start entry
fn advance(
    current: &mut BTreeMap<SeriesId, BookendValue>,
    value: IdPointValueTime,
    callback: &mut impl BookendCallback,
) {
    let newer = current
        .get(&value.series_id)
        .map_or(true, |previous| value.timestamp > previous.timestamp);
    if newer {
        current.insert(value.series_id, BookendValue::from(value.clone()));
        callback.row(value);
    }
}
