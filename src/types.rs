//! Core data types used throughout the point-value store
//!
//! # Key Types
//!
//! - **`SeriesId`**: stable surrogate key for one point's value history
//! - **`PointRef`**: a data point as resolved by the caller (point id + series id)
//! - **`DataValue`**: the tagged payload of a sample
//! - **`PointValueTime`** / **`IdPointValueTime`**: a sample without / with its series id
//! - **`TimeOrder`**: ascending or descending timestamp order
//! - **`TimeRange`**: half-open query window `[from, to)` with optional bounds
//!
//! # Example
//!
//! ```rust
//! use kuba_pointvalues::types::{DataValue, PointValueTime, TimeRange};
//!
//! let value = PointValueTime::new(1_700_000_000_000, DataValue::Numeric(42.5));
//! assert_eq!(value.value.as_f64(), Some(42.5));
//!
//! let range = TimeRange::new(Some(1000), Some(2000)).unwrap();
//! assert!(range.contains(1000));
//! assert!(!range.contains(2000));
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::fmt;

/// Surrogate key of a value history
///
/// Independent of the point's configuration identity, so a point can be
/// re-configured (or re-created) without moving its history.
pub type SeriesId = u64;

/// Identifier of a data point configuration
pub type PointId = u32;

/// A data point as seen by this layer
///
/// Resolution of point configuration (and permission checks) belongs to the
/// caller; the store only needs the series the point writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointRef {
    /// Point configuration id
    pub point_id: PointId,
    /// Series holding the point's values
    pub series_id: SeriesId,
}

impl PointRef {
    /// Create a new point reference
    pub fn new(point_id: PointId, series_id: SeriesId) -> Self {
        Self {
            point_id,
            series_id,
        }
    }
}

/// Reference to a stored binary payload (e.g. an image file)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Identifier of the stored blob
    pub id: u64,
    /// File extension describing the payload format
    pub extension: String,
}

/// Payload of a single sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum DataValue {
    /// Floating point measurement
    Numeric(f64),
    /// Discrete integer state
    Multistate(i32),
    /// Boolean state
    Binary(bool),
    /// Free text
    Alphanumeric(String),
    /// Reference to a binary payload
    Image(ImageRef),
}

impl DataValue {
    /// Short name of the payload kind
    pub fn kind(&self) -> &'static str {
        match self {
            DataValue::Numeric(_) => "numeric",
            DataValue::Multistate(_) => "multistate",
            DataValue::Binary(_) => "binary",
            DataValue::Alphanumeric(_) => "alphanumeric",
            DataValue::Image(_) => "image",
        }
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Numeric(v) => Some(*v),
            DataValue::Multistate(v) => Some(*v as f64),
            DataValue::Binary(v) => Some(if *v { 1.0 } else { 0.0 }),
            DataValue::Alphanumeric(_) | DataValue::Image(_) => None,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Numeric(v) => write!(f, "{}", v),
            DataValue::Multistate(v) => write!(f, "{}", v),
            DataValue::Binary(v) => write!(f, "{}", v),
            DataValue::Alphanumeric(v) => write!(f, "{}", v),
            DataValue::Image(r) => write!(f, "image:{}.{}", r.id, r.extension),
        }
    }
}

/// A sample of one point: timestamp, value and optional annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointValueTime {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Sample payload
    pub value: DataValue,
    /// Optional annotation (e.g. who set the value)
    pub annotation: Option<String>,
}

impl PointValueTime {
    /// Create a new, unannotated sample
    pub fn new(timestamp: i64, value: DataValue) -> Self {
        Self {
            timestamp,
            value,
            annotation: None,
        }
    }

    /// Shorthand for a numeric sample
    pub fn numeric(timestamp: i64, value: f64) -> Self {
        Self::new(timestamp, DataValue::Numeric(value))
    }

    /// Attach an annotation
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    /// Tag the sample with the series it belongs to
    pub fn with_series(self, series_id: SeriesId) -> IdPointValueTime {
        IdPointValueTime {
            series_id,
            timestamp: self.timestamp,
            value: self.value,
            annotation: self.annotation,
        }
    }
}

/// A sample tagged with its series id, as returned by multi-series reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdPointValueTime {
    /// Series the sample belongs to
    pub series_id: SeriesId,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Sample payload
    pub value: DataValue,
    /// Optional annotation
    pub annotation: Option<String>,
}

impl IdPointValueTime {
    /// Create a new, unannotated sample
    pub fn new(series_id: SeriesId, timestamp: i64, value: DataValue) -> Self {
        Self {
            series_id,
            timestamp,
            value,
            annotation: None,
        }
    }

    /// Drop the series id
    pub fn into_point_value(self) -> PointValueTime {
        PointValueTime {
            timestamp: self.timestamp,
            value: self.value,
            annotation: self.annotation,
        }
    }
}

impl From<IdPointValueTime> for PointValueTime {
    fn from(v: IdPointValueTime) -> Self {
        v.into_point_value()
    }
}

/// Boundary entry of a bookend query
///
/// `value` is `None` when the point had no value at or before the boundary,
/// in which case the entry was synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookendValue {
    /// Series the entry belongs to
    pub series_id: SeriesId,
    /// Boundary timestamp
    pub timestamp: i64,
    /// Value in effect at the boundary, if any
    pub value: Option<DataValue>,
    /// Annotation of the value in effect, if any
    pub annotation: Option<String>,
}

impl BookendValue {
    /// Entry for a series with no value in effect
    pub fn empty(series_id: SeriesId, timestamp: i64) -> Self {
        Self {
            series_id,
            timestamp,
            value: None,
            annotation: None,
        }
    }

    /// Move the entry to a new timestamp, keeping the value
    pub fn with_time(&self, timestamp: i64) -> Self {
        Self {
            series_id: self.series_id,
            timestamp,
            value: self.value.clone(),
            annotation: self.annotation.clone(),
        }
    }
}

impl From<IdPointValueTime> for BookendValue {
    fn from(v: IdPointValueTime) -> Self {
        Self {
            series_id: v.series_id,
            timestamp: v.timestamp,
            value: Some(v.value),
            annotation: v.annotation,
        }
    }
}

/// Timestamp order of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeOrder {
    /// Oldest values first
    Ascending,
    /// Newest values first
    Descending,
}

impl TimeOrder {
    /// Compare two timestamps in this order
    #[inline]
    pub fn compare_times(self, a: i64, b: i64) -> Ordering {
        match self {
            TimeOrder::Ascending => a.cmp(&b),
            TimeOrder::Descending => b.cmp(&a),
        }
    }

    /// Sort key used when merging series: time in this order, then
    /// ascending series id
    pub fn merge_key(self) -> impl Fn(&IdPointValueTime) -> MergeKey + Copy {
        move |v| match self {
            TimeOrder::Ascending => MergeKey::Ascending(v.timestamp, v.series_id),
            TimeOrder::Descending => MergeKey::Descending(Reverse(v.timestamp), v.series_id),
        }
    }
}

/// Position of a value in a combined query
///
/// Keys of one query share a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MergeKey {
    /// Oldest first, then series id
    Ascending(i64, SeriesId),
    /// Newest first, then series id
    Descending(Reverse<i64>, SeriesId),
}

/// Half-open time window `[from, to)`
///
/// `from = None` is the unbounded past, `to = None` the unbounded future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive lower bound (epoch ms)
    pub from: Option<i64>,
    /// Exclusive upper bound (epoch ms)
    pub to: Option<i64>,
}

impl TimeRange {
    /// Create a validated range
    ///
    /// Fails with [`Error::InvalidArgument`] when `to < from`.
    pub fn new(from: Option<i64>, to: Option<i64>) -> Result<Self> {
        if let (Some(f), Some(t)) = (from, to) {
            if t < f {
                return Err(Error::invalid(format!(
                    "to time {} must be greater than or equal to from time {}",
                    t, f
                )));
            }
        }
        Ok(Self { from, to })
    }

    /// The unbounded range
    pub fn all() -> Self {
        Self::default()
    }

    /// Range covering exactly one millisecond
    pub fn at(timestamp: i64) -> Self {
        Self {
            from: Some(timestamp),
            to: timestamp.checked_add(1),
        }
    }

    /// Whether a timestamp falls inside the range
    #[inline]
    pub fn contains(&self, timestamp: i64) -> bool {
        self.from.map_or(true, |f| timestamp >= f) && self.to.map_or(true, |t| timestamp < t)
    }

    /// Whether the range can contain no timestamp at all
    pub fn is_empty(&self) -> bool {
        matches!((self.from, self.to), (Some(f), Some(t)) if f >= t)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.from {
            Some(from) => write!(f, "[{}, ", from)?,
            None => write!(f, "[-inf, ")?,
        }
        match self.to {
            Some(to) => write!(f, "{})", to),
            None => write!(f, "+inf)"),
        }
    }
}

/// First and last timestamp across a set of points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAndEndTime {
    /// Earliest stored timestamp
    pub start_time: i64,
    /// Latest stored timestamp
    pub end_time: i64,
}

/// Number of stored values of one series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesCount {
    /// Series id
    pub series_id: SeriesId,
    /// Stored value count
    pub count: u64,
}

/// Current wall clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_half_open() {
        let range = TimeRange::new(Some(100), Some(200)).unwrap();
        assert!(!range.contains(99));
        assert!(range.contains(100));
        assert!(range.contains(199));
        assert!(!range.contains(200));
    }

    #[test]
    fn test_time_range_unbounded() {
        let range = TimeRange::all();
        assert!(range.contains(i64::MIN));
        assert!(range.contains(i64::MAX));

        let past = TimeRange::new(None, Some(0)).unwrap();
        assert!(past.contains(-1));
        assert!(!past.contains(0));
    }

    #[test]
    fn test_time_range_rejects_inverted_bounds() {
        let err = TimeRange::new(Some(200), Some(100)).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(TimeRange::new(Some(100), Some(100)).unwrap().is_empty());
    }

    #[test]
    fn test_time_range_at() {
        let range = TimeRange::at(500);
        assert!(range.contains(500));
        assert!(!range.contains(501));
        assert!(TimeRange::at(i64::MAX).contains(i64::MAX));
    }

    #[test]
    fn test_merge_key_breaks_ties_by_series() {
        let a = IdPointValueTime::new(2, 100, DataValue::Numeric(1.0));
        let b = IdPointValueTime::new(1, 100, DataValue::Numeric(2.0));
        let c = IdPointValueTime::new(1, 200, DataValue::Numeric(3.0));

        let asc = TimeOrder::Ascending.merge_key();
        assert!(asc(&b) < asc(&a));
        assert!(asc(&a) < asc(&c));

        let desc = TimeOrder::Descending.merge_key();
        assert!(desc(&c) < desc(&a));
        // ties still break by ascending series id
        assert!(desc(&b) < desc(&a));
    }

    #[test]
    fn test_data_value_views() {
        assert_eq!(DataValue::Binary(true).as_f64(), Some(1.0));
        assert_eq!(DataValue::Multistate(3).as_f64(), Some(3.0));
        assert_eq!(DataValue::Alphanumeric("x".into()).as_f64(), None);
        assert_eq!(DataValue::Numeric(1.5).kind(), "numeric");
    }

    #[test]
    fn test_bookend_from_value() {
        let v = IdPointValueTime::new(7, 100, DataValue::Numeric(1.0));
        let b = BookendValue::from(v).with_time(150);
        assert_eq!(b.series_id, 7);
        assert_eq!(b.timestamp, 150);
        assert_eq!(b.value, Some(DataValue::Numeric(1.0)));
    }
}
