//! Read pipeline
//!
//! ```text
//! PointValueDb query
//!      │
//!      ▼
//! ┌─────────────────────┐
//! │ SeriesValueIterator │  one per series, fetches `chunk_size` values per scan
//! └─────────────────────┘
//!      │
//!      ▼
//! ┌─────────────────────┐
//! │  MergingIterator    │  combined queries: time, then series id
//! └─────────────────────┘
//!      │
//!      ▼
//!  callback / PointValueStream
//! ```
//!
//! The query operations themselves are methods on
//! [`PointValueDb`](crate::engine::PointValueDb), defined in `facade`.

pub mod callback;
mod facade;
pub mod iterator;
pub mod merge;
pub mod stream;

pub use callback::{BookendCallback, BookendCollector, BookendEvent, WideCallback, WideCollector};
pub use iterator::SeriesValueIterator;
pub use merge::MergingIterator;
pub use stream::{with_stream, PointValueStream};
