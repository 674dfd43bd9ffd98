//! Asynchronous write path
//!
//! # Architecture
//!
//! ```text
//! enqueue → [QueueCapacity] → shard (series % workers) → [worker] → insert_batch
//!                ↓                                          ↓
//!          [OverflowPolicy]                           [WriteMetrics]
//! ```
//!
//! Values of one series always land on the same worker, so they reach the
//! backend in the order they were enqueued.
//!
//! # Example
//!
//! ```rust,no_run
//! use kuba_pointvalues::engine::{MemoryStore, PointValueDb};
//! use kuba_pointvalues::ingestion::WriterConfig;
//! use kuba_pointvalues::types::{PointRef, PointValueTime};
//!
//! # async fn example() -> kuba_pointvalues::Result<()> {
//! let db = PointValueDb::builder()
//!     .with_store(MemoryStore::new())
//!     .with_async_writes(WriterConfig::default())
//!     .build()?;
//!
//! let point = PointRef::new(1, 1);
//! db.save_async(&point, PointValueTime::numeric(1_700_000_000_000, 42.5)).await?;
//! db.flush().await;
//! db.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod metrics;
pub mod writer;

pub use backpressure::{Admission, OverflowPolicy, QueueCapacity};
pub use metrics::{RateMeter, WriteMetrics, WriteMetricsSnapshot};
pub use writer::{BatchWriterPool, WriterConfig};
