//! Storage backends and the database handle
//!
//! - **traits**: the [`PointValueStore`] backend contract and capabilities
//! - **memory**: [`MemoryStore`], an in-process backend
//! - **db**: [`PointValueDb`], the handle queries and writes go through

pub mod db;
pub mod memory;
pub mod traits;

pub use db::{PointValueDb, PointValueDbBuilder};
pub use memory::MemoryStore;
pub use traits::{
    BatchEntry, Capabilities, Capability, PointValueStore, ReadLease, ScanRequest,
    DEFAULT_CHUNK_SIZE,
};
