//! Queue capacity and overflow handling
//!
//! The write queue holds at most `queue_capacity` values, counted with a
//! semaphore. A permit is taken when a value is enqueued and released only
//! after the batch containing it has been written, so the capacity bounds
//! queued plus in-flight values.

use crate::error::IngestionError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// What to do with a write when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Park the producer until space is available
    #[default]
    Block,
    /// Fail the write with a backpressure error
    Reject,
    /// Discard the incoming value and count it as dropped
    DropNewest,
}

/// Outcome of asking the queue for room
#[derive(Debug)]
pub enum Admission {
    /// Room was reserved; hold the permit until the value is written
    Admitted(OwnedSemaphorePermit),
    /// The value must be discarded
    Dropped,
}

/// Capacity accounting for the write queue
#[derive(Debug)]
pub struct QueueCapacity {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl QueueCapacity {
    /// Create a queue admitting at most `capacity` values
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
        }
    }

    /// Reserve room for one value according to the overflow policy
    pub async fn admit(&self) -> Result<Admission, IngestionError> {
        match self.policy {
            OverflowPolicy::Block => self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map(Admission::Admitted)
                .map_err(|_| IngestionError::ChannelClosed("write queue is shut down".to_string())),
            OverflowPolicy::Reject | OverflowPolicy::DropNewest => {
                match self.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => Ok(Admission::Admitted(permit)),
                    Err(TryAcquireError::NoPermits)
                        if self.policy == OverflowPolicy::DropNewest =>
                    {
                        Ok(Admission::Dropped)
                    }
                    Err(TryAcquireError::NoPermits) => Err(IngestionError::Backpressure(format!(
                        "write queue is full ({} values)",
                        self.capacity
                    ))),
                    Err(TryAcquireError::Closed) => Err(IngestionError::ChannelClosed(
                        "write queue is shut down".to_string(),
                    )),
                }
            }
        }
    }

    /// Refuse all further admissions, waking blocked producers
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Values currently holding room
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}
