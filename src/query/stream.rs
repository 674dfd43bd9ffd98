//! Lazily fetched, closeable value streams
//!
//! A [`PointValueStream`] owns the [`ReadLease`] the backend handed out for
//! it. The lease is released when the stream is exhausted, fails, is closed
//! or is dropped, whichever comes first, so an abandoned stream cannot leak
//! the backend resource.

pub use crate::engine::traits::ReadLease;
use crate::error::Result;
use crate::types::IdPointValueTime;
use std::fmt;

type BoxedValues = Box<dyn Iterator<Item = Result<IdPointValueTime>> + Send>;

/// Lazy sequence of values backed by a live backend lease
pub struct PointValueStream {
    values: Option<BoxedValues>,
    lease: Option<ReadLease>,
    remaining: Option<usize>,
}

impl PointValueStream {
    /// Wrap `values`, holding `lease` until the stream ends
    ///
    /// At most `limit` values are yielded when a limit is given.
    pub fn new(
        values: impl Iterator<Item = Result<IdPointValueTime>> + Send + 'static,
        lease: ReadLease,
        limit: Option<usize>,
    ) -> Self {
        Self {
            values: Some(Box::new(values)),
            lease: Some(lease),
            remaining: limit,
        }
    }

    /// A stream yielding nothing
    pub fn empty() -> Self {
        Self {
            values: None,
            lease: None,
            remaining: Some(0),
        }
    }

    /// Release the backend lease and stop yielding values
    pub fn close(&mut self) {
        self.values = None;
        self.lease = None;
    }

    /// Whether the stream has ended
    pub fn is_closed(&self) -> bool {
        self.values.is_none()
    }
}

impl Iterator for PointValueStream {
    type Item = Result<IdPointValueTime>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            self.close();
            return None;
        }
        let item = self.values.as_mut()?.next();
        match &item {
            Some(Ok(_)) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
            }
            Some(Err(_)) | None => self.close(),
        }
        item
    }
}

impl fmt::Debug for PointValueStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointValueStream")
            .field("closed", &self.is_closed())
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// Run `f` over `stream`, closing it afterwards even if `f` stops early
///
/// ```rust
/// use kuba_pointvalues::query::stream::{with_stream, PointValueStream};
///
/// let count = with_stream(PointValueStream::empty(), |s| s.count());
/// assert_eq!(count, 0);
/// ```
pub fn with_stream<R>(
    mut stream: PointValueStream,
    f: impl FnOnce(&mut PointValueStream) -> R,
) -> R {
    let result = f(&mut stream);
    stream.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, StorageError};
    use crate::types::DataValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted_lease(counter: &Arc<AtomicUsize>) -> ReadLease {
        counter.fetch_add(1, Ordering::SeqCst);
        let counter = counter.clone();
        ReadLease::new(move || {
            counter.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn values(n: i64) -> impl Iterator<Item = Result<IdPointValueTime>> + Send {
        (0..n).map(|t| Ok(IdPointValueTime::new(1, t, DataValue::Numeric(0.0))))
    }

    #[test]
    fn test_lease_released_on_exhaustion() {
        let open = Arc::new(AtomicUsize::new(0));
        let mut stream = PointValueStream::new(values(3), counted_lease(&open), None);
        assert_eq!(stream.by_ref().count(), 3);
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(stream.is_closed());
    }

    #[test]
    fn test_lease_released_on_early_drop() {
        let open = Arc::new(AtomicUsize::new(0));
        let mut stream = PointValueStream::new(values(100), counted_lease(&open), None);
        assert!(stream.next().is_some());
        assert_eq!(open.load(Ordering::SeqCst), 1);
        drop(stream);
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lease_released_on_error() {
        let open = Arc::new(AtomicUsize::new(0));
        let failing = std::iter::once(Err(Error::from(StorageError::Backend("gone".into()))));
        let mut stream = PointValueStream::new(failing, counted_lease(&open), None);
        assert!(stream.next().unwrap().is_err());
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_limit_and_scoped_close() {
        let open = Arc::new(AtomicUsize::new(0));
        let stream = PointValueStream::new(values(10), counted_lease(&open), Some(4));
        let taken = with_stream(stream, |s| s.take(2).count());
        assert_eq!(taken, 2);
        assert_eq!(open.load(Ordering::SeqCst), 0);

        let stream = PointValueStream::new(values(10), counted_lease(&open), Some(4));
        assert_eq!(with_stream(stream, |s| s.count()), 4);
    }
}
