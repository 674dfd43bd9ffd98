//! K-way merge of ordered sources
//!
//! Combines N individually ordered iterators into one ordered iterator. The
//! current head of every source sits in a `BinaryHeap` keyed by a sort key,
//! so each step costs O(log N) comparisons no matter how many series take
//! part. Sources are pulled lazily: nothing is read until the first `next`,
//! and each source is advanced only after its head is emitted.

use crate::error::{Error, Result};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Head of one source, ordered by key then source position
struct HeapEntry<K, T> {
    key: K,
    source: usize,
    value: T,
}

impl<K: Ord, T> Ord for HeapEntry<K, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl<K: Ord, T> PartialOrd for HeapEntry<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> PartialEq for HeapEntry<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, T> Eq for HeapEntry<K, T> {}

/// Ordered merge of fallible sources
///
/// Values come out in ascending `key` order. Equal keys are broken by source
/// position. A source error is yielded in order and ends the merge.
pub struct MergingIterator<I, T, K, F>
where
    I: Iterator<Item = Result<T>>,
    K: Ord,
    F: Fn(&T) -> K,
{
    sources: Vec<I>,
    heap: BinaryHeap<Reverse<HeapEntry<K, T>>>,
    key: F,
    primed: bool,
    pending_error: Option<Error>,
    done: bool,
}

impl<I, T, K, F> MergingIterator<I, T, K, F>
where
    I: Iterator<Item = Result<T>>,
    K: Ord,
    F: Fn(&T) -> K,
{
    /// Merge `sources` ordered by `key`
    pub fn new(sources: Vec<I>, key: F) -> Self {
        let n = sources.len();
        Self {
            sources,
            heap: BinaryHeap::with_capacity(n),
            key,
            primed: false,
            pending_error: None,
            done: false,
        }
    }

    fn push(&mut self, source: usize, value: T) {
        let key = (self.key)(&value);
        self.heap.push(Reverse(HeapEntry { key, source, value }));
    }

    fn prime(&mut self) -> Result<()> {
        self.primed = true;
        for source in 0..self.sources.len() {
            match self.sources[source].next() {
                Some(Ok(value)) => self.push(source, value),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }
        Ok(())
    }
}

impl<I, T, K, F> Iterator for MergingIterator<I, T, K, F>
where
    I: Iterator<Item = Result<T>>,
    K: Ord,
    F: Fn(&T) -> K,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.done = true;
            return Some(Err(e));
        }
        if !self.primed {
            if let Err(e) = self.prime() {
                self.done = true;
                return Some(Err(e));
            }
        }

        let Some(Reverse(top)) = self.heap.pop() else {
            self.done = true;
            return None;
        };

        match self.sources[top.source].next() {
            Some(Ok(next)) => self.push(top.source, next),
            // `top` is still the smallest head, emit it before the error
            Some(Err(e)) => self.pending_error = Some(e),
            None => {}
        }
        Some(Ok(top.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::types::{DataValue, IdPointValueTime, TimeOrder};

    fn source(series: u64, times: &[i64]) -> std::vec::IntoIter<Result<IdPointValueTime>> {
        times
            .iter()
            .map(|t| Ok(IdPointValueTime::new(series, *t, DataValue::Numeric(*t as f64))))
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn keys(merged: impl Iterator<Item = Result<IdPointValueTime>>) -> Vec<(u64, i64)> {
        merged
            .map(|v| v.map(|v| (v.series_id, v.timestamp)).unwrap())
            .collect()
    }

    #[test]
    fn test_merge_ascending_with_series_tie_break() {
        let merged = MergingIterator::new(
            vec![source(2, &[1, 5, 9]), source(1, &[1, 4]), source(3, &[])],
            TimeOrder::Ascending.merge_key(),
        );
        assert_eq!(keys(merged), vec![(1, 1), (2, 1), (1, 4), (2, 5), (2, 9)]);
    }

    #[test]
    fn test_merge_descending() {
        let merged = MergingIterator::new(
            vec![source(1, &[9, 3]), source(2, &[7, 3, 1])],
            TimeOrder::Descending.merge_key(),
        );
        assert_eq!(keys(merged), vec![(1, 9), (2, 7), (1, 3), (2, 3), (2, 1)]);
    }

    #[test]
    fn test_merge_no_sources() {
        let mut merged = MergingIterator::new(
            Vec::<std::vec::IntoIter<Result<IdPointValueTime>>>::new(),
            TimeOrder::Ascending.merge_key(),
        );
        assert!(merged.next().is_none());
    }

    #[test]
    fn test_merge_is_lazy() {
        let pulled = std::cell::Cell::new(0);
        let counting = (0..1000).map(|t| {
            pulled.set(pulled.get() + 1);
            Ok::<_, Error>(t)
        });
        let mut merged = MergingIterator::new(vec![counting], |v: &i64| *v);
        assert_eq!(merged.next().unwrap().unwrap(), 0);
        assert_eq!(pulled.get(), 2);
    }

    #[test]
    fn test_source_error_yielded_after_smaller_heads() {
        let failing: Vec<Result<IdPointValueTime>> = vec![
            Ok(IdPointValueTime::new(1, 1, DataValue::Numeric(0.0))),
            Err(StorageError::Backend("boom".to_string()).into()),
        ];
        let mut merged = MergingIterator::new(
            vec![failing.into_iter(), source(2, &[2, 3])],
            TimeOrder::Ascending.merge_key(),
        );
        assert_eq!(merged.next().unwrap().unwrap().timestamp, 1);
        assert!(merged.next().unwrap().is_err());
        assert!(merged.next().is_none());
    }
}
