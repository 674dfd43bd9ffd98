//! Callbacks for wide and bookend queries
//!
//! Plain range queries take any `FnMut(IdPointValueTime)`. Wide queries also
//! report the values just outside the range, so they take one of the traits
//! below instead.

use crate::types::{BookendValue, IdPointValueTime};

/// Receiver of a single-point wide query
///
/// `first_value` and `last_value` are only called when such a value exists.
pub trait WideCallback {
    /// Value immediately before the range start
    fn first_value(&mut self, _value: IdPointValueTime) {}

    /// Value inside the range, ascending
    fn row(&mut self, value: IdPointValueTime);

    /// Value at or after the range end
    fn last_value(&mut self, _value: IdPointValueTime) {}
}

/// Receiver of a multi-point bookend query
///
/// Both boundaries are always reported for every point, at exactly the
/// range start and end. `bookend` is true when the entry was synthesized
/// rather than stored at that timestamp.
pub trait BookendCallback {
    /// Entry at the range start
    fn first_value(&mut self, value: BookendValue, bookend: bool);

    /// Value inside the range, ascending
    fn row(&mut self, value: IdPointValueTime);

    /// Entry at the range end
    fn last_value(&mut self, value: BookendValue, bookend: bool);
}

/// Collects the output of a wide query
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WideCollector {
    /// Value before the range, if any
    pub first: Option<IdPointValueTime>,
    /// Values inside the range
    pub rows: Vec<IdPointValueTime>,
    /// Value at or after the range end, if any
    pub last: Option<IdPointValueTime>,
}

impl WideCallback for WideCollector {
    fn first_value(&mut self, value: IdPointValueTime) {
        self.first = Some(value);
    }

    fn row(&mut self, value: IdPointValueTime) {
        self.rows.push(value);
    }

    fn last_value(&mut self, value: IdPointValueTime) {
        self.last = Some(value);
    }
}

/// One reported entry of a bookend query
#[derive(Debug, Clone, PartialEq)]
pub enum BookendEvent {
    /// Range start entry
    First {
        /// Entry value
        value: BookendValue,
        /// Synthesized
        bookend: bool,
    },
    /// Range body value
    Row(IdPointValueTime),
    /// Range end entry
    Last {
        /// Entry value
        value: BookendValue,
        /// Synthesized
        bookend: bool,
    },
}

/// Collects the output of a bookend query in call order
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BookendCollector {
    /// Entries in the order they were reported
    pub events: Vec<BookendEvent>,
}

impl BookendCollector {
    /// Body rows only
    pub fn rows(&self) -> Vec<&IdPointValueTime> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BookendEvent::Row(v) => Some(v),
                _ => None,
            })
            .collect()
    }
}

impl BookendCallback for BookendCollector {
    fn first_value(&mut self, value: BookendValue, bookend: bool) {
        self.events.push(BookendEvent::First { value, bookend });
    }

    fn row(&mut self, value: IdPointValueTime) {
        self.events.push(BookendEvent::Row(value));
    }

    fn last_value(&mut self, value: BookendValue, bookend: bool) {
        self.events.push(BookendEvent::Last { value, bookend });
    }
}
