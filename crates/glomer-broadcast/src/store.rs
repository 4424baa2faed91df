//! Deduplicating store of accepted broadcast values.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::protocol::Value;

/// Set of every value this node has accepted.
///
/// The only mutation is [`MessageStore::insert`], which checks membership and
/// records the value under a single lock acquisition. Two concurrent inserts
/// of the same value therefore cannot both report it as new, which is what
/// limits propagation to one wave per value.
#[derive(Debug, Default)]
pub struct MessageStore {
    values: Mutex<HashSet<Value>>,
}

impl MessageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a value, returning true if it was not present before.
    ///
    /// Returns true exactly once per distinct value for the lifetime of the store.
    pub fn insert(&self, value: Value) -> bool {
        self.values.lock().insert(value)
    }

    /// Returns a point-in-time copy of every stored value, unordered.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Value> {
        self.values.lock().iter().copied().collect()
    }

    /// Returns true if the value has been accepted.
    #[must_use]
    pub fn contains(&self, value: Value) -> bool {
        self.values.lock().contains(&value)
    }

    /// Returns the number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Returns true if no value has been accepted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}
