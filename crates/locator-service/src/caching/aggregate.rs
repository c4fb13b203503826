use std::collections::{BTreeMap, HashMap, HashSet};

/// Counts the distinct keys that currently resolve to each value.
///
/// The key sets are only kept in memory to deduplicate; consumers (and durable storage) only
/// ever see the counts.
#[derive(Debug, Clone, Default)]
pub struct UsageAggregator {
    keys_by_value: HashMap<String, HashSet<String>>,
    value_by_key: HashMap<String, String>,
}

impl UsageAggregator {
    /// Records that `key` resolves to `value`.
    ///
    /// A key previously recorded with another value is moved over.
    pub fn insert(&mut self, key: &str, value: &str) {
        if let Some(previous) = self.value_by_key.get(key) {
            if previous == value {
                return;
            }
            self.remove(key);
        }

        self.keys_by_value
            .entry(value.to_owned())
            .or_default()
            .insert(key.to_owned());
        self.value_by_key.insert(key.to_owned(), value.to_owned());
    }

    /// Forgets `key`, for example because its cache entry expired.
    pub fn remove(&mut self, key: &str) {
        let Some(value) = self.value_by_key.remove(key) else {
            return;
        };
        if let Some(keys) = self.keys_by_value.get_mut(&value) {
            keys.remove(key);
            if keys.is_empty() {
                self.keys_by_value.remove(&value);
            }
        }
    }

    /// The number of distinct keys resolving to `value`.
    pub fn count(&self, value: &str) -> usize {
        self.keys_by_value.get(value).map_or(0, HashSet::len)
    }

    /// All counts, ordered by value.
    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.keys_by_value
            .iter()
            .map(|(value, keys)| (value.clone(), keys.len() as u64))
            .collect()
    }

    /// The total number of keys with a value.
    pub fn total(&self) -> usize {
        self.value_by_key.len()
    }

    pub fn clear(&mut self) {
        self.keys_by_value.clear();
        self.value_by_key.clear();
    }
}
