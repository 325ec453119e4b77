//! Fixed-capacity LRU used as the in-process fallback
//!
//! Recency is tracked with a monotonically increasing tick per entry and an
//! ordered tick index, so touching and evicting are both logarithmic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One appended stream entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub op_id: String,
    pub payload: String,
}

/// Locally held value shapes, mirroring the remote data types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LocalValue {
    Value(String),
    Stream(Vec<StreamEntry>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntry {
    pub value: LocalValue,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LocalEntry {
    pub fn new(value: LocalValue, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { value, expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct LruCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, (LocalEntry, u64)>,
    order: BTreeMap<u64, String>,
}

impl LruCache {
    /// Create a cache holding at most `capacity` keys (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Fetch a live entry and mark it most recently used
    ///
    /// Expired entries are dropped on access.
    pub fn get(&mut self, key: &str) -> Option<&LocalEntry> {
        let now = Utc::now();
        let expired = match self.entries.get(key) {
            Some((entry, _)) => entry.is_expired(now),
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }

        let tick = self.next_tick();
        let (entry, old_tick) = self.entries.get_mut(key)?;
        self.order.remove(old_tick);
        *old_tick = tick;
        self.order.insert(tick, key.to_string());
        Some(entry)
    }

    /// Insert or replace, evicting the least recently used key when full
    ///
    /// Returns the evicted key, if any.
    pub fn put(&mut self, key: &str, entry: LocalEntry) -> Option<String> {
        let tick = self.next_tick();
        if let Some((_, old_tick)) = self.entries.remove(key) {
            self.order.remove(&old_tick);
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.order.pop_first() {
                self.entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }

        self.entries.insert(key.to_string(), (entry, tick));
        self.order.insert(tick, key.to_string());
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<LocalEntry> {
        let (entry, tick) = self.entries.remove(key)?;
        self.order.remove(&tick);
        Some(entry)
    }

    /// Live keys starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, (entry, _))| k.starts_with(prefix) && !entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: &str) -> LocalEntry {
        LocalEntry::new(LocalValue::Value(v.to_string()), None)
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.put("a", value("1"));
        cache.put("b", value("2"));

        // Touch "a" so "b" becomes the eviction candidate
        assert!(cache.get("a").is_some());
        let evicted = cache.put("c", value("3"));

        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut cache = LruCache::new(3);
        for i in 0..50 {
            cache.put(&format!("k{}", i), value("v"));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.keys_with_prefix("k"), vec!["k47", "k48", "k49"]);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let mut cache = LruCache::new(2);
        cache.put("a", value("1"));
        cache.put("b", value("2"));
        assert!(cache.put("a", value("3")).is_none());
        assert_eq!(cache.get("a").map(|e| e.value.clone()), Some(LocalValue::Value("3".into())));
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let mut cache = LruCache::new(4);
        let past = Utc::now() - chrono::Duration::seconds(5);
        cache.put("old", LocalEntry::new(LocalValue::Value("x".into()), Some(past)));
        assert!(cache.get("old").is_none());
        assert!(cache.is_empty());
    }
}
