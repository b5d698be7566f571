//! Local Cache Entries

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Value held by a cache entry
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// Plain string value (rows, negative sentinel)
    Text(String),
    /// Hash of fields (search shards)
    Hash(HashMap<String, String>),
}

/// Entry stored in the local cache with its recency stamp
#[derive(Debug)]
pub struct LocalEntry {
    value: CachedValue,
    last_access: AtomicU64,
}

impl LocalEntry {
    /// Create an entry stamped with the current access tick
    pub fn new(value: CachedValue, tick: u64) -> Self {
        Self {
            value,
            last_access: AtomicU64::new(tick),
        }
    }

    #[inline]
    pub fn value(&self) -> &CachedValue {
        &self.value
    }

    /// Text value, `None` for hash entries
    pub fn text(&self) -> Option<&str> {
        match &self.value {
            CachedValue::Text(s) => Some(s),
            CachedValue::Hash(_) => None,
        }
    }

    /// One hash field, `None` for text entries or a missing field
    pub fn field(&self, field: &str) -> Option<&str> {
        match &self.value {
            CachedValue::Hash(fields) => fields.get(field).map(String::as_str),
            CachedValue::Text(_) => None,
        }
    }

    /// Record an access at `tick`
    #[inline]
    pub fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }

    /// Tick of the most recent access
    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_accessors() {
        let entry = LocalEntry::new(CachedValue::Text("nil".into()), 1);
        assert_eq!(entry.text(), Some("nil"));
        assert_eq!(entry.field("1"), None);

        let mut fields = HashMap::new();
        fields.insert("1".to_string(), "2 5 7".to_string());
        let entry = LocalEntry::new(CachedValue::Hash(fields), 1);
        assert_eq!(entry.field("1"), Some("2 5 7"));
        assert_eq!(entry.text(), None);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let entry = LocalEntry::new(CachedValue::Text("x".into()), 5);
        entry.touch(9);
        entry.touch(7);
        assert_eq!(entry.last_access(), 9);
    }
}
