//! Per-connection prepared-statement cache
//!
//! Capacity is a hard ceiling on backend-side statement handles: inserting
//! past it hands the displaced entry back to the caller, which must
//! deallocate the backend statement id on the same connection before the
//! insert is considered complete. Lookup promotes recency.

use std::num::NonZeroUsize;

use lru::LruCache;

use super::StatementHandle;

/// Cache key: a statement text is only reusable under the schema it was
/// prepared against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub schema: String,
    pub text: String,
}

impl StatementKey {
    pub fn new(schema: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            text: text.into(),
        }
    }
}

/// Access-ordered bounded map of prepared statements on one connection.
pub struct StatementCache {
    entries: LruCache<StatementKey, StatementHandle>,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Look up a statement, promoting it to most recently used.
    pub fn get(&mut self, key: &StatementKey) -> Option<&StatementHandle> {
        self.entries.get(key)
    }

    /// Remove and return a statement, e.g. to move it into active use.
    pub fn take(&mut self, key: &StatementKey) -> Option<StatementHandle> {
        self.entries.pop(key)
    }

    /// Insert a statement. Returns the displaced entry — the evicted
    /// least-recently-used entry when at capacity, or the stale handle when
    /// the key was already present. Either way the caller must deallocate
    /// the returned backend statement id before reusing the slot.
    pub fn insert(
        &mut self,
        key: StatementKey,
        handle: StatementHandle,
    ) -> Option<(StatementKey, StatementHandle)> {
        self.entries.push(key, handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Drain every entry, e.g. when the connection is being torn down.
    pub fn drain(&mut self) -> Vec<(StatementKey, StatementHandle)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_lru() {
            out.push(entry);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u32) -> StatementHandle {
        StatementHandle {
            statement_id: id,
            param_count: 1,
            column_count: 2,
        }
    }

    fn key(text: &str) -> StatementKey {
        StatementKey::new("app", text)
    }

    #[test]
    fn test_insert_within_capacity_displaces_nothing() {
        let mut cache = StatementCache::new(3);
        assert!(cache.insert(key("SELECT 1"), handle(1)).is_none());
        assert!(cache.insert(key("SELECT 2"), handle(2)).is_none());
        assert!(cache.insert(key("SELECT 3"), handle(3)).is_none());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_overflow_evicts_exactly_the_lru_entry() {
        let mut cache = StatementCache::new(3);
        cache.insert(key("SELECT 1"), handle(1));
        cache.insert(key("SELECT 2"), handle(2));
        cache.insert(key("SELECT 3"), handle(3));

        let displaced = cache.insert(key("SELECT 4"), handle(4)).unwrap();
        assert_eq!(displaced.0, key("SELECT 1"));
        assert_eq!(displaced.1.statement_id, 1);
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&key("SELECT 1")).is_none());
    }

    #[test]
    fn test_lookup_promotes_recency() {
        let mut cache = StatementCache::new(2);
        cache.insert(key("SELECT 1"), handle(1));
        cache.insert(key("SELECT 2"), handle(2));

        // Touch the older entry so the newer one becomes the LRU
        assert!(cache.get(&key("SELECT 1")).is_some());

        let displaced = cache.insert(key("SELECT 3"), handle(3)).unwrap();
        assert_eq!(displaced.0, key("SELECT 2"));
    }

    #[test]
    fn test_reinsert_same_key_returns_stale_handle() {
        let mut cache = StatementCache::new(2);
        cache.insert(key("SELECT 1"), handle(1));

        let displaced = cache.insert(key("SELECT 1"), handle(9)).unwrap();
        assert_eq!(displaced.1.statement_id, 1);
        assert_eq!(cache.get(&key("SELECT 1")).unwrap().statement_id, 9);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_schema_is_part_of_the_key() {
        let mut cache = StatementCache::new(4);
        cache.insert(StatementKey::new("app", "SELECT 1"), handle(1));
        cache.insert(StatementKey::new("other", "SELECT 1"), handle(2));

        assert_eq!(
            cache
                .get(&StatementKey::new("app", "SELECT 1"))
                .unwrap()
                .statement_id,
            1
        );
        assert_eq!(
            cache
                .get(&StatementKey::new("other", "SELECT 1"))
                .unwrap()
                .statement_id,
            2
        );
    }

    #[test]
    fn test_take_removes_entry() {
        let mut cache = StatementCache::new(2);
        cache.insert(key("SELECT 1"), handle(1));

        let taken = cache.take(&key("SELECT 1")).unwrap();
        assert_eq!(taken.statement_id, 1);
        assert!(cache.is_empty());
    }
}
