//!
//! Statement Cache
//!
//! LRU of SQL text to statement object for one connection. The cache holds
//! each statement through a `StablePtr`; whenever an entry leaves the cache
//! (capacity eviction, replacement, explicit removal, `evict_all`) the
//! statement is finalized first and the token disposed second.
//!
//! A capacity of 0 turns caching off: a put finalizes the statement at once.
//!

use std::num::NonZeroUsize;

use lru::LruCache;

use kite_core::{ManagedRef, StablePtr};
use kite_handles::NativePtr;

use crate::error::SqliteError;

pub const MAX_CACHE_SIZE: usize = 100;

/// Releases the native statement behind a statement object.
pub trait StatementFinalizer: Send + Sync {
    fn finalize(&self, connection: NativePtr, statement: &ManagedRef);
}

impl<F> StatementFinalizer for F
where
    F: Fn(NativePtr, &ManagedRef) + Send + Sync,
{
    fn finalize(&self, connection: NativePtr, statement: &ManagedRef) {
        self(connection, statement)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct StatementCache {
    /// None when caching is disabled
    entries: Option<LruCache<String, StablePtr>>,
    stats: CacheStats,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Result<Self, SqliteError> {
        if capacity > MAX_CACHE_SIZE {
            return Err(SqliteError::CacheSizeOutOfRange(capacity as i64));
        }
        Ok(Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
            stats: CacheStats::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.cap().get())
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn release(connection: NativePtr, token: StablePtr, finalizer: &dyn StatementFinalizer) {
        finalizer.finalize(connection, token.object());
        token.dispose();
    }

    /// Cache `statement` under `sql` as the most recently used entry.
    pub fn put(
        &mut self,
        connection: NativePtr,
        sql: impl Into<String>,
        statement: ManagedRef,
        finalizer: &dyn StatementFinalizer,
    ) {
        let sql = sql.into();
        let Some(entries) = self.entries.as_mut() else {
            tracing::trace!(%sql, "statement cache disabled, finalizing");
            finalizer.finalize(connection, &statement);
            return;
        };

        let token = StablePtr::create(statement);
        match entries.push(sql.clone(), token) {
            None => {}
            Some((key, old)) if key == sql => {
                // Same object re-put: the old token only held a second reference.
                let same = entries
                    .peek(&sql)
                    .is_some_and(|current| current.object().ptr_eq(old.object()));
                if same {
                    old.dispose();
                } else {
                    Self::release(connection, old, finalizer);
                }
            }
            Some((key, old)) => {
                tracing::debug!(sql = %key, "statement evicted from cache");
                self.stats.evictions += 1;
                Self::release(connection, old, finalizer);
            }
        }
    }

    /// Look up `sql`, promoting a hit to most recently used.
    pub fn get(&mut self, sql: &str) -> Option<ManagedRef> {
        let found = self.entries.as_mut().and_then(|e| e.get(sql)).map(StablePtr::peek);
        if found.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        found
    }

    /// Presence test. Does not change the LRU order.
    pub fn has(&self, sql: &str) -> bool {
        self.entries.as_ref().is_some_and(|e| e.contains(sql))
    }

    /// Finalize and drop the entry for `sql`, if there is one.
    pub fn remove(&mut self, connection: NativePtr, sql: &str, finalizer: &dyn StatementFinalizer) -> bool {
        match self.entries.as_mut().and_then(|e| e.pop(sql)) {
            Some(token) => {
                Self::release(connection, token, finalizer);
                true
            }
            None => false,
        }
    }

    /// Finalize and drop every entry, least recently used first.
    pub fn evict_all(&mut self, connection: NativePtr, finalizer: &dyn StatementFinalizer) -> usize {
        let Some(entries) = self.entries.as_mut() else {
            return 0;
        };
        let mut evicted = 0;
        while let Some((_, token)) = entries.pop_lru() {
            Self::release(connection, token, finalizer);
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(evicted, "statement cache cleared");
        }
        evicted
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .as_ref()
            .map(|e| e.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn finalized(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl StatementFinalizer for Recorder {
        fn finalize(&self, _connection: NativePtr, statement: &ManagedRef) {
            self.0
                .lock()
                .unwrap()
                .push(statement.as_str().unwrap_or_default().to_string());
        }
    }

    const CONN: NativePtr = NativePtr::NULL;

    fn stmt(sql: &str) -> ManagedRef {
        ManagedRef::string(sql)
    }

    #[test]
    fn test_lru_eviction_order() {
        let finalizer = Recorder::default();
        let mut cache = StatementCache::new(2).unwrap();
        cache.put(CONN, "A", stmt("A"), &finalizer);
        cache.put(CONN, "B", stmt("B"), &finalizer);
        cache.put(CONN, "C", stmt("C"), &finalizer);

        assert_eq!(finalizer.finalized(), vec!["A"]);
        assert!(!cache.has("A"));
        assert!(cache.has("B"));
        assert!(cache.has("C"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_promotes() {
        let finalizer = Recorder::default();
        let mut cache = StatementCache::new(2).unwrap();
        cache.put(CONN, "A", stmt("A"), &finalizer);
        cache.put(CONN, "B", stmt("B"), &finalizer);
        assert!(cache.get("A").is_some());
        cache.put(CONN, "C", stmt("C"), &finalizer);

        assert_eq!(finalizer.finalized(), vec!["B"]);
        assert_eq!(cache.keys(), vec!["C", "A"]);
    }

    #[test]
    fn test_has_does_not_promote() {
        let finalizer = Recorder::default();
        let mut cache = StatementCache::new(2).unwrap();
        cache.put(CONN, "A", stmt("A"), &finalizer);
        cache.put(CONN, "B", stmt("B"), &finalizer);
        assert!(cache.has("A"));
        cache.put(CONN, "C", stmt("C"), &finalizer);
        assert_eq!(finalizer.finalized(), vec!["A"]);
    }

    #[test]
    fn test_replacing_key_finalizes_old_statement() {
        let finalizer = Recorder::default();
        let mut cache = StatementCache::new(4).unwrap();
        let first = stmt("old");
        cache.put(CONN, "Q", first.clone(), &finalizer);
        cache.put(CONN, "Q", stmt("new"), &finalizer);

        assert_eq!(finalizer.finalized(), vec!["old"]);
        assert_eq!(first.ref_count(), 1);
        assert_eq!(cache.get("Q").unwrap().as_str(), Some("new"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reput_same_statement_only_retokens() {
        let finalizer = Recorder::default();
        let mut cache = StatementCache::new(4).unwrap();
        let statement = stmt("Q");
        cache.put(CONN, "Q", statement.clone(), &finalizer);
        cache.put(CONN, "Q", statement.clone(), &finalizer);

        assert!(finalizer.finalized().is_empty());
        assert_eq!(statement.ref_count(), 2);
    }

    #[test]
    fn test_disabled_cache_finalizes_immediately() {
        let finalizer = Recorder::default();
        let mut cache = StatementCache::new(0).unwrap();
        let statement = stmt("SELECT 1");
        cache.put(CONN, "SELECT 1", statement.clone(), &finalizer);

        assert_eq!(finalizer.finalized(), vec!["SELECT 1"]);
        assert!(!cache.is_enabled());
        assert!(!cache.has("SELECT 1"));
        assert!(cache.get("SELECT 1").is_none());
        assert_eq!(statement.ref_count(), 1);
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(StatementCache::new(MAX_CACHE_SIZE).is_ok());
        assert!(matches!(
            StatementCache::new(MAX_CACHE_SIZE + 1),
            Err(SqliteError::CacheSizeOutOfRange(101))
        ));
    }

    #[test]
    fn test_remove_and_evict_all() {
        let finalizer = Recorder::default();
        let mut cache = StatementCache::new(5).unwrap();
        for sql in ["A", "B", "C"] {
            cache.put(CONN, sql, stmt(sql), &finalizer);
        }
        assert!(cache.remove(CONN, "B", &finalizer));
        assert!(!cache.remove(CONN, "B", &finalizer));
        assert_eq!(cache.evict_all(CONN, &finalizer), 2);

        assert_eq!(finalizer.finalized(), vec!["B", "A", "C"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let finalizer = |_: NativePtr, _: &ManagedRef| {};
        let mut cache = StatementCache::new(1).unwrap();
        cache.put(CONN, "A", stmt("A"), &finalizer);
        assert!(cache.get("A").is_some());
        assert!(cache.get("Z").is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
    }
}
