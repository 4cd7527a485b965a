//! Namespace-scoped read cache.
//!
//! Read results are keyed by statement, read mode and the bound query, and
//! tagged with the statement's namespace. A successful write through any
//! statement of a namespace drops every entry of that namespace. Entries are
//! never mutated in place, only replaced or evicted (least recently used
//! first once `capacity` is reached).
//!
//! Recency is the entry order of an `IndexMap`, so a hit shifts the entries
//! after it and costs O(capacity). Keep `capacity` in the hundreds.
//!
//! Each namespace carries a generation counter. A reader takes a
//! [`CacheTicket`] before it queries the database and the result is only
//! stored if no invalidation happened in between, so a read that raced a
//! write can never repopulate the cache with pre-write rows.

use crate::models::Record;
use crate::statement::{BoundQuery, Statement};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// How a read was invoked; part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    One,
    List,
}

impl ReadMode {
    fn as_str(&self) -> &'static str {
        match self {
            ReadMode::One => "one",
            ReadMode::List => "list",
        }
    }
}

/// Identity of one cached read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    key: String,
}

impl CacheKey {
    pub fn new(statement: &Statement, mode: ReadMode, query: &BoundQuery) -> Self {
        Self {
            namespace: statement.namespace().to_string(),
            key: format!(
                "{}|{}|{}",
                statement.full_id(),
                mode.as_str(),
                query.cache_key()
            ),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Snapshot of the invalidation state taken before a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket {
    epoch: u64,
    generation: u64,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

struct Entry {
    namespace: String,
    rows: Arc<Vec<Record>>,
}

#[derive(Default)]
struct CacheInner {
    /// Insertion order doubles as recency order: the front is evicted first.
    entries: IndexMap<String, Entry>,
    generations: HashMap<String, u64>,
    /// Bumped by `clear`, invalidating every outstanding ticket.
    epoch: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn ticket(&self, namespace: &str) -> CacheTicket {
        CacheTicket {
            epoch: self.epoch,
            generation: self.generations.get(namespace).copied().unwrap_or(0),
        }
    }
}

/// LRU read cache with per-namespace invalidation.
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    enabled: bool,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("enabled", &self.enabled)
            .field("stats", &self.stats())
            .finish()
    }
}

impl QueryCache {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                stats: CacheStats {
                    capacity,
                    ..CacheStats::default()
                },
                ..CacheInner::default()
            }),
            capacity,
            enabled: enabled && capacity > 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Take a ticket for a read about to hit the database.
    pub fn ticket(&self, namespace: &str) -> CacheTicket {
        self.inner
            .lock()
            .map(|inner| inner.ticket(namespace))
            .unwrap_or(CacheTicket {
                epoch: u64::MAX,
                generation: u64::MAX,
            })
    }

    /// Look up a cached read, marking it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<Record>>> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock().ok()?;
        match inner.entries.get_index_of(&key.key) {
            Some(index) => {
                let last = inner.entries.len() - 1;
                inner.entries.move_index(index, last);
                let rows = Arc::clone(&inner.entries[last].rows);
                inner.stats.hits += 1;
                trace!(namespace = %key.namespace, "Cache hit");
                Some(rows)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Store a read result unless its namespace was invalidated since `ticket`.
    ///
    /// Returns whether the entry was stored.
    pub fn put(&self, key: CacheKey, rows: Arc<Vec<Record>>, ticket: CacheTicket) -> bool {
        if !self.enabled {
            return false;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.ticket(&key.namespace) != ticket {
            trace!(namespace = %key.namespace, "Skipping stale cache fill");
            return false;
        }

        inner.entries.shift_remove(&key.key);
        while inner.entries.len() >= self.capacity {
            if inner.entries.shift_remove_index(0).is_none() {
                break;
            }
            inner.stats.evictions += 1;
        }
        inner.entries.insert(
            key.key,
            Entry {
                namespace: key.namespace,
                rows,
            },
        );
        true
    }

    /// Drop every entry of `namespace` and advance its generation.
    pub fn invalidate_namespace(&self, namespace: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        *inner.generations.entry(namespace.to_string()).or_insert(0) += 1;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.namespace != namespace);
        let dropped = before - inner.entries.len();
        inner.stats.invalidations += 1;
        trace!(namespace, dropped, "Cache namespace invalidated");
    }

    /// Drop everything.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.epoch += 1;
            inner.stats.invalidations += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .map(|inner| CacheStats {
                entries: inner.entries.len(),
                ..inner.stats
            })
            .unwrap_or_default()
    }
}
