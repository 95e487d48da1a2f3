//! Bounded LRU cache of materialized snapshot payloads.
//!
//! Reads that hit a tier pay codec work to materialize the payload; this
//! cache shields repeated reads of the same frame from repeating it.
//! Entries are dropped exactly when invalidation or reserved eviction
//! removes the corresponding frame, and may also fall out under normal
//! LRU pressure independent of store eviction.

use std::collections::VecDeque;

use bytes::Bytes;
use fxhash::FxHashMap;

/// Default number of cached payloads.
pub const DEFAULT_CACHE_ENTRIES: usize = 16;

/// Bounded least-recently-used map of `frame -> materialized bytes`.
#[derive(Debug)]
pub struct DecompressionCache {
    map: FxHashMap<u64, Bytes>,
    /// Recency order; front is least recently used.
    recency: VecDeque<u64>,
    max_entries: usize,
}

impl DecompressionCache {
    /// Create a cache holding at most `max_entries` payloads.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            map: FxHashMap::default(),
            recency: VecDeque::with_capacity(max_entries),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of cached payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fetch a payload and mark it most recently used.
    pub fn get(&mut self, frame: u64) -> Option<Bytes> {
        let bytes = self.map.get(&frame)?.clone();
        self.touch(frame);
        Some(bytes)
    }

    /// Insert a payload, evicting the least recently used on overflow.
    pub fn insert(&mut self, frame: u64, bytes: Bytes) {
        if self.map.insert(frame, bytes).is_some() {
            self.touch(frame);
            return;
        }
        self.recency.push_back(frame);
        while self.map.len() > self.max_entries {
            if let Some(oldest) = self.recency.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    /// Drop one frame's payload, if cached.
    pub fn remove(&mut self, frame: u64) {
        if self.map.remove(&frame).is_some() {
            self.recency.retain(|f| *f != frame);
        }
    }

    /// Drop every payload whose frame exceeds `frame`.
    pub fn retain_at_or_before(&mut self, frame: u64) {
        self.map.retain(|f, _| *f <= frame);
        self.recency.retain(|f| *f <= frame);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.map.clear();
        self.recency.clear();
    }

    fn touch(&mut self, frame: u64) {
        self.recency.retain(|f| *f != frame);
        self.recency.push_back(frame);
    }
}
