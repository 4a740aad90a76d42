// Copyright 2025 Stoolap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cardinality cache
//!
//! Remembers the output buffer size that worked for a plan fingerprint so that
//! repeated queries skip distinct value estimation.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::backend::CardinalityCache;
use super::config::DEFAULT_MAX_CARDINALITY_CACHE_ENTRIES;

/// Bounded in-memory [`CardinalityCache`], least recently used entries go first
#[derive(Debug)]
pub struct InMemoryCardinalityCache {
    entries: Mutex<LruCache<u64, usize>>,
}

impl Default for InMemoryCardinalityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCardinalityCache {
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_CARDINALITY_CACHE_ENTRIES)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl CardinalityCache for InMemoryCardinalityCache {
    fn get(&self, key: u64) -> Option<usize> {
        self.entries.lock().get(&key).copied()
    }

    fn put(&self, key: u64, cardinality: usize) {
        self.entries.lock().put(key, cardinality);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put() {
        let cache = InMemoryCardinalityCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.get(1), None);
        cache.put(1, 500);
        assert_eq!(cache.get(1), Some(500));
        cache.put(1, 700);
        assert_eq!(cache.get(1), Some(700));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = InMemoryCardinalityCache::with_max_entries(3);
        cache.put(1, 10);
        cache.put(2, 20);
        cache.put(3, 30);
        // touch 1 so that 2 is the oldest
        assert_eq!(cache.get(1), Some(10));
        cache.put(4, 40);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(2), None);
        assert_eq!(cache.get(1), Some(10));
        assert_eq!(cache.get(4), Some(40));
    }

    #[test]
    fn test_zero_capacity_keeps_one_entry() {
        let cache = InMemoryCardinalityCache::with_max_entries(0);
        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(2), Some(20));
    }
}
