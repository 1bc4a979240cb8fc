//! Leader cache - remembers which node leads each colony.
//!
//! Forwarding a message needs the colony leader of the owning bee. Leaders
//! move on failover, so entries carry the registry epoch they were learned
//! at and a TTL; a `NotLeader` or stale-epoch reply invalidates the entry
//! and the next route re-reads the registry.

use std::collections::HashMap;

use beehive_core::{BeeId, Epoch, NodeId};

/// Maximum number of cached leaders.
pub const LEADER_CACHE_ENTRIES_MAX: usize = 100_000;

/// Default TTL for entries in microseconds (5 seconds).
pub const LEADER_CACHE_TTL_US_DEFAULT: u64 = 5_000_000;

/// Configuration for the leader cache.
#[derive(Debug, Clone, Copy)]
pub struct LeaderCacheConfig {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Time-to-live for entries in microseconds.
    pub ttl_us: u64,
}

impl Default for LeaderCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: LEADER_CACHE_ENTRIES_MAX,
            ttl_us: LEADER_CACHE_TTL_US_DEFAULT,
        }
    }
}

/// A cached leader.
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    leader: NodeId,
    epoch: Epoch,
    updated_at_us: u64,
}

/// Cache of known colony leaders.
#[derive(Debug)]
pub struct LeaderCache {
    config: LeaderCacheConfig,
    entries: HashMap<BeeId, CacheEntry>,
}

impl LeaderCache {
    /// Creates a cache with the given configuration.
    #[must_use]
    pub fn new(config: LeaderCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Creates a cache with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(LeaderCacheConfig::default())
    }

    /// Returns the cached `(leader, epoch)` for a bee if fresh.
    #[must_use]
    pub fn get(&self, bee: BeeId, now_us: u64) -> Option<(NodeId, Epoch)> {
        self.entries.get(&bee).and_then(|entry| {
            let age = now_us.saturating_sub(entry.updated_at_us);
            (age <= self.config.ttl_us).then_some((entry.leader, entry.epoch))
        })
    }

    /// Records a leader learned at `epoch`. Entries at an older epoch than
    /// the cached one are ignored.
    pub fn put(&mut self, bee: BeeId, leader: NodeId, epoch: Epoch, now_us: u64) {
        if let Some(existing) = self.entries.get(&bee) {
            if existing.epoch > epoch {
                return;
            }
        }
        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(&bee) {
            self.evict_oldest();
        }
        self.entries.insert(
            bee,
            CacheEntry {
                leader,
                epoch,
                updated_at_us: now_us,
            },
        );
    }

    /// Drops the entry for a bee (stale route observed).
    pub fn invalidate(&mut self, bee: BeeId) {
        self.entries.remove(&bee);
    }

    /// Drops every entry pointing at a failed node.
    pub fn invalidate_node(&mut self, node: NodeId) {
        self.entries.retain(|_, entry| entry.leader != node);
    }

    /// Clears the cache.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes expired entries.
    pub fn evict_expired(&mut self, now_us: u64) {
        self.entries.retain(|_, entry| {
            now_us.saturating_sub(entry.updated_at_us) <= self.config.ttl_us
        });
    }

    fn evict_oldest(&mut self) {
        if let Some((&oldest, _)) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.updated_at_us)
        {
            self.entries.remove(&oldest);
        }
    }
}

impl Default for LeaderCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let mut cache = LeaderCache::with_defaults();
        cache.put(BeeId::new(1), NodeId::new(2), Epoch::new(0), 1_000);

        assert_eq!(
            cache.get(BeeId::new(1), 1_000),
            Some((NodeId::new(2), Epoch::new(0)))
        );
        assert!(cache.get(BeeId::new(9), 1_000).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let config = LeaderCacheConfig {
            ttl_us: 100,
            ..Default::default()
        };
        let mut cache = LeaderCache::new(config);
        cache.put(BeeId::new(1), NodeId::new(2), Epoch::new(0), 1_000);

        assert!(cache.get(BeeId::new(1), 1_050).is_some());
        assert!(cache.get(BeeId::new(1), 1_200).is_none());
    }

    #[test]
    fn test_older_epoch_ignored() {
        let mut cache = LeaderCache::with_defaults();
        cache.put(BeeId::new(1), NodeId::new(3), Epoch::new(5), 1_000);

        // A stale observation must not clobber the newer route.
        cache.put(BeeId::new(1), NodeId::new(2), Epoch::new(4), 2_000);
        assert_eq!(
            cache.get(BeeId::new(1), 2_000),
            Some((NodeId::new(3), Epoch::new(5)))
        );

        cache.put(BeeId::new(1), NodeId::new(4), Epoch::new(6), 3_000);
        assert_eq!(
            cache.get(BeeId::new(1), 3_000),
            Some((NodeId::new(4), Epoch::new(6)))
        );
    }

    #[test]
    fn test_invalidate_node() {
        let mut cache = LeaderCache::with_defaults();
        cache.put(BeeId::new(1), NodeId::new(7), Epoch::new(0), 1_000);
        cache.put(BeeId::new(2), NodeId::new(7), Epoch::new(0), 1_000);
        cache.put(BeeId::new(3), NodeId::new(8), Epoch::new(0), 1_000);

        cache.invalidate_node(NodeId::new(7));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(BeeId::new(3), 1_000).is_some());
    }

    #[test]
    fn test_eviction_at_capacity() {
        let config = LeaderCacheConfig {
            max_entries: 2,
            ..Default::default()
        };
        let mut cache = LeaderCache::new(config);
        cache.put(BeeId::new(1), NodeId::new(1), Epoch::new(0), 100);
        cache.put(BeeId::new(2), NodeId::new(1), Epoch::new(0), 200);
        cache.put(BeeId::new(3), NodeId::new(1), Epoch::new(0), 300);

        assert_eq!(cache.len(), 2);
        // The oldest entry was evicted.
        assert!(cache.get(BeeId::new(1), 300).is_none());
        assert!(cache.get(BeeId::new(3), 300).is_some());
    }
}
