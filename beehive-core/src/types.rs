//! Strongly-typed identifiers for Beehive entities.
//!
//! Explicit types prevent bugs from mixing up ids. All ids are 64-bit to
//! handle large, long-lived clusters.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `NodeId` with `BeeId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Cluster topology.
define_id!(NodeId, "node", "Unique identifier for a hive (node) in the cluster.");

// Ownership.
define_id!(BeeId, "bee", "Cluster-wide monotonic identifier for a bee (owner of a cell set).");
define_id!(Epoch, "epoch", "Per-cell ownership epoch, bumped on every ownership change.");

// Consensus.
define_id!(GroupId, "group", "Unique identifier for a consensus group.");
define_id!(TermId, "term", "Consensus term number for leader election.");
define_id!(LogIndex, "idx", "Index into a consensus group's log.");

// Emit ordering.
define_id!(TxnSeq, "seq", "Monotone per-bee sequence number assigned to committed emits.");

impl GroupId {
    /// The well-known cluster group replicating the cell registry and
    /// cluster membership.
    pub const CLUSTER: Self = Self(0);

    /// Offset separating colony group ids from the cluster group.
    ///
    /// A bee's colony replicates through `GroupId(bee_id + COLONY_OFFSET)`,
    /// keeping the group id space disjoint without a second allocator.
    pub const COLONY_OFFSET: u64 = 1 << 32;

    /// Returns the colony group id for a bee.
    #[must_use]
    pub const fn colony(bee: BeeId) -> Self {
        Self(bee.get() + Self::COLONY_OFFSET)
    }

    /// Returns the bee whose colony this group replicates, if any.
    #[must_use]
    pub const fn colony_bee(self) -> Option<BeeId> {
        if self.0 >= Self::COLONY_OFFSET {
            Some(BeeId::new(self.0 - Self::COLONY_OFFSET))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let node = NodeId::new(1);
        let bee = BeeId::new(1);

        // These are different types even with same value.
        assert_eq!(node.get(), bee.get());
    }

    #[test]
    fn test_id_display() {
        let bee = BeeId::new(42);
        assert_eq!(format!("{bee}"), "bee-42");
        assert_eq!(format!("{bee:?}"), "bee(42)");
    }

    #[test]
    fn test_id_next() {
        let seq = TxnSeq::new(0);
        assert_eq!(seq.next().get(), 1);
        assert_eq!(seq.next().next().get(), 2);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let id = BeeId::new(u64::MAX);
        let _ = id.next();
    }

    #[test]
    fn test_colony_group_roundtrip() {
        let bee = BeeId::new(7);
        let group = GroupId::colony(bee);

        assert_ne!(group, GroupId::CLUSTER);
        assert_eq!(group.colony_bee(), Some(bee));
        assert_eq!(GroupId::CLUSTER.colony_bee(), None);
    }

    #[test]
    fn test_id_ordering() {
        let a = Epoch::new(1);
        let b = Epoch::new(2);

        assert!(a < b);
        assert_eq!(a, Epoch::new(1));
    }
}
