//! System limits and configuration bounds.
//!
//! Put limits on everything: every queue, buffer, and resource has an
//! explicit maximum size. This prevents unbounded growth and makes the
//! system predictable.

/// System-wide limits for a hive.
///
/// All limits are explicit and configurable. Default values are chosen to
/// be safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Message limits.
    /// Maximum size of a single message payload in bytes.
    pub max_message_bytes: u32,
    /// Maximum depth of a bee's input queue.
    pub max_bee_queue_depth: u32,

    // Transaction limits.
    /// Maximum staged size of a transaction (writes + emits) in bytes.
    pub max_txn_bytes: u64,
    /// Maximum read-set invalidation retries before surfacing an abort.
    pub max_txn_retries: u32,
    /// Size of the replay-dedup window (message ids remembered per bee).
    pub dedup_window: u32,

    // Routing limits.
    /// Maximum transparent routing retries on `NotLeader`/stale-epoch.
    pub max_route_retries: u32,

    // Storage limits.
    /// Maximum size of a log segment in bytes.
    pub max_segment_bytes: u64,
    /// Applied entries between snapshots for snapshot-persisted bees.
    pub snapshot_every_entries: u64,

    // Failure detection (in ticks of the hive clock).
    /// Missed heartbeats before a node is marked dead.
    pub dead_timeout_ticks: u32,
    /// Idle ticks before a drained, cell-less bee is destroyed.
    pub drain_grace_ticks: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Messages: 1MB payloads, 1024-deep bee queues.
            max_message_bytes: 1024 * 1024,
            max_bee_queue_depth: 1024,

            // Transactions: 4MB staged, 3 retries, 4096-entry dedup window.
            max_txn_bytes: 4 * 1024 * 1024,
            max_txn_retries: 3,
            dedup_window: 4096,

            // Routing: 3 transparent retries before surfacing.
            max_route_retries: 3,

            // Storage: 64MB segments, snapshot every 10k applied entries.
            max_segment_bytes: 64 * 1024 * 1024,
            snapshot_every_entries: 10_000,

            // Failure detection: ~5s dead timeout, ~10s drain grace at the
            // default 100ms tick.
            dead_timeout_ticks: 50,
            drain_grace_ticks: 100,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_message_bytes == 0 {
            return Err(crate::HiveError::InvalidArgument {
                name: "max_message_bytes",
                reason: "must be positive",
            });
        }

        // A transaction must be able to hold at least one full message.
        if self.max_txn_bytes < self.max_message_bytes as u64 {
            return Err(crate::HiveError::InvalidArgument {
                name: "max_txn_bytes",
                reason: "must be >= max_message_bytes",
            });
        }

        if self.max_bee_queue_depth == 0 {
            return Err(crate::HiveError::InvalidArgument {
                name: "max_bee_queue_depth",
                reason: "must be positive",
            });
        }

        if self.dedup_window == 0 {
            return Err(crate::HiveError::InvalidArgument {
                name: "dedup_window",
                reason: "must be positive",
            });
        }

        if self.snapshot_every_entries == 0 {
            return Err(crate::HiveError::InvalidArgument {
                name: "snapshot_every_entries",
                reason: "must be positive",
            });
        }

        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        let limits = Limits::new();
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_txn_smaller_than_message() {
        let mut limits = Limits::new();
        limits.max_txn_bytes = 512;
        limits.max_message_bytes = 1024;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_zero_dedup_window() {
        let mut limits = Limits::new();
        limits.dedup_window = 0;
        assert!(limits.validate().is_err());
    }
}
