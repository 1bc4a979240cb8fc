//! Application descriptors.
//!
//! An application is a named collection of handlers, identical on every node.
//! Its options control persistence, replication, and emit delivery policy.

use std::fmt;

/// Application name. Compared and hashed across nodes to detect
/// configuration divergence at join time.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppName(String);

impl AppName {
    /// Creates an application name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app({})", self.0)
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// How a bee's state survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Persistence {
    /// State lives only in memory.
    #[default]
    Volatile,
    /// Committed transactions are logged to disk.
    Log,
    /// Logged, plus periodic snapshots for bounded recovery time.
    LogSnapshot,
}

/// Delivery policy for a handler's outbound emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutboundPolicy {
    /// Redeliver until applied; receivers deduplicate by message id.
    #[default]
    AtLeastOnce,
    /// Deliver once; a failed handler invocation drops the message.
    AtMostOnce,
}

/// Recognized per-application options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppOptions {
    /// Persistence mode for the app's bees.
    pub persistence: Persistence,
    /// Colony replication factor. Must be >= 1.
    pub replication: u8,
    /// Whether `rcv` runs inside a transaction. Always true today; kept as
    /// an explicit option so the wire format doesn't change when
    /// non-transactional handlers land.
    pub transactional: bool,
    /// Emit delivery policy.
    pub outbound: OutboundPolicy,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            persistence: Persistence::Volatile,
            replication: 1,
            transactional: true,
            outbound: OutboundPolicy::AtLeastOnce,
        }
    }
}

impl AppOptions {
    /// Validates the options.
    ///
    /// # Errors
    /// Returns an error if the options are internally inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.replication == 0 {
            return Err(crate::HiveError::InvalidArgument {
                name: "replication",
                reason: "must be >= 1",
            });
        }
        if self.replication > 1 && self.persistence == Persistence::Volatile {
            return Err(crate::HiveError::InvalidArgument {
                name: "replication",
                reason: "replicated bees require persistence",
            });
        }
        Ok(())
    }

    /// Sets the persistence mode.
    #[must_use]
    pub const fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    /// Sets the replication factor.
    #[must_use]
    pub const fn with_replication(mut self, replication: u8) -> Self {
        self.replication = replication;
        self
    }

    /// Sets the outbound delivery policy.
    #[must_use]
    pub const fn with_outbound(mut self, outbound: OutboundPolicy) -> Self {
        self.outbound = outbound;
        self
    }

    /// Folds the options into a configuration hash, used to compare
    /// application sets across joining nodes.
    #[must_use]
    pub fn config_word(&self) -> u64 {
        let p = match self.persistence {
            Persistence::Volatile => 0u64,
            Persistence::Log => 1,
            Persistence::LogSnapshot => 2,
        };
        let o = match self.outbound {
            OutboundPolicy::AtLeastOnce => 0u64,
            OutboundPolicy::AtMostOnce => 1,
        };
        p | (u64::from(self.replication) << 2) | (u64::from(self.transactional) << 10) | (o << 11)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_valid() {
        assert!(AppOptions::default().validate().is_ok());
    }

    #[test]
    fn test_zero_replication_rejected() {
        let opts = AppOptions::default().with_replication(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_volatile_replicated_rejected() {
        let opts = AppOptions::default().with_replication(3);
        assert!(opts.validate().is_err());

        let opts = opts.with_persistence(Persistence::Log);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_config_word_distinguishes_options() {
        let a = AppOptions::default();
        let b = AppOptions::default().with_outbound(OutboundPolicy::AtMostOnce);
        let c = AppOptions::default()
            .with_persistence(Persistence::Log)
            .with_replication(3);

        assert_ne!(a.config_word(), b.config_word());
        assert_ne!(a.config_word(), c.config_word());
        assert_ne!(b.config_word(), c.config_word());
    }
}
