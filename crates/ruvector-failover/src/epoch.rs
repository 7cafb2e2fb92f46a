//! Configuration epochs
//!
//! An epoch is the pair `(data_loss_version, configuration_version)`,
//! ordered lexicographically. The high 32 bits of the configuration version
//! count primary changes and the low 32 bits count every configuration change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mask selecting the configuration change counter of a configuration version
pub const PRIMARY_EPOCH_MASK: i64 = 0xFFFF_FFFF;

/// Fencing epoch of a failover unit configuration
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Epoch {
    /// Bumped whenever the partition may have lost acknowledged writes
    pub data_loss_version: i64,
    /// Bumped on every configuration change
    pub configuration_version: i64,
}

impl Epoch {
    /// Create an epoch from its raw versions
    pub fn new(data_loss_version: i64, configuration_version: i64) -> Self {
        Self {
            data_loss_version,
            configuration_version,
        }
    }

    /// Create an epoch from a primary change counter and a change counter
    pub fn from_parts(data_loss_version: i64, primary_version: i64, change_version: i64) -> Self {
        Self::new(
            data_loss_version,
            (primary_version << 32) | (change_version & PRIMARY_EPOCH_MASK),
        )
    }

    /// The epoch used for an empty previous configuration
    pub fn invalid() -> Self {
        Self::new(0, 0)
    }

    /// Returns true unless this is the invalid epoch
    pub fn is_valid(&self) -> bool {
        *self != Self::invalid()
    }

    /// Number of primary changes encoded in the configuration version
    pub fn primary_version(&self) -> i64 {
        self.configuration_version >> 32
    }

    /// Number of configuration changes encoded in the configuration version
    pub fn change_version(&self) -> i64 {
        self.configuration_version & PRIMARY_EPOCH_MASK
    }

    /// Returns true if moving from `self` to `other` changed the primary
    pub fn is_primary_change_to(&self, other: &Epoch) -> bool {
        self.data_loss_version != other.data_loss_version
            || self.primary_version() != other.primary_version()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.data_loss_version,
            self.primary_version(),
            self.change_version()
        )
    }
}
