//! Generation state
//!
//! Implements the fencing state kept by every node:
//! - Generation numbers, ordered by value then owner
//! - Proposed, receive and send generations for each authority role

use crate::{RebuildError, RebuildResult};
use chrono::{DateTime, Utc};
use ruvector_failover::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fencing token minted by a rebuild coordinator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct GenerationNumber {
    pub value: i64,
    pub owner: NodeId,
}

impl GenerationNumber {
    pub fn new(value: i64, owner: impl Into<NodeId>) -> Self {
        Self {
            value,
            owner: owner.into(),
        }
    }

    /// The generation every node starts at
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// A fresh generation owned by `owner`, above `last`
    ///
    /// Wall-clock milliseconds are used when they are larger, so a restarted
    /// coordinator does not reuse a value it minted before. Fails once the
    /// value space above `last` is used up.
    pub fn mint(
        last: &GenerationNumber,
        owner: impl Into<NodeId>,
        now: DateTime<Utc>,
    ) -> RebuildResult<Self> {
        let value = last.value.saturating_add(1).max(now.timestamp_millis());
        let minted = Self::new(value, owner);
        if minted <= *last {
            return Err(RebuildError::GenerationExhausted(last.clone()));
        }
        Ok(minted)
    }
}

impl fmt::Display for GenerationNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.value, self.owner)
    }
}

/// The two failover authorities, each fenced independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenerationRole {
    /// Owns the bootstrap partition
    PrimaryAuthority,
    /// Owns every other partition
    BackupAuthority,
}

impl GenerationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationRole::PrimaryAuthority => "primary",
            GenerationRole::BackupAuthority => "backup",
        }
    }
}

impl fmt::Display for GenerationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generations of one role
///
/// `receive` and `send` may differ by one generation while an upload for the
/// newer generation is still unconfirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGenerations {
    /// Highest generation proposed to this node
    pub proposed: GenerationNumber,

    /// Messages fenced below this generation are rejected
    pub receive: GenerationNumber,

    /// Generation stamped on this node's own messages
    pub send: GenerationNumber,
}

impl RoleGenerations {
    /// Raise every generation to at least `generation`
    pub fn advance_to(&mut self, generation: &GenerationNumber) {
        for current in [&mut self.proposed, &mut self.receive, &mut self.send] {
            if *current < *generation {
                *current = generation.clone();
            }
        }
    }
}

/// Per-role generation state of a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationState {
    primary: RoleGenerations,
    backup: RoleGenerations,
}

impl GenerationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_role(&self, role: GenerationRole) -> &RoleGenerations {
        match role {
            GenerationRole::PrimaryAuthority => &self.primary,
            GenerationRole::BackupAuthority => &self.backup,
        }
    }

    pub fn for_role_mut(&mut self, role: GenerationRole) -> &mut RoleGenerations {
        match role {
            GenerationRole::PrimaryAuthority => &mut self.primary,
            GenerationRole::BackupAuthority => &mut self.backup,
        }
    }
}
