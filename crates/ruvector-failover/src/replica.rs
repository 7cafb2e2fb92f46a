//! Replica description
//!
//! A replica is one copy of a partition on one node instance. Roles are kept
//! separately for the previous and the current configuration; the owning
//! [`FailoverUnit`](crate::FailoverUnit) is the only place that changes them.

use crate::node::NodeInstance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for an unknown sequence number
pub const INVALID_LSN: i64 = -1;

/// Role of a replica in one configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Not part of the configuration
    None,
    /// Known to the partition but not counted for quorum
    Idle,
    /// Replicates from the primary and counts for quorum
    Secondary,
    /// Accepts writes for the partition
    Primary,
}

impl ReplicaRole {
    /// Returns true for roles that are members of a configuration
    pub fn is_in_configuration(&self) -> bool {
        *self >= ReplicaRole::Secondary
    }
}

/// Lifecycle state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    /// Placed but not yet created on the node
    InCreate,
    /// Being built by copying state from the primary
    InBuild,
    /// Closed but its state is retained on disk
    Standby,
    /// Fully caught up
    Ready,
    /// Being dropped
    InDrop,
    /// Permanently gone
    Dropped,
}

/// Independent intent flags attached to a replica
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaFlags(u16);

impl ReplicaFlags {
    pub const TO_BE_DROPPED_BY_FM: ReplicaFlags = ReplicaFlags(1 << 0);
    pub const TO_BE_DROPPED_BY_PLB: ReplicaFlags = ReplicaFlags(1 << 1);
    pub const TO_BE_PROMOTED: ReplicaFlags = ReplicaFlags(1 << 2);
    pub const PENDING_REMOVE: ReplicaFlags = ReplicaFlags(1 << 3);
    pub const PREFERRED_PRIMARY_LOCATION: ReplicaFlags = ReplicaFlags(1 << 4);
    pub const PREFERRED_REPLICA_LOCATION: ReplicaFlags = ReplicaFlags(1 << 5);
    pub const PRIMARY_TO_BE_PLACED: ReplicaFlags = ReplicaFlags(1 << 6);
    pub const REPLICA_TO_BE_PLACED: ReplicaFlags = ReplicaFlags(1 << 7);
    pub const MOVE_IN_PROGRESS: ReplicaFlags = ReplicaFlags(1 << 8);
    pub const ENDPOINT_AVAILABLE: ReplicaFlags = ReplicaFlags(1 << 9);

    /// No flags set
    pub fn empty() -> Self {
        Self(0)
    }

    /// Raw bit representation
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Returns true if every bit of `other` is set
    pub fn contains(&self, other: ReplicaFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set
    pub fn intersects(&self, other: ReplicaFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: ReplicaFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ReplicaFlags) {
        self.0 &= !other.0;
    }

    /// Insert or remove `other` depending on `value`
    pub fn set(&mut self, other: ReplicaFlags, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl std::ops::BitOr for ReplicaFlags {
    type Output = ReplicaFlags;

    fn bitor(self, rhs: ReplicaFlags) -> ReplicaFlags {
        ReplicaFlags(self.0 | rhs.0)
    }
}

/// Index of a replica inside its owning failover unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaHandle(pub(crate) usize);

impl ReplicaHandle {
    /// Position of the replica in the failover unit's replica list
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A single replica of a failover unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    /// Node instance hosting the replica
    pub(crate) node: NodeInstance,
    /// Stable identifier of the replica within the partition
    pub(crate) replica_id: i64,
    /// Incarnation of the replica
    pub(crate) instance_id: i64,
    /// Role in the previous configuration
    pub(crate) previous_role: ReplicaRole,
    /// Role in the current configuration
    pub(crate) current_role: ReplicaRole,
    /// Whether the hosting node instance is up
    pub(crate) is_up: bool,
    /// Lifecycle state
    pub(crate) state: ReplicaState,
    /// Intent flags
    pub(crate) flags: ReplicaFlags,
    /// First sequence number the replica acknowledged
    pub(crate) first_acknowledged_lsn: i64,
    /// Last sequence number the replica acknowledged
    pub(crate) last_acknowledged_lsn: i64,
    /// Last time the replica changed
    pub(crate) last_updated: DateTime<Utc>,
}

impl Replica {
    /// Create a new up replica in `InCreate` state with no roles
    pub fn new(node: NodeInstance, replica_id: i64, instance_id: i64) -> Self {
        Self {
            node,
            replica_id,
            instance_id,
            previous_role: ReplicaRole::None,
            current_role: ReplicaRole::None,
            is_up: true,
            state: ReplicaState::InCreate,
            flags: ReplicaFlags::empty(),
            first_acknowledged_lsn: INVALID_LSN,
            last_acknowledged_lsn: INVALID_LSN,
            last_updated: Utc::now(),
        }
    }

    /// Set both configuration roles
    pub fn with_roles(mut self, previous: ReplicaRole, current: ReplicaRole) -> Self {
        self.previous_role = previous;
        self.current_role = current;
        self
    }

    /// Set the lifecycle state
    pub fn with_state(mut self, state: ReplicaState) -> Self {
        self.state = state;
        self
    }

    /// Set whether the replica is up
    pub fn with_up(mut self, is_up: bool) -> Self {
        self.is_up = is_up;
        self
    }

    /// Set intent flags
    pub fn with_flags(mut self, flags: ReplicaFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn node(&self) -> &NodeInstance {
        &self.node
    }

    pub fn replica_id(&self) -> i64 {
        self.replica_id
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn previous_role(&self) -> ReplicaRole {
        self.previous_role
    }

    pub fn current_role(&self) -> ReplicaRole {
        self.current_role
    }

    pub fn is_up(&self) -> bool {
        self.is_up
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn flags(&self) -> ReplicaFlags {
        self.flags
    }

    pub fn first_acknowledged_lsn(&self) -> i64 {
        self.first_acknowledged_lsn
    }

    pub fn last_acknowledged_lsn(&self) -> i64 {
        self.last_acknowledged_lsn
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Record a lifecycle state reported by the hosting node
    pub fn set_state(&mut self, state: ReplicaState) {
        if self.state != state {
            self.state = state;
            self.touch();
        }
    }

    /// Set or clear an intent flag
    ///
    /// Clearing a multi-bit mask removes whichever of its bits are set.
    pub fn set_flag(&mut self, flag: ReplicaFlags, value: bool) {
        let changes = if value {
            !self.flags.contains(flag)
        } else {
            self.flags.intersects(flag)
        };
        if changes {
            self.flags.set(flag, value);
            self.touch();
        }
    }

    /// Record the acknowledged sequence number range
    pub fn update_lsn(&mut self, first: i64, last: i64) {
        self.first_acknowledged_lsn = first;
        self.last_acknowledged_lsn = last;
    }

    pub(crate) fn set_previous_role(&mut self, role: ReplicaRole) {
        if self.previous_role != role {
            self.previous_role = role;
            self.touch();
        }
    }

    pub(crate) fn set_current_role(&mut self, role: ReplicaRole) {
        if self.current_role != role {
            self.current_role = role;
            self.touch();
        }
    }

    pub(crate) fn reset_lsn(&mut self) {
        self.update_lsn(INVALID_LSN, INVALID_LSN);
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn is_in_current_configuration(&self) -> bool {
        self.current_role.is_in_configuration()
    }

    pub fn is_in_previous_configuration(&self) -> bool {
        self.previous_role.is_in_configuration()
    }

    /// Member of either configuration
    pub fn is_in_configuration(&self) -> bool {
        self.is_in_current_configuration() || self.is_in_previous_configuration()
    }

    pub fn is_current_primary(&self) -> bool {
        self.current_role == ReplicaRole::Primary
    }

    pub fn is_previous_primary(&self) -> bool {
        self.previous_role == ReplicaRole::Primary
    }

    pub fn is_creating(&self) -> bool {
        self.state == ReplicaState::InCreate
    }

    pub fn is_in_build(&self) -> bool {
        self.state == ReplicaState::InBuild
    }

    pub fn is_standby(&self) -> bool {
        self.state == ReplicaState::Standby
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReplicaState::Ready
    }

    pub fn is_dropped(&self) -> bool {
        self.state == ReplicaState::Dropped
    }

    /// Up and fully caught up
    pub fn is_available(&self) -> bool {
        self.is_up && self.is_ready()
    }

    /// Down but may come back with its state
    pub fn is_offline(&self) -> bool {
        !self.is_up && !self.is_dropped()
    }

    /// Available and not scheduled to leave
    pub fn is_stable(&self) -> bool {
        self.is_available() && !self.is_to_be_dropped()
    }

    pub fn is_to_be_dropped(&self) -> bool {
        self.flags
            .intersects(ReplicaFlags::TO_BE_DROPPED_BY_FM | ReplicaFlags::TO_BE_DROPPED_BY_PLB)
    }

    pub fn is_to_be_promoted(&self) -> bool {
        self.flags.contains(ReplicaFlags::TO_BE_PROMOTED)
    }

    pub fn is_pending_remove(&self) -> bool {
        self.flags.contains(ReplicaFlags::PENDING_REMOVE)
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?}/{:?} {:?} {} flags={:#06x}",
            self.node,
            self.previous_role,
            self.current_role,
            self.state,
            if self.is_up { "U" } else { "D" },
            self.flags.bits()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica() -> Replica {
        Replica::new(NodeInstance::new("node1", 1), 1, 1)
    }

    #[test]
    fn test_new_replica() {
        let r = replica();
        assert!(r.is_up());
        assert!(r.is_creating());
        assert!(!r.is_in_configuration());
        assert_eq!(r.first_acknowledged_lsn(), INVALID_LSN);
    }

    #[test]
    fn test_role_predicates() {
        let r = replica().with_roles(ReplicaRole::Primary, ReplicaRole::Idle);
        assert!(r.is_in_previous_configuration());
        assert!(!r.is_in_current_configuration());
        assert!(r.is_previous_primary());
        assert!(r.is_in_configuration());
    }

    #[test]
    fn test_availability() {
        let ready = replica().with_state(ReplicaState::Ready);
        assert!(ready.is_available());
        assert!(ready.is_stable());

        let down = ready.clone().with_up(false);
        assert!(!down.is_available());
        assert!(down.is_offline());

        let dropped = down.with_state(ReplicaState::Dropped);
        assert!(!dropped.is_offline());
        assert!(dropped.is_dropped());
    }

    #[test]
    fn test_flags() {
        let mut r = replica().with_state(ReplicaState::Ready);
        r.set_flag(ReplicaFlags::TO_BE_DROPPED_BY_PLB, true);
        assert!(r.is_to_be_dropped());
        assert!(!r.is_stable());

        r.set_flag(ReplicaFlags::TO_BE_DROPPED_BY_PLB, false);
        r.set_flag(ReplicaFlags::TO_BE_PROMOTED, true);
        assert!(!r.is_to_be_dropped());
        assert!(r.is_to_be_promoted());
        assert_eq!(r.flags().bits(), ReplicaFlags::TO_BE_PROMOTED.bits());
    }

    #[test]
    fn test_clearing_combined_mask_removes_single_bit() {
        let both = ReplicaFlags::TO_BE_DROPPED_BY_FM | ReplicaFlags::TO_BE_DROPPED_BY_PLB;

        let mut r = replica().with_state(ReplicaState::Ready);
        r.set_flag(ReplicaFlags::TO_BE_DROPPED_BY_PLB, true);
        r.set_flag(ReplicaFlags::TO_BE_PROMOTED, true);
        r.set_flag(both, false);
        assert!(!r.is_to_be_dropped());
        assert!(r.is_to_be_promoted());

        r.set_flag(both, true);
        assert!(r.flags().contains(both));
        r.set_flag(both, false);
        assert_eq!(r.flags(), ReplicaFlags::TO_BE_PROMOTED);
    }
}
