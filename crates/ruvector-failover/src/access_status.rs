//! Read and write access status of a replica
//!
//! The status a replica hands out to its clients depends on where it is in a
//! reconfiguration:
//! - Promotion grants read once catchup completes, write only at completion
//! - Demotion revokes write before catchup and read after catchup completes
//! - Without a primary change, writes need a quorum of both configurations
//!
//! [`AccessStatus::GrantedIfQuorum`] is never cached: it is resolved against a
//! live [`QuorumView`] each time a client asks.

use crate::{
    failover_unit::{write_quorum_size, FailoverUnit},
    replica::ReplicaRole,
};
use serde::{Deserialize, Serialize};

/// Configurations whose write quorum is required
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuorumScope {
    /// Write quorum of the current configuration
    CurrentConfiguration,
    /// Write quorum of both the current and the previous configuration
    CurrentAndPreviousConfiguration,
}

/// Access granted to clients of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessStatus {
    /// Operations are allowed
    Granted,
    /// The replica is reconfiguring; retry later
    TryAgain,
    /// The replica is not the primary
    NotPrimary,
    /// Allowed only while the scope has a write quorum
    GrantedIfQuorum(QuorumScope),
    /// Resolved form of `GrantedIfQuorum` without a quorum
    NoWriteQuorum,
}

/// Live view of which configurations currently have a write quorum
pub trait QuorumView {
    fn has_write_quorum(&self, scope: QuorumScope) -> bool;
}

impl QuorumView for FailoverUnit {
    fn has_write_quorum(&self, scope: QuorumScope) -> bool {
        let current =
            self.current_up_count() >= write_quorum_size(self.current_configuration_size());

        match scope {
            QuorumScope::CurrentConfiguration => current,
            QuorumScope::CurrentAndPreviousConfiguration => {
                let previous_size = self.previous_configuration_size();
                current
                    && (previous_size == 0
                        || self.previous_up_count() >= write_quorum_size(previous_size))
            }
        }
    }
}

impl AccessStatus {
    /// Resolve `GrantedIfQuorum` against the live quorum
    pub fn resolve(&self, quorum: &dyn QuorumView) -> AccessStatus {
        match self {
            AccessStatus::GrantedIfQuorum(scope) => {
                if quorum.has_write_quorum(*scope) {
                    AccessStatus::Granted
                } else {
                    AccessStatus::NoWriteQuorum
                }
            }
            other => *other,
        }
    }
}

/// Why a replica is reconfiguring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconfigurationSituation {
    /// Not reconfiguring; only open/close matters
    LifeCycle,
    /// Secondary becoming primary
    PromoteToPrimary,
    /// Primary becoming secondary
    DemoteToSecondary,
    /// Primary stays primary while secondaries change
    NoPrimaryChange,
    /// Idle replica joining the configuration
    IdleToActive,
}

/// Progress of the reconfiguration on this replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconfigurationPhase {
    PreWriteStatusCatchup,
    TransitioningRole,
    CatchupInProgress,
    CatchupCompleted,
    Completed,
}

/// Local state of a replica that determines its access status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaAccessView {
    pub situation: ReconfigurationSituation,
    pub phase: ReconfigurationPhase,
    /// Whether the replica is open on its node
    pub is_open: bool,
    /// Role of the replica in its current configuration
    pub role: ReplicaRole,
}

/// Read and write status of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadWriteStatus {
    pub read: AccessStatus,
    pub write: AccessStatus,
}

impl ReadWriteStatus {
    pub fn new(read: AccessStatus, write: AccessStatus) -> Self {
        Self { read, write }
    }

    fn both(status: AccessStatus) -> Self {
        Self::new(status, status)
    }

    /// Resolve both statuses against the live quorum
    pub fn resolve(&self, quorum: &dyn QuorumView) -> ReadWriteStatus {
        Self::new(self.read.resolve(quorum), self.write.resolve(quorum))
    }
}

/// Compute the read and write status for a replica
pub fn compute_access_status(view: &ReplicaAccessView) -> ReadWriteStatus {
    use AccessStatus::*;
    use ReconfigurationPhase::*;
    use ReconfigurationSituation::*;

    let current = GrantedIfQuorum(QuorumScope::CurrentConfiguration);
    let both_configurations = GrantedIfQuorum(QuorumScope::CurrentAndPreviousConfiguration);

    match view.situation {
        LifeCycle => {
            let is_primary = view.role == ReplicaRole::Primary;
            match (view.is_open, is_primary) {
                (false, true) => ReadWriteStatus::both(TryAgain),
                (true, true) => ReadWriteStatus::new(Granted, current),
                (_, false) => ReadWriteStatus::both(NotPrimary),
            }
        }
        PromoteToPrimary => match view.phase {
            PreWriteStatusCatchup | TransitioningRole | CatchupInProgress => {
                ReadWriteStatus::both(TryAgain)
            }
            CatchupCompleted => ReadWriteStatus::new(Granted, TryAgain),
            Completed => ReadWriteStatus::new(Granted, current),
        },
        DemoteToSecondary => match view.phase {
            PreWriteStatusCatchup => ReadWriteStatus::new(Granted, both_configurations),
            CatchupInProgress => ReadWriteStatus::new(Granted, TryAgain),
            CatchupCompleted => ReadWriteStatus::both(TryAgain),
            TransitioningRole | Completed => ReadWriteStatus::both(NotPrimary),
        },
        NoPrimaryChange => match view.phase {
            Completed => ReadWriteStatus::new(Granted, current),
            _ => ReadWriteStatus::new(Granted, both_configurations),
        },
        IdleToActive => ReadWriteStatus::both(NotPrimary),
    }
}

/// Publishes access status only when it changes
#[derive(Debug, Clone)]
pub struct AccessStatusTracker {
    status: ReadWriteStatus,
}

impl Default for AccessStatusTracker {
    fn default() -> Self {
        Self {
            status: ReadWriteStatus::both(AccessStatus::NotPrimary),
        }
    }
}

impl AccessStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ReadWriteStatus {
        self.status
    }

    /// Store `status`, returning true if it differs from the last one
    pub fn try_update(&mut self, status: ReadWriteStatus) -> bool {
        if self.status == status {
            false
        } else {
            self.status = status;
            true
        }
    }

    /// Recompute from `view` and store the result
    pub fn update_from(&mut self, view: &ReplicaAccessView) -> bool {
        self.try_update(compute_access_status(view))
    }
}
