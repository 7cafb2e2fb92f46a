//! Failover unit model
//!
//! A failover unit is the replicated-state record of one partition:
//! - Ordered replicas, each with a previous and a current configuration role
//! - Current and previous configuration epochs
//! - Reconfiguration, quorum loss and deletion bookkeeping
//!
//! All mutating operations take `&mut self`. Outside this crate a mutable
//! failover unit is only reachable through
//! [`LockedFailoverUnit::enable_update`](crate::LockedFailoverUnit::enable_update).

use crate::{
    config::FailoverConfig,
    epoch::{Epoch, PRIMARY_EPOCH_MASK},
    node::{is_bootstrap_partition, NodeId, NodeInstance, PartitionId},
    replica::{Replica, ReplicaFlags, ReplicaHandle, ReplicaRole, ReplicaState, INVALID_LSN},
    FailoverError, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Number of up members needed to read from a configuration of `size`
pub fn read_quorum_size(size: usize) -> usize {
    (size + 1) / 2
}

/// Number of up members needed to write to a configuration of `size`
pub fn write_quorum_size(size: usize) -> usize {
    size / 2 + 1
}

/// Time elapsed between `since` and `now`, zero if `now` is earlier
pub fn elapsed_since(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Static description of the service owning a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    /// Service name
    pub name: String,
    /// Whether replicas keep their state across restarts
    pub has_persisted_state: bool,
    /// Desired number of configuration members
    pub target_replica_set_size: usize,
    /// Minimum number of available members for the partition to be ready
    pub min_replica_set_size: usize,
    /// How long quorum loss is tolerated before offline replicas are dropped
    pub quorum_loss_wait_duration: Duration,
}

impl ServiceDescription {
    /// Create a persisted service that waits indefinitely on quorum loss
    pub fn new(
        name: impl Into<String>,
        target_replica_set_size: usize,
        min_replica_set_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            has_persisted_state: true,
            target_replica_set_size,
            min_replica_set_size,
            quorum_loss_wait_duration: Duration::MAX,
        }
    }

    /// Mark the service as keeping its state in memory only
    pub fn volatile(mut self) -> Self {
        self.has_persisted_state = false;
        self
    }

    /// Set the quorum loss wait duration
    pub fn with_quorum_loss_wait(mut self, wait: Duration) -> Self {
        self.quorum_loss_wait_duration = wait;
        self
    }
}

/// Externally visible status of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    /// Enough available members
    Ready,
    /// Too few available members
    NotReady,
    /// Quorum of the configuration is down
    InQuorumLoss,
    /// A reconfiguration is in flight
    Reconfiguring,
    /// Partition is being deleted
    Deleting,
}

/// Replicated-state record of one partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverUnit {
    partition_id: PartitionId,
    service: ServiceDescription,
    current_epoch: Epoch,
    previous_epoch: Epoch,
    replicas: Vec<Replica>,
    is_swapping_primary: bool,
    is_to_be_deleted: bool,
    quorum_loss_since: Option<DateTime<Utc>>,
    reconfiguration_started_at: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
    update_version: u64,
    #[serde(skip)]
    last_action_at: Option<DateTime<Utc>>,
}

impl FailoverUnit {
    /// Create an empty failover unit at the initial epoch
    pub fn new(partition_id: PartitionId, service: ServiceDescription, config: &FailoverConfig) -> Self {
        let data_loss_version = if config.deterministic_data_loss_versions {
            1
        } else {
            Utc::now().timestamp_millis()
        };

        Self::with_epochs(
            partition_id,
            service,
            Epoch::invalid(),
            Epoch::new(data_loss_version, PRIMARY_EPOCH_MASK + 2),
        )
    }

    /// Create an empty failover unit at the given epochs
    pub fn with_epochs(
        partition_id: PartitionId,
        service: ServiceDescription,
        previous_epoch: Epoch,
        current_epoch: Epoch,
    ) -> Self {
        Self {
            partition_id,
            service,
            current_epoch,
            previous_epoch,
            replicas: Vec::new(),
            is_swapping_primary: false,
            is_to_be_deleted: false,
            quorum_loss_since: None,
            reconfiguration_started_at: None,
            last_updated: Utc::now(),
            update_version: 0,
            last_action_at: None,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn service(&self) -> &ServiceDescription {
        &self.service
    }

    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    pub fn has_persisted_state(&self) -> bool {
        self.service.has_persisted_state
    }

    pub fn target_replica_set_size(&self) -> usize {
        self.service.target_replica_set_size
    }

    pub fn min_replica_set_size(&self) -> usize {
        self.service.min_replica_set_size
    }

    pub fn quorum_loss_wait_duration(&self) -> Duration {
        self.service.quorum_loss_wait_duration
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn previous_epoch(&self) -> Epoch {
        self.previous_epoch
    }

    pub fn is_swapping_primary(&self) -> bool {
        self.is_swapping_primary
    }

    pub fn is_to_be_deleted(&self) -> bool {
        self.is_to_be_deleted
    }

    /// Mark the partition for deletion; the state machine stops acting on it
    pub fn mark_to_be_deleted(&mut self) {
        self.is_to_be_deleted = true;
    }

    /// When quorum loss was first observed
    pub fn quorum_loss_since(&self) -> Option<DateTime<Utc>> {
        self.quorum_loss_since
    }

    pub(crate) fn set_quorum_loss_since(&mut self, since: Option<DateTime<Utc>>) {
        self.quorum_loss_since = since;
    }

    pub fn reconfiguration_started_at(&self) -> Option<DateTime<Utc>> {
        self.reconfiguration_started_at
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn update_version(&self) -> u64 {
        self.update_version
    }

    /// Record a persisted update
    pub(crate) fn stamp_update(&mut self, now: DateTime<Utc>) {
        self.last_updated = now;
        self.update_version += 1;
    }

    pub fn is_bootstrap(&self) -> bool {
        is_bootstrap_partition(&self.partition_id)
    }

    /// True while the previous configuration is non-empty
    pub fn is_changing_configuration(&self) -> bool {
        self.previous_epoch.configuration_version > 0
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Handles of every replica, in order
    pub fn handles(&self) -> impl Iterator<Item = ReplicaHandle> {
        (0..self.replicas.len()).map(ReplicaHandle)
    }

    /// # Panics
    ///
    /// Panics if `handle` does not belong to this failover unit.
    pub fn replica(&self, handle: ReplicaHandle) -> &Replica {
        &self.replicas[handle.0]
    }

    /// Mutable access for node-reported state, flags and sequence numbers
    ///
    /// # Panics
    ///
    /// Panics if `handle` does not belong to this failover unit.
    pub fn replica_mut(&mut self, handle: ReplicaHandle) -> &mut Replica {
        &mut self.replicas[handle.0]
    }

    /// Find the replica hosted on `node_id`
    pub fn find_replica(&self, node_id: &str) -> Option<ReplicaHandle> {
        self.replicas
            .iter()
            .position(|r| r.node.id == node_id)
            .map(ReplicaHandle)
    }

    fn find(&self, predicate: impl Fn(&Replica) -> bool) -> Option<ReplicaHandle> {
        self.replicas.iter().position(predicate).map(ReplicaHandle)
    }

    fn count(&self, predicate: impl Fn(&Replica) -> bool) -> usize {
        self.replicas.iter().filter(|r| predicate(r)).count()
    }

    /// Current configuration primary
    pub fn primary(&self) -> Option<ReplicaHandle> {
        self.find(|r| r.is_current_primary())
    }

    /// Previous configuration primary
    pub fn previous_primary(&self) -> Option<ReplicaHandle> {
        self.find(|r| r.is_previous_primary())
    }

    /// Create a new replica on `node`
    ///
    /// A dropped replica on the same node is replaced in place.
    ///
    /// # Panics
    ///
    /// Panics if a replica that is not dropped already exists on the node.
    pub fn create_replica(&mut self, node: NodeInstance) -> ReplicaHandle {
        let replica_id = self.replicas.iter().map(|r| r.replica_id).max().unwrap_or(0) + 1;

        match self.find_replica(&node.id) {
            Some(handle) => {
                let existing = &self.replicas[handle.0];
                assert!(
                    existing.is_dropped(),
                    "{}: creating a replica on {} over live replica {}",
                    self.partition_id,
                    node,
                    existing
                );
                let instance_id = existing.instance_id + 1;
                self.replicas[handle.0] = Replica::new(node, replica_id, instance_id);
                handle
            }
            None => {
                self.replicas.push(Replica::new(node, replica_id, 1));
                ReplicaHandle(self.replicas.len() - 1)
            }
        }
    }

    /// Create a replica on `node` placed in `role` of the current configuration
    ///
    /// Placement uses `Primary` for a new primary and `Idle` for a replica
    /// that will join the configuration once built.
    ///
    /// # Panics
    ///
    /// Panics if a live replica exists on the node, or if `role` is `Primary`
    /// while another replica is primary.
    pub fn place_replica(&mut self, node: NodeInstance, role: ReplicaRole) -> ReplicaHandle {
        let handle = self.create_replica(node);
        self.set_current_role(handle, role);
        handle
    }

    /// Insert a fully described replica, as reported by a node
    pub fn add_replica(&mut self, replica: Replica) -> Result<ReplicaHandle> {
        if self.find_replica(&replica.node.id).is_some() {
            return Err(FailoverError::DuplicateReplica(replica.node.id.clone()));
        }

        if replica.is_current_primary() && self.primary().is_some() {
            return Err(FailoverError::InvalidState(format!(
                "{}: a current primary already exists, cannot add {}",
                self.partition_id, replica
            )));
        }

        self.replicas.push(replica);
        Ok(ReplicaHandle(self.replicas.len() - 1))
    }

    /// # Panics
    ///
    /// Panics if another replica already holds the current primary role.
    pub(crate) fn set_current_role(&mut self, handle: ReplicaHandle, role: ReplicaRole) {
        if role == ReplicaRole::Primary {
            if let Some(primary) = self.primary() {
                assert!(
                    primary == handle,
                    "{}: second current primary {} while {} is primary",
                    self.partition_id,
                    self.replicas[handle.0],
                    self.replicas[primary.0]
                );
            }
        }
        self.replicas[handle.0].set_current_role(role);
    }

    pub(crate) fn set_previous_role(&mut self, handle: ReplicaHandle, role: ReplicaRole) {
        self.replicas[handle.0].set_previous_role(role);
    }

    pub(crate) fn set_swapping_primary(&mut self, value: bool) {
        self.is_swapping_primary = value;
    }

    pub fn current_configuration_size(&self) -> usize {
        self.count(|r| r.is_in_current_configuration())
    }

    pub fn previous_configuration_size(&self) -> usize {
        self.count(|r| r.is_in_previous_configuration())
    }

    pub fn current_up_count(&self) -> usize {
        self.count(|r| r.is_in_current_configuration() && r.is_up)
    }

    pub fn previous_up_count(&self) -> usize {
        self.count(|r| r.is_in_previous_configuration() && r.is_up)
    }

    pub fn current_available_count(&self) -> usize {
        self.count(|r| r.is_in_current_configuration() && r.is_available())
    }

    /// Current configuration members that are up but not caught up
    pub fn current_in_build_or_standby_count(&self) -> usize {
        self.count(|r| {
            r.is_in_current_configuration() && r.is_up && (r.is_in_build() || r.is_standby())
        })
    }

    /// Current configuration secondaries whose node is down
    pub fn down_secondary_count(&self) -> usize {
        self.count(|r| r.current_role == ReplicaRole::Secondary && !r.is_up)
    }

    pub fn up_replica_count(&self) -> usize {
        self.count(|r| r.is_up)
    }

    pub fn available_replica_count(&self) -> usize {
        self.count(|r| r.is_available())
    }

    pub fn offline_replica_count(&self) -> usize {
        self.count(|r| r.is_offline())
    }

    /// Up replicas that could still join the current configuration
    pub fn potential_replica_count(&self) -> usize {
        self.count(|r| {
            r.is_up && !r.is_in_current_configuration() && !r.is_to_be_dropped() && !r.is_dropped()
        })
    }

    pub fn has_pending_remove_idle_replica(&self) -> bool {
        self.replicas
            .iter()
            .any(|r| r.is_pending_remove() && !r.is_in_configuration())
    }

    pub fn to_be_promoted_replica_exists(&self) -> bool {
        self.replicas.iter().any(|r| r.is_to_be_promoted())
    }

    /// Primary driving the in-flight reconfiguration
    ///
    /// While swapping, the previous primary keeps driving as long as it is
    /// available.
    pub fn reconfiguration_primary(&self) -> Option<ReplicaHandle> {
        if self.is_swapping_primary {
            if let Some(previous) = self.previous_primary() {
                if self.replicas[previous.0].is_available() {
                    return Some(previous);
                }
            }
        }
        self.primary()
    }

    pub fn is_reconfiguration_primary_available(&self) -> bool {
        self.reconfiguration_primary()
            .map(|h| self.replicas[h.0].is_available())
            .unwrap_or(false)
    }

    /// A newly placed primary that has not finished building
    pub fn is_creating_primary(&self) -> bool {
        match self.primary() {
            Some(primary) => {
                let primary = &self.replicas[primary.0];
                primary.is_up
                    && primary.is_in_build()
                    && self.previous_configuration_size() == 0
                    && self.is_changing_configuration()
            }
            None => false,
        }
    }

    /// True when the partition cannot currently make progress
    pub fn is_quorum_lost(&self) -> bool {
        let current_size = self.current_configuration_size();
        if !self.has_persisted_state() || current_size == 0 {
            return false;
        }

        if self.current_up_count() < write_quorum_size(current_size) {
            return true;
        }

        self.is_changing_configuration()
            && self.previous_up_count() < read_quorum_size(self.previous_configuration_size())
    }

    /// Converged at target size with every member available
    pub fn is_stable(&self) -> bool {
        let target = self.target_replica_set_size();
        let stable = self.count(|r| r.is_in_current_configuration() && r.is_stable());

        !self.is_changing_configuration()
            && stable == target
            && self.current_available_count() == target
            && self.down_secondary_count() == 0
            && !self.to_be_promoted_replica_exists()
    }

    pub fn partition_status(&self) -> PartitionStatus {
        if self.is_to_be_deleted {
            PartitionStatus::Deleting
        } else if self.is_quorum_lost() {
            PartitionStatus::InQuorumLoss
        } else if self.is_changing_configuration() {
            PartitionStatus::Reconfiguring
        } else if self.current_available_count() >= self.min_replica_set_size() {
            PartitionStatus::Ready
        } else {
            PartitionStatus::NotReady
        }
    }

    /// Move `new_primary` into the current primary role
    ///
    /// The old current primary, if any, becomes a secondary.
    pub fn swap_primary(&mut self, new_primary: ReplicaHandle) {
        let old_primary = self.primary();
        if old_primary == Some(new_primary) {
            return;
        }

        if let Some(old) = old_primary {
            self.replicas[old.0].set_current_role(ReplicaRole::Secondary);
        }
        self.set_current_role(new_primary, ReplicaRole::Primary);
    }

    /// Take a replica out of the current configuration
    ///
    /// Persisted replicas that are merely down stay known as idle.
    pub fn remove_from_current_configuration(&mut self, handle: ReplicaHandle) {
        let has_persisted_state = self.has_persisted_state();
        let replica = &mut self.replicas[handle.0];
        replica.set_flag(ReplicaFlags::PENDING_REMOVE, false);

        let role = if has_persisted_state && !replica.is_up && !replica.is_dropped() {
            ReplicaRole::Idle
        } else {
            ReplicaRole::None
        };
        replica.set_current_role(role);
    }

    pub fn update_epoch_for_configuration_change(&mut self, is_primary_change: bool) {
        let mut configuration_version = self.current_epoch.configuration_version + 1;
        if is_primary_change {
            configuration_version += PRIMARY_EPOCH_MASK + 1;
        }

        self.current_epoch = Epoch::new(self.current_epoch.data_loss_version, configuration_version);

        if is_primary_change {
            self.reset_lsn();
        }
    }

    pub fn update_epoch_for_data_loss(&mut self, config: &FailoverConfig, now: DateTime<Utc>) {
        let next = self.current_epoch.data_loss_version + 1;
        let data_loss_version = if config.deterministic_data_loss_versions {
            next
        } else {
            now.timestamp_millis().max(next)
        };

        self.current_epoch = Epoch::new(data_loss_version, self.current_epoch.configuration_version);
    }

    /// Snapshot the current configuration as previous and bump the epoch
    ///
    /// # Panics
    ///
    /// Panics if a reconfiguration is already in flight.
    pub fn start_reconfiguration(&mut self, is_primary_change: bool, now: DateTime<Utc>) {
        assert!(
            !self.is_changing_configuration(),
            "{}: previous configuration not empty when starting reconfiguration",
            self
        );

        let data_loss_version = if self.previous_epoch.is_valid() {
            self.previous_epoch.data_loss_version
        } else {
            self.current_epoch.data_loss_version
        };
        self.previous_epoch = Epoch::new(data_loss_version, self.current_epoch.configuration_version);

        for replica in &mut self.replicas {
            let role = replica.current_role;
            replica.set_previous_role(role);
        }

        self.update_epoch_for_configuration_change(is_primary_change);
        self.reconfiguration_started_at = Some(now);

        debug!(
            "{}: reconfiguration started {} -> {}",
            self.partition_id, self.previous_epoch, self.current_epoch
        );
    }

    /// Collapse the previous configuration into the current one
    ///
    /// # Panics
    ///
    /// Panics if no reconfiguration is in flight.
    pub fn complete_reconfiguration(&mut self) {
        assert!(
            self.is_changing_configuration(),
            "{}: not changing configuration",
            self
        );

        let primary_available = self
            .primary()
            .map(|h| self.replicas[h.0].is_available())
            .unwrap_or(false);

        if primary_available
            || self.previous_epoch.data_loss_version == self.current_epoch.data_loss_version
        {
            self.previous_epoch = Epoch::invalid();
        } else {
            self.previous_epoch = Epoch::new(self.previous_epoch.data_loss_version, 0);
        }

        self.is_swapping_primary = false;

        for index in 0..self.replicas.len() {
            let handle = ReplicaHandle(index);
            let replica = &self.replicas[index];

            if replica.current_role == ReplicaRole::None {
                self.on_replica_down(handle, true);
            } else if replica.is_current_primary() {
                let replica = &mut self.replicas[index];
                replica.set_flag(ReplicaFlags::TO_BE_PROMOTED, false);
                if replica.flags.contains(ReplicaFlags::PRIMARY_TO_BE_PLACED) {
                    replica.set_flag(ReplicaFlags::PREFERRED_PRIMARY_LOCATION, false);
                    replica.set_flag(ReplicaFlags::PRIMARY_TO_BE_PLACED, false);
                }
            } else if replica.is_available() {
                let replica = &mut self.replicas[index];
                replica.set_flag(ReplicaFlags::PREFERRED_REPLICA_LOCATION, false);
                replica.set_flag(ReplicaFlags::REPLICA_TO_BE_PLACED, false);
            }

            let replica = &mut self.replicas[index];
            replica.set_previous_role(ReplicaRole::None);
            replica.set_flag(ReplicaFlags::ENDPOINT_AVAILABLE, false);
        }

        self.reset_lsn();

        debug!(
            "{}: reconfiguration completed at {}",
            self.partition_id, self.current_epoch
        );
    }

    /// Elect a primary among the surviving replicas after data loss
    pub fn recover_from_data_loss(&mut self, config: &FailoverConfig, now: DateTime<Utc>) {
        if !self.has_persisted_state() {
            return;
        }

        if self.offline_replica_count() > 0
            && elapsed_since(self.last_updated, now) < config.recover_on_data_loss_wait_duration
        {
            return;
        }

        let mut primary_selected = false;
        for replica in self.replicas.iter_mut().filter(|r| r.is_up) {
            if primary_selected {
                replica.set_current_role(ReplicaRole::Secondary);
            } else {
                replica.set_current_role(ReplicaRole::Primary);
                replica.set_state(ReplicaState::InBuild);
                primary_selected = true;
            }
        }
    }

    /// Reset a configuration whose members have all been dropped
    ///
    /// # Panics
    ///
    /// Panics if a configuration member is not dropped.
    pub fn clear_configuration(&mut self, config: &FailoverConfig, now: DateTime<Utc>) {
        if self.is_changing_configuration() {
            self.complete_reconfiguration();
        }

        for replica in &mut self.replicas {
            if replica.is_in_configuration() {
                assert!(
                    replica.is_dropped(),
                    "{}: clearing configuration with live member {}",
                    self.partition_id,
                    replica
                );
                replica.set_current_role(ReplicaRole::None);
            }
        }

        self.recover_from_data_loss(config, now);

        self.previous_epoch = Epoch::new(self.current_epoch.data_loss_version, 0);
        self.update_epoch_for_data_loss(config, now);
    }

    pub fn clear_previous_configuration(&mut self) {
        self.previous_epoch = Epoch::new(self.retained_previous_data_loss_version(), 0);

        for replica in &mut self.replicas {
            replica.set_previous_role(ReplicaRole::None);
        }
    }

    /// Rebuild the current configuration from the previous one
    ///
    /// Used mid-reconfiguration when every current member has been dropped
    /// but the previous configuration survives.
    ///
    /// # Panics
    ///
    /// Panics if no up previous configuration member can become primary.
    pub fn clear_current_configuration(&mut self, config: &FailoverConfig, now: DateTime<Utc>) {
        self.update_epoch_for_data_loss(config, now);

        let mut new_primary: Option<ReplicaHandle> = None;
        let mut found_primary = false;

        for index in 0..self.replicas.len() {
            let replica = &mut self.replicas[index];
            if !replica.is_in_current_configuration()
                && replica.is_in_previous_configuration()
                && replica.is_up
            {
                if replica.is_previous_primary() {
                    found_primary = true;
                    new_primary = Some(ReplicaHandle(index));
                } else if !found_primary && (new_primary.is_none() || replica.is_available()) {
                    new_primary = Some(ReplicaHandle(index));
                }

                replica.set_current_role(ReplicaRole::Secondary);
            }
        }

        let new_primary = match new_primary {
            Some(handle) => handle,
            None => panic!("{}: clearing current configuration without a primary", self),
        };

        self.update_epoch_for_configuration_change(true);
        self.swap_primary(new_primary);
    }

    /// Drop every replica of the bootstrap partition ahead of a full rebuild
    ///
    /// # Panics
    ///
    /// Panics if called for any other partition.
    pub fn remove_all_replicas(&mut self) {
        assert!(
            self.is_bootstrap(),
            "{}: only the bootstrap partition can remove all replicas",
            self.partition_id
        );

        for index in 0..self.replicas.len() {
            self.on_replica_down(ReplicaHandle(index), true);
        }
        self.replicas.clear();

        self.previous_epoch = Epoch::new(self.retained_previous_data_loss_version(), 0);
    }

    fn retained_previous_data_loss_version(&self) -> i64 {
        if self.previous_epoch.data_loss_version == self.current_epoch.data_loss_version {
            0
        } else {
            self.previous_epoch.data_loss_version
        }
    }

    /// Record that a replica's node went down, or that the replica was dropped
    pub fn on_replica_down(&mut self, handle: ReplicaHandle, is_dropped: bool) {
        let is_dropped = is_dropped || !self.has_persisted_state();
        let primary_available = self.is_reconfiguration_primary_available();

        let replica = &mut self.replicas[handle.0];
        let dropped_state_changed = is_dropped && !replica.is_dropped();
        let mut primary_down = false;

        if replica.is_up {
            replica.is_up = false;

            if replica.first_acknowledged_lsn != INVALID_LSN {
                replica.first_acknowledged_lsn = 0;
            }

            if primary_available && replica.current_role != ReplicaRole::None {
                replica.set_flag(ReplicaFlags::PENDING_REMOVE, true);
            }

            primary_down = replica.is_current_primary() || replica.is_previous_primary();
        } else if dropped_state_changed && replica.is_in_current_configuration() && primary_available {
            replica.set_flag(ReplicaFlags::PENDING_REMOVE, true);
        }

        if dropped_state_changed {
            replica.set_state(ReplicaState::Dropped);
            if !replica.is_in_configuration() {
                replica.set_current_role(ReplicaRole::None);
                replica.set_previous_role(ReplicaRole::None);
            }
        }

        if primary_down {
            self.on_primary_down();
        }
    }

    /// Shorthand for `on_replica_down(handle, true)`
    pub fn on_replica_dropped(&mut self, handle: ReplicaHandle) {
        self.on_replica_down(handle, true);
    }

    fn on_primary_down(&mut self) {
        let has_persisted_state = self.has_persisted_state();

        for replica in &mut self.replicas {
            if !replica.is_in_configuration() {
                if has_persisted_state {
                    if replica.is_ready() {
                        replica.set_state(ReplicaState::InBuild);
                    }
                } else {
                    replica.set_flag(ReplicaFlags::TO_BE_DROPPED_BY_FM, true);
                }
                replica.set_flag(ReplicaFlags::PENDING_REMOVE, false);
            }
            replica.set_flag(ReplicaFlags::TO_BE_PROMOTED, false);
        }
    }

    /// Record that `node` hosts the replica again
    ///
    /// Returns false for reports from an older instance of the node.
    pub fn on_replica_up(&mut self, handle: ReplicaHandle, node: NodeInstance) -> bool {
        let replica = &mut self.replicas[handle.0];
        if node.instance_id < replica.node.instance_id || replica.is_dropped() {
            return false;
        }

        if !replica.is_up || replica.node != node {
            replica.is_up = true;
            replica.node = node;
            replica.last_updated = Utc::now();
        }
        true
    }

    /// Drop every replica that is down but not yet dropped
    pub fn drop_offline_replicas(&mut self) -> Vec<NodeId> {
        let mut dropped = Vec::new();
        for index in 0..self.replicas.len() {
            if self.replicas[index].is_offline() {
                dropped.push(self.replicas[index].node.id.clone());
                self.on_replica_dropped(ReplicaHandle(index));
            }
        }
        dropped
    }

    pub fn reset_lsn(&mut self) {
        for replica in &mut self.replicas {
            replica.reset_lsn();
        }
    }

    /// Whether an action may be emitted now without flooding nodes
    pub fn can_generate_action(&self, now: DateTime<Utc>, config: &FailoverConfig) -> bool {
        let interval = if elapsed_since(self.last_updated, now) > config.max_action_retry_interval {
            config.max_action_retry_interval
        } else {
            config.min_action_retry_interval
        };

        match self.last_action_at {
            Some(last) => elapsed_since(last, now) > interval,
            None => true,
        }
    }

    /// Remember that an action was just sent
    pub(crate) fn record_action(&mut self, now: DateTime<Utc>) {
        self.last_action_at = Some(now);
    }

    /// Like [`can_generate_action`](Self::can_generate_action), recording the attempt
    pub fn should_generate_action(&mut self, now: DateTime<Utc>, config: &FailoverConfig) -> bool {
        if self.can_generate_action(now, config) {
            self.record_action(now);
            true
        } else {
            false
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, bincode::error::EncodeError> {
        use bincode::config;
        bincode::encode_to_vec(bincode::serde::Compat(self), config::standard())
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, bincode::error::DecodeError> {
        use bincode::config;
        let (compat, _): (bincode::serde::Compat<Self>, _) =
            bincode::decode_from_slice(bytes, config::standard())?;
        Ok(compat.0)
    }

    /// Check structural invariants
    pub fn verify_consistency(&self) -> Result<()> {
        if self.count(|r| r.is_current_primary()) > 1 {
            return Err(FailoverError::InvalidState(format!(
                "{}: more than one current primary",
                self
            )));
        }

        if self.count(|r| r.is_previous_primary()) > 1 {
            return Err(FailoverError::InvalidState(format!(
                "{}: more than one previous primary",
                self
            )));
        }

        if !self.is_changing_configuration()
            && self.replicas.iter().any(|r| r.previous_role != ReplicaRole::None)
        {
            return Err(FailoverError::InvalidState(format!(
                "{}: previous roles present outside of reconfiguration",
                self
            )));
        }

        Ok(())
    }
}

impl fmt::Display for FailoverUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}{}",
            self.partition_id,
            self.previous_epoch,
            self.current_epoch,
            if self.is_swapping_primary { " SW" } else { "" }
        )?;
        for replica in &self.replicas {
            write!(f, " [{}]", replica)?;
        }
        Ok(())
    }
}
