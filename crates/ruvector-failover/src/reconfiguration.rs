//! Reconfiguration state machine
//!
//! [`ReconfigurationTask`] inspects one locked failover unit, performs at most
//! one configuration transition and returns the actions the caller must send
//! to nodes. It is level-triggered: run it again whenever replica liveness,
//! placement flags, timers or node reports change. A run with no new input
//! leaves the unit untouched.

use crate::{
    config::FailoverConfig,
    epoch::Epoch,
    failover_unit::{elapsed_since, read_quorum_size, write_quorum_size, FailoverUnit},
    health::{HealthReport, HealthReportKind, HealthReporter, HealthSeverity},
    locked::LockedFailoverUnit,
    metrics::MetricsRecorder,
    node::{NodeId, NodeInstance, PartitionId},
    replica::{ReplicaFlags, ReplicaHandle, ReplicaRole, ReplicaState},
    Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Placement preference used as the last primary tie-break
pub trait PrimaryPromotionComparator: Send + Sync {
    /// `Greater` when `a` is the better host for the primary
    fn compare_node_for_promotion(
        &self,
        service_name: &str,
        partition_id: PartitionId,
        a: &NodeInstance,
        b: &NodeInstance,
    ) -> Ordering;
}

/// Comparator without placement preference
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPreference;

impl PrimaryPromotionComparator for NoPreference {
    fn compare_node_for_promotion(
        &self,
        _service_name: &str,
        _partition_id: PartitionId,
        _a: &NodeInstance,
        _b: &NodeInstance,
    ) -> Ordering {
        Ordering::Equal
    }
}

/// Work the caller must carry out after a task run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconfigurationAction {
    /// Ask the reconfiguration primary to drive the configuration to `epoch`
    DoReconfiguration { primary: NodeInstance, epoch: Epoch },
    /// Build a replica that is not caught up
    BuildReplica { node: NodeInstance },
    /// Create the primary of a new partition
    AddPrimary { node: NodeInstance },
    /// The partition moved to a new data loss version
    DataLoss { data_loss_version: i64 },
    QuorumLost,
    QuorumRestored,
    /// Offline replicas were given up on after the quorum loss wait
    OfflineReplicasDropped { nodes: Vec<NodeId> },
    /// Every bootstrap replica was removed; the cluster must rebuild
    BootstrapRebuildRequired,
}

/// Drives failover units towards a stable configuration
pub struct ReconfigurationTask {
    config: FailoverConfig,
    comparator: Arc<dyn PrimaryPromotionComparator>,
    health: Arc<dyn HealthReporter>,
}

impl ReconfigurationTask {
    pub fn new(
        config: FailoverConfig,
        comparator: Arc<dyn PrimaryPromotionComparator>,
        health: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            config,
            comparator,
            health,
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Run against the current time
    pub fn run(&self, locked: &mut LockedFailoverUnit) -> Result<Vec<ReconfigurationAction>> {
        self.run_at(locked, Utc::now())
    }

    /// Evaluate the unit at `now` and return the actions to send
    pub fn run_at(
        &self,
        locked: &mut LockedFailoverUnit,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReconfigurationAction>> {
        let fu = locked.enable_update()?;
        let mut actions = Vec::new();

        if fu.replica_count() == 0 || fu.is_to_be_deleted() {
            return Ok(actions);
        }

        if fu.is_creating_primary() {
            if fu.should_generate_action(now, &self.config) {
                if let Some(primary) = fu.primary() {
                    actions.push(ReconfigurationAction::AddPrimary {
                        node: fu.replica(primary).node().clone(),
                    });
                }
            }
            return Ok(actions);
        }

        let entry_epoch = fu.current_epoch();

        let mut acted = self.check_primary(fu, now, &mut actions);

        let primary_available = fu.primary().map(|h| fu.replica(h).is_available()).unwrap_or(false);
        if !acted
            && primary_available
            && !fu.is_changing_configuration()
            && !fu.has_pending_remove_idle_replica()
        {
            self.clear_drop_flags(fu);
            acted = self.reconfig_swap_primary(fu, now) || self.reconfig_secondary(fu, now);
        }

        acted |= self.build_sweep(fu, now, acted, &mut actions);

        self.check_data_loss(fu, entry_epoch, &mut actions);
        self.check_quorum_loss(fu, now, &mut actions);

        if acted {
            fu.record_action(now);
            if let Some(action) = do_reconfiguration(fu) {
                actions.push(action);
            }
        } else {
            let retries = pending_retries(fu);
            if !retries.is_empty() && fu.should_generate_action(now, &self.config) {
                actions.extend(retries);
            }
        }

        Ok(actions)
    }

    /// Close an in-flight reconfiguration after the primary reports it done
    ///
    /// Returns false when no reconfiguration was in flight.
    pub fn complete(&self, locked: &mut LockedFailoverUnit) -> Result<bool> {
        if !locked.get().is_changing_configuration() {
            return Ok(false);
        }

        let fu = locked.enable_update()?;
        fu.complete_reconfiguration();
        info!("{}: reconfiguration completed at {}", fu.partition_id(), fu.current_epoch());
        Ok(true)
    }

    fn check_primary(
        &self,
        fu: &mut FailoverUnit,
        now: DateTime<Utc>,
        actions: &mut Vec<ReconfigurationAction>,
    ) -> bool {
        if fu.current_configuration_size() == 0 {
            fu.recover_from_data_loss(&self.config, now);
            if fu.primary().is_none() {
                return false;
            }

            warn!("{}: recovered with no known configuration", fu.partition_id());
            actions.push(ReconfigurationAction::DataLoss {
                data_loss_version: fu.current_epoch().data_loss_version,
            });
            self.health.report_health(HealthReport::new(
                HealthReportKind::DataLoss,
                HealthSeverity::Warning,
                format!("{} recovered without a configuration", fu.partition_id()),
            ));
            return true;
        }

        let all_dropped = fu
            .replicas()
            .iter()
            .filter(|r| r.is_in_current_configuration())
            .all(|r| r.is_dropped());

        if all_dropped {
            if !fu.is_changing_configuration() {
                warn!("{}: every configuration member dropped", fu.partition_id());
                fu.clear_configuration(&self.config, now);
                return true;
            }

            let survivor = fu.replicas().iter().any(|r| {
                r.is_up() && r.is_in_previous_configuration() && !r.is_in_current_configuration()
            });
            if survivor && previous_configuration_has_quorum(fu) {
                warn!("{}: current configuration dropped, falling back to previous", fu.partition_id());
                fu.clear_current_configuration(&self.config, now);
                return true;
            }
            return false;
        }

        if fu.is_changing_configuration() {
            let mut swap_cleared = false;
            if fu.is_swapping_primary() {
                let previous_available = fu
                    .previous_primary()
                    .map(|h| fu.replica(h).is_available())
                    .unwrap_or(false);
                if !previous_available {
                    debug!("{}: swap source lost, new primary drives", fu.partition_id());
                    fu.set_swapping_primary(false);
                    swap_cleared = true;
                }
            }

            let needs_primary = match fu.primary() {
                Some(h) => {
                    let primary = fu.replica(h);
                    !primary.is_up() || primary.is_standby() || primary.is_dropped()
                }
                None => true,
            };
            return (needs_primary && self.reconfig_primary_while_changing(fu)) || swap_cleared;
        }

        match fu.primary() {
            Some(h) if fu.replica(h).is_creating() => false,
            Some(h) if fu.replica(h).is_available() => false,
            _ => self.reconfig_primary(fu, now),
        }
    }

    fn reconfig_primary(&self, fu: &mut FailoverUnit, now: DateTime<Utc>) -> bool {
        let size = fu.current_configuration_size();
        let offline = fu
            .replicas()
            .iter()
            .any(|r| r.is_in_current_configuration() && r.is_offline());
        if fu.current_up_count() < read_quorum_size(size) && offline {
            debug!("{}: primary cannot be replaced without quorum", fu.partition_id());
            return false;
        }

        let candidates: Vec<ReplicaHandle> = fu
            .handles()
            .filter(|&h| {
                let r = fu.replica(h);
                r.is_in_current_configuration() && r.is_up() && !r.is_dropped()
            })
            .collect();
        let new_primary = match self.best_for_primary(fu, &candidates) {
            Some(h) => h,
            None => return false,
        };

        let old_primary = fu.primary();
        fu.start_reconfiguration(true, now);

        let dropped: Vec<ReplicaHandle> = fu
            .handles()
            .filter(|&h| fu.replica(h).is_in_current_configuration() && fu.replica(h).is_dropped())
            .collect();
        for h in dropped {
            fu.remove_from_current_configuration(h);
        }

        if fu.replica(new_primary).is_standby() {
            fu.replica_mut(new_primary).set_state(ReplicaState::InBuild);
        }
        fu.swap_primary(new_primary);

        if let Some(old) = old_primary.filter(|&h| h != new_primary) {
            let old = fu.replica_mut(old);
            if !old.is_up() && !old.is_dropped() {
                old.set_flag(ReplicaFlags::PENDING_REMOVE, true);
            }
        }

        info!(
            "{}: primary moved to {} at {}",
            fu.partition_id(),
            fu.replica(new_primary).node(),
            fu.current_epoch()
        );
        MetricsRecorder::record_reconfiguration("primary");
        true
    }

    fn reconfig_primary_while_changing(&self, fu: &mut FailoverUnit) -> bool {
        if !previous_configuration_has_quorum(fu) {
            debug!("{}: previous configuration lost quorum", fu.partition_id());
            return false;
        }

        let previous_primary = fu
            .previous_primary()
            .filter(|&h| fu.replica(h).is_available());

        let new_primary = match previous_primary {
            Some(h) => h,
            None => {
                let candidates: Vec<ReplicaHandle> = fu
                    .handles()
                    .filter(|&h| {
                        let r = fu.replica(h);
                        r.is_in_current_configuration() && r.is_up() && !r.is_dropped()
                    })
                    .collect();
                match self.best_for_primary(fu, &candidates) {
                    Some(h) => h,
                    None => return false,
                }
            }
        };

        fu.update_epoch_for_configuration_change(true);
        if fu.replica(new_primary).is_standby() {
            fu.replica_mut(new_primary).set_state(ReplicaState::InBuild);
        }
        fu.swap_primary(new_primary);
        fu.set_swapping_primary(false);

        info!(
            "{}: reconfiguration primary replaced by {} at {}",
            fu.partition_id(),
            fu.replica(new_primary).node(),
            fu.current_epoch()
        );
        MetricsRecorder::record_reconfiguration("primary");
        true
    }

    fn best_for_primary(&self, fu: &FailoverUnit, candidates: &[ReplicaHandle]) -> Option<ReplicaHandle> {
        candidates.iter().copied().reduce(|best, h| {
            if self.compare_for_primary(fu, h, best) == Ordering::Greater {
                h
            } else {
                best
            }
        })
    }

    /// `Greater` when `a` should become primary rather than `b`
    fn compare_for_primary(&self, fu: &FailoverUnit, a: ReplicaHandle, b: ReplicaHandle) -> Ordering {
        let (ra, rb) = (fu.replica(a), fu.replica(b));
        ra.is_available()
            .cmp(&rb.is_available())
            .then(ra.is_current_primary().cmp(&rb.is_current_primary()))
            .then(ra.is_in_previous_configuration().cmp(&rb.is_in_previous_configuration()))
            .then((!ra.is_creating()).cmp(&!rb.is_creating()))
            .then_with(|| {
                self.comparator.compare_node_for_promotion(
                    fu.service_name(),
                    fu.partition_id(),
                    ra.node(),
                    rb.node(),
                )
            })
    }

    /// Withdraw drop requests that cannot be honoured
    fn clear_drop_flags(&self, fu: &mut FailoverUnit) {
        let drop_flags = ReplicaFlags::TO_BE_DROPPED_BY_FM | ReplicaFlags::TO_BE_DROPPED_BY_PLB;

        if let Some(primary) = fu.primary() {
            if fu.replica(primary).is_to_be_dropped() && !fu.to_be_promoted_replica_exists() {
                debug!("{}: no replacement for primary, keeping it", fu.partition_id());
                fu.replica_mut(primary).set_flag(drop_flags, false);
            }
        }

        let no_replacement = fu.potential_replica_count() == 0
            && fu.current_configuration_size() <= fu.target_replica_set_size();
        if no_replacement {
            let flagged: Vec<ReplicaHandle> = fu
                .handles()
                .filter(|&h| {
                    let r = fu.replica(h);
                    r.current_role() == ReplicaRole::Secondary && r.is_to_be_dropped()
                })
                .collect();
            for h in flagged {
                fu.replica_mut(h).set_flag(drop_flags, false);
            }
        }
    }

    fn reconfig_swap_primary(&self, fu: &mut FailoverUnit, now: DateTime<Utc>) -> bool {
        let candidate = fu.handles().find(|&h| {
            let r = fu.replica(h);
            r.current_role() == ReplicaRole::Secondary && r.is_to_be_promoted() && r.is_available()
        });
        let candidate = match candidate {
            Some(h) => h,
            None => return false,
        };

        let primary_available = fu.primary().map(|h| fu.replica(h).is_available()).unwrap_or(false);
        let building = fu.replicas().iter().any(|r| {
            r.is_up() && !r.is_to_be_dropped() && (r.is_in_build() || r.is_standby())
        });
        let write_quorum = fu.down_secondary_count() == 0
            || fu.current_up_count() >= write_quorum_size(fu.current_configuration_size());

        if !primary_available || building || !write_quorum {
            return false;
        }

        fu.start_reconfiguration(true, now);
        fu.set_swapping_primary(true);
        fu.swap_primary(candidate);

        info!(
            "{}: swapping primary to {} at {}",
            fu.partition_id(),
            fu.replica(candidate).node(),
            fu.current_epoch()
        );
        MetricsRecorder::record_reconfiguration("swap_primary");
        true
    }

    fn reconfig_secondary(&self, fu: &mut FailoverUnit, now: DateTime<Utc>) -> bool {
        if fu.is_stable() {
            return false;
        }

        let target = fu.target_replica_set_size();
        let mut removals: Vec<ReplicaHandle> = fu
            .handles()
            .filter(|&h| {
                let r = fu.replica(h);
                r.current_role() == ReplicaRole::Secondary && !r.is_up()
            })
            .collect();

        let mut healthy = healthy_member_count(fu);

        let mut idle: Vec<ReplicaHandle> = fu
            .handles()
            .filter(|&h| {
                let r = fu.replica(h);
                !r.is_in_current_configuration()
                    && r.is_up()
                    && r.is_ready()
                    && !r.is_to_be_dropped()
                    && !r.is_pending_remove()
            })
            .collect();
        idle.sort_by_key(|&h| !fu.replica(h).is_to_be_promoted());

        let mut additions = Vec::new();
        for h in idle {
            if healthy < target || fu.replica(h).is_to_be_promoted() {
                additions.push(h);
                healthy += 1;
            }
        }

        let mut size = fu.current_configuration_size() - removals.len() + additions.len();
        for h in fu.handles() {
            if size <= target {
                break;
            }
            let r = fu.replica(h);
            if r.current_role() == ReplicaRole::Secondary && r.is_up() && r.is_to_be_dropped() {
                removals.push(h);
                size -= 1;
            }
        }

        let pending_build = fu.replicas().iter().any(|r| {
            r.current_role() == ReplicaRole::Secondary && r.is_up() && r.is_in_build()
        });

        if removals.is_empty() && additions.is_empty() && !pending_build {
            return false;
        }

        fu.start_reconfiguration(false, now);
        for h in removals {
            fu.remove_from_current_configuration(h);
        }
        for h in additions {
            fu.set_current_role(h, ReplicaRole::Secondary);
        }

        info!("{}: secondary reconfiguration at {}", fu.partition_id(), fu.current_epoch());
        MetricsRecorder::record_reconfiguration("secondary");
        true
    }

    fn build_sweep(
        &self,
        fu: &mut FailoverUnit,
        now: DateTime<Utc>,
        transitioned: bool,
        actions: &mut Vec<ReconfigurationAction>,
    ) -> bool {
        let mut acted = false;

        if let Some(primary) = fu.primary() {
            if !transitioned && !fu.is_changing_configuration() && fu.replica(primary).is_creating() {
                if !fu.replica(primary).is_up() {
                    return false;
                }
                fu.replica_mut(primary).set_state(ReplicaState::InBuild);
                fu.start_reconfiguration(false, now);
                fu.set_previous_role(primary, ReplicaRole::None);

                info!("{}: creating primary on {}", fu.partition_id(), fu.replica(primary).node());
                actions.push(ReconfigurationAction::AddPrimary {
                    node: fu.replica(primary).node().clone(),
                });
                return true;
            }
        }

        let to_build: Vec<ReplicaHandle> = fu
            .handles()
            .filter(|&h| {
                let r = fu.replica(h);
                r.is_up()
                    && !r.is_current_primary()
                    && !r.is_dropped()
                    && !r.is_to_be_dropped()
                    && (r.is_creating() || r.is_standby())
            })
            .collect();

        for h in to_build {
            let replica = fu.replica_mut(h);
            replica.set_state(ReplicaState::InBuild);
            if replica.current_role() == ReplicaRole::None {
                fu.set_current_role(h, ReplicaRole::Idle);
            }

            debug!("{}: building {}", fu.partition_id(), fu.replica(h));
            actions.push(ReconfigurationAction::BuildReplica {
                node: fu.replica(h).node().clone(),
            });
            acted = true;
        }

        acted
    }

    fn check_data_loss(
        &self,
        fu: &mut FailoverUnit,
        entry_epoch: Epoch,
        actions: &mut Vec<ReconfigurationAction>,
    ) {
        let data_loss_version = fu.current_epoch().data_loss_version;
        if data_loss_version == entry_epoch.data_loss_version {
            return;
        }

        warn!(
            "{}: data loss, version {} -> {}",
            fu.partition_id(),
            entry_epoch.data_loss_version,
            data_loss_version
        );
        MetricsRecorder::record_data_loss(fu.is_bootstrap());
        self.health.report_health(HealthReport::new(
            HealthReportKind::DataLoss,
            HealthSeverity::Warning,
            format!("{} moved to data loss version {}", fu.partition_id(), data_loss_version),
        ));
        actions.push(ReconfigurationAction::DataLoss { data_loss_version });

        if fu.is_bootstrap() {
            fu.remove_all_replicas();
            actions.push(ReconfigurationAction::BootstrapRebuildRequired);
        }
    }

    fn check_quorum_loss(
        &self,
        fu: &mut FailoverUnit,
        now: DateTime<Utc>,
        actions: &mut Vec<ReconfigurationAction>,
    ) {
        if fu.is_quorum_lost() {
            let since = match fu.quorum_loss_since() {
                Some(since) => since,
                None => {
                    warn!("{}: quorum lost", fu.partition_id());
                    fu.set_quorum_loss_since(Some(now));
                    MetricsRecorder::record_quorum_loss(true);
                    self.health.report_health(HealthReport::new(
                        HealthReportKind::QuorumLoss,
                        HealthSeverity::Warning,
                        format!("{} lost quorum", fu.partition_id()),
                    ));
                    actions.push(ReconfigurationAction::QuorumLost);
                    now
                }
            };

            // The bootstrap partition recovers through a full rebuild instead.
            if fu.is_bootstrap() || elapsed_since(since, now) < fu.quorum_loss_wait_duration() {
                return;
            }

            let nodes = fu.drop_offline_replicas();
            if !nodes.is_empty() {
                warn!("{}: dropped offline replicas on {:?}", fu.partition_id(), nodes);
                self.health.report_health(HealthReport::new(
                    HealthReportKind::QuorumLoss,
                    HealthSeverity::Error,
                    format!("{} dropped offline replicas on {}", fu.partition_id(), nodes.join(",")),
                ));
                actions.push(ReconfigurationAction::OfflineReplicasDropped { nodes });
            }
        } else if fu.quorum_loss_since().is_some() {
            info!("{}: quorum restored", fu.partition_id());
            fu.set_quorum_loss_since(None);
            MetricsRecorder::record_quorum_loss(false);
            self.health.report_health(HealthReport::new(
                HealthReportKind::QuorumLoss,
                HealthSeverity::Ok,
                format!("{} quorum restored", fu.partition_id()),
            ));
            actions.push(ReconfigurationAction::QuorumRestored);
        }
    }
}

fn previous_configuration_has_quorum(fu: &FailoverUnit) -> bool {
    let offline = fu
        .replicas()
        .iter()
        .any(|r| r.is_in_previous_configuration() && r.is_offline());
    fu.previous_up_count() >= read_quorum_size(fu.previous_configuration_size()) || !offline
}

fn do_reconfiguration(fu: &FailoverUnit) -> Option<ReconfigurationAction> {
    if !fu.is_changing_configuration() || fu.is_creating_primary() {
        return None;
    }
    let primary = fu.reconfiguration_primary()?;
    Some(ReconfigurationAction::DoReconfiguration {
        primary: fu.replica(primary).node().clone(),
        epoch: fu.current_epoch(),
    })
}

/// Actions re-sent while the unit waits on nodes
fn pending_retries(fu: &FailoverUnit) -> Vec<ReconfigurationAction> {
    if fu.is_changing_configuration() {
        return do_reconfiguration(fu).into_iter().collect();
    }

    fu.replicas()
        .iter()
        .filter(|r| r.is_up() && r.is_in_build() && !r.is_in_configuration() && !r.is_to_be_dropped())
        .map(|r| ReconfigurationAction::BuildReplica { node: r.node().clone() })
        .collect()
}

/// Up current configuration members that are staying
fn healthy_member_count(fu: &FailoverUnit) -> usize {
    fu.replicas()
        .iter()
        .filter(|r| r.is_in_current_configuration() && r.is_up() && !r.is_to_be_dropped())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover_unit::tests::{add, config, stable_unit, unit};
    use crate::failover_unit::ServiceDescription;
    use crate::health::InMemoryHealthReporter;
    use crate::locked::{FailoverUnitMap, InMemoryStore};
    use crate::node::BOOTSTRAP_PARTITION_ID;
    use proptest::prelude::*;
    use std::time::Duration;
    use uuid::Uuid;
    use crate::replica::ReplicaRole::{Idle, None as N, Primary as P, Secondary as S};
    use crate::replica::ReplicaState::{Dropped as DD, InBuild as IB, Ready as RD, Standby as SB};

    struct Harness {
        task: ReconfigurationTask,
        health: Arc<InMemoryHealthReporter>,
        map: FailoverUnitMap,
        id: PartitionId,
    }

    impl Harness {
        fn new(fu: FailoverUnit) -> Self {
            let health = Arc::new(InMemoryHealthReporter::new());
            let task = ReconfigurationTask::new(config(), Arc::new(NoPreference), health.clone());
            let map = FailoverUnitMap::new(Arc::new(InMemoryStore::new()));
            let id = fu.partition_id();
            map.insert(fu).unwrap();
            Self { task, health, map, id }
        }

        fn run_at(&self, now: DateTime<Utc>) -> Vec<ReconfigurationAction> {
            let mut locked = self.map.lock(&self.id).unwrap();
            let actions = self.task.run_at(&mut locked, now).unwrap();
            locked.release().unwrap();
            actions
        }

        fn run(&self) -> Vec<ReconfigurationAction> {
            self.run_at(Utc::now())
        }

        fn complete(&self) -> bool {
            let mut locked = self.map.lock(&self.id).unwrap();
            self.task.complete(&mut locked).unwrap()
        }

        fn unit(&self) -> FailoverUnit {
            self.map.snapshot(&self.id).unwrap()
        }

        fn roles(&self) -> Vec<(ReplicaRole, ReplicaRole)> {
            self.unit()
                .replicas()
                .iter()
                .map(|r| (r.previous_role(), r.current_role()))
                .collect()
        }
    }

    /// Prefers the node with the larger id
    struct HighestNode;

    impl PrimaryPromotionComparator for HighestNode {
        fn compare_node_for_promotion(
            &self,
            _service_name: &str,
            _partition_id: PartitionId,
            a: &NodeInstance,
            b: &NodeInstance,
        ) -> Ordering {
            a.id.cmp(&b.id)
        }
    }

    fn h(index: usize) -> ReplicaHandle {
        ReplicaHandle(index)
    }

    #[test]
    fn test_stable_unit_is_left_alone() {
        let harness = Harness::new(stable_unit());
        assert!(harness.run().is_empty());
        assert_eq!(harness.unit().current_epoch(), Epoch::from_parts(1, 1, 1));
    }

    #[test]
    fn test_primary_down_promotes_secondary() {
        let mut fu = stable_unit();
        fu.on_replica_down(h(0), false);
        let harness = Harness::new(fu);

        let actions = harness.run();
        let fu = harness.unit();

        assert!(fu.is_changing_configuration());
        assert_eq!(fu.current_epoch(), Epoch::from_parts(1, 2, 2));
        assert_eq!(fu.primary(), Some(h(1)));
        let old = fu.replica(h(0));
        assert_eq!((old.previous_role(), old.current_role()), (P, S));
        assert!(old.is_pending_remove());
        assert_eq!(
            actions,
            vec![ReconfigurationAction::DoReconfiguration {
                primary: NodeInstance::new("1", 1),
                epoch: Epoch::from_parts(1, 2, 2),
            }]
        );
    }

    #[test]
    fn test_primary_choice_uses_comparator() {
        let mut fu = stable_unit();
        fu.on_replica_down(h(0), false);
        let health = Arc::new(InMemoryHealthReporter::new());
        let task = ReconfigurationTask::new(config(), Arc::new(HighestNode), health);
        let map = FailoverUnitMap::new(Arc::new(InMemoryStore::new()));
        let id = fu.partition_id();
        map.insert(fu).unwrap();

        let mut locked = map.lock(&id).unwrap();
        task.run(&mut locked).unwrap();
        assert_eq!(locked.get().primary(), Some(h(2)));
    }

    #[test]
    fn test_available_replica_preferred_over_standby() {
        let mut fu = unit(3);
        add(&mut fu, "0", N, P, RD, false);
        add(&mut fu, "1", N, S, SB, true);
        add(&mut fu, "2", N, S, RD, true);
        let harness = Harness::new(fu);

        harness.run();
        let fu = harness.unit();
        assert_eq!(fu.primary(), Some(h(2)));
        // the standby secondary is rebuilt by the sweep
        assert!(fu.replica(h(1)).is_in_build());
    }

    #[test]
    fn test_in_build_primary_restarts_with_standby_secondaries() {
        let mut fu = unit(3);
        add(&mut fu, "1", N, P, IB, true);
        add(&mut fu, "2", N, S, SB, true);
        add(&mut fu, "3", N, S, SB, true);
        let harness = Harness::new(fu);

        let actions = harness.run();
        let fu = harness.unit();

        assert_eq!(fu.current_epoch(), Epoch::from_parts(1, 2, 2));
        assert_eq!(harness.roles(), vec![(P, P), (S, S), (S, S)]);
        assert!(fu.replica(h(1)).is_in_build());
        assert!(fu.replica(h(2)).is_in_build());
        assert!(actions.contains(&ReconfigurationAction::DoReconfiguration {
            primary: NodeInstance::new("1", 1),
            epoch: Epoch::from_parts(1, 2, 2),
        }));
    }

    #[test]
    fn test_primary_not_replaced_without_quorum() {
        let mut fu = unit(3);
        add(&mut fu, "1", N, P, IB, true);
        add(&mut fu, "2", N, S, RD, false);
        add(&mut fu, "3", N, S, RD, false);
        let harness = Harness::new(fu);

        let actions = harness.run();
        assert_eq!(actions, vec![ReconfigurationAction::QuorumLost]);
        assert!(!harness.unit().is_changing_configuration());
        assert!(harness.unit().quorum_loss_since().is_some());
    }

    #[test]
    fn test_dropped_primary_leaves_configuration() {
        let mut fu = FailoverUnit::new(
            Uuid::new_v4(),
            ServiceDescription::new("svc", 3, 1).volatile(),
            &config(),
        );
        add(&mut fu, "0", N, P, RD, true);
        add(&mut fu, "2", N, S, RD, true);
        add(&mut fu, "3", N, Idle, IB, true);
        add(&mut fu, "4", N, S, RD, true);
        fu.on_replica_down(h(0), true);
        let harness = Harness::new(fu);

        harness.run();
        let fu = harness.unit();
        assert_eq!(fu.current_epoch(), Epoch::from_parts(1, 2, 2));
        assert_eq!(fu.replica(h(0)).current_role(), N);
        assert_eq!(fu.primary(), Some(h(1)));
        // volatile idle replicas are flagged for drop when the primary goes
        assert!(fu.replica(h(2)).flags().contains(ReplicaFlags::TO_BE_DROPPED_BY_FM));
    }

    #[test]
    fn test_new_primary_down_falls_back_to_previous_primary() {
        let mut fu = FailoverUnit::with_epochs(
            Uuid::new_v4(),
            ServiceDescription::new("svc", 3, 1),
            Epoch::from_parts(1, 1, 1),
            Epoch::from_parts(1, 2, 2),
        );
        add(&mut fu, "0", P, S, RD, true);
        add(&mut fu, "1", S, P, RD, true);
        add(&mut fu, "2", S, S, RD, true);
        fu.on_replica_down(h(1), true);
        let harness = Harness::new(fu);

        harness.run();
        let fu = harness.unit();
        assert_eq!(fu.current_epoch(), Epoch::from_parts(1, 3, 3));
        assert_eq!(harness.roles(), vec![(P, P), (S, S), (S, S)]);
    }

    #[test]
    fn test_swap_source_down_clears_swapping() {
        let mut fu = stable_unit();
        fu.replica_mut(h(1)).set_flag(ReplicaFlags::TO_BE_PROMOTED, true);
        let harness = Harness::new(fu);

        harness.run();
        let fu = harness.unit();
        assert!(fu.is_swapping_primary());
        assert_eq!(harness.roles(), vec![(P, S), (S, P), (S, S)]);
        assert_eq!(fu.reconfiguration_primary(), Some(h(0)));

        {
            let mut locked = harness.map.lock(&harness.id).unwrap();
            locked.enable_update().unwrap().on_replica_down(h(0), true);
        }

        let actions = harness.run();
        let fu = harness.unit();
        assert!(!fu.is_swapping_primary());
        assert_eq!(fu.current_epoch(), Epoch::from_parts(1, 2, 2));
        assert!(actions.contains(&ReconfigurationAction::DoReconfiguration {
            primary: NodeInstance::new("1", 1),
            epoch: Epoch::from_parts(1, 2, 2),
        }));
    }

    #[test]
    fn test_swap_blocked_by_standby_secondary() {
        let mut fu = stable_unit();
        fu.replica_mut(h(1)).set_flag(ReplicaFlags::TO_BE_PROMOTED, true);
        fu.replica_mut(h(2)).set_state(SB);
        let harness = Harness::new(fu);

        let actions = harness.run();
        let fu = harness.unit();
        assert!(!fu.is_changing_configuration());
        assert!(fu.replica(h(2)).is_in_build());
        assert_eq!(
            actions,
            vec![ReconfigurationAction::BuildReplica {
                node: NodeInstance::new("2", 1)
            }]
        );
    }

    #[test]
    fn test_idle_ready_replicas_join() {
        let mut fu = unit(3);
        add(&mut fu, "0", N, P, RD, true);
        add(&mut fu, "1", N, Idle, RD, true);
        add(&mut fu, "2", N, Idle, RD, true);
        let harness = Harness::new(fu);

        harness.run();
        assert_eq!(harness.unit().current_epoch(), Epoch::from_parts(1, 1, 2));
        assert_eq!(harness.roles(), vec![(P, P), (Idle, S), (Idle, S)]);
    }

    #[test]
    fn test_down_secondaries_leave() {
        let mut fu = stable_unit();
        add(&mut fu, "3", N, S, RD, true);
        fu.on_replica_down(h(1), true);
        fu.on_replica_down(h(2), false);
        let harness = Harness::new(fu);

        harness.run();
        let roles = harness.roles();
        assert_eq!(roles[1], (S, N));
        assert_eq!(roles[2], (S, Idle));
        assert_eq!(roles[3], (S, S));
    }

    #[test]
    fn test_move_secondary_with_ready_idle() {
        let mut fu = unit(3);
        add(&mut fu, "1", N, S, RD, true);
        add(&mut fu, "2", N, S, RD, true);
        add(&mut fu, "3", N, Idle, RD, true);
        add(&mut fu, "4", N, P, RD, true);
        fu.replica_mut(h(0)).set_flag(ReplicaFlags::TO_BE_DROPPED_BY_PLB, true);
        let harness = Harness::new(fu);

        harness.run();
        assert_eq!(harness.roles(), vec![(S, N), (S, S), (Idle, S), (P, P)]);
    }

    #[test]
    fn test_move_secondary_waits_for_idle_build() {
        let mut fu = unit(3);
        add(&mut fu, "1", N, S, RD, true);
        add(&mut fu, "2", N, S, RD, true);
        add(&mut fu, "3", N, Idle, IB, true);
        add(&mut fu, "4", N, P, RD, true);
        fu.replica_mut(h(0)).set_flag(ReplicaFlags::TO_BE_DROPPED_BY_PLB, true);
        let harness = Harness::new(fu);

        let actions = harness.run();
        let fu = harness.unit();
        assert!(!fu.is_changing_configuration());
        assert!(fu.replica(h(0)).is_to_be_dropped());
        assert_eq!(
            actions,
            vec![ReconfigurationAction::BuildReplica {
                node: NodeInstance::new("3", 1)
            }]
        );
    }

    #[test]
    fn test_extra_secondary_removed_only_when_flagged() {
        let mut fu = stable_unit();
        add(&mut fu, "3", N, S, RD, true);
        let harness = Harness::new(fu.clone());
        assert!(harness.run().is_empty());
        assert!(!harness.unit().is_changing_configuration());

        fu.replica_mut(h(2)).set_flag(ReplicaFlags::TO_BE_DROPPED_BY_PLB, true);
        let harness = Harness::new(fu);
        harness.run();
        assert_eq!(harness.roles()[2], (S, N));
    }

    #[test]
    fn test_drop_flag_cleared_without_replacement() {
        let mut fu = stable_unit();
        fu.replica_mut(h(2)).set_flag(ReplicaFlags::TO_BE_DROPPED_BY_PLB, true);
        fu.replica_mut(h(0)).set_flag(ReplicaFlags::TO_BE_DROPPED_BY_FM, true);
        let harness = Harness::new(fu);

        assert!(harness.run().is_empty());
        let fu = harness.unit();
        assert!(!fu.replica(h(0)).is_to_be_dropped());
        assert!(!fu.replica(h(2)).is_to_be_dropped());
        assert!(!fu.is_changing_configuration());
    }

    #[test]
    fn test_primary_drop_flag_kept_while_promotion_pending() {
        let mut fu = stable_unit();
        add(&mut fu, "3", N, Idle, RD, true);
        fu.replica_mut(h(0)).set_flag(ReplicaFlags::TO_BE_DROPPED_BY_PLB, true);
        fu.replica_mut(h(3)).set_flag(ReplicaFlags::TO_BE_PROMOTED, true);
        let harness = Harness::new(fu);

        harness.run();
        let fu = harness.unit();
        assert!(fu.replica(h(0)).is_to_be_dropped());
        assert_eq!(fu.current_epoch(), Epoch::from_parts(1, 1, 2));
        assert_eq!(harness.roles()[3], (Idle, S));
    }

    #[test]
    fn test_in_build_secondary_starts_reconfiguration() {
        let mut fu = unit(3);
        add(&mut fu, "0", N, P, RD, true);
        add(&mut fu, "1", N, S, RD, true);
        add(&mut fu, "2", N, S, IB, true);
        let harness = Harness::new(fu);

        harness.run();
        assert_eq!(harness.unit().current_epoch(), Epoch::from_parts(1, 1, 2));
    }

    #[test]
    fn test_creating_primary() {
        let mut fu = unit(1);
        fu.place_replica(NodeInstance::new("0", 1), P);
        let harness = Harness::new(fu);
        let now = Utc::now();

        let actions = harness.run_at(now);
        let node = NodeInstance::new("0", 1);
        assert_eq!(actions, vec![ReconfigurationAction::AddPrimary { node: node.clone() }]);

        let fu = harness.unit();
        assert!(fu.is_creating_primary());
        assert_eq!(fu.current_epoch(), Epoch::from_parts(1, 1, 2));

        // throttled until the retry interval passes
        assert!(harness.run_at(now + chrono::Duration::seconds(1)).is_empty());
        assert_eq!(
            harness.run_at(now + chrono::Duration::seconds(6)),
            vec![ReconfigurationAction::AddPrimary { node }]
        );

        assert!(harness.complete());
        let fu = harness.unit();
        assert!(!fu.is_changing_configuration());
        assert!(!harness.complete());
    }

    #[test]
    fn test_do_reconfiguration_is_throttled() {
        let mut fu = stable_unit();
        fu.on_replica_down(h(0), false);
        let harness = Harness::new(fu);
        let now = Utc::now();

        assert_eq!(harness.run_at(now).len(), 1);
        assert!(harness.run_at(now + chrono::Duration::seconds(2)).is_empty());
        assert_eq!(harness.run_at(now + chrono::Duration::seconds(8)).len(), 1);
    }

    #[test]
    fn test_second_run_is_a_fixed_point() {
        let mut fu = stable_unit();
        add(&mut fu, "3", N, Idle, RD, true);
        fu.on_replica_down(h(2), false);
        let harness = Harness::new(fu);
        let now = Utc::now();

        harness.run_at(now);
        let first = harness.unit().to_bytes().unwrap();
        harness.run_at(now);
        let second = harness.unit().to_bytes().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_all_members_dropped_recovers_with_data_loss() {
        let mut fu = FailoverUnit::with_epochs(
            Uuid::new_v4(),
            ServiceDescription::new("svc", 3, 1),
            Epoch::invalid(),
            Epoch::from_parts(1, 1, 1),
        );
        add(&mut fu, "0", N, P, DD, false);
        add(&mut fu, "1", N, S, DD, false);
        add(&mut fu, "2", N, Idle, SB, true);
        let harness = Harness::new(fu);

        let actions = harness.run();
        let fu = harness.unit();
        assert_eq!(fu.current_epoch().data_loss_version, 2);
        assert_eq!(fu.primary(), Some(h(2)));
        assert!(actions.contains(&ReconfigurationAction::DataLoss { data_loss_version: 2 }));
        assert!(harness.health.latest(HealthReportKind::DataLoss).is_some());
    }

    #[test]
    fn test_bootstrap_data_loss_removes_replicas() {
        let mut fu = FailoverUnit::with_epochs(
            BOOTSTRAP_PARTITION_ID,
            ServiceDescription::new("fm", 3, 1),
            Epoch::invalid(),
            Epoch::from_parts(1, 1, 1),
        );
        add(&mut fu, "0", N, P, DD, false);
        add(&mut fu, "1", N, Idle, SB, true);
        let harness = Harness::new(fu);

        let actions = harness.run();
        assert!(actions.contains(&ReconfigurationAction::BootstrapRebuildRequired));
        assert_eq!(harness.unit().replica_count(), 0);
    }

    #[test]
    fn test_empty_configuration_recovers() {
        let mut fu = unit(3);
        add(&mut fu, "0", N, Idle, SB, true);
        add(&mut fu, "1", N, Idle, SB, true);
        let harness = Harness::new(fu);

        let actions = harness.run();
        assert_eq!(harness.unit().primary(), Some(h(0)));
        assert!(matches!(actions[0], ReconfigurationAction::DataLoss { .. }));
    }

    fn quorum_loss_unit(id: PartitionId) -> FailoverUnit {
        let mut fu = FailoverUnit::new(
            id,
            ServiceDescription::new("svc", 3, 1).with_quorum_loss_wait(Duration::from_secs(60)),
            &config(),
        );
        add(&mut fu, "0", N, P, RD, true);
        add(&mut fu, "1", N, S, RD, false);
        add(&mut fu, "2", N, S, RD, false);
        fu
    }

    #[test]
    fn test_quorum_loss_wait_drops_offline_replicas() {
        let harness = Harness::new(quorum_loss_unit(Uuid::new_v4()));
        let t0 = Utc::now();

        let actions = harness.run_at(t0);
        assert!(actions.contains(&ReconfigurationAction::QuorumLost));
        assert_eq!(harness.unit().quorum_loss_since(), Some(t0));
        assert_eq!(
            harness.health.latest(HealthReportKind::QuorumLoss).unwrap().severity,
            HealthSeverity::Warning
        );

        let actions = harness.run_at(t0 + chrono::Duration::seconds(59));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ReconfigurationAction::OfflineReplicasDropped { .. })));
        assert_eq!(harness.unit().offline_replica_count(), 2);

        let actions = harness.run_at(t0 + chrono::Duration::seconds(61));
        assert!(actions.contains(&ReconfigurationAction::OfflineReplicasDropped {
            nodes: vec!["1".to_string(), "2".to_string()],
        }));
        assert_eq!(harness.unit().offline_replica_count(), 0);
    }

    #[test]
    fn test_bootstrap_partition_never_drops_offline_replicas() {
        let harness = Harness::new(quorum_loss_unit(BOOTSTRAP_PARTITION_ID));
        let t0 = Utc::now();

        harness.run_at(t0);
        let actions = harness.run_at(t0 + chrono::Duration::seconds(600));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ReconfigurationAction::OfflineReplicasDropped { .. })));
        assert_eq!(harness.unit().offline_replica_count(), 2);
    }

    #[test]
    fn test_quorum_restored() {
        let harness = Harness::new(quorum_loss_unit(Uuid::new_v4()));
        harness.run();

        {
            let mut locked = harness.map.lock(&harness.id).unwrap();
            let fu = locked.enable_update().unwrap();
            fu.on_replica_up(h(1), NodeInstance::new("1", 1));
        }

        let actions = harness.run();
        assert!(actions.contains(&ReconfigurationAction::QuorumRestored));
        assert!(harness.unit().quorum_loss_since().is_none());
        assert_eq!(
            harness.health.latest(HealthReportKind::QuorumLoss).unwrap().severity,
            HealthSeverity::Ok
        );
    }

    proptest! {
        #[test]
        fn prop_single_primary(
            up in proptest::collection::vec(any::<bool>(), 3..6),
            promote in 0usize..6,
        ) {
            let mut fu = unit(3);
            for (i, &is_up) in up.iter().enumerate() {
                let role = if i == 0 { P } else if i < 3 { S } else { Idle };
                add(&mut fu, &i.to_string(), N, role, RD, is_up);
            }
            if promote < up.len() {
                fu.replica_mut(h(promote)).set_flag(ReplicaFlags::TO_BE_PROMOTED, true);
            }
            let harness = Harness::new(fu);

            let now = Utc::now();
            for step in 0..4 {
                harness.run_at(now + chrono::Duration::seconds(step * 10));
                let fu = harness.unit();
                prop_assert!(fu.verify_consistency().is_ok());
                if fu.is_changing_configuration() && step % 2 == 1 {
                    harness.complete();
                }
            }
        }
    }
}
