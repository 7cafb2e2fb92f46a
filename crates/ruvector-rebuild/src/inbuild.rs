//! Merging failover unit uploads
//!
//! Every node uploads its local view of the failover units it hosts. For each
//! partition the most advanced view decides the configuration, while each
//! replica's own state comes from the report of the node hosting it:
//! - The winning view is the one with the highest current epoch, then the
//!   highest previous epoch, then the one reported by the primary
//! - Replicas in the winning view whose node never reported are marked down
//! - Replicas that reported themselves but are missing from the winning view
//!   join as idle

use crate::rpc::LfumUpload;
use crate::RebuildResult;
use ruvector_failover::{
    Epoch, FailoverError, FailoverUnit, NodeId, NodeInstance, PartitionId, Replica, ReplicaRole,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error};

/// One node's view of one failover unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverUnitReport {
    pub unit: FailoverUnit,

    /// Whether the reporting node hosts the current primary
    pub reporter_is_primary: bool,
}

impl FailoverUnitReport {
    pub fn new(unit: FailoverUnit, reporter_is_primary: bool) -> Self {
        Self {
            unit,
            reporter_is_primary,
        }
    }

    fn rank(&self) -> (Epoch, Epoch, bool) {
        (
            self.unit.current_epoch(),
            self.unit.previous_epoch(),
            self.reporter_is_primary,
        )
    }
}

/// Failover unit being reassembled from reports
#[derive(Debug)]
pub struct InBuildFailoverUnit {
    partition_id: PartitionId,
    best: Option<FailoverUnitReport>,
    /// Each node's own replica, from its latest report
    own: HashMap<NodeId, (NodeInstance, Replica)>,
}

impl InBuildFailoverUnit {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            best: None,
            own: HashMap::new(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Number of nodes that reported their own replica
    pub fn reporter_count(&self) -> usize {
        self.own.len()
    }

    /// Merge the report of `from`
    pub fn add(&mut self, report: FailoverUnitReport, from: &NodeInstance) -> RebuildResult<()> {
        if report.unit.partition_id() != self.partition_id {
            return Err(FailoverError::InvalidState(format!(
                "report for {} merged into {}",
                report.unit.partition_id(),
                self.partition_id
            ))
            .into());
        }

        if let Some(handle) = report.unit.find_replica(&from.id) {
            let replaces = match self.own.get(&from.id) {
                Some((known, _)) => from.instance_id >= known.instance_id,
                None => true,
            };
            if replaces {
                let replica = report.unit.replica(handle).clone();
                self.own.insert(from.id.clone(), (from.clone(), replica));
            }
        }

        let wins = match &self.best {
            Some(best) => report.rank() > best.rank(),
            None => true,
        };
        if wins {
            debug!(
                "Report from {} is the best view of {}: {}",
                from, self.partition_id, report.unit
            );
            self.best = Some(report);
        }

        Ok(())
    }

    /// Build the failover unit, or `None` if nothing was reported
    pub fn generate(&self) -> RebuildResult<Option<FailoverUnit>> {
        let best = match &self.best {
            Some(best) => best,
            None => return Ok(None),
        };

        let mut unit = best.unit.clone();
        let handles: Vec<_> = unit.handles().collect();
        for handle in handles {
            let configured = unit.replica(handle).clone();
            let merged = match self.own.get(&configured.node().id) {
                Some((_, own)) => with_configured_roles(own, &configured),
                None => configured.with_up(false),
            };
            *unit.replica_mut(handle) = merged;
        }

        let idle_previous = if unit.is_changing_configuration() {
            ReplicaRole::Idle
        } else {
            ReplicaRole::None
        };
        let mut missing: Vec<_> = self
            .own
            .iter()
            .filter(|(node_id, _)| best.unit.find_replica(node_id).is_none())
            .map(|(_, (_, replica))| replica)
            .collect();
        missing.sort_by(|a, b| a.node().cmp(b.node()));
        for own in missing {
            let idle = own.clone().with_roles(idle_previous, ReplicaRole::Idle);
            unit.add_replica(idle)?;
        }

        unit.verify_consistency()?;
        Ok(Some(unit))
    }
}

/// The replica as its node reported it, with roles from the winning view
fn with_configured_roles(own: &Replica, configured: &Replica) -> Replica {
    let mut merged = Replica::new(own.node().clone(), own.replica_id(), own.instance_id())
        .with_roles(configured.previous_role(), configured.current_role())
        .with_state(own.state())
        .with_up(own.is_up())
        .with_flags(own.flags());
    merged.update_lsn(own.first_acknowledged_lsn(), own.last_acknowledged_lsn());
    merged
}

/// All failover units being rebuilt
#[derive(Debug, Default)]
pub struct InBuildCache {
    units: HashMap<PartitionId, InBuildFailoverUnit>,
    any_replica_found: bool,
}

impl InBuildCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge every report of an upload
    pub fn add_upload(&mut self, upload: &LfumUpload) -> RebuildResult<()> {
        self.any_replica_found |= upload.any_replica_found;
        for report in &upload.reports {
            let id = report.unit.partition_id();
            self.units
                .entry(id)
                .or_insert_with(|| InBuildFailoverUnit::new(id))
                .add(report.clone(), &upload.node)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Whether any node reported a replica
    pub fn has_evidence(&self) -> bool {
        self.any_replica_found || !self.units.is_empty()
    }

    /// Build every failover unit, ordered by partition
    ///
    /// A partition whose reports cannot be merged is logged and skipped.
    pub fn generate(&self) -> Vec<FailoverUnit> {
        let mut ids: Vec<_> = self.units.keys().copied().collect();
        ids.sort();

        let mut generated = Vec::with_capacity(ids.len());
        for id in ids {
            match self.units[&id].generate() {
                Ok(Some(unit)) => generated.push(unit),
                Ok(None) => {}
                Err(e) => error!("Failed to rebuild failover unit {}: {}", id, e),
            }
        }
        generated
    }
}
