//! Failover and reconfiguration core for ruvector partitions
//!
//! This crate provides the replicated-state model and the logic that keeps it
//! converged:
//! - Replica and failover unit records with configuration epochs
//! - A reconfiguration state machine that replaces primaries, swaps them on
//!   request, grows and shrinks the secondary set and tracks quorum loss
//! - Locked, persisted access to failover units and per-partition job queues
//! - Read/write access status for replicas during role changes
//!
//! # Examples
//!
//! ```no_run
//! use ruvector_failover::{
//!     FailoverConfig, FailoverUnit, FailoverUnitMap, InMemoryStore, NoPreference, NodeInstance,
//!     ReconfigurationTask, ReplicaRole, ServiceDescription, TracingHealthReporter,
//! };
//! use std::sync::Arc;
//!
//! fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FailoverConfig::default();
//!     let map = FailoverUnitMap::new(Arc::new(InMemoryStore::new()));
//!
//!     // Place the primary of a new partition
//!     let mut unit = FailoverUnit::new(
//!         uuid::Uuid::new_v4(),
//!         ServiceDescription::new("vectors", 3, 2),
//!         &config,
//!     );
//!     unit.place_replica(NodeInstance::new("node-1", 1), ReplicaRole::Primary);
//!     let id = unit.partition_id();
//!     map.insert(unit)?;
//!
//!     // Let the state machine decide what to do
//!     let task = ReconfigurationTask::new(
//!         config,
//!         Arc::new(NoPreference),
//!         Arc::new(TracingHealthReporter),
//!     );
//!     let mut locked = map.lock(&id)?;
//!     for action in task.run(&mut locked)? {
//!         println!("{:?}", action);
//!     }
//!     Ok(())
//! }
//! ```

pub mod access_status;
pub mod config;
pub mod epoch;
pub mod failover_unit;
pub mod health;
pub mod jobs;
pub mod locked;
pub mod metrics;
pub mod node;
pub mod reconfiguration;
pub mod replica;

pub use access_status::{
    compute_access_status, AccessStatus, AccessStatusTracker, QuorumScope, QuorumView,
    ReadWriteStatus, ReconfigurationPhase, ReconfigurationSituation, ReplicaAccessView,
};
pub use config::FailoverConfig;
pub use epoch::{Epoch, PRIMARY_EPOCH_MASK};
pub use failover_unit::{FailoverUnit, PartitionStatus, ServiceDescription};
pub use health::{
    HealthReport, HealthReportKind, HealthReporter, HealthSeverity, InMemoryHealthReporter,
    TracingHealthReporter,
};
pub use jobs::{FailoverJob, FailoverJobQueue};
pub use locked::{FailoverUnitMap, FailoverUnitStore, InMemoryStore, LockedFailoverUnit};
pub use metrics::{gather_metrics, MetricsRecorder};
pub use node::{NodeId, NodeInstance, PartitionId, BOOTSTRAP_PARTITION_ID};
pub use reconfiguration::{
    NoPreference, PrimaryPromotionComparator, ReconfigurationAction, ReconfigurationTask,
};
pub use replica::{Replica, ReplicaFlags, ReplicaHandle, ReplicaRole, ReplicaState};

use thiserror::Error;

/// Result type for failover operations
pub type Result<T> = std::result::Result<T, FailoverError>;

/// Errors that can occur during failover operations
#[derive(Error, Debug)]
pub enum FailoverError {
    #[error("Failover unit not found: {0}")]
    FailoverUnitNotFound(PartitionId),

    #[error("Replica already exists on node {0}")]
    DuplicateReplica(NodeId),

    #[error("Invalid failover unit state: {0}")]
    InvalidState(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Job queue closed for failover unit {0}")]
    JobQueueClosed(PartitionId),

    #[error("Serialization encode error: {0}")]
    SerializationEncode(#[from] bincode::error::EncodeError),

    #[error("Serialization decode error: {0}")]
    SerializationDecode(#[from] bincode::error::DecodeError),
}
