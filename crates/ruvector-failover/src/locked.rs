//! Locked failover units and persistence
//!
//! Every failover unit lives behind its own mutex in the [`FailoverUnitMap`].
//! A [`LockedFailoverUnit`] is the only way to change one: mutation must be
//! enabled explicitly, and releasing the lock persists the unit only if its
//! encoded form changed. A failed write restores the pre-update state.

use crate::{failover_unit::FailoverUnit, node::PartitionId, FailoverError, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Durable storage for failover units
///
/// `persist` must complete before any message derived from the update is sent.
pub trait FailoverUnitStore: Send + Sync {
    /// Durably write the failover unit
    fn persist(&self, unit: &FailoverUnit) -> Result<()>;
}

/// Store keeping encoded failover units in memory
#[derive(Default)]
pub struct InMemoryStore {
    units: DashMap<PartitionId, Vec<u8>>,
    writes: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful writes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Decode the last persisted version of a failover unit
    pub fn load(&self, id: &PartitionId) -> Result<Option<FailoverUnit>> {
        match self.units.get(id) {
            Some(bytes) => Ok(Some(FailoverUnit::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl FailoverUnitStore for InMemoryStore {
    fn persist(&self, unit: &FailoverUnit) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FailoverError::Persistence(format!(
                "write rejected for {}",
                unit.partition_id()
            )));
        }

        self.units.insert(unit.partition_id(), unit.to_bytes()?);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// All failover units known to this node or authority
pub struct FailoverUnitMap {
    units: DashMap<PartitionId, Arc<Mutex<FailoverUnit>>>,
    store: Arc<dyn FailoverUnitStore>,
}

impl FailoverUnitMap {
    /// Create an empty map backed by `store`
    pub fn new(store: Arc<dyn FailoverUnitStore>) -> Self {
        Self {
            units: DashMap::new(),
            store,
        }
    }

    /// Persist and register a new failover unit
    pub fn insert(&self, unit: FailoverUnit) -> Result<()> {
        self.store.persist(&unit)?;
        self.units
            .insert(unit.partition_id(), Arc::new(Mutex::new(unit)));
        Ok(())
    }

    /// Remove a failover unit from memory
    pub fn remove(&self, id: &PartitionId) -> Option<FailoverUnit> {
        let (_, unit) = self.units.remove(id)?;
        let removed = unit.lock().clone();
        Some(removed)
    }

    /// Lock a failover unit for reading or updating
    ///
    /// Blocks while another handle holds the same unit.
    pub fn lock(&self, id: &PartitionId) -> Result<LockedFailoverUnit> {
        let unit = self
            .units
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(FailoverError::FailoverUnitNotFound(*id))?;

        Ok(LockedFailoverUnit {
            guard: unit.lock_arc(),
            store: self.store.clone(),
            snapshot: None,
        })
    }

    /// Clone the current state of a failover unit
    pub fn snapshot(&self, id: &PartitionId) -> Option<FailoverUnit> {
        let unit = self.units.get(id).map(|entry| entry.value().clone())?;
        let snapshot = unit.lock().clone();
        Some(snapshot)
    }

    pub fn contains(&self, id: &PartitionId) -> bool {
        self.units.contains_key(id)
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.units.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Exclusive handle to one failover unit
pub struct LockedFailoverUnit {
    guard: ArcMutexGuard<RawMutex, FailoverUnit>,
    store: Arc<dyn FailoverUnitStore>,
    snapshot: Option<Vec<u8>>,
}

impl LockedFailoverUnit {
    /// Read access
    pub fn get(&self) -> &FailoverUnit {
        &self.guard
    }

    pub fn is_update_enabled(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Enable mutation, capturing the state to compare against on release
    pub fn enable_update(&mut self) -> Result<&mut FailoverUnit> {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.guard.to_bytes()?);
        }
        Ok(&mut self.guard)
    }

    /// Persist the unit if it changed since [`enable_update`](Self::enable_update)
    ///
    /// Returns whether a write happened. On a failed write the unit is
    /// restored to the state captured by `enable_update`.
    pub fn release(&mut self) -> Result<bool> {
        let snapshot = match self.snapshot.take() {
            Some(snapshot) => snapshot,
            None => return Ok(false),
        };

        if self.guard.to_bytes()? == snapshot {
            return Ok(false);
        }

        self.guard.stamp_update(Utc::now());

        if let Err(e) = self.store.persist(&self.guard) {
            error!(
                "Failed to persist failover unit {}: {}",
                self.guard.partition_id(),
                e
            );
            *self.guard = FailoverUnit::from_bytes(&snapshot)?;
            return Err(e);
        }

        debug!(
            "Persisted failover unit {} version {}",
            self.guard.partition_id(),
            self.guard.update_version()
        );
        Ok(true)
    }
}

impl Drop for LockedFailoverUnit {
    fn drop(&mut self) {
        if self.snapshot.is_some() {
            if let Err(e) = self.release() {
                error!("Failover unit update lost on unlock: {}", e);
            }
        }
    }
}
